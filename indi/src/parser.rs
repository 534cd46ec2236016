//! Streaming INDI message parser
//!
//! INDI servers send an endless sequence of top-level XML elements with no
//! enclosing document. Bytes arrive in arbitrary chunks, so the parser first
//! frames complete top-level elements out of its buffer and then runs each
//! frame through quick-xml, tracking one "current vector" at a time.
//!
//! Driver streams are not trusted to be well formed. Unexpected nesting, a
//! one*/def* element whose type does not match its vector, or a stray end
//! tag resets the parse state and drops the rest of that frame. Nothing here
//! returns an error to the caller.

use crate::error::IndiError;
use crate::{IndiPermission, IndiPropertyState, IndiPropertyType, NumberLimits};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

/// Largest partial message kept while waiting for the rest of it
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Which family a vector message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    /// `def*Vector`: property definition
    Def,
    /// `set*Vector`: value update from the device
    Set,
    /// `new*Vector`: client request (echoed by some servers)
    New,
}

impl VectorKind {
    fn prefix(self) -> &'static str {
        match self {
            VectorKind::Def => "def",
            VectorKind::Set => "set",
            VectorKind::New => "new",
        }
    }

    /// Tag prefix of the member elements (`defNumber` vs `oneNumber`)
    fn member_prefix(self) -> &'static str {
        match self {
            VectorKind::Def => "def",
            VectorKind::Set | VectorKind::New => "one",
        }
    }
}

/// One member element of a vector
#[derive(Debug, Clone, PartialEq)]
pub struct ElementValue {
    pub name: String,
    pub label: Option<String>,
    pub value: String,
    /// Only present on `defNumber`
    pub limits: Option<NumberLimits>,
}

/// A complete def/set/new vector message
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMessage {
    pub kind: VectorKind,
    pub property_type: IndiPropertyType,
    pub device: String,
    pub name: String,
    pub label: Option<String>,
    pub group: Option<String>,
    pub state: Option<IndiPropertyState>,
    pub perm: Option<IndiPermission>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    pub elements: Vec<ElementValue>,
}

impl VectorMessage {
    fn tag(&self) -> String {
        format!("{}{}Vector", self.kind.prefix(), self.property_type.tag_suffix())
    }

    fn member_tag(&self) -> String {
        format!("{}{}", self.kind.member_prefix(), self.property_type.tag_suffix())
    }

    /// Raw value of a member element
    pub fn value(&self, element: &str) -> Option<&str> {
        self.elements
            .iter()
            .find(|e| e.name == element)
            .map(|e| e.value.as_str())
    }
}

/// Messages produced by the parser
#[derive(Debug, Clone, PartialEq)]
pub enum IndiMessage {
    GetProperties {
        version: Option<String>,
        device: Option<String>,
    },
    Vector(VectorMessage),
    DelProperty {
        device: String,
        /// `None` deletes every property of the device
        name: Option<String>,
        message: Option<String>,
    },
    Message {
        device: Option<String>,
        text: String,
    },
}

#[derive(Debug)]
enum ParseState {
    Idle,
    Vector {
        msg: VectorMessage,
        element: Option<ElementValue>,
    },
    /// Inside an element this client does not use
    Skip { depth: usize },
}

enum Scan {
    /// A complete frame ends at this offset
    Complete(usize),
    Incomplete,
}

/// Incremental INDI parser
#[derive(Debug)]
pub struct IndiParser {
    buffer: Vec<u8>,
    capacity: usize,
    state: ParseState,
    resets: u64,
}

impl Default for IndiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl IndiParser {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            capacity,
            state: ParseState::Idle,
            resets: 0,
        }
    }

    /// Number of defensive resets since creation
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Bytes held while waiting for the rest of a message
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes and the current parse state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::Idle;
    }

    /// Append bytes and return every message completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<IndiMessage> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            let (start, scan) = scan_frame(&self.buffer);
            match scan {
                Scan::Complete(end) => {
                    let frame: Vec<u8> = self.buffer.drain(..end).skip(start).collect();
                    self.parse_frame(&frame, &mut out);
                }
                Scan::Incomplete => {
                    // Leading bytes before the first '<' can never become part of a message
                    self.buffer.drain(..start);
                    break;
                }
            }
        }

        if self.buffer.len() > self.capacity {
            let err = IndiError::BufferOverflow {
                capacity: self.capacity,
                buffered: self.buffer.len(),
            };
            tracing::warn!("{}. Discarding partial message.", err);
            self.buffer.clear();
            self.defensive_reset();
        }

        out
    }

    fn defensive_reset(&mut self) {
        self.state = ParseState::Idle;
        self.resets += 1;
    }

    fn parse_frame(&mut self, frame: &[u8], out: &mut Vec<IndiMessage>) {
        let mut reader = Reader::from_reader(frame);
        reader.trim_text(true);
        reader.check_end_names(false);

        loop {
            let result = match reader.read_event() {
                Ok(Event::Start(e)) => self.handle_start(&e, false, out),
                Ok(Event::Empty(e)) => self.handle_start(&e, true, out),
                Ok(Event::End(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    self.handle_end(&tag, out)
                }
                Ok(Event::Text(e)) => match e.unescape() {
                    Ok(text) => {
                        self.handle_text(&text);
                        Ok(())
                    }
                    Err(err) => Err(IndiError::from(err)),
                },
                Ok(Event::CData(e)) => {
                    self.handle_text(&String::from_utf8_lossy(&e));
                    Ok(())
                }
                Ok(Event::Eof) => break,
                Ok(_) => Ok(()),
                Err(err) => Err(IndiError::from(err)),
            };

            if let Err(err) = result {
                tracing::warn!(
                    "Malformed INDI message, resetting parser: {}. Frame (first 200 bytes): {:?}",
                    err,
                    String::from_utf8_lossy(&frame[..frame.len().min(200)])
                );
                self.defensive_reset();
                return;
            }
        }

        // Frames are balanced, so anything still open here came from mismatched end tags
        if !matches!(self.state, ParseState::Idle) {
            tracing::warn!("INDI message ended inside an open element, resetting parser");
            self.defensive_reset();
        }
    }

    fn handle_start(
        &mut self,
        e: &BytesStart,
        empty: bool,
        out: &mut Vec<IndiMessage>,
    ) -> Result<(), IndiError> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();

        match &mut self.state {
            ParseState::Skip { depth } => {
                if !empty {
                    *depth += 1;
                }
                Ok(())
            }
            ParseState::Vector { msg, element } => {
                if element.is_some() {
                    return Err(IndiError::UnexpectedElement {
                        found: tag,
                        context: "inside a vector member".to_string(),
                    });
                }
                if tag != msg.member_tag() {
                    return Err(IndiError::UnexpectedElement {
                        context: format!("inside <{}>", msg.tag()),
                        found: tag,
                    });
                }
                let name = required_attribute(e, "name", &tag)?;
                let limits = (msg.kind == VectorKind::Def
                    && msg.property_type == IndiPropertyType::Number)
                    .then(|| NumberLimits {
                        min: get_attribute(e, "min").and_then(|s| s.parse().ok()),
                        max: get_attribute(e, "max").and_then(|s| s.parse().ok()),
                        step: get_attribute(e, "step").and_then(|s| s.parse().ok()),
                        format: get_attribute(e, "format"),
                    });
                let value = ElementValue {
                    name,
                    label: get_attribute(e, "label"),
                    value: String::new(),
                    limits,
                };
                if empty {
                    msg.elements.push(value);
                } else {
                    *element = Some(value);
                }
                Ok(())
            }
            ParseState::Idle => self.handle_top_level(&tag, e, empty, out),
        }
    }

    fn handle_top_level(
        &mut self,
        tag: &str,
        e: &BytesStart,
        empty: bool,
        out: &mut Vec<IndiMessage>,
    ) -> Result<(), IndiError> {
        if let Some((kind, property_type)) = vector_tag(tag) {
            let msg = VectorMessage {
                kind,
                property_type,
                device: required_attribute(e, "device", tag)?,
                name: required_attribute(e, "name", tag)?,
                label: get_attribute(e, "label"),
                group: get_attribute(e, "group"),
                state: get_attribute(e, "state").map(|s| IndiPropertyState::parse(&s)),
                perm: get_attribute(e, "perm").map(|s| IndiPermission::parse(&s)),
                timestamp: get_attribute(e, "timestamp"),
                message: get_attribute(e, "message"),
                elements: Vec::new(),
            };
            if empty {
                out.push(IndiMessage::Vector(msg));
            } else {
                self.state = ParseState::Vector { msg, element: None };
            }
            return Ok(());
        }

        match tag {
            "getProperties" => out.push(IndiMessage::GetProperties {
                version: get_attribute(e, "version"),
                device: get_attribute(e, "device"),
            }),
            "delProperty" => out.push(IndiMessage::DelProperty {
                device: required_attribute(e, "device", tag)?,
                name: get_attribute(e, "name"),
                message: get_attribute(e, "message"),
            }),
            "message" => out.push(IndiMessage::Message {
                device: get_attribute(e, "device"),
                text: get_attribute(e, "message").unwrap_or_default(),
            }),
            other => tracing::debug!("Ignoring INDI element <{}>", other),
        }

        if !empty {
            self.state = ParseState::Skip { depth: 0 };
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) {
        if let ParseState::Vector {
            element: Some(element),
            ..
        } = &mut self.state
        {
            element.value.push_str(text);
        }
    }

    fn handle_end(&mut self, tag: &str, out: &mut Vec<IndiMessage>) -> Result<(), IndiError> {
        let state = std::mem::replace(&mut self.state, ParseState::Idle);
        match state {
            ParseState::Idle => Err(IndiError::UnexpectedElement {
                found: format!("/{}", tag),
                context: "outside any element".to_string(),
            }),
            ParseState::Skip { depth } => {
                if depth > 0 {
                    self.state = ParseState::Skip { depth: depth - 1 };
                }
                Ok(())
            }
            ParseState::Vector {
                mut msg,
                element: Some(mut element),
            } => {
                if tag != msg.member_tag() {
                    return Err(IndiError::UnexpectedElement {
                        found: format!("/{}", tag),
                        context: format!("closing <{}>", msg.member_tag()),
                    });
                }
                element.value = element.value.trim().to_string();
                msg.elements.push(element);
                self.state = ParseState::Vector { msg, element: None };
                Ok(())
            }
            ParseState::Vector { msg, element: None } => {
                if tag != msg.tag() {
                    return Err(IndiError::UnexpectedElement {
                        found: format!("/{}", tag),
                        context: format!("closing <{}>", msg.tag()),
                    });
                }
                out.push(IndiMessage::Vector(msg));
                Ok(())
            }
        }
    }
}

fn vector_tag(tag: &str) -> Option<(VectorKind, IndiPropertyType)> {
    let body = tag.strip_suffix("Vector")?;
    let (kind, suffix) = if let Some(rest) = body.strip_prefix("def") {
        (VectorKind::Def, rest)
    } else if let Some(rest) = body.strip_prefix("set") {
        (VectorKind::Set, rest)
    } else if let Some(rest) = body.strip_prefix("new") {
        (VectorKind::New, rest)
    } else {
        return None;
    };
    IndiPropertyType::from_tag_suffix(suffix).map(|t| (kind, t))
}

/// Helper to get attribute from XML event
fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| match a.unescape_value() {
            Ok(value) => value.to_string(),
            Err(_) => String::from_utf8_lossy(&a.value).to_string(),
        })
}

fn required_attribute(e: &BytesStart, name: &str, tag: &str) -> Result<String, IndiError> {
    get_attribute(e, name).ok_or_else(|| IndiError::UnexpectedElement {
        found: tag.to_string(),
        context: format!("without a '{}' attribute", name),
    })
}

/// Locate the first complete top-level element.
///
/// Returns the offset of the frame start (first `<`) and whether the frame
/// is complete. Quoted attribute values, comments, CDATA sections and
/// processing instructions are skipped without affecting nesting depth.
fn scan_frame(buf: &[u8]) -> (usize, Scan) {
    let Some(start) = buf.iter().position(|&b| b == b'<') else {
        return (buf.len(), Scan::Incomplete);
    };

    let mut depth = 0usize;
    let mut pos = start;
    loop {
        let rest = &buf[pos..];
        let consumed = if let Some(len) = skip_special(rest) {
            match len {
                Some(len) => len,
                None => return (start, Scan::Incomplete),
            }
        } else {
            let Some(tag_end) = find_tag_end(rest) else {
                return (start, Scan::Incomplete);
            };
            if rest.get(1) == Some(&b'/') {
                // A stray end tag at top level forms its own (malformed) frame
                depth = depth.saturating_sub(1);
            } else if rest[tag_end - 1] != b'/' {
                depth += 1;
            }
            tag_end + 1
        };

        let end = pos + consumed;
        if depth == 0 {
            return (start, Scan::Complete(end));
        }
        match buf[end..].iter().position(|&b| b == b'<') {
            Some(next) => pos = end + next,
            None => return (start, Scan::Incomplete),
        }
    }
}

/// Length of a comment, CDATA section, declaration or processing
/// instruction starting at `rest`. `Some(None)` means it is still incomplete,
/// `None` means `rest` starts a regular tag.
fn skip_special(rest: &[u8]) -> Option<Option<usize>> {
    const SPECIALS: [(&[u8], &[u8]); 3] = [
        (b"<!--", b"-->"),
        (b"<![CDATA[", b"]]>"),
        (b"<?", b"?>"),
    ];
    for (open, close) in SPECIALS {
        if rest.starts_with(open) {
            return Some(find(&rest[open.len()..], close).map(|i| open.len() + i + close.len()));
        }
        if open.starts_with(rest) {
            // Not enough bytes yet to tell
            return Some(None);
        }
    }
    if rest.starts_with(b"<!") {
        return Some(find_tag_end(rest).map(|i| i + 1));
    }
    None
}

/// Index of the `>` closing the tag at the start of `rest`, outside quotes
fn find_tag_end(rest: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in rest.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEF_EOD: &str = r#"<defNumberVector device="Telescope Simulator" name="EQUATORIAL_EOD_COORD" label="Eq. Coordinates" group="Main Control" state="Idle" perm="rw" timeout="60">
    <defNumber name="RA" label="RA (hh:mm:ss)" format="%010.6m" min="0" max="24" step="0">
6.5
    </defNumber>
    <defNumber name="DEC" label="DEC (dd:mm:ss)" format="%010.6m" min="-90" max="90" step="0">
-12.25
    </defNumber>
</defNumberVector>
"#;

    fn single_vector(messages: Vec<IndiMessage>) -> VectorMessage {
        assert_eq!(messages.len(), 1, "expected one message, got {:?}", messages);
        match messages.into_iter().next() {
            Some(IndiMessage::Vector(v)) => v,
            other => panic!("expected a vector, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_def_number_vector() {
        let mut parser = IndiParser::new();
        let v = single_vector(parser.feed(DEF_EOD.as_bytes()));
        assert_eq!(v.kind, VectorKind::Def);
        assert_eq!(v.property_type, IndiPropertyType::Number);
        assert_eq!(v.device, "Telescope Simulator");
        assert_eq!(v.name, "EQUATORIAL_EOD_COORD");
        assert_eq!(v.perm, Some(IndiPermission::ReadWrite));
        assert_eq!(v.value("RA"), Some("6.5"));
        assert_eq!(v.value("DEC"), Some("-12.25"));
        let limits = v.elements[1].limits.clone().expect("defNumber carries limits");
        assert_eq!(limits.min, Some(-90.0));
        assert_eq!(limits.max, Some(90.0));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_messages_split_across_chunks() {
        let mut parser = IndiParser::new();
        let bytes = DEF_EOD.as_bytes();
        let mut messages = Vec::new();
        for chunk in bytes.chunks(7) {
            messages.extend(parser.feed(chunk));
        }
        let v = single_vector(messages);
        assert_eq!(v.value("RA"), Some("6.5"));
    }

    #[test]
    fn test_quoted_gt_in_attribute_does_not_end_tag() {
        let mut parser = IndiParser::new();
        let xml = r#"<setTextVector device="D" name="P" message="a > b"><oneText name="T">x</oneText></setTextVector>"#;
        let v = single_vector(parser.feed(xml.as_bytes()));
        assert_eq!(v.message.as_deref(), Some("a > b"));
        assert_eq!(v.value("T"), Some("x"));
    }

    #[test]
    fn test_several_messages_in_one_chunk() {
        let mut parser = IndiParser::new();
        let xml = concat!(
            "<?xml version=\"1.0\"?>\n",
            "<!-- driver banner -->\n",
            "<getProperties version=\"1.7\"/>\n",
            "<message device=\"Telescope Simulator\" timestamp=\"2024-01-01T00:00:00\" message=\"Hello\"/>\n",
            "<delProperty device=\"Telescope Simulator\" name=\"EQUATORIAL_EOD_COORD\"/>\n",
            "<setSwitchVector device=\"Telescope Simulator\" name=\"CONNECTION\" state=\"Ok\">",
            "<oneSwitch name=\"CONNECT\">On</oneSwitch><oneSwitch name=\"DISCONNECT\">Off</oneSwitch>",
            "</setSwitchVector>",
        );
        let messages = parser.feed(xml.as_bytes());
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[0],
            IndiMessage::GetProperties {
                version: Some("1.7".to_string()),
                device: None
            }
        );
        assert_eq!(
            messages[1],
            IndiMessage::Message {
                device: Some("Telescope Simulator".to_string()),
                text: "Hello".to_string()
            }
        );
        assert!(matches!(
            &messages[2],
            IndiMessage::DelProperty { name: Some(n), .. } if n == "EQUATORIAL_EOD_COORD"
        ));
        match &messages[3] {
            IndiMessage::Vector(v) => {
                assert_eq!(v.kind, VectorKind::Set);
                assert_eq!(v.state, Some(IndiPropertyState::Ok));
                assert_eq!(v.value("CONNECT"), Some("On"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parser.resets(), 0);
    }

    #[test]
    fn test_type_mismatch_resets_and_recovers() {
        let mut parser = IndiParser::new();
        let bad = r#"<setNumberVector device="D" name="P"><oneSwitch name="X">On</oneSwitch></setNumberVector>"#;
        let good = r#"<setNumberVector device="D" name="P"><oneNumber name="X">1.5</oneNumber></setNumberVector>"#;
        assert!(parser.feed(bad.as_bytes()).is_empty());
        assert_eq!(parser.resets(), 1);
        let v = single_vector(parser.feed(good.as_bytes()));
        assert_eq!(v.value("X"), Some("1.5"));
    }

    #[test]
    fn test_nested_vector_resets() {
        let mut parser = IndiParser::new();
        let bad = r#"<setNumberVector device="D" name="P"><setNumberVector device="D" name="Q"></setNumberVector></setNumberVector>"#;
        assert!(parser.feed(bad.as_bytes()).is_empty());
        assert_eq!(parser.resets(), 1);
    }

    #[test]
    fn test_stray_end_tag_resets() {
        let mut parser = IndiParser::new();
        assert!(parser.feed(b"</setNumberVector>").is_empty());
        assert_eq!(parser.resets(), 1);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_vector_without_device_is_dropped() {
        let mut parser = IndiParser::new();
        assert!(parser
            .feed(br#"<setNumberVector name="P"><oneNumber name="X">1</oneNumber></setNumberVector>"#)
            .is_empty());
        assert_eq!(parser.resets(), 1);
    }

    #[test]
    fn test_unknown_elements_are_skipped() {
        let mut parser = IndiParser::new();
        let xml = r#"<enableBLOB device="D">Never</enableBLOB><pingRequest uid="1"/><setNumberVector device="D" name="P"><oneNumber name="X">2</oneNumber></setNumberVector>"#;
        let v = single_vector(parser.feed(xml.as_bytes()));
        assert_eq!(v.value("X"), Some("2"));
        assert_eq!(parser.resets(), 0);
    }

    #[test]
    fn test_oversized_partial_message_is_discarded() {
        let mut parser = IndiParser::with_capacity(64);
        let mut xml = String::from(r#"<setTextVector device="D" name="P"><oneText name="T">"#);
        xml.push_str(&"x".repeat(128));
        assert!(parser.feed(xml.as_bytes()).is_empty());
        assert_eq!(parser.buffered(), 0);
        assert_eq!(parser.resets(), 1);

        // The tail of the discarded message is junk text followed by a stray end tag
        let messages = parser.feed(br#"</oneText></setTextVector><setNumberVector device="D" name="P"><oneNumber name="X">3</oneNumber></setNumberVector>"#);
        let v = single_vector(messages);
        assert_eq!(v.value("X"), Some("3"));
    }

    #[test]
    fn test_escaped_text_is_unescaped() {
        let mut parser = IndiParser::new();
        let v = single_vector(parser.feed(
            br#"<setTextVector device="D" name="P"><oneText name="T">a &amp; b</oneText></setTextVector>"#,
        ));
        assert_eq!(v.value("T"), Some("a & b"));
    }
}
