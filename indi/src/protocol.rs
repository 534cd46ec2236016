//! INDI XML Protocol definitions

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Standard INDI properties
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";

    // Mount properties
    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const EQUATORIAL_COORD: &str = "EQUATORIAL_COORD";
    pub const EQUATORIAL_EOD_COORD_REQUEST: &str = "EQUATORIAL_EOD_COORD_REQUEST";
    pub const EQUATORIAL_COORD_REQUEST: &str = "EQUATORIAL_COORD_REQUEST";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";

    // ON_COORD_SET elements
    pub const SLEW: &str = "SLEW";
    pub const TRACK: &str = "TRACK";
}

/// Common coordinate elements
pub mod coord_elements {
    pub const RA: &str = "RA";
    pub const DEC: &str = "DEC";
}

/// Builders for the client-to-server messages this crate sends
pub mod messages {
    use quick_xml::escape::escape;

    /// `<getProperties>`, optionally restricted to one device
    pub fn get_properties(device: Option<&str>) -> String {
        match device {
            Some(dev) => format!(
                "<getProperties version=\"{}\" device=\"{}\"/>\n",
                super::INDI_PROTOCOL_VERSION,
                escape(dev)
            ),
            None => format!("<getProperties version=\"{}\"/>\n", super::INDI_PROTOCOL_VERSION),
        }
    }

    /// `<newSwitchVector>` turning one element On (one-of-many rule does the rest)
    pub fn new_switch(device: &str, property: &str, element: &str) -> String {
        format!(
            "<newSwitchVector device=\"{}\" name=\"{}\">\
             <oneSwitch name=\"{}\">On</oneSwitch>\
             </newSwitchVector>\n",
            escape(device),
            escape(property),
            escape(element)
        )
    }

    /// `<newNumberVector>` carrying several number elements
    pub fn new_numbers(device: &str, property: &str, values: &[(&str, f64)]) -> String {
        let elements: String = values
            .iter()
            .map(|(name, value)| {
                format!("<oneNumber name=\"{}\">{}</oneNumber>", escape(*name), value)
            })
            .collect();
        format!(
            "<newNumberVector device=\"{}\" name=\"{}\">{}</newNumberVector>\n",
            escape(device),
            escape(property),
            elements
        )
    }
}
