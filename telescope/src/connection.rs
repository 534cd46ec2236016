//! Live connection to one mount
//!
//! ```text
//!                start()                established
//! Disconnected ─────────▶ Connecting ─────────────────▶ Connected
//!      ▲  ▲                  │ timeout / error             │ EOF / I/O / protocol error
//!      │  └──── backoff ─────┴─────────────────────────────┘
//!      │ stop() from any state
//! Failed (non-retryable transport error, never reconnects)
//! ```
//!
//! Everything here runs on the update thread. `step()` does one bounded
//! write and one bounded read and returns without waiting.

use crate::clock::duration_micros;
use crate::codec::{Decoded, GotoOutcome, Outbox, Protocol};
use crate::config::ControlConfig;
use crate::error::{ConnectionError, LinkError, ProtocolError};
use crate::events::{ConnectionEventKind, EventSink};
use crate::interpolator::PositionInterpolator;
use crate::link::{Connector, Link, Transport};
use nalgebra::Vector3;
use std::sync::Arc;

/// Position reported before anything is known
pub fn default_position() -> Vector3<f64> {
    Vector3::x()
}

/// What the service needs from any kind of telescope
pub trait TelescopeClient: Send {
    /// Profile name
    fn id(&self) -> &str;

    /// Begin connecting; an error other than `Failed` means a retry is scheduled
    fn start(&mut self, now: i64) -> Result<(), ConnectionError>;

    /// One non-blocking I/O step.
    ///
    /// An error means the client already dropped its link (or gave up) and
    /// reports why; it is not fatal to the caller.
    fn step(&mut self, now: i64) -> Result<(), ConnectionError>;

    /// Best J2000 estimate for `now`, falling back to the last known direction
    fn position(&self, now: i64) -> Vector3<f64>;

    /// Slew to a J2000 direction
    fn goto(&mut self, target_j2000: Vector3<f64>, now: i64);

    fn is_connected(&self) -> bool;

    /// Gave up for good; the owner should drop it
    fn has_failed(&self) -> bool {
        false
    }

    fn has_known_position(&self) -> bool;

    /// Tear down without scheduling a reconnect
    fn stop(&mut self);

    fn fov_circles(&self) -> &[f64];

    fn set_fov_circles(&mut self, circles: Vec<f64>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { deadline: i64 },
    Connected,
    Failed { reason: String },
}

/// Shared pieces every connection is built with
#[derive(Clone)]
pub struct ConnectionContext {
    pub connector: Arc<dyn Connector>,
    pub config: ControlConfig,
    pub events: EventSink,
}

pub struct DeviceConnection {
    id: String,
    transport: Transport,
    protocol: Box<dyn Protocol>,
    connector: Arc<dyn Connector>,
    config: ControlConfig,
    events: EventSink,
    state: ConnectionState,
    link: Option<Box<dyn Link>>,
    read_buf: Vec<u8>,
    outbox: Outbox,
    interpolator: PositionInterpolator,
    last_position: Vector3<f64>,
    delay_micros: i64,
    fov_circles: Vec<f64>,
    /// Latest goto that did not fit into the outbox
    held_goto: Option<Vector3<f64>>,
    /// Started and not stopped; governs reconnects
    running: bool,
    retry_at: Option<i64>,
    attempts: u32,
    last_rx: i64,
}

impl DeviceConnection {
    pub fn new(
        id: &str,
        transport: Transport,
        protocol: Box<dyn Protocol>,
        delay_micros: i64,
        fov_circles: Vec<f64>,
        context: &ConnectionContext,
    ) -> Self {
        let outbox = Outbox::new(protocol.write_capacity());
        Self {
            id: id.to_string(),
            transport,
            protocol,
            connector: context.connector.clone(),
            config: context.config.clone(),
            events: context.events.clone(),
            state: ConnectionState::Disconnected,
            link: None,
            read_buf: Vec::new(),
            outbox,
            interpolator: PositionInterpolator::new(),
            last_position: default_position(),
            delay_micros,
            fov_circles,
            held_goto: None,
            running: false,
            retry_at: None,
            attempts: 0,
            last_rx: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Earliest time of the next connection attempt, when one is scheduled
    pub fn retry_at(&self) -> Option<i64> {
        self.retry_at
    }

    /// Consecutive failed attempts since the last successful connect
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_held_goto(&self) -> bool {
        self.held_goto.is_some()
    }

    fn begin_connect(&mut self, now: i64) -> Result<(), ConnectionError> {
        match self.connector.open(&self.transport, self.config.connect_timeout()) {
            Ok(link) => {
                tracing::debug!("{}: connecting via {}", self.id, link.describe());
                self.link = Some(link);
                self.retry_at = None;
                self.state = ConnectionState::Connecting {
                    deadline: now + duration_micros(self.config.connect_timeout()),
                };
                Ok(())
            }
            Err(e) if !e.is_retryable() => {
                let reason = e.to_string();
                self.fail(reason.clone());
                Err(ConnectionError::Failed(reason))
            }
            Err(e) => self.lose(now, e.into()),
        }
    }

    fn fail(&mut self, reason: String) {
        tracing::error!("{}: giving up: {}", self.id, reason);
        self.teardown();
        self.running = false;
        self.retry_at = None;
        self.events.emit(
            &self.id,
            ConnectionEventKind::Failed {
                reason: reason.clone(),
            },
        );
        self.state = ConnectionState::Failed { reason };
    }

    /// Drop the link after an error and schedule the next attempt
    fn lose(&mut self, now: i64, err: ConnectionError) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Disconnected {
            tracing::warn!("{}: connection lost: {}", self.id, err);
            // Observers hear about it before anything is torn down
            self.events.emit(
                &self.id,
                ConnectionEventKind::Disconnected {
                    reason: err.to_string(),
                },
            );
        } else {
            tracing::warn!("{}: connection attempt failed: {}", self.id, err);
        }
        self.teardown();
        self.state = ConnectionState::Disconnected;

        if self.running && self.config.reconnection.enabled {
            self.attempts = self.attempts.saturating_add(1);
            let delay = self.config.reconnection.calculate_delay(self.attempts);
            self.retry_at = Some(now + duration_micros(delay));
            tracing::info!("{}: reconnecting in {:.1}s (attempt {})", self.id, delay.as_secs_f64(), self.attempts);
        } else {
            self.running = false;
            self.retry_at = None;
        }
        Err(err)
    }

    fn teardown(&mut self) {
        self.read_buf.clear();
        self.outbox.clear();
        self.held_goto = None;
        self.interpolator.reset();
        self.protocol.reset();
        self.link = None;
    }

    fn on_established(&mut self, now: i64) -> Result<(), ConnectionError> {
        tracing::info!("{}: connected", self.id);
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.last_rx = now;
        self.events.emit(&self.id, ConnectionEventKind::Connected);
        if let Err(e) = self.protocol.on_connected(now, &mut self.outbox) {
            return self.lose(now, e.into());
        }
        Ok(())
    }

    fn step_connected(&mut self, now: i64) -> Result<(), ConnectionError> {
        if let Err(e) = self.protocol.poll(now, &mut self.outbox) {
            return self.lose(now, e.into());
        }

        self.flush(now)?;
        self.retry_held_goto(now);

        let capacity = self.protocol.read_capacity();
        let room = capacity.saturating_sub(self.read_buf.len());
        let read = match self.link.as_mut() {
            Some(link) => link.read_available(&mut self.read_buf, room),
            None => Err(LinkError::Closed),
        };
        match read {
            Ok(0) => {}
            Ok(_) => self.last_rx = now,
            Err(e) => return self.lose(now, e.into()),
        }

        match self.protocol.decode(&mut self.read_buf, now, &mut self.outbox) {
            Ok(decoded) => self.apply(decoded),
            Err(e) => return self.lose(now, e.into()),
        }
        if self.read_buf.len() >= capacity {
            return self.lose(now, ProtocolError::ReadOverflow(capacity).into());
        }

        let idle = self.config.idle_timeout();
        if self.protocol.streams_positions() && now - self.last_rx > duration_micros(idle) {
            return self.lose(now, ConnectionError::IdleTimeout(idle.as_millis() as u64));
        }
        Ok(())
    }

    /// Hand as much of the outbox to the link as it takes
    fn flush(&mut self, now: i64) -> Result<(), ConnectionError> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        let written = match self.link.as_mut() {
            Some(link) => link.write(self.outbox.as_slice()),
            None => Err(LinkError::Closed),
        };
        match written {
            Ok(n) => {
                self.outbox.consume(n);
                Ok(())
            }
            Err(e) => self.lose(now, e.into()),
        }
    }

    fn retry_held_goto(&mut self, now: i64) {
        let Some(target) = self.held_goto.take() else {
            return;
        };
        match self.protocol.encode_goto(&target, now, &mut self.outbox) {
            Ok(GotoOutcome::NoRoom) => self.held_goto = Some(target),
            Ok(_) => tracing::debug!("{}: held goto queued", self.id),
            Err(e) => tracing::warn!("{}: held goto rejected: {}", self.id, e),
        }
    }

    fn apply(&mut self, decoded: Decoded) {
        if decoded.position_lost {
            tracing::debug!("{}: position withdrawn by device", self.id);
            self.interpolator.reset();
        }
        for sample in decoded.samples {
            self.interpolator.add(sample);
            if let Some(newest) = self.interpolator.newest() {
                self.last_position = newest.position;
            }
        }
    }

    fn drop_goto(&self, reason: &str) {
        self.events.emit(
            &self.id,
            ConnectionEventKind::GotoDropped {
                reason: reason.to_string(),
            },
        );
    }
}

impl TelescopeClient for DeviceConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, now: i64) -> Result<(), ConnectionError> {
        if let ConnectionState::Failed { reason } = &self.state {
            return Err(ConnectionError::Failed(reason.clone()));
        }
        if self.running {
            return Ok(());
        }
        self.running = true;
        self.attempts = 0;
        self.retry_at = None;
        tracing::info!("{}: starting {} connection to {}", self.id, self.protocol.name(), self.transport);
        self.events.emit(&self.id, ConnectionEventKind::Started);
        self.begin_connect(now)
    }

    fn step(&mut self, now: i64) -> Result<(), ConnectionError> {
        match self.state.clone() {
            ConnectionState::Failed { .. } => Ok(()),
            ConnectionState::Disconnected => match self.retry_at {
                Some(at) if self.running && now >= at => self.begin_connect(now),
                _ => Ok(()),
            },
            ConnectionState::Connecting { deadline } => {
                let established = match self.link.as_mut() {
                    Some(link) => link.poll_established(),
                    None => Err(LinkError::Closed),
                };
                match established {
                    Ok(true) => {
                        self.on_established(now)?;
                        self.step_connected(now)
                    }
                    Ok(false) if now >= deadline => self.lose(now, ConnectionError::ConnectTimeout),
                    Ok(false) => Ok(()),
                    Err(e) => self.lose(now, e.into()),
                }
            }
            ConnectionState::Connected => self.step_connected(now),
        }
    }

    fn position(&self, now: i64) -> Vector3<f64> {
        self.interpolator
            .get(now - self.delay_micros)
            .unwrap_or(self.last_position)
    }

    fn goto(&mut self, target_j2000: Vector3<f64>, now: i64) {
        let norm = target_j2000.norm();
        if !norm.is_finite() || norm == 0.0 {
            tracing::warn!("{}: ignoring goto to degenerate vector", self.id);
            return;
        }
        let target = target_j2000 / norm;

        if self.state != ConnectionState::Connected {
            if self.running && self.protocol.holds_goto_offline() {
                match self.protocol.encode_goto(&target, now, &mut self.outbox) {
                    Ok(_) => tracing::info!("{}: goto held until the device connects", self.id),
                    Err(e) => {
                        tracing::warn!("{}: goto rejected: {}", self.id, e);
                        self.drop_goto(&e.to_string());
                    }
                }
            } else {
                tracing::warn!("{}: not connected, dropping goto", self.id);
                self.drop_goto("not connected");
            }
            return;
        }

        if self.held_goto.is_some() {
            // Outbox still full; only the newest target matters
            tracing::warn!("{}: outgoing buffer full, replacing held goto", self.id);
            self.drop_goto("superseded while outgoing buffer full");
            self.held_goto = Some(target);
            return;
        }

        match self.protocol.encode_goto(&target, now, &mut self.outbox) {
            Ok(GotoOutcome::Queued) => tracing::debug!("{}: goto queued", self.id),
            Ok(GotoOutcome::Held) => tracing::info!("{}: goto held until the device is ready", self.id),
            Ok(GotoOutcome::NoRoom) => {
                tracing::warn!("{}: outgoing buffer full, holding goto", self.id);
                self.held_goto = Some(target);
            }
            Err(e) => {
                tracing::warn!("{}: goto rejected: {}", self.id, e);
                self.drop_goto(&e.to_string());
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.protocol.is_ready()
    }

    fn has_failed(&self) -> bool {
        matches!(self.state, ConnectionState::Failed { .. })
    }

    fn has_known_position(&self) -> bool {
        self.interpolator.is_known()
    }

    fn stop(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting { .. }
        ) {
            self.events.emit(
                &self.id,
                ConnectionEventKind::Disconnected {
                    reason: "stopped".to_string(),
                },
            );
        }
        self.teardown();
        self.running = false;
        self.retry_at = None;
        self.attempts = 0;
        if !matches!(self.state, ConnectionState::Failed { .. }) {
            self.state = ConnectionState::Disconnected;
        }
        tracing::info!("{}: stopped", self.id);
        self.events.emit(&self.id, ConnectionEventKind::Stopped);
    }

    fn fov_circles(&self) -> &[f64] {
        &self.fov_circles
    }

    fn set_fov_circles(&mut self, circles: Vec<f64>) {
        self.fov_circles = circles;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::stellarium::{decode_goto, encode_position, GOTO_LEN};
    use crate::codec::{NexStarProtocol, NexStarVariant, StellariumProtocol};
    use crate::config::ReconnectionConfig;
    use crate::coordinates::{rect_to_spherical, spherical_to_rect, Equinox};
    use crate::events::ConnectionEvent;
    use crate::link::memory::MemoryConnector;
    use approx::assert_relative_eq;
    use tokio::sync::broadcast;

    const SECOND: i64 = 1_000_000;

    fn config() -> ControlConfig {
        ControlConfig {
            reconnection: ReconnectionConfig {
                use_jitter: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn setup(
        protocol: Box<dyn Protocol>,
        config: ControlConfig,
    ) -> (DeviceConnection, MemoryConnector, broadcast::Receiver<ConnectionEvent>) {
        let connector = MemoryConnector::default();
        let events = EventSink::new(64);
        let rx = events.subscribe();
        let context = ConnectionContext {
            connector: Arc::new(connector.clone()),
            config,
            events,
        };
        let conn = DeviceConnection::new(
            "scope",
            Transport::Tcp {
                host: "127.0.0.1".to_string(),
                port: 10001,
            },
            protocol,
            100_000,
            vec![0.5, 1.0],
            &context,
        );
        (conn, connector, rx)
    }

    fn stellarium() -> (DeviceConnection, MemoryConnector, broadcast::Receiver<ConnectionEvent>) {
        setup(Box::new(StellariumProtocol::new(Equinox::J2000)), config())
    }

    fn connect(conn: &mut DeviceConnection, connector: &MemoryConnector, now: i64) {
        conn.start(now).unwrap();
        connector.with(|s| s.established = true);
        conn.step(now).unwrap();
        assert_eq!(conn.state(), &ConnectionState::Connected);
    }

    fn kinds(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEventKind> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect()
    }

    #[test]
    fn test_connect_and_track_position() {
        let (mut conn, connector, mut rx) = stellarium();
        conn.start(0).unwrap();
        assert!(matches!(conn.state(), ConnectionState::Connecting { .. }));
        conn.step(SECOND / 10).unwrap();
        assert!(matches!(conn.state(), ConnectionState::Connecting { .. }));

        connector.with(|s| {
            s.established = true;
            s.incoming.extend_from_slice(&encode_position(0, 1.0, 0.5, 0));
            s.incoming.extend_from_slice(&encode_position(SECOND, 1.01, 0.5, 0));
        });
        conn.step(SECOND).unwrap();
        assert!(conn.is_connected());
        assert!(conn.has_known_position());

        // Query lags by the configured delay
        let (ra, dec) = rect_to_spherical(&conn.position(SECOND + 100_000));
        assert_relative_eq!(ra, 1.01, epsilon = 1e-6);
        assert_relative_eq!(dec, 0.5, epsilon = 1e-6);

        assert_eq!(
            kinds(&mut rx),
            vec![ConnectionEventKind::Started, ConnectionEventKind::Connected]
        );
    }

    #[test]
    fn test_unknown_position_falls_back() {
        let (conn, _, _) = stellarium();
        assert!(!conn.has_known_position());
        assert_eq!(conn.position(0), default_position());
    }

    #[test]
    fn test_connect_timeout_arms_backoff() {
        let (mut conn, connector, _) = stellarium();
        conn.start(0).unwrap();
        assert_eq!(conn.step(5 * SECOND), Err(ConnectionError::ConnectTimeout));
        assert_eq!(conn.state(), &ConnectionState::Disconnected);
        assert_eq!(conn.retry_at(), Some(6 * SECOND));

        conn.step(5 * SECOND + 500_000).unwrap();
        assert_eq!(connector.with(|s| s.opens), 1);
        conn.step(6 * SECOND).unwrap();
        assert_eq!(connector.with(|s| s.opens), 2);
        assert!(matches!(conn.state(), ConnectionState::Connecting { .. }));
    }

    #[test]
    fn test_backoff_grows_and_resets_after_success() {
        let (mut conn, connector, _) = stellarium();
        connector.with(|s| s.refuse = Some(LinkError::ConnectFailed("refused".to_string())));
        assert!(conn.start(0).is_err());
        assert_eq!(conn.retry_at(), Some(SECOND));
        assert!(conn.step(SECOND).is_err());
        assert_eq!(conn.retry_at(), Some(3 * SECOND));
        assert_eq!(conn.attempts(), 2);

        connector.with(|s| {
            s.refuse = None;
            s.established = true;
        });
        conn.step(3 * SECOND).unwrap();
        conn.step(3 * SECOND).unwrap();
        assert_eq!(conn.state(), &ConnectionState::Connected);
        assert_eq!(conn.attempts(), 0);
    }

    #[test]
    fn test_malformed_frame_disconnects_and_resets() {
        let (mut conn, connector, mut rx) = stellarium();
        connect(&mut conn, &connector, 0);
        connector.with(|s| {
            s.incoming.extend_from_slice(&encode_position(0, 1.0, 0.5, 0));
            s.incoming.extend_from_slice(&encode_position(SECOND, 1.01, 0.5, 0));
        });
        conn.step(SECOND).unwrap();
        assert!(conn.has_known_position());
        // Newest sample, once the display delay has passed
        let last = conn.position(SECOND + 100_000);
        kinds(&mut rx);

        connector.with(|s| s.incoming.extend_from_slice(&[2, 0, 0, 0]));
        let err = conn.step(2 * SECOND).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(ProtocolError::FrameLength { .. })));
        assert!(!conn.is_connected());
        assert!(!conn.has_known_position());
        // Last good direction stays as the fallback
        assert_relative_eq!(conn.position(3 * SECOND).angle(&last), 0.0, epsilon = 1e-9);
        assert!(matches!(
            kinds(&mut rx).as_slice(),
            [ConnectionEventKind::Disconnected { .. }]
        ));
        assert_eq!(conn.retry_at(), Some(3 * SECOND));
    }

    #[test]
    fn test_eof_disconnects() {
        let (mut conn, connector, _) = stellarium();
        connect(&mut conn, &connector, 0);
        connector.with(|s| s.error = Some(LinkError::Closed));
        assert_eq!(conn.step(SECOND), Err(ConnectionError::Link(LinkError::Closed)));
        assert_eq!(conn.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_idle_link_counts_as_lost() {
        let (mut conn, connector, _) = stellarium();
        connect(&mut conn, &connector, 0);
        conn.step(10 * SECOND).unwrap();
        assert_eq!(conn.step(10 * SECOND + 1), Err(ConnectionError::IdleTimeout(10_000)));
    }

    #[test]
    fn test_reconnect_disabled() {
        let mut cfg = config();
        cfg.reconnection.enabled = false;
        let (mut conn, connector, _) = setup(Box::new(StellariumProtocol::new(Equinox::J2000)), cfg);
        connect(&mut conn, &connector, 0);
        connector.with(|s| s.error = Some(LinkError::Closed));
        assert!(conn.step(SECOND).is_err());
        assert_eq!(conn.retry_at(), None);
        conn.step(100 * SECOND).unwrap();
        assert_eq!(connector.with(|s| s.opens), 1);
    }

    #[test]
    fn test_stop_while_connecting() {
        let (mut conn, connector, mut rx) = stellarium();
        conn.start(0).unwrap();
        conn.stop();
        assert_eq!(conn.state(), &ConnectionState::Disconnected);
        conn.step(60 * SECOND).unwrap();
        assert_eq!(connector.with(|s| s.opens), 1);
        assert_eq!(
            kinds(&mut rx),
            vec![
                ConnectionEventKind::Started,
                ConnectionEventKind::Disconnected {
                    reason: "stopped".to_string()
                },
                ConnectionEventKind::Stopped,
            ]
        );
    }

    #[test]
    fn test_unsupported_transport_fails_permanently() {
        let (mut conn, connector, mut rx) = stellarium();
        connector.with(|s| s.refuse = Some(LinkError::Unsupported("ASCOM".to_string())));
        assert!(matches!(conn.start(0), Err(ConnectionError::Failed(_))));
        assert!(matches!(conn.state(), ConnectionState::Failed { .. }));
        conn.step(100 * SECOND).unwrap();
        assert_eq!(connector.with(|s| s.opens), 1);
        assert!(kinds(&mut rx)
            .iter()
            .any(|k| matches!(k, ConnectionEventKind::Failed { .. })));
    }

    #[test]
    fn test_goto_while_disconnected_is_dropped() {
        let (mut conn, connector, mut rx) = stellarium();
        conn.goto(spherical_to_rect(1.0, 0.2), 0);
        assert!(matches!(
            kinds(&mut rx).as_slice(),
            [ConnectionEventKind::GotoDropped { .. }]
        ));
        connect(&mut conn, &connector, 0);
        conn.step(1).unwrap();
        assert!(connector.with(|s| s.written.is_empty()));
    }

    #[test]
    fn test_goto_is_written_on_next_step() {
        let (mut conn, connector, _) = stellarium();
        connect(&mut conn, &connector, 0);
        conn.goto(spherical_to_rect(2.0, -0.3), 1_000);
        conn.step(2_000).unwrap();
        let written = connector.with(|s| s.written.clone());
        assert_eq!(written.len(), GOTO_LEN);
        let msg = decode_goto(&written).unwrap();
        assert_eq!(msg.client_micros, 1_000);
        assert_relative_eq!(msg.ra, 2.0, epsilon = 1e-8);
        assert_relative_eq!(msg.dec, -0.3, epsilon = 1e-8);
    }

    #[test]
    fn test_backpressure_holds_only_latest_goto() {
        let (mut conn, connector, _) = stellarium();
        connect(&mut conn, &connector, 0);
        connector.with(|s| s.write_limit = Some(0));

        // 120-byte outbox takes six 20-byte gotos
        for i in 0..50 {
            conn.goto(spherical_to_rect(0.01 * i as f64, 0.1), i);
        }
        assert!(conn.has_held_goto());
        conn.step(100).unwrap();
        assert!(conn.has_held_goto());

        connector.with(|s| s.write_limit = None);
        conn.step(200).unwrap();
        conn.step(300).unwrap();
        assert!(!conn.has_held_goto());

        let written = connector.with(|s| s.written.clone());
        assert_eq!(written.len(), 7 * GOTO_LEN);
        let last = decode_goto(&written[6 * GOTO_LEN..]).unwrap();
        assert_relative_eq!(last.ra, 0.49, epsilon = 1e-8);
    }

    #[test]
    fn test_partial_writes_keep_order() {
        let (mut conn, connector, _) = stellarium();
        connect(&mut conn, &connector, 0);
        connector.with(|s| s.write_limit = Some(7));
        conn.goto(spherical_to_rect(1.5, 0.0), 10);
        for t in 0..3 {
            conn.step(20 + t).unwrap();
        }
        let written = connector.with(|s| s.written.clone());
        assert_eq!(written.len(), GOTO_LEN);
        assert_relative_eq!(decode_goto(&written).unwrap().ra, 1.5, epsilon = 1e-8);
    }

    #[test]
    fn test_nexstar_poll_cycle() {
        let cfg = config();
        let protocol = NexStarProtocol::new(NexStarVariant::NexStar, Equinox::J2000, &cfg);
        let (mut conn, connector, _) = setup(Box::new(protocol), cfg);
        connect(&mut conn, &connector, 0);
        // Poll queued on connect, written on the next drain
        conn.step(1).unwrap();
        assert_eq!(connector.with(|s| s.written.clone()), b"E");

        connector.with(|s| s.incoming.extend_from_slice(b"4000,0000#"));
        conn.step(2).unwrap();
        conn.step(500_000).unwrap();
        conn.step(500_001).unwrap();
        connector.with(|s| s.incoming.extend_from_slice(b"4000,0000#"));
        conn.step(600_000).unwrap();
        assert!(conn.has_known_position());
        assert_eq!(connector.with(|s| s.written.clone()), b"EE");
    }

    #[test]
    fn test_nexstar_silence_disconnects() {
        let cfg = config();
        let protocol = NexStarProtocol::new(NexStarVariant::NexStar, Equinox::J2000, &cfg);
        let (mut conn, connector, _) = setup(Box::new(protocol), cfg);
        connect(&mut conn, &connector, 0);
        conn.step(1).unwrap();
        assert_eq!(
            conn.step(2 * SECOND),
            Err(ConnectionError::Protocol(ProtocolError::AnswerTimeout(2_000)))
        );
    }

    #[test]
    fn test_fov_circles_are_mutable() {
        let (mut conn, _, _) = stellarium();
        assert_eq!(conn.fov_circles(), &[0.5, 1.0]);
        conn.set_fov_circles(vec![2.0]);
        assert_eq!(conn.fov_circles(), &[2.0]);
    }
}
