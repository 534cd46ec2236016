//! Live telescope mount connections
//!
//! Keeps connections to mounts reachable over the Stellarium TCP protocol,
//! a Celestron hand controller on a serial port, or INDI, and answers
//! "where is the telescope pointing right now" with jitter-smoothed J2000
//! estimates.
//!
//! ## Features
//!
//! - Non-blocking per-tick stepping of every connection from one thread
//! - Reconnect with exponential backoff after link or protocol failures
//! - J2000 and equinox-of-date conversion for mounts working in JNow
//! - Validated connection profiles persisted as JSON
//! - A simulated mount, both in-process and as a Stellarium server

pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod coordinates;
pub mod error;
pub mod events;
pub mod interpolator;
pub mod link;
pub mod profile;
pub mod registry;
pub mod server;
pub mod service;
pub mod store;
pub mod virtual_telescope;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ControlConfig, ReconnectionConfig};
pub use connection::{ConnectionState, DeviceConnection, TelescopeClient};
pub use coordinates::Equinox;
pub use error::{ConfigError, ConnectionError, LinkError, ProtocolError, StoreError};
pub use events::{ConnectionEvent, ConnectionEventKind};
pub use interpolator::{PositionInterpolator, PositionSample};
pub use profile::{ConnectionProfile, Interface};
pub use registry::ConnectionRegistry;
pub use server::DummyServer;
pub use service::TelescopeControl;
pub use store::ProfileStore;
pub use virtual_telescope::VirtualTelescope;
