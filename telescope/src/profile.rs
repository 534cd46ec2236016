//! Persisted connection profiles
//!
//! A profile is everything needed to (re)start one connection. Keys follow
//! the stored file format (`interfaceKind`, `tcpPort`, ...); the profile name
//! is the map key in that file and is not repeated inside the entry.

use crate::codec::NexStarVariant;
use crate::config::ControlConfig;
use crate::coordinates::Equinox;
use crate::error::ConfigError;
use crate::link::Transport;
use crate::store::VERSION_KEY;
use serde::{Deserialize, Serialize};

pub const MAX_FOV_CIRCLES: usize = 10;
pub const MAX_CONNECT_DELAY_MICROS: i64 = 10_000_000;
pub const DEFAULT_CONNECT_DELAY_MICROS: i64 = 500_000;
pub const DEFAULT_INDI_PORT: u16 = scopelink_indi::INDI_DEFAULT_PORT;
/// Ports below this are reserved for system services
pub const MIN_TCP_PORT: u16 = 1024;

fn default_connect_delay() -> i64 {
    DEFAULT_CONNECT_DELAY_MICROS
}

fn default_indi_port() -> u16 {
    DEFAULT_INDI_PORT
}

/// How the mount is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "interfaceKind")]
pub enum Interface {
    /// Simulated mount
    Virtual,
    /// Stellarium telescope server over TCP
    #[serde(rename_all = "camelCase")]
    StellariumTcp { host: String, tcp_port: u16 },
    /// Celestron hand controller on a serial port
    #[serde(rename_all = "camelCase")]
    StellariumSerial {
        serial_port: String,
        #[serde(default)]
        device_model: NexStarVariant,
    },
    /// INDI device behind an indiserver or a local driver
    #[serde(rename_all = "camelCase")]
    Indi {
        indi_device: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default = "default_indi_port")]
        tcp_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        indi_driver: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Ascom { ascom_driver_id: String },
}

impl Interface {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Interface::Virtual => "Virtual",
            Interface::StellariumTcp { .. } => "StellariumTcp",
            Interface::StellariumSerial { .. } => "StellariumSerial",
            Interface::Indi { .. } => "Indi",
            Interface::Ascom { .. } => "Ascom",
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.kind_name();
        let missing = |field| ConfigError::MissingField { kind, field };
        match self {
            Interface::Virtual => Ok(()),
            Interface::StellariumTcp { host, tcp_port } => {
                if host.trim().is_empty() {
                    return Err(missing("host"));
                }
                check_tcp_port(*tcp_port)
            }
            Interface::StellariumSerial { serial_port, .. } => {
                if serial_port.is_empty() {
                    return Err(missing("serialPort"));
                }
                if !(serial_port.starts_with("/dev/") || serial_port.starts_with("COM")) {
                    return Err(ConfigError::InvalidSerialPort(serial_port.clone()));
                }
                Ok(())
            }
            Interface::Indi {
                indi_device,
                host,
                tcp_port,
                indi_driver,
            } => {
                if indi_device.trim().is_empty() {
                    return Err(missing("indiDevice"));
                }
                let host = host.as_deref().filter(|h| !h.trim().is_empty());
                let driver = indi_driver.as_deref().filter(|d| !d.trim().is_empty());
                match (host, driver) {
                    (Some(_), Some(_)) => Err(ConfigError::ConflictingFields {
                        kind,
                        first: "host",
                        second: "indiDriver",
                    }),
                    (Some(_), None) => check_tcp_port(*tcp_port),
                    (None, Some(_)) => Ok(()),
                    (None, None) => Err(missing("host or indiDriver")),
                }
            }
            Interface::Ascom { ascom_driver_id } => {
                if ascom_driver_id.trim().is_empty() {
                    return Err(missing("ascomDriverId"));
                }
                Ok(())
            }
        }
    }
}

fn check_tcp_port(port: u16) -> Result<(), ConfigError> {
    if port < MIN_TCP_PORT {
        return Err(ConfigError::InvalidTcpPort(port));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Unique key; also the id used by the service
    #[serde(skip)]
    pub name: String,
    #[serde(flatten)]
    pub interface: Interface,
    #[serde(default)]
    pub equinox: Equinox,
    /// Assumed one-way latency between the mount and us
    #[serde(default = "default_connect_delay")]
    pub connect_delay_micros: i64,
    #[serde(default)]
    pub connects_at_startup: bool,
    /// Field-of-view circle diameters in degrees
    #[serde(default)]
    pub fov_circles: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut_number: Option<u8>,
}

impl ConnectionProfile {
    pub fn new(name: &str, interface: Interface) -> Self {
        Self {
            name: name.to_string(),
            interface,
            equinox: Equinox::J2000,
            connect_delay_micros: DEFAULT_CONNECT_DELAY_MICROS,
            connects_at_startup: false,
            fov_circles: Vec::new(),
            shortcut_number: None,
        }
    }

    /// Sort and deduplicate the FOV circles
    pub fn normalize(&mut self) {
        self.fov_circles.sort_by(f64::total_cmp);
        self.fov_circles.dedup();
    }

    /// Checks that need only this profile (uniqueness is the registry's job)
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.name.contains(['\\', '"']) {
            return Err(ConfigError::ReservedCharacter(self.name.clone()));
        }
        if self.name == VERSION_KEY {
            return Err(ConfigError::ReservedName(self.name.clone()));
        }
        self.interface.validate()?;

        if self.connect_delay_micros <= 0 || self.connect_delay_micros > MAX_CONNECT_DELAY_MICROS {
            return Err(ConfigError::InvalidDelay(self.connect_delay_micros));
        }
        if let Some(bad) = self
            .fov_circles
            .iter()
            .find(|c| !c.is_finite() || **c <= 0.0)
        {
            return Err(ConfigError::InvalidFovCircle(*bad));
        }
        if self.fov_circles.len() > MAX_FOV_CIRCLES {
            return Err(ConfigError::TooManyFovCircles(self.fov_circles.len()));
        }
        if let Some(shortcut) = self.shortcut_number {
            if !(1..=9).contains(&shortcut) {
                return Err(ConfigError::InvalidShortcut(shortcut));
            }
        }
        Ok(())
    }

    /// TCP port this profile points at, if any
    pub fn tcp_port(&self) -> Option<u16> {
        match &self.interface {
            Interface::StellariumTcp { tcp_port, .. } => Some(*tcp_port),
            Interface::Indi {
                host: Some(host),
                tcp_port,
                ..
            } if !host.trim().is_empty() => Some(*tcp_port),
            _ => None,
        }
    }

    /// Where the connection's bytes go; `None` for interfaces without a link
    pub fn transport(&self, config: &ControlConfig) -> Option<Transport> {
        match &self.interface {
            Interface::StellariumTcp { host, tcp_port } => Some(Transport::Tcp {
                host: host.clone(),
                port: *tcp_port,
            }),
            Interface::StellariumSerial { serial_port, .. } => Some(Transport::Serial {
                path: serial_port.clone(),
                baud_rate: config.serial_baud_rate,
            }),
            Interface::Indi {
                host: Some(host),
                tcp_port,
                ..
            } if !host.trim().is_empty() => Some(Transport::Tcp {
                host: host.clone(),
                port: *tcp_port,
            }),
            Interface::Indi {
                indi_driver: Some(driver),
                ..
            } => Some(Transport::Process {
                program: driver.clone(),
                args: Vec::new(),
            }),
            Interface::Indi { .. } | Interface::Virtual | Interface::Ascom { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(name: &str, port: u16) -> ConnectionProfile {
        ConnectionProfile::new(
            name,
            Interface::StellariumTcp {
                host: "localhost".to_string(),
                tcp_port: port,
            },
        )
    }

    #[test]
    fn test_valid_profiles() {
        assert_eq!(tcp("Scope", 10001).validate(), Ok(()));
        assert_eq!(ConnectionProfile::new("Sim", Interface::Virtual).validate(), Ok(()));
        let serial = ConnectionProfile::new(
            "CPC",
            Interface::StellariumSerial {
                serial_port: "COM3".to_string(),
                device_model: NexStarVariant::NexStarPrecise,
            },
        );
        assert_eq!(serial.validate(), Ok(()));
    }

    #[test]
    fn test_name_rules() {
        assert_eq!(tcp("", 10001).validate(), Err(ConfigError::EmptyName));
        assert!(matches!(
            tcp("a\"b", 10001).validate(),
            Err(ConfigError::ReservedCharacter(_))
        ));
        assert!(matches!(
            tcp("a\\b", 10001).validate(),
            Err(ConfigError::ReservedCharacter(_))
        ));
        assert_eq!(
            ConnectionProfile::new("version", Interface::Virtual).validate(),
            Err(ConfigError::ReservedName("version".to_string()))
        );
        assert_eq!(tcp("Version", 10001).validate(), Ok(()));
    }

    #[test]
    fn test_port_boundary() {
        assert_eq!(tcp("x", 1023).validate(), Err(ConfigError::InvalidTcpPort(1023)));
        assert_eq!(tcp("x", 1024).validate(), Ok(()));
        assert_eq!(tcp("x", 65535).validate(), Ok(()));
    }

    #[test]
    fn test_serial_port_prefix() {
        let profile = ConnectionProfile::new(
            "x",
            Interface::StellariumSerial {
                serial_port: "ttyUSB0".to_string(),
                device_model: NexStarVariant::NexStar,
            },
        );
        assert!(matches!(profile.validate(), Err(ConfigError::InvalidSerialPort(_))));
    }

    #[test]
    fn test_delay_bounds() {
        let mut profile = tcp("x", 10001);
        profile.connect_delay_micros = 0;
        assert_eq!(profile.validate(), Err(ConfigError::InvalidDelay(0)));
        profile.connect_delay_micros = MAX_CONNECT_DELAY_MICROS;
        assert_eq!(profile.validate(), Ok(()));
        profile.connect_delay_micros = MAX_CONNECT_DELAY_MICROS + 1;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_fov_circles() {
        let mut profile = tcp("x", 10001);
        profile.fov_circles = vec![2.0, 0.5, 2.0, 1.0];
        profile.normalize();
        assert_eq!(profile.fov_circles, vec![0.5, 1.0, 2.0]);
        assert_eq!(profile.validate(), Ok(()));

        profile.fov_circles = (1..=11).map(f64::from).collect();
        assert_eq!(profile.validate(), Err(ConfigError::TooManyFovCircles(11)));

        profile.fov_circles = vec![0.0];
        assert_eq!(profile.validate(), Err(ConfigError::InvalidFovCircle(0.0)));
    }

    #[test]
    fn test_shortcut_range() {
        let mut profile = tcp("x", 10001);
        profile.shortcut_number = Some(0);
        assert_eq!(profile.validate(), Err(ConfigError::InvalidShortcut(0)));
        profile.shortcut_number = Some(9);
        assert_eq!(profile.validate(), Ok(()));
        profile.shortcut_number = Some(10);
        assert_eq!(profile.validate(), Err(ConfigError::InvalidShortcut(10)));
    }

    #[test]
    fn test_indi_endpoints() {
        let indi = |host: Option<&str>, driver: Option<&str>| {
            ConnectionProfile::new(
                "x",
                Interface::Indi {
                    indi_device: "Telescope Simulator".to_string(),
                    host: host.map(str::to_string),
                    tcp_port: DEFAULT_INDI_PORT,
                    indi_driver: driver.map(str::to_string),
                },
            )
        };
        let config = ControlConfig::default();

        let remote = indi(Some("indi.local"), None);
        assert_eq!(remote.validate(), Ok(()));
        assert_eq!(remote.tcp_port(), Some(7624));
        assert_eq!(
            remote.transport(&config),
            Some(Transport::Tcp {
                host: "indi.local".to_string(),
                port: 7624
            })
        );

        let local = indi(None, Some("indi_simulator_telescope"));
        assert_eq!(local.validate(), Ok(()));
        assert_eq!(local.tcp_port(), None);
        assert!(matches!(local.transport(&config), Some(Transport::Process { .. })));

        // A blank host counts as absent
        let blank_host = indi(Some("  "), Some("indi_simulator_telescope"));
        assert_eq!(blank_host.validate(), Ok(()));
        assert_eq!(blank_host.tcp_port(), None);
        assert!(matches!(blank_host.transport(&config), Some(Transport::Process { .. })));

        assert!(matches!(
            indi(Some("h"), Some("d")).validate(),
            Err(ConfigError::ConflictingFields { .. })
        ));
        assert!(matches!(
            indi(None, None).validate(),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_ascom_needs_driver_id() {
        let profile = ConnectionProfile::new(
            "x",
            Interface::Ascom {
                ascom_driver_id: String::new(),
            },
        );
        assert!(matches!(profile.validate(), Err(ConfigError::MissingField { .. })));
    }

    #[test]
    fn test_stored_format() {
        let mut profile = tcp("Scope", 10001);
        profile.equinox = Equinox::JNow;
        profile.shortcut_number = Some(2);
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["interfaceKind"], "StellariumTcp");
        assert_eq!(json["tcpPort"], 10001);
        assert_eq!(json["equinox"], "JNow");
        assert_eq!(json["connectDelayMicros"], 500_000);
        assert_eq!(json["shortcutNumber"], 2);
        assert!(json.get("name").is_none());

        let back: ConnectionProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back.interface, profile.interface);
        assert_eq!(back.equinox, Equinox::JNow);
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let profile: ConnectionProfile = serde_json::from_str(
            r#"{"interfaceKind":"Indi","indiDevice":"EQMod Mount","host":"localhost"}"#,
        )
        .unwrap();
        assert_eq!(profile.tcp_port(), Some(DEFAULT_INDI_PORT));
        assert_eq!(profile.connect_delay_micros, DEFAULT_CONNECT_DELAY_MICROS);
        assert!(!profile.connects_at_startup);
    }
}
