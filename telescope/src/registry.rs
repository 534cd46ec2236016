//! Profiles and the live connections started from them

use crate::codec::{IndiProtocol, NexStarProtocol, Protocol, StellariumProtocol};
use crate::connection::{ConnectionContext, DeviceConnection, TelescopeClient};
use crate::coordinates::Equinox;
use crate::error::{ConfigError, ConnectionError};
use crate::link::Connector;
use crate::profile::{ConnectionProfile, Interface};
use crate::virtual_telescope::VirtualTelescope;
use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Ports tried first when suggesting a port for a new server
pub const PRIVATE_PORTS: RangeInclusive<u16> = 10001..=10009;
/// IANA dynamic range, tried next
pub const DYNAMIC_PORTS: RangeInclusive<u16> = 49152..=65535;
/// Suggested when every candidate is taken
pub const FALLBACK_PORT: u16 = 10000;

pub struct ConnectionRegistry {
    profiles: BTreeMap<String, ConnectionProfile>,
    live: BTreeMap<String, Box<dyn TelescopeClient>>,
    context: ConnectionContext,
}

impl ConnectionRegistry {
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            profiles: BTreeMap::new(),
            live: BTreeMap::new(),
            context,
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Connector used for connections started from now on
    pub fn set_connector(&mut self, connector: Arc<dyn Connector>) {
        self.context.connector = connector;
    }

    /// Validate and store a new profile. Live connections are untouched.
    pub fn add_profile(&mut self, mut profile: ConnectionProfile) -> Result<(), ConfigError> {
        profile.normalize();
        profile.validate()?;
        if self.profiles.contains_key(&profile.name) {
            return Err(ConfigError::DuplicateName(profile.name));
        }
        self.check_shortcut(&profile)?;
        tracing::info!("Added {} profile {}", profile.interface.kind_name(), profile.name);
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    /// Replace an existing profile; refused while its connection runs
    pub fn update_profile(&mut self, mut profile: ConnectionProfile) -> Result<(), ConfigError> {
        if !self.profiles.contains_key(&profile.name) {
            return Err(ConfigError::NotFound(profile.name));
        }
        if self.live.contains_key(&profile.name) {
            return Err(ConfigError::ProfileInUse(profile.name));
        }
        profile.normalize();
        profile.validate()?;
        self.check_shortcut(&profile)?;
        tracing::info!("Updated profile {}", profile.name);
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    /// Delete a profile, stopping its connection first
    pub fn remove_profile(&mut self, name: &str) -> Result<ConnectionProfile, ConfigError> {
        if self.live.contains_key(name) {
            self.stop_connection(name)?;
        }
        let profile = self
            .profiles
            .remove(name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        tracing::info!("Removed profile {}", name);
        Ok(profile)
    }

    fn check_shortcut(&self, profile: &ConnectionProfile) -> Result<(), ConfigError> {
        let Some(shortcut) = profile.shortcut_number else {
            return Ok(());
        };
        match self.profile_by_shortcut(shortcut) {
            Some(owner) if owner.name != profile.name => Err(ConfigError::ShortcutInUse {
                shortcut,
                owner: owner.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.get(name)
    }

    /// All profiles ordered by name
    pub fn profiles(&self) -> impl Iterator<Item = &ConnectionProfile> {
        self.profiles.values()
    }

    pub fn profile_by_shortcut(&self, shortcut: u8) -> Option<&ConnectionProfile> {
        self.profiles
            .values()
            .find(|p| p.shortcut_number == Some(shortcut))
    }

    /// Swap in a whole profile set; invalid entries are skipped with a warning
    pub fn replace_profiles(&mut self, profiles: Vec<ConnectionProfile>) -> usize {
        self.stop_all();
        self.profiles.clear();
        for profile in profiles {
            let name = profile.name.clone();
            if let Err(e) = self.add_profile(profile) {
                tracing::warn!("Skipping stored profile {}: {}", name, e);
            }
        }
        self.profiles.len()
    }

    fn build_client(&self, profile: &ConnectionProfile) -> Result<Box<dyn TelescopeClient>, ConfigError> {
        let config = &self.context.config;
        let protocol: Box<dyn Protocol> = match &profile.interface {
            Interface::Virtual => {
                return Ok(Box::new(VirtualTelescope::new(
                    &profile.name,
                    profile.fov_circles.clone(),
                )))
            }
            Interface::Ascom { ascom_driver_id } => {
                return Err(ConfigError::Unsupported(format!("ASCOM driver {}", ascom_driver_id)))
            }
            Interface::StellariumTcp { .. } => Box::new(StellariumProtocol::new(profile.equinox)),
            Interface::StellariumSerial { device_model, .. } => {
                Box::new(NexStarProtocol::new(*device_model, profile.equinox, config))
            }
            Interface::Indi { indi_device, .. } => {
                if profile.equinox != Equinox::J2000 {
                    tracing::debug!(
                        "{}: INDI devices announce their own frame; equinox setting ignored",
                        profile.name
                    );
                }
                Box::new(IndiProtocol::new(indi_device, config))
            }
        };
        let transport = profile.transport(config).ok_or(ConfigError::MissingField {
            kind: profile.interface.kind_name(),
            field: "transport",
        })?;
        Ok(Box::new(DeviceConnection::new(
            &profile.name,
            transport,
            protocol,
            profile.connect_delay_micros,
            profile.fov_circles.clone(),
            &self.context,
        )))
    }

    /// Build and start the connection for a profile
    pub fn start_connection(&mut self, name: &str, now: i64) -> Result<(), ConfigError> {
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        if self.live.contains_key(name) {
            return Err(ConfigError::AlreadyRunning(name.to_string()));
        }

        let mut client = self.build_client(profile)?;
        match client.start(now) {
            Err(ConnectionError::Failed(reason)) => {
                return Err(ConfigError::StartFailed {
                    name: name.to_string(),
                    reason,
                })
            }
            // Retryable failures keep the connection; it backs off and retries
            Err(e) => tracing::warn!("{}: first connection attempt failed: {}", name, e),
            Ok(()) => {}
        }
        self.live.insert(name.to_string(), client);
        Ok(())
    }

    pub fn stop_connection(&mut self, name: &str) -> Result<(), ConfigError> {
        let mut client = self
            .live
            .remove(name)
            .ok_or_else(|| ConfigError::NotRunning(name.to_string()))?;
        client.stop();
        Ok(())
    }

    pub fn stop_all(&mut self) {
        for (_, mut client) in std::mem::take(&mut self.live) {
            client.stop();
        }
    }

    /// Drop connections that gave up for good; returns their names
    pub fn remove_failed(&mut self) -> Vec<String> {
        let failed: Vec<String> = self
            .live
            .iter()
            .filter(|(_, client)| client.has_failed())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &failed {
            if let Some(mut client) = self.live.remove(name) {
                tracing::warn!("{}: connection failed permanently, removing it", name);
                client.stop();
            }
        }
        failed
    }

    /// Start every profile marked to connect at startup; returns the names started
    pub fn start_all_at_startup(&mut self, now: i64) -> Vec<String> {
        let names: Vec<String> = self
            .profiles
            .values()
            .filter(|p| p.connects_at_startup)
            .map(|p| p.name.clone())
            .collect();
        names
            .into_iter()
            .filter(|name| match self.start_connection(name, now) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Not starting {}: {}", name, e);
                    false
                }
            })
            .collect()
    }

    /// Names of started connections, whether or not the device is reachable
    pub fn list_connected_ids(&self) -> Vec<String> {
        self.live.keys().cloned().collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.live.contains_key(name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.live.get(name).is_some_and(|c| c.is_connected())
    }

    pub fn client(&self, name: &str) -> Option<&dyn TelescopeClient> {
        self.live.get(name).map(|c| c.as_ref())
    }

    pub fn client_mut(&mut self, name: &str) -> Option<&mut (dyn TelescopeClient + 'static)> {
        self.live.get_mut(name).map(|c| c.as_mut())
    }

    pub fn clients_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn TelescopeClient>> {
        self.live.values_mut()
    }

    /// Change the FOV circles of a profile and of its running connection
    pub fn set_fov_circles(&mut self, name: &str, circles: Vec<f64>) -> Result<(), ConfigError> {
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        let mut updated = profile.clone();
        updated.fov_circles = circles;
        updated.normalize();
        updated.validate()?;
        if let Some(client) = self.live.get_mut(name) {
            client.set_fov_circles(updated.fov_circles.clone());
        }
        self.profiles.insert(name.to_string(), updated);
        Ok(())
    }

    /// First port no profile points at.
    ///
    /// Only a hint: nothing is bound to check the port is actually free.
    pub fn find_free_tcp_port(&self) -> u16 {
        let used: HashSet<u16> = self.profiles.values().filter_map(|p| p.tcp_port()).collect();
        PRIVATE_PORTS
            .chain(DYNAMIC_PORTS)
            .find(|port| !used.contains(port))
            .unwrap_or(FALLBACK_PORT)
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
