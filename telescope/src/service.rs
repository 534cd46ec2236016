//! Host-facing entry point
//!
//! The host calls [`TelescopeControl::tick`] on its update cadence; each
//! tick steps every live connection once. Everything here runs on the
//! host's update thread. Network and driver I/O runs on a small tokio
//! runtime owned by the service and only hands over byte chunks.

use crate::clock::{Clock, SystemClock};
use crate::config::ControlConfig;
use crate::connection::{default_position, ConnectionContext};
use crate::error::{ConfigError, StoreError};
use crate::events::{ConnectionEvent, EventSink};
use crate::link::{Connector, RuntimeConnector};
use crate::profile::ConnectionProfile;
use crate::registry::ConnectionRegistry;
use crate::store::ProfileStore;
use nalgebra::Vector3;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::broadcast;

pub struct TelescopeControl {
    registry: ConnectionRegistry,
    clock: Arc<dyn Clock>,
    events: EventSink,
    store: Option<ProfileStore>,
    runtime: Option<Runtime>,
}

impl TelescopeControl {
    pub fn new(config: ControlConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("scopelink-io")
            .enable_all()
            .build()?;
        let events = EventSink::new(config.event_capacity);
        let context = ConnectionContext {
            connector: Arc::new(RuntimeConnector::new(runtime.handle().clone())),
            config,
            events: events.clone(),
        };
        Ok(Self {
            registry: ConnectionRegistry::new(context),
            clock: Arc::new(SystemClock),
            events,
            store: None,
            runtime: Some(runtime),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace how links are opened (connections started later use it)
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.registry.set_connector(connector);
        self
    }

    pub fn with_store(mut self, store: ProfileStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn now_micros(&self) -> i64 {
        self.clock.now_micros()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn report(&self, operation: &str, result: Result<(), ConfigError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{} failed: {}", operation, e);
                false
            }
        }
    }

    pub fn add_connection(&mut self, profile: ConnectionProfile) -> bool {
        let result = self.registry.add_profile(profile);
        self.report("Adding connection", result)
    }

    pub fn update_connection(&mut self, profile: ConnectionProfile) -> bool {
        let result = self.registry.update_profile(profile);
        self.report("Updating connection", result)
    }

    pub fn remove_connection(&mut self, id: &str) -> bool {
        let result = self.registry.remove_profile(id).map(|_| ());
        self.report("Removing connection", result)
    }

    pub fn start_connection(&mut self, id: &str) -> bool {
        let now = self.now_micros();
        let result = self.registry.start_connection(id, now);
        self.report("Starting connection", result)
    }

    pub fn stop_connection(&mut self, id: &str) -> bool {
        let result = self.registry.stop_connection(id);
        self.report("Stopping connection", result)
    }

    /// Start every profile marked to connect at startup
    pub fn start_all_at_startup(&mut self) -> Vec<String> {
        let now = self.now_micros();
        self.registry.start_all_at_startup(now)
    }

    pub fn stop_all(&mut self) {
        self.registry.stop_all();
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.registry.is_connected(id)
    }

    pub fn has_known_position(&self, id: &str) -> bool {
        self.registry
            .client(id)
            .is_some_and(|c| c.has_known_position())
    }

    /// Started connections, reachable or not
    pub fn list_connected_ids(&self) -> Vec<String> {
        self.registry.list_connected_ids()
    }

    pub fn profile(&self, id: &str) -> Option<&ConnectionProfile> {
        self.registry.profile(id)
    }

    pub fn find_free_tcp_port(&self) -> u16 {
        self.registry.find_free_tcp_port()
    }

    pub fn set_fov_circles(&mut self, id: &str, circles: Vec<f64>) -> bool {
        let result = self.registry.set_fov_circles(id, circles);
        self.report("Setting FOV circles", result)
    }

    /// Slew a running connection to a J2000 direction
    pub fn telescope_goto(&mut self, id: &str, target_j2000: Vector3<f64>) {
        let now = self.now_micros();
        match self.registry.client_mut(id) {
            Some(client) => client.goto(target_j2000, now),
            None => tracing::warn!("Goto for {} ignored: not running", id),
        }
    }

    /// Estimated J2000 direction of a running connection at `now_micros`.
    ///
    /// Unknown ids get the default direction.
    pub fn get_equatorial_position(&self, id: &str, now_micros: i64) -> Vector3<f64> {
        self.registry
            .client(id)
            .map(|c| c.position(now_micros))
            .unwrap_or_else(default_position)
    }

    /// Per-frame hook; time-based animation is the host's business
    pub fn tick(&mut self, delta_micros: i64) {
        tracing::trace!("tick {}us", delta_micros);
        self.communicate();
    }

    /// Step every live connection once
    pub fn communicate(&mut self) {
        let now = self.now_micros();
        for client in self.registry.clients_mut() {
            // Failures are contained to their own connection
            if let Err(e) = client.step(now) {
                tracing::debug!("{}: step reported {}", client.id(), e);
            }
        }
        self.registry.remove_failed();
    }

    pub fn save_profiles(&self) -> Result<(), StoreError> {
        match &self.store {
            Some(store) => store.save(self.registry.profiles()),
            None => {
                tracing::warn!("No profile store configured; not saving");
                Ok(())
            }
        }
    }

    /// Replace all profiles with the stored ones; returns how many were loaded
    pub fn load_profiles(&mut self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            tracing::warn!("No profile store configured; nothing to load");
            return Ok(0);
        };
        let profiles = store.load()?;
        Ok(self.registry.replace_profiles(profiles))
    }
}

impl Drop for TelescopeControl {
    fn drop(&mut self) {
        self.registry.stop_all();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
