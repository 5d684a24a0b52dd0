//! Runtime descriptor store
//!
//! One `FleetStore` per process holds the working copy of the fleet:
//! insertion-ordered instance records, each behind its own mutex so a
//! route acceptance serializes per instance name instead of contending
//! on a fleet-wide write lock, plus the fleet settings and the file the
//! store was opened from. Nothing here touches disk except `save`.

use crate::fleet::{vet_descriptor, ConfigError, FleetConfig, FleetSettings, SkippedInstance};
use crate::instance::{InstanceDescriptor, RouteResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Process-wide instance descriptor store.
pub struct FleetStore {
    /// Insertion order of instance names.
    order: RwLock<Vec<String>>,
    /// One mutex per record; the outer lock only guards map shape.
    records: RwLock<HashMap<String, Arc<Mutex<InstanceDescriptor>>>>,
    /// Fleet-wide settings.
    settings: RwLock<FleetSettings>,
    /// Fleet file backing this store, if any.
    path: Mutex<Option<PathBuf>>,
}

/// One entry of the proxy-ready listing.
#[derive(Debug, Clone)]
pub struct ProxyReady {
    pub name: String,
    pub socks_port: u16,
    pub route: RouteResult,
}

impl FleetStore {
    /// Empty store with default settings.
    pub fn new() -> Self {
        Self::from_config(FleetConfig::default())
    }

    /// Build a store from a validated configuration.
    pub fn from_config(config: FleetConfig) -> Self {
        let mut order = Vec::with_capacity(config.instances.len());
        let mut records = HashMap::with_capacity(config.instances.len());
        for desc in config.instances {
            order.push(desc.name.clone());
            records.insert(desc.name.clone(), Arc::new(Mutex::new(desc)));
        }
        Self {
            order: RwLock::new(order),
            records: RwLock::new(records),
            settings: RwLock::new(config.settings),
            path: Mutex::new(None),
        }
    }

    /// Open a fleet file, or start empty if it does not exist yet.
    /// The store stays bound to the path for later `save` calls.
    pub fn open(path: &Path) -> Result<(Self, Vec<SkippedInstance>), ConfigError> {
        if path.exists() {
            let load = FleetConfig::load(path)?;
            let store = Self::from_config(load.config);
            store.bind_path(path);
            Ok((store, load.skipped))
        } else {
            info!("fleet file {} not found, starting empty", path.display());
            let store = Self::new();
            store.bind_path(path);
            Ok((store, Vec::new()))
        }
    }

    /// Bind the store to a fleet file for `save`.
    pub fn bind_path(&self, path: &Path) {
        *self.path.lock().unwrap() = Some(path.to_path_buf());
    }

    /// Path the store was opened from.
    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap().clone()
    }

    /// Instance names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.order.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.order.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.read().unwrap().contains_key(name)
    }

    /// Clone of one descriptor.
    pub fn descriptor(&self, name: &str) -> Option<InstanceDescriptor> {
        let record = self.record(name)?;
        let guard = record.lock().unwrap();
        Some(guard.clone())
    }

    /// Clone of the fleet settings.
    pub fn settings(&self) -> FleetSettings {
        self.settings.read().unwrap().clone()
    }

    /// Mutate the fleet settings.
    pub fn update_settings(&self, f: impl FnOnce(&mut FleetSettings)) {
        let mut guard = self.settings.write().unwrap();
        f(&mut guard);
    }

    /// Add an instance after validating it against the current fleet.
    /// Validation runs under the write locks, so two concurrent adds
    /// cannot both pass vetting against the same state.
    pub fn add(&self, desc: InstanceDescriptor) -> Result<(), ConfigError> {
        let mut order = self.order.write().unwrap();
        let mut records = self.records.write().unwrap();
        // Same rules the fleet file uses at load time.
        let existing: Vec<InstanceDescriptor> = order
            .iter()
            .filter_map(|name| records.get(name))
            .map(|record| record.lock().unwrap().clone())
            .collect();
        vet_descriptor(&desc, &existing)?;
        order.push(desc.name.clone());
        records.insert(desc.name.clone(), Arc::new(Mutex::new(desc)));
        Ok(())
    }

    /// Remove an instance, returning its last descriptor.
    pub fn remove(&self, name: &str) -> Option<InstanceDescriptor> {
        let mut order = self.order.write().unwrap();
        let mut records = self.records.write().unwrap();
        order.retain(|n| n != name);
        let record = records.remove(name)?;
        let guard = record.lock().unwrap();
        Some(guard.clone())
    }

    /// Replace an instance's accepted route. The record's own lock is
    /// held for the swap; other instances are untouched.
    pub fn accept_route(&self, name: &str, route: RouteResult) -> Result<(), StoreError> {
        let record = self
            .record(name)
            .ok_or_else(|| StoreError::UnknownInstance(name.to_string()))?;
        let mut guard = record.lock().unwrap();
        debug!("recording route for {}: {}", name, route.describe());
        guard.best_route = Some(route);
        Ok(())
    }

    /// Last accepted route for an instance.
    pub fn best_route(&self, name: &str) -> Option<RouteResult> {
        let record = self.record(name)?;
        let guard = record.lock().unwrap();
        guard.best_route.clone()
    }

    /// Mutate one descriptor under its record lock.
    pub fn update<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut InstanceDescriptor) -> R,
    ) -> Result<R, StoreError> {
        let record = self
            .record(name)
            .ok_or_else(|| StoreError::UnknownInstance(name.to_string()))?;
        let mut guard = record.lock().unwrap();
        Ok(f(&mut guard))
    }

    /// Instances with an accepted route, best first: throughput
    /// descending, then latency ascending. Instances that never accepted
    /// a route are not proxy-ready and are left out.
    pub fn proxy_ready(&self) -> Vec<ProxyReady> {
        let mut ready: Vec<ProxyReady> = Vec::new();
        for name in self.names() {
            if let Some(desc) = self.descriptor(&name) {
                if let Some(route) = desc.best_route {
                    ready.push(ProxyReady {
                        name,
                        socks_port: desc.socks_port,
                        route,
                    });
                }
            }
        }
        ready.sort_by(|a, b| {
            let at = a.route.throughput_bps.unwrap_or(0);
            let bt = b.route.throughput_bps.unwrap_or(0);
            bt.cmp(&at)
                .then(a.route.latency_ms.cmp(&b.route.latency_ms))
        });
        ready
    }

    /// Snapshot the store back into a fleet configuration.
    pub fn snapshot(&self) -> FleetConfig {
        let mut instances = Vec::new();
        for name in self.names() {
            if let Some(desc) = self.descriptor(&name) {
                instances.push(desc);
            }
        }
        FleetConfig {
            settings: self.settings(),
            instances,
        }
    }

    /// Write the snapshot to the bound fleet file.
    pub fn save(&self) -> Result<(), StoreError> {
        let path = self.path().ok_or(StoreError::NotBound)?;
        self.snapshot().save(&path)?;
        info!("fleet saved to {}", path.display());
        Ok(())
    }

    fn record(&self, name: &str) -> Option<Arc<Mutex<InstanceDescriptor>>> {
        self.records.read().unwrap().get(name).cloned()
    }
}

impl Default for FleetStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("store is not bound to a fleet file")]
    NotBound,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
