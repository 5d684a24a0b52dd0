//! Fleet configuration file
//!
//! The fleet file is the single durable artifact: fleet-wide settings plus
//! an ordered list of instance entries. TOML is the primary format, JSON
//! is accepted for tooling. Entries are parsed loosely and vetted one by
//! one, so a duplicate port or unknown region skips that instance with a
//! reported error instead of failing the whole fleet.
//!
//! # File Shape (TOML)
//!
//! ```toml
//! attempt_budget = 3
//! probe_concurrency = 2
//! acceptance = "first-improvement"
//!
//! [[instances]]
//! name = "tor-us"
//! region = "US"
//! socks_port = 9050
//! control_port = 9051
//! ```

use crate::bridge::BridgeConfig;
use crate::instance::{InstanceDescriptor, RouteResult};
use crate::region::{RegionCode, RegionParseError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// How a selection run decides when to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcceptancePolicy {
    /// Accept the first successful matching candidate and end the run.
    #[default]
    FirstImprovement,
    /// Spend the whole budget, keep the best candidate seen
    /// (lower latency first, higher throughput on ties).
    BestOfBudget,
}

/// Fleet-wide tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSettings {
    /// Default renewal attempts per selection run.
    pub attempt_budget: u32,
    /// Re-test interval; `None` disables periodic runs.
    pub schedule_interval_secs: Option<u64>,
    /// Ceiling on simultaneous selection runs (hence probe traffic).
    pub probe_concurrency: usize,
    /// Acceptance policy for selection runs.
    pub acceptance: AcceptancePolicy,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            attempt_budget: 3,
            schedule_interval_secs: None,
            probe_concurrency: 2,
            acceptance: AcceptancePolicy::default(),
        }
    }
}

/// Validated fleet configuration: settings plus ordered instances.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetConfig {
    pub settings: FleetSettings,
    pub instances: Vec<InstanceDescriptor>,
}

/// Result of loading a fleet file: the valid part plus what was skipped.
#[derive(Debug)]
pub struct FleetLoad {
    pub config: FleetConfig,
    pub skipped: Vec<SkippedInstance>,
}

/// One instance entry rejected at load time.
#[derive(Debug)]
pub struct SkippedInstance {
    pub name: String,
    pub reason: ConfigError,
}

impl FleetConfig {
    /// Load from a fleet file, choosing the format by extension.
    pub fn load(path: &Path) -> Result<FleetLoad, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let load = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };
        info!(
            "loaded fleet: {} instances, {} skipped",
            load.config.instances.len(),
            load.skipped.len()
        );
        Ok(load)
    }

    /// Parse from TOML text.
    pub fn from_toml(content: &str) -> Result<FleetLoad, ConfigError> {
        let file: FleetFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(file.vet())
    }

    /// Parse from JSON text.
    pub fn from_json(content: &str) -> Result<FleetLoad, ConfigError> {
        let file: FleetFile =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(file.vet())
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(&FleetFile::from_config(self))
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Render as JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(&FleetFile::from_config(self))
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Write to a fleet file, choosing the format by extension and
    /// creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content = match ext {
            "toml" => self.to_toml()?,
            "json" => self.to_json()?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Add an instance after validating it against the existing fleet.
    pub fn try_add(&mut self, desc: InstanceDescriptor) -> Result<(), ConfigError> {
        vet_descriptor(&desc, &self.instances)?;
        self.instances.push(desc);
        Ok(())
    }

    /// Remove an instance by name.
    pub fn remove(&mut self, name: &str) -> Option<InstanceDescriptor> {
        let idx = self.instances.iter().position(|i| i.name == name)?;
        Some(self.instances.remove(idx))
    }

    /// Find an instance by name.
    pub fn find(&self, name: &str) -> Option<&InstanceDescriptor> {
        self.instances.iter().find(|i| i.name == name)
    }
}

/// Validate one descriptor against the already-accepted fleet.
pub(crate) fn vet_descriptor(
    desc: &InstanceDescriptor,
    existing: &[InstanceDescriptor],
) -> Result<(), ConfigError> {
    vet_name(&desc.name)?;
    for port in [desc.socks_port, desc.control_port] {
        if port < 1024 {
            return Err(ConfigError::ReservedPort(port));
        }
    }
    if desc.socks_port == desc.control_port {
        return Err(ConfigError::DuplicatePort(desc.socks_port));
    }
    for other in existing {
        if other.name == desc.name {
            return Err(ConfigError::DuplicateName(desc.name.clone()));
        }
        for port in [desc.socks_port, desc.control_port] {
            if port == other.socks_port || port == other.control_port {
                return Err(ConfigError::DuplicatePort(port));
            }
        }
    }
    Ok(())
}

/// Names become working-directory names, so keep them filesystem-safe.
fn vet_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

/// On-disk shape. Regions are strings and control ports optional here;
/// `vet` turns entries into validated descriptors.
#[derive(Debug, Serialize, Deserialize)]
struct FleetFile {
    #[serde(default = "default_attempt_budget")]
    attempt_budget: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schedule_interval_secs: Option<u64>,
    #[serde(default = "default_probe_concurrency")]
    probe_concurrency: usize,
    #[serde(default)]
    acceptance: AcceptancePolicy,
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

fn default_attempt_budget() -> u32 {
    3
}

fn default_probe_concurrency() -> usize {
    2
}

#[derive(Debug, Serialize, Deserialize)]
struct InstanceEntry {
    name: String,
    region: String,
    socks_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    control_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bridge: Option<BridgeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    best_route: Option<RouteResult>,
}

impl FleetFile {
    fn vet(self) -> FleetLoad {
        let settings = FleetSettings {
            attempt_budget: self.attempt_budget.max(1),
            schedule_interval_secs: self.schedule_interval_secs,
            probe_concurrency: self.probe_concurrency.max(1),
            acceptance: self.acceptance,
        };

        let mut instances: Vec<InstanceDescriptor> = Vec::new();
        let mut skipped = Vec::new();
        for entry in self.instances {
            let name = entry.name.clone();
            match entry.vet(&instances) {
                Ok(desc) => instances.push(desc),
                Err(reason) => {
                    warn!("skipping instance {:?}: {}", name, reason);
                    skipped.push(SkippedInstance { name, reason });
                }
            }
        }

        FleetLoad {
            config: FleetConfig {
                settings,
                instances,
            },
            skipped,
        }
    }

    fn from_config(config: &FleetConfig) -> FleetFile {
        FleetFile {
            attempt_budget: config.settings.attempt_budget,
            schedule_interval_secs: config.settings.schedule_interval_secs,
            probe_concurrency: config.settings.probe_concurrency,
            acceptance: config.settings.acceptance,
            instances: config
                .instances
                .iter()
                .map(InstanceEntry::from_descriptor)
                .collect(),
        }
    }
}

impl InstanceEntry {
    fn vet(self, accepted: &[InstanceDescriptor]) -> Result<InstanceDescriptor, ConfigError> {
        let region = RegionCode::parse(&self.region)?;
        let control_port = match self.control_port {
            Some(port) => port,
            None => self
                .socks_port
                .checked_add(1)
                .ok_or(ConfigError::ControlPortOverflow(self.socks_port))?,
        };
        let desc = InstanceDescriptor {
            name: self.name,
            region,
            socks_port: self.socks_port,
            control_port,
            bridge: self.bridge,
            data_dir: self.data_dir,
            best_route: self.best_route,
        };
        vet_descriptor(&desc, accepted)?;
        Ok(desc)
    }

    fn from_descriptor(desc: &InstanceDescriptor) -> InstanceEntry {
        InstanceEntry {
            name: desc.name.clone(),
            region: desc.region.as_str().to_string(),
            socks_port: desc.socks_port,
            control_port: Some(desc.control_port),
            bridge: desc.bridge.clone(),
            data_dir: desc.data_dir.clone(),
            best_route: desc.best_route.clone(),
        }
    }
}

/// Fleet file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("unsupported config format (expected .toml or .json)")]
    UnsupportedFormat,

    #[error("duplicate instance name: {0}")]
    DuplicateName(String),

    #[error("port {0} already in use by the fleet")]
    DuplicatePort(u16),

    #[error("port {0} is reserved (use 1024 or above)")]
    ReservedPort(u16),

    #[error("cannot default control port for SOCKS port {0}")]
    ControlPortOverflow(u16),

    #[error("invalid instance name: {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    InvalidRegion(#[from] RegionParseError),
}
