//! Instance descriptors and accepted routes
//!
//! An `InstanceDescriptor` is the durable identity of one Tor client:
//! name, target exit region, local ports, optional bridges, working
//! directory, and the best route accepted so far. Process state lives in
//! the supervisor's handle set and is rebuilt on every manager start,
//! never here.

use crate::bridge::BridgeConfig;
use crate::region::RegionCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Durable description of one fleet instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDescriptor {
    /// Unique instance name; also the working-directory name.
    pub name: String,
    /// Requested exit region.
    pub region: RegionCode,
    /// Local SOCKS5 port, unique across the fleet.
    pub socks_port: u16,
    /// Local control-channel port, unique across the fleet.
    pub control_port: u16,
    /// Bridge lines, opaque to the engine.
    pub bridge: Option<BridgeConfig>,
    /// Working-directory override; defaults to `<base>/<name>`.
    pub data_dir: Option<PathBuf>,
    /// Last accepted route, replaced wholesale on acceptance.
    pub best_route: Option<RouteResult>,
}

impl InstanceDescriptor {
    /// Create a descriptor with no bridges and the default working dir.
    pub fn new(name: &str, region: RegionCode, socks_port: u16, control_port: u16) -> Self {
        Self {
            name: name.to_string(),
            region,
            socks_port,
            control_port,
            bridge: None,
            data_dir: None,
            best_route: None,
        }
    }

    /// Working directory for runtime config, cookie file and Tor state.
    pub fn resolve_data_dir(&self, base: &Path) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => base.join(&self.name),
        }
    }

    /// Does this instance use bridges?
    pub fn uses_bridges(&self) -> bool {
        self.bridge.is_some()
    }

    /// SOCKS proxy URL applications point at.
    pub fn proxy_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.socks_port)
    }
}

/// Outcome of an accepted selection run.
///
/// Owned by exactly one instance. Acceptance replaces the whole record;
/// fields are never merged across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    /// Observed exit IP.
    pub exit_ip: IpAddr,
    /// Observed exit region; `None` when every geo lookup failed
    /// (only acceptable for wildcard instances).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionCode>,
    /// Observed exit city, for listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Time to first byte of the exit-IP lookup, floored at 1 ms.
    pub latency_ms: u64,
    /// Bytes per second over the payload fetch; `None` when the fetch
    /// did not complete at full size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_bps: Option<u64>,
    /// When the accepted probe finished.
    pub measured_at: DateTime<Utc>,
    /// Renewal attempts consumed by the accepting run.
    pub attempts: u32,
}

impl RouteResult {
    /// Throughput in megabits per second, for display.
    pub fn throughput_mbps(&self) -> Option<f64> {
        self.throughput_bps
            .map(|bps| (bps as f64) * 8.0 / 1_000_000.0)
    }

    /// One-line summary for logs and listings.
    pub fn describe(&self) -> String {
        let region = self
            .region
            .as_ref()
            .map(|r| r.as_str())
            .unwrap_or("??");
        match self.throughput_mbps() {
            Some(mbps) => format!(
                "{} ({}) {}ms {:.2} Mbps",
                self.exit_ip, region, self.latency_ms, mbps
            ),
            None => format!("{} ({}) {}ms", self.exit_ip, region, self.latency_ms),
        }
    }
}
