//! Runtime torrc rendering
//!
//! Each start materializes a fresh torrc inside the instance working
//! directory. The engine talks to Tor over SOCKS and the control channel
//! only; everything Tor needs to know is written here.

use rand::Rng;
use std::path::Path;
use torpool_store::InstanceDescriptor;

/// File name of the rendered config inside the working directory.
pub const TORRC_FILE: &str = "torrc";

/// Render the torrc for one instance.
///
/// Region pinning (`ExitNodes` + `StrictNodes`) is omitted for the
/// wildcard region. `NewCircuitPeriod` gets a fresh 15-45 s jitter per
/// render so instances do not rotate circuits in lockstep.
pub fn render(desc: &InstanceDescriptor, data_dir: &Path) -> String {
    render_with_period(desc, data_dir, rand::thread_rng().gen_range(15..=45))
}

/// Does an existing rendered file still describe this descriptor?
///
/// The circuit period is jittered per render, so the comparison
/// re-renders with the period found in the file.
pub(crate) fn matches(desc: &InstanceDescriptor, data_dir: &Path, existing: &str) -> bool {
    let Some(period) = existing
        .lines()
        .find_map(|line| line.strip_prefix("NewCircuitPeriod "))
        .and_then(|value| value.trim().parse::<u32>().ok())
    else {
        return false;
    };
    render_with_period(desc, data_dir, period) == existing
}

fn render_with_period(desc: &InstanceDescriptor, data_dir: &Path, circuit_period: u32) -> String {
    let mut cfg = String::new();

    cfg.push_str(&format!("SocksPort 127.0.0.1:{}\n", desc.socks_port));
    cfg.push_str(&format!("ControlPort 127.0.0.1:{}\n", desc.control_port));
    cfg.push_str("CookieAuthentication 1\n");
    cfg.push_str(&format!("DataDirectory {}\n", data_dir.display()));

    if let Some(bridge) = &desc.bridge {
        cfg.push_str("UseBridges 1\n");
        if let Some(directive) = bridge.transport.plugin_directive() {
            cfg.push_str(&format!("ClientTransportPlugin {}\n", directive));
        }
        for line in &bridge.lines {
            cfg.push_str(&format!("Bridge {}\n", line));
        }
    }

    if let Some(cc) = desc.region.torrc_code() {
        cfg.push_str(&format!("ExitNodes {{{}}}\n", cc));
        cfg.push_str("StrictNodes 1\n");
    }

    // Bridged circuits build slowly; give them double the window.
    let build_timeout = if desc.uses_bridges() { 120 } else { 60 };

    cfg.push_str(&format!("NewCircuitPeriod {}\n", circuit_period));
    cfg.push_str("MaxCircuitDirtiness 300\n");
    cfg.push_str(&format!("CircuitBuildTimeout {}\n", build_timeout));
    cfg.push_str("LearnCircuitBuildTimeout 0\n");
    cfg.push_str("NumEntryGuards 3\n");
    cfg.push_str("UseEntryGuards 1\n");

    cfg
}
