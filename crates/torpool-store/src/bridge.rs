//! Bridge configuration
//!
//! Bridges are carried as opaque lines: the engine detects the pluggable
//! transport so it can emit the matching `ClientTransportPlugin` directive,
//! and otherwise never interprets the parameter blob. Lines are stored
//! without the leading `Bridge ` keyword; the torrc renderer adds it.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Pluggable transport carried by a set of bridge lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Plain `address:port fingerprint` bridges, no transport plugin.
    Vanilla,
    Obfs4,
    Snowflake,
    MeekAzure,
    Webtunnel,
}

impl Transport {
    /// Detect the transport named in a single bridge line.
    pub fn detect(line: &str) -> Transport {
        let lower = line.to_ascii_lowercase();
        if lower.contains("obfs4") {
            Transport::Obfs4
        } else if lower.contains("snowflake") {
            Transport::Snowflake
        } else if lower.contains("meek-azure") || lower.contains("meek_lite") {
            Transport::MeekAzure
        } else if lower.contains("webtunnel") {
            Transport::Webtunnel
        } else {
            Transport::Vanilla
        }
    }

    /// `ClientTransportPlugin` directive body for this transport, if any.
    pub fn plugin_directive(&self) -> Option<&'static str> {
        match self {
            Transport::Vanilla => None,
            Transport::Obfs4 => Some("obfs4 exec /usr/bin/obfs4proxy"),
            Transport::Snowflake => Some("snowflake exec /usr/bin/snowflake-client"),
            Transport::MeekAzure => Some("meek_lite exec /usr/bin/meek-client"),
            Transport::Webtunnel => Some("webtunnel exec /usr/bin/webtunnel-client"),
        }
    }

    /// Name as shown in listings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Vanilla => "vanilla",
            Transport::Obfs4 => "obfs4",
            Transport::Snowflake => "snowflake",
            Transport::MeekAzure => "meek-azure",
            Transport::Webtunnel => "webtunnel",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A set of bridge lines sharing one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Detected transport; decides the `ClientTransportPlugin` directive.
    pub transport: Transport,
    /// Bridge lines without the leading `Bridge ` keyword.
    pub lines: Vec<String>,
}

impl BridgeConfig {
    /// Parse pasted bridge input: one bridge per line, blank lines and
    /// `#` comments ignored, a leading `Bridge ` keyword stripped.
    ///
    /// Mixed transports resolve to the first one seen, with a warning;
    /// Tor would accept the extra `ClientTransportPlugin` directives, but
    /// a single pool of same-transport bridges is what the fleet expects.
    pub fn parse(input: &str) -> Result<BridgeConfig, BridgeParseError> {
        let mut lines = Vec::new();
        let mut transports = Vec::new();

        for raw in input.lines() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let line = trimmed
                .strip_prefix("Bridge ")
                .or_else(|| trimmed.strip_prefix("bridge "))
                .unwrap_or(trimmed)
                .trim()
                .to_string();

            let transport = Transport::detect(&line);
            if !transports.contains(&transport) {
                transports.push(transport);
            }
            lines.push(line);
        }

        if lines.is_empty() {
            return Err(BridgeParseError::Empty);
        }
        if transports.len() > 1 {
            let names: Vec<&str> = transports.iter().map(|t| t.as_str()).collect();
            warn!("mixed bridge transports: {}, using {}", names.join(", "), names[0]);
        }

        Ok(BridgeConfig {
            transport: transports[0],
            lines,
        })
    }

    /// Number of configured bridges.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when no lines are configured (not constructible via `parse`).
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Bridge input errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeParseError {
    #[error("no bridge lines in input")]
    Empty,
}
