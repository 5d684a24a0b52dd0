//! Control-channel client for a local Tor process.
//!
//! Speaks the line-oriented control protocol on 127.0.0.1: cookie
//! authentication, circuit renewal, bootstrap polling during startup,
//! liveness checks, graceful shutdown, and resolution of the current
//! exit relay. Only the command subset the fleet needs is implemented.
//!
//! # Protocol shape
//!
//! Commands are CRLF-terminated lines. Reply lines carry a three-digit
//! code and a separator: `-` means more lines follow, `+` opens a data
//! block terminated by a lone `.`, and a space marks the final line.
//! Codes at or above 400 are rejections.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use torpool_store::RegionCode;
use tracing::debug;

/// File Tor drops next to its data directory when cookie auth is on.
pub const COOKIE_FILE: &str = "control_auth_cookie";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("control channel timed out")]
    Timeout,

    #[error("control connection closed")]
    Closed,

    #[error("control cookie unreadable at {path}: {reason}")]
    Cookie { path: PathBuf, reason: String },

    #[error("control authentication rejected: {0}")]
    AuthRejected(String),

    #[error("control command rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("malformed control reply: {0}")]
    Malformed(String),

    #[error("no built circuit with an exit relay")]
    NoExitInfo,
}

/// One parsed reply: the final status code plus the text of every line,
/// data-block lines included.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

/// Exit relay of the newest built general-purpose circuit.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub fingerprint: String,
    pub nickname: Option<String>,
    pub ip: Option<IpAddr>,
    pub region: Option<RegionCode>,
}

/// Authenticated connection to one instance's control port.
#[derive(Debug)]
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
}

impl ControlClient {
    /// Connect and authenticate with the cookie at `cookie_path`.
    pub async fn connect(
        control_port: u16,
        cookie_path: &Path,
        io_timeout: Duration,
    ) -> Result<Self, ControlError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], control_port));
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ControlError::Timeout)??;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            io_timeout,
        };
        client.authenticate(cookie_path).await?;
        Ok(client)
    }

    async fn authenticate(&mut self, cookie_path: &Path) -> Result<(), ControlError> {
        let cookie = tokio::fs::read(cookie_path)
            .await
            .map_err(|err| ControlError::Cookie {
                path: cookie_path.to_path_buf(),
                reason: err.to_string(),
            })?;
        let hex: String = cookie.iter().map(|b| format!("{b:02X}")).collect();
        match self.send(&format!("AUTHENTICATE {hex}")).await {
            Ok(_) => Ok(()),
            Err(ControlError::Rejected { message, .. }) => {
                Err(ControlError::AuthRejected(message))
            }
            Err(err) => Err(err),
        }
    }

    /// Issue one command and collect the full reply. Rejection codes
    /// become errors.
    pub async fn send(&mut self, command: &str) -> Result<Reply, ControlError> {
        let line = format!("{command}\r\n");
        timeout(self.io_timeout, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| ControlError::Timeout)??;
        let reply = self.read_reply().await?;
        if reply.code >= 400 {
            return Err(ControlError::Rejected {
                code: reply.code,
                message: reply.lines.join("; "),
            });
        }
        Ok(reply)
    }

    /// Ask Tor to switch to clean circuits for new streams.
    pub async fn renew_circuit(&mut self) -> Result<(), ControlError> {
        self.send("SIGNAL NEWNYM").await?;
        debug!("circuit renewal signalled");
        Ok(())
    }

    /// Ask Tor to exit cleanly.
    pub async fn shutdown(&mut self) -> Result<(), ControlError> {
        self.send("SIGNAL SHUTDOWN").await?;
        Ok(())
    }

    /// Cheap liveness check.
    pub async fn ping(&mut self) -> Result<(), ControlError> {
        self.send("GETINFO version").await?;
        Ok(())
    }

    /// Bootstrap percentage, 0 through 100.
    pub async fn bootstrap_progress(&mut self) -> Result<u8, ControlError> {
        let reply = self.send("GETINFO status/bootstrap-phase").await?;
        reply
            .lines
            .iter()
            .find_map(|line| parse_bootstrap_progress(line))
            .ok_or_else(|| {
                ControlError::Malformed("bootstrap-phase reply without PROGRESS".to_string())
            })
    }

    /// Resolve the exit of the newest built circuit, then its address
    /// and country from Tor's own consensus and GeoIP data. The relay
    /// can drop out of the consensus between calls, so address and
    /// region stay optional.
    pub async fn exit_info(&mut self) -> Result<ExitInfo, ControlError> {
        let reply = self.send("GETINFO circuit-status").await?;
        let (fingerprint, nickname) =
            newest_built_exit(&reply.lines).ok_or(ControlError::NoExitInfo)?;

        let ip = match self.send(&format!("GETINFO ns/id/{fingerprint}")).await {
            Ok(reply) => router_address(&reply.lines),
            Err(ControlError::Rejected { .. }) => None,
            Err(err) => return Err(err),
        };

        let region = match ip {
            Some(ip) => match self.send(&format!("GETINFO ip-to-country/{ip}")).await {
                Ok(reply) => country_value(&reply.lines),
                Err(ControlError::Rejected { .. }) => None,
                Err(err) => return Err(err),
            },
            None => None,
        };

        Ok(ExitInfo {
            fingerprint,
            nickname,
            ip,
            region,
        })
    }

    async fn read_reply(&mut self) -> Result<Reply, ControlError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.len() < 4 {
                return Err(ControlError::Malformed(line));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| ControlError::Malformed(line.clone()))?;
            let sep = line.as_bytes()[3];
            let text = line[4..].to_string();
            match sep {
                b'-' => lines.push(text),
                b'+' => {
                    lines.push(text);
                    loop {
                        let data = self.read_line().await?;
                        if data == "." {
                            break;
                        }
                        lines.push(data);
                    }
                }
                b' ' => {
                    lines.push(text);
                    return Ok(Reply { code, lines });
                }
                _ => return Err(ControlError::Malformed(line)),
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, ControlError> {
        let mut line = String::new();
        let n = timeout(self.io_timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| ControlError::Timeout)??;
        if n == 0 {
            return Err(ControlError::Closed);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

fn parse_bootstrap_progress(line: &str) -> Option<u8> {
    line.split_whitespace()
        .find_map(|token| token.strip_prefix("PROGRESS="))
        .and_then(|value| value.parse().ok())
}

/// Last hop of the newest BUILT general-purpose circuit, as
/// (fingerprint, nickname).
fn newest_built_exit(lines: &[String]) -> Option<(String, Option<String>)> {
    let mut best: Option<(u64, String, Option<String>)> = None;
    for raw in lines {
        let line = raw.strip_prefix("circuit-status=").unwrap_or(raw);
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 {
            continue;
        }
        let Ok(id) = tokens[0].parse::<u64>() else {
            continue;
        };
        if tokens[1] != "BUILT" {
            continue;
        }
        if let Some(purpose) = tokens.iter().find_map(|t| t.strip_prefix("PURPOSE=")) {
            if purpose != "GENERAL" {
                continue;
            }
        }
        let Some(path) = tokens.iter().find(|t| t.starts_with('$')) else {
            continue;
        };
        let Some(last_hop) = path.split(',').next_back() else {
            continue;
        };
        let (fingerprint, nickname) = split_long_name(last_hop);
        if best.as_ref().is_none_or(|(best_id, _, _)| id > *best_id) {
            best = Some((id, fingerprint, nickname));
        }
    }
    best.map(|(_, fingerprint, nickname)| (fingerprint, nickname))
}

/// Split a `$FINGERPRINT~nickname` long name.
fn split_long_name(hop: &str) -> (String, Option<String>) {
    let hop = hop.strip_prefix('$').unwrap_or(hop);
    match hop.split_once(['~', '=']) {
        Some((fingerprint, nickname)) => {
            (fingerprint.to_ascii_uppercase(), Some(nickname.to_string()))
        }
        None => (hop.to_ascii_uppercase(), None),
    }
}

/// Address column of an `ns/id` router status entry. Only the `r` line
/// carries one, and only one field on it parses as an IP.
fn router_address(lines: &[String]) -> Option<IpAddr> {
    for line in lines {
        if let Some(rest) = line.strip_prefix("r ") {
            for field in rest.split_whitespace() {
                if let Ok(ip) = field.parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }
    None
}

/// Country from an `ip-to-country` reply. Tor answers `??` when its
/// GeoIP database has no entry, which maps to no region here.
fn country_value(lines: &[String]) -> Option<RegionCode> {
    for line in lines {
        if let Some((key, value)) = line.split_once('=') {
            if key.starts_with("ip-to-country/") {
                return RegionCode::parse(value).ok();
            }
        }
    }
    None
}
