//! Active route measurement through an instance's SOCKS proxy.
//!
//! A probe answers three questions about the circuit an instance is
//! currently using: where does traffic leave (exit IP and region), how
//! quickly does a request come back (latency), and how fast does a
//! known payload transfer (throughput). Every request rides the
//! instance's own proxy, so the numbers reflect what a client of that
//! instance would see.
//!
//! Each stage walks a ladder of public services and keeps the first
//! usable answer. A failed stage degrades the report (unknown region,
//! no throughput figure) rather than failing the probe; only losing
//! every IP service or the overall deadline is fatal.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use torpool_store::{RegionCode, RouteResult};
use tracing::{debug, warn};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe did not finish within {0:?}")]
    Timeout(Duration),

    #[error("probe connection failed: {0}")]
    Connection(String),
}

/// Geo lookup endpoint. `{ip}` in the URL is replaced with the exit
/// address; the keys name where the JSON answer keeps its fields.
#[derive(Debug, Clone)]
pub struct GeoService {
    pub url: String,
    pub country_key: String,
    pub city_key: String,
}

/// Payload of known size for throughput measurement.
#[derive(Debug, Clone)]
pub struct PayloadTarget {
    pub url: String,
    pub expected_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Services answering with the caller's public IP in plain text.
    pub ip_services: Vec<String>,
    pub geo_services: Vec<GeoService>,
    pub payload_targets: Vec<PayloadTarget>,
    /// Per-request ceiling for IP and geo lookups.
    pub request_timeout: Duration,
    /// Per-request ceiling for payload transfers.
    pub payload_timeout: Duration,
    /// Hard cap on any proxied response body.
    pub max_body: u64,
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ip_services: vec![
                "http://api.ipify.org/".to_string(),
                "http://checkip.amazonaws.com/".to_string(),
                "http://icanhazip.com/".to_string(),
                "http://ipecho.net/plain".to_string(),
                "http://myexternalip.com/raw".to_string(),
            ],
            geo_services: vec![
                GeoService {
                    url: "http://ip-api.com/json/{ip}".to_string(),
                    country_key: "countryCode".to_string(),
                    city_key: "city".to_string(),
                },
                GeoService {
                    url: "https://ipapi.co/{ip}/json/".to_string(),
                    country_key: "country_code".to_string(),
                    city_key: "city".to_string(),
                },
                GeoService {
                    url: "https://ipwho.is/{ip}".to_string(),
                    country_key: "country_code".to_string(),
                    city_key: "city".to_string(),
                },
                GeoService {
                    url: "http://www.geoplugin.net/json.gp?ip={ip}".to_string(),
                    country_key: "geoplugin_countryCode".to_string(),
                    city_key: "geoplugin_city".to_string(),
                },
            ],
            payload_targets: vec![
                PayloadTarget {
                    url: "http://httpbin.org/bytes/50000".to_string(),
                    expected_bytes: 50_000,
                },
                PayloadTarget {
                    url: "http://httpbin.org/bytes/25000".to_string(),
                    expected_bytes: 25_000,
                },
                PayloadTarget {
                    url: "http://speedtest.ftp.otenet.gr/files/test100k.db".to_string(),
                    expected_bytes: 100_000,
                },
            ],
            request_timeout: Duration::from_secs(15),
            payload_timeout: Duration::from_secs(12),
            max_body: 4 * 1024 * 1024,
            user_agent: "torpool/0.1".to_string(),
        }
    }
}

/// Outcome of one probe. Latency is time to first response byte,
/// floored at one millisecond; throughput is present only when a
/// payload transferred completely.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub exit_ip: IpAddr,
    pub region: Option<RegionCode>,
    pub city: Option<String>,
    pub latency_ms: u64,
    pub throughput_bps: Option<u64>,
}

impl ProbeReport {
    pub fn into_route(self, attempts: u32) -> RouteResult {
        RouteResult {
            exit_ip: self.exit_ip,
            region: self.region,
            city: self.city,
            latency_ms: self.latency_ms,
            throughput_bps: self.throughput_bps,
            measured_at: Utc::now(),
            attempts,
        }
    }
}

struct FetchOutcome {
    body: Vec<u8>,
    ttfb: Duration,
    total: Duration,
}

pub struct Prober {
    config: ProbeConfig,
    tls: Arc<ClientConfig>,
}

impl Prober {
    pub fn new(config: ProbeConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Self {
            config,
            tls: Arc::new(tls),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ProbeConfig::default())
    }

    /// Measure the route behind `socks_port`. The deadline bounds the
    /// whole probe, ladders included.
    pub async fn probe(
        &self,
        socks_port: u16,
        deadline: Duration,
    ) -> Result<ProbeReport, ProbeError> {
        timeout(deadline, self.probe_stages(socks_port))
            .await
            .map_err(|_| ProbeError::Timeout(deadline))?
    }

    async fn probe_stages(&self, socks_port: u16) -> Result<ProbeReport, ProbeError> {
        let mut exit_ip = None;
        let mut latency_ms = 0u64;
        let mut last_error = String::new();
        for service in &self.config.ip_services {
            match self.fetch(socks_port, service, self.config.request_timeout).await {
                Ok(outcome) => {
                    let text = String::from_utf8_lossy(&outcome.body);
                    match text.trim().parse::<IpAddr>() {
                        Ok(ip) => {
                            latency_ms = (outcome.ttfb.as_millis().max(1)) as u64;
                            exit_ip = Some(ip);
                            break;
                        }
                        Err(_) => debug!(%service, "IP service answered garbage"),
                    }
                }
                Err(err) => {
                    debug!(%service, error = %err, "IP service failed");
                    last_error = err.to_string();
                }
            }
        }
        let Some(exit_ip) = exit_ip else {
            return Err(ProbeError::Connection(if last_error.is_empty() {
                "no IP service gave a usable answer".to_string()
            } else {
                last_error
            }));
        };

        let mut region = None;
        let mut city = None;
        for service in &self.config.geo_services {
            let url = service.url.replace("{ip}", &exit_ip.to_string());
            match self.fetch(socks_port, &url, self.config.request_timeout).await {
                Ok(outcome) => {
                    let Ok(value) =
                        serde_json::from_slice::<serde_json::Value>(&outcome.body)
                    else {
                        continue;
                    };
                    let parsed = value
                        .get(&service.country_key)
                        .and_then(|v| v.as_str())
                        .and_then(|code| RegionCode::parse(code).ok());
                    if let Some(found) = parsed {
                        city = value
                            .get(&service.city_key)
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string());
                        region = Some(found);
                        break;
                    }
                }
                Err(err) => debug!(%url, error = %err, "geo service failed"),
            }
        }
        if region.is_none() {
            warn!(%exit_ip, "exit region could not be determined");
        }

        let mut throughput_bps = None;
        for target in &self.config.payload_targets {
            match self
                .fetch(socks_port, &target.url, self.config.payload_timeout)
                .await
            {
                Ok(outcome) => {
                    let got = outcome.body.len() as u64;
                    if got >= target.expected_bytes {
                        let secs = outcome.total.as_secs_f64().max(0.001);
                        throughput_bps = Some((got as f64 / secs) as u64);
                        break;
                    }
                    // Partial transfers would flatter the figure, skip them.
                    debug!(url = %target.url, got, want = target.expected_bytes, "incomplete payload");
                }
                Err(err) => debug!(url = %target.url, error = %err, "payload fetch failed"),
            }
        }

        Ok(ProbeReport {
            exit_ip,
            region,
            city,
            latency_ms,
            throughput_bps,
        })
    }

    async fn fetch(
        &self,
        socks_port: u16,
        url: &str,
        limit: Duration,
    ) -> Result<FetchOutcome, ProbeError> {
        timeout(limit, self.fetch_via_proxy(socks_port, url))
            .await
            .map_err(|_| ProbeError::Connection(format!("{url}: request timed out")))?
    }

    async fn fetch_via_proxy(
        &self,
        socks_port: u16,
        url: &str,
    ) -> Result<FetchOutcome, ProbeError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| ProbeError::Connection(format!("invalid URL: {url}")))?;
        let host = uri
            .host()
            .ok_or_else(|| ProbeError::Connection(format!("no host in URL: {url}")))?
            .to_string();
        let is_https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });
        let path = uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let started = Instant::now();
        let stream = socks_connect(socks_port, &host, port).await?;

        if is_https {
            let connector = TlsConnector::from(self.tls.clone());
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| ProbeError::Connection(format!("invalid TLS name: {host}")))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|err| ProbeError::Connection(format!("TLS with {host}: {err}")))?;
            self.exchange(tls_stream, &host, &path, started).await
        } else {
            self.exchange(stream, &host, &path, started).await
        }
    }

    async fn exchange<S>(
        &self,
        stream: S,
        host: &str,
        path: &str,
        started: Instant,
    ) -> Result<FetchOutcome, ProbeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|err| ProbeError::Connection(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("probe connection ended: {err}");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, host)
            .header(USER_AGENT, &self.config.user_agent)
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .map_err(|err| ProbeError::Connection(err.to_string()))?;

        let mut response = sender
            .send_request(request)
            .await
            .map_err(|err| ProbeError::Connection(err.to_string()))?;
        let ttfb = started.elapsed();
        let status = response.status();

        let mut body = Vec::new();
        while let Some(next) = response.frame().await {
            let frame = next.map_err(|err| ProbeError::Connection(err.to_string()))?;
            if let Some(chunk) = frame.data_ref() {
                body.extend_from_slice(chunk);
                if body.len() as u64 > self.config.max_body {
                    return Err(ProbeError::Connection(format!(
                        "{host} response exceeded the body cap"
                    )));
                }
            }
        }
        if !status.is_success() {
            return Err(ProbeError::Connection(format!("{host} answered {status}")));
        }

        Ok(FetchOutcome {
            body,
            ttfb,
            total: started.elapsed(),
        })
    }
}

/// CONNECT through the local SOCKS5 proxy, no authentication.
async fn socks_connect(
    socks_port: u16,
    host: &str,
    port: u16,
) -> Result<TcpStream, ProbeError> {
    let mut stream = TcpStream::connect(("127.0.0.1", socks_port))
        .await
        .map_err(|err| {
            ProbeError::Connection(format!("proxy on 127.0.0.1:{socks_port} unreachable: {err}"))
        })?;

    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NONE])
        .await
        .map_err(handshake_err)?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(handshake_err)?;
    if choice != [SOCKS_VERSION, METHOD_NONE] {
        return Err(ProbeError::Connection(
            "proxy demands an authentication method".to_string(),
        ));
    }

    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(ProbeError::Connection(format!("hostname too long: {host}")));
    }
    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.extend_from_slice(&[
        SOCKS_VERSION,
        CMD_CONNECT,
        0x00,
        ADDR_DOMAIN,
        host_bytes.len() as u8,
    ]);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(handshake_err)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(handshake_err)?;
    if reply[1] != REPLY_SUCCESS {
        return Err(ProbeError::Connection(format!(
            "proxy refused connect to {host}:{port} (code {:#04x})",
            reply[1]
        )));
    }
    // Drain the bound-address trailer.
    match reply[3] {
        ADDR_IPV4 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await.map_err(handshake_err)?;
        }
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(handshake_err)?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await.map_err(handshake_err)?;
        }
        ADDR_IPV6 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await.map_err(handshake_err)?;
        }
        other => {
            return Err(ProbeError::Connection(format!(
                "unknown address type {other} in proxy reply"
            )));
        }
    }
    Ok(stream)
}

fn handshake_err(err: std::io::Error) -> ProbeError {
    ProbeError::Connection(format!("proxy handshake failed: {err}"))
}
