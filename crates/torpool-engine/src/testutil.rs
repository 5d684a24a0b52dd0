//! Test doubles: a scripted control-port listener and a combined
//! SOCKS5-plus-HTTP endpoint standing in for a Tor exit.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub(crate) const FAKE_COOKIE: [u8; 32] = [0xA5; 32];

fn cookie_hex() -> String {
    FAKE_COOKIE.iter().map(|b| format!("{b:02X}")).collect()
}

/// Scripted Tor control port. Answers the command subset the engine
/// speaks; everything else gets a 510.
pub(crate) struct FakeTorControl {
    pub port: u16,
    pub newnym_count: Arc<AtomicU32>,
    pub shutdown_count: Arc<AtomicU32>,
    progress: Arc<AtomicU8>,
    circuits: Arc<Mutex<Vec<String>>>,
    country: Arc<Mutex<String>>,
    task: JoinHandle<()>,
}

impl FakeTorControl {
    /// Listen on an ephemeral port.
    pub(crate) async fn spawn(cookie_path: &Path) -> FakeTorControl {
        Self::spawn_on(0, cookie_path)
            .await
            .expect("bind fake control")
    }

    /// Listen on a specific port and write the auth cookie file.
    pub(crate) async fn spawn_on(
        port: u16,
        cookie_path: &Path,
    ) -> std::io::Result<FakeTorControl> {
        if let Some(parent) = cookie_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(cookie_path, FAKE_COOKIE).await?;

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();

        let newnym_count = Arc::new(AtomicU32::new(0));
        let shutdown_count = Arc::new(AtomicU32::new(0));
        let progress = Arc::new(AtomicU8::new(100));
        let circuits = Arc::new(Mutex::new(Vec::new()));
        let country = Arc::new(Mutex::new("us".to_string()));
        let closing = Arc::new(Notify::new());

        let task = {
            let newnym = newnym_count.clone();
            let shutdown = shutdown_count.clone();
            let progress = progress.clone();
            let circuits = circuits.clone();
            let country = country.clone();
            let closing = closing.clone();
            tokio::spawn(async move {
                loop {
                    let stream = tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(_) => break,
                        },
                        // SIGNAL SHUTDOWN drops the listener, so the
                        // port goes quiet the way a real instance does.
                        _ = closing.notified() => break,
                    };
                    let newnym = newnym.clone();
                    let shutdown = shutdown.clone();
                    let progress = progress.clone();
                    let circuits = circuits.clone();
                    let country = country.clone();
                    let closing = closing.clone();
                    tokio::spawn(async move {
                        let _ = serve_control(
                            stream, newnym, shutdown, progress, circuits, country, closing,
                        )
                        .await;
                    });
                }
            })
        };

        Ok(FakeTorControl {
            port,
            newnym_count,
            shutdown_count,
            progress,
            circuits,
            country,
            task,
        })
    }

    pub(crate) fn set_progress(&self, progress: u8) {
        self.progress.store(progress, Ordering::SeqCst);
    }

    pub(crate) fn set_circuits(&self, lines: &[&str]) {
        *self.circuits.lock().unwrap() = lines.iter().map(|s| s.to_string()).collect();
    }

    pub(crate) fn set_country(&self, country: &str) {
        *self.country.lock().unwrap() = country.to_string();
    }
}

impl Drop for FakeTorControl {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_control(
    stream: TcpStream,
    newnym: Arc<AtomicU32>,
    shutdown: Arc<AtomicU32>,
    progress: Arc<AtomicU8>,
    circuits: Arc<Mutex<Vec<String>>>,
    country: Arc<Mutex<String>>,
    closing: Arc<Notify>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let cmd = line.trim();

        let reply: String = if let Some(given) = cmd.strip_prefix("AUTHENTICATE") {
            if given.trim() == cookie_hex() {
                "250 OK\r\n".into()
            } else {
                "515 Authentication failed\r\n".into()
            }
        } else if cmd == "SIGNAL NEWNYM" {
            newnym.fetch_add(1, Ordering::SeqCst);
            "250 OK\r\n".into()
        } else if cmd == "SIGNAL SHUTDOWN" {
            shutdown.fetch_add(1, Ordering::SeqCst);
            write_half.write_all(b"250 OK\r\n").await?;
            closing.notify_waiters();
            return Ok(());
        } else if cmd == "GETINFO version" {
            "250-version=0.4.8.12\r\n250 OK\r\n".into()
        } else if cmd == "GETINFO status/bootstrap-phase" {
            format!(
                "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS={} TAG=done SUMMARY=\"Done\"\r\n250 OK\r\n",
                progress.load(Ordering::SeqCst)
            )
        } else if cmd == "GETINFO circuit-status" {
            let lines = circuits.lock().unwrap().clone();
            if lines.is_empty() {
                "250-circuit-status=\r\n250 OK\r\n".into()
            } else {
                format!("250+circuit-status=\r\n{}\r\n.\r\n250 OK\r\n", lines.join("\r\n"))
            }
        } else if let Some(rest) = cmd.strip_prefix("GETINFO ns/id/") {
            format!(
                "250+ns/id/{rest}=\r\nr Exit64 aGVsbG8gd29ybGQ c2lnbmF0dXJl 2026-08-20 12:00:00 185.220.101.4 443 0\r\n.\r\n250 OK\r\n"
            )
        } else if let Some(ip) = cmd.strip_prefix("GETINFO ip-to-country/") {
            format!(
                "250-ip-to-country/{}={}\r\n250 OK\r\n",
                ip,
                country.lock().unwrap()
            )
        } else if cmd == "QUIT" {
            write_half.write_all(b"250 closing connection\r\n").await?;
            return Ok(());
        } else {
            "510 Unrecognized command\r\n".into()
        };

        write_half.write_all(reply.as_bytes()).await?;
    }
}

/// What the fake exit serves for each probe stage.
pub(crate) struct ExitBehavior {
    pub ip_body: Mutex<String>,
    /// `None` makes every geo lookup fail with a 500.
    pub country: Mutex<Option<String>>,
    pub city: Mutex<Option<String>>,
    /// Bytes actually served on payload paths.
    pub payload_bytes: Mutex<usize>,
    /// Delay before each HTTP response.
    pub delay: Mutex<Duration>,
}

impl Default for ExitBehavior {
    fn default() -> Self {
        Self {
            ip_body: Mutex::new("185.220.101.4".to_string()),
            country: Mutex::new(Some("US".to_string())),
            city: Mutex::new(Some("New York".to_string())),
            payload_bytes: Mutex::new(50_000),
            delay: Mutex::new(Duration::ZERO),
        }
    }
}

/// A SOCKS5 server that answers the proxied HTTP requests itself, so a
/// probe sees one process acting as proxy, IP service, geo service and
/// payload host at once.
pub(crate) struct FakeExit {
    pub port: u16,
    pub behavior: Arc<ExitBehavior>,
    task: JoinHandle<()>,
}

impl FakeExit {
    pub(crate) async fn spawn() -> FakeExit {
        Self::spawn_with(Arc::new(ExitBehavior::default())).await
    }

    pub(crate) async fn spawn_with(behavior: Arc<ExitBehavior>) -> FakeExit {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind fake exit");
        let port = listener.local_addr().expect("local addr").port();

        let task = {
            let behavior = behavior.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let behavior = behavior.clone();
                    tokio::spawn(async move {
                        let _ = serve_exit(stream, behavior).await;
                    });
                }
            })
        };

        FakeExit {
            port,
            behavior,
            task,
        }
    }
}

impl Drop for FakeExit {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_exit(mut stream: TcpStream, behavior: Arc<ExitBehavior>) -> std::io::Result<()> {
    // SOCKS5 greeting
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    // CONNECT request
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    let host = match req[3] {
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;

    // Proxied HTTP request
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    let mut header = String::new();
    loop {
        header.clear();
        if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
            break;
        }
    }

    let delay = *behavior.delay.lock().unwrap();
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }

    let geo_host = host.contains("ip-api")
        || host.contains("ipapi")
        || host.contains("ipwho")
        || host.contains("geoplugin");
    let payload = path.contains("/bytes/") || path.contains("test100k");

    let (status, body): (&str, Vec<u8>) = if geo_host {
        match behavior.country.lock().unwrap().clone() {
            Some(country) => {
                let city = behavior
                    .city
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| "Nowhere".to_string());
                // one body satisfying every geo service's key names
                let json = format!(
                    "{{\"countryCode\":\"{c}\",\"country_code\":\"{c}\",\"geoplugin_countryCode\":\"{c}\",\"city\":\"{city}\",\"geoplugin_city\":\"{city}\"}}",
                    c = country
                );
                ("200 OK", json.into_bytes())
            }
            None => ("500 Internal Server Error", Vec::new()),
        }
    } else if payload {
        let n = *behavior.payload_bytes.lock().unwrap();
        ("200 OK", vec![b'x'; n])
    } else {
        ("200 OK", behavior.ip_body.lock().unwrap().clone().into_bytes())
    };

    let head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        body.len()
    );
    write_half.write_all(head.as_bytes()).await?;
    write_half.write_all(&body).await?;
    Ok(())
}
