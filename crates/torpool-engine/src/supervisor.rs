//! Process supervision for the fleet.
//!
//! Owns launch, readiness, liveness and teardown of one Tor process
//! per instance. Children are spawned detached from the supervisor's
//! fate: a restarted manager finds the proxies still serving and
//! adopts them over the control channel instead of spawning twins.
//!
//! # Start sequence
//!
//! ```text
//!  start(desc)
//!    |-- handle exists and answers ping?  -> AlreadyRunning
//!    |-- control port authenticates?
//!    |     |-- on-disk torrc still matches -> Adopted
//!    |     `-- config stale                -> shutdown, relaunch below
//!    |-- control port rejects our cookie? -> Err(PortInUse)
//!    |-- preflight-bind both ports        -> Err(PortInUse) on conflict
//!    |-- scrub cache, write torrc, spawn
//!    `-- poll bootstrap to 100%           -> Started | Err(StartupTimeout)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::{timeout, MissedTickBehavior};
use torpool_store::InstanceDescriptor;
use tracing::{debug, info, warn};

use crate::control::{ControlClient, ControlError, COOKIE_FILE};
use crate::torrc;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("instance did not bootstrap within {0:?}")]
    StartupTimeout(Duration),

    #[error("port {0} is in use by another process")]
    PortInUse(u16),

    #[error("instance {0} survived shutdown and kill")]
    TerminationTimeout(String),

    #[error("tor exited during startup with status {0:?}")]
    ExitedEarly(Option<i32>),

    #[error("instance {0} is not running")]
    NotRunning(String),

    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("supervisor IO failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root under which each instance keeps its data directory.
    pub base_dir: PathBuf,
    /// Tor binary to launch.
    pub tor_binary: PathBuf,
    /// Ceiling for reaching a fully bootstrapped control channel.
    pub startup_timeout: Duration,
    /// Extra startup allowance when bridges are configured.
    pub bridge_startup_extra: Duration,
    /// Bootstrap poll cadence.
    pub poll_interval: Duration,
    /// Window a graceful shutdown gets before the process is killed,
    /// and the kill gets before stop gives up.
    pub grace_period: Duration,
    /// Per-command ceiling on health and adoption probes.
    pub health_timeout: Duration,
    /// Per-command ceiling on regular control traffic.
    pub control_timeout: Duration,
    /// Remove cached consensus documents before a fresh launch.
    pub scrub_cache: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("torpool"),
            tor_binary: PathBuf::from("tor"),
            startup_timeout: Duration::from_secs(90),
            bridge_startup_extra: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            health_timeout: Duration::from_secs(2),
            control_timeout: Duration::from_secs(10),
            scrub_cache: true,
        }
    }
}

/// How `start` satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A fresh process was launched and bootstrapped.
    Started,
    /// A live process from an earlier manager run was taken over.
    Adopted,
    /// The instance was already under supervision and healthy.
    AlreadyRunning,
}

/// Live state for one supervised instance. Never persisted; a fleet
/// restart rebuilds these through adoption.
#[derive(Debug)]
pub struct ProcessHandle {
    pub name: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub data_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub adopted: bool,
    /// `None` for adopted instances, which have no child to reap.
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    fn cookie_path(&self) -> PathBuf {
        self.data_dir.join(COOKIE_FILE)
    }
}

/// Snapshot of one running instance for listings.
#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub name: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub pid: Option<u32>,
    pub adopted: bool,
    pub started_at: DateTime<Utc>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    handles: Mutex<HashMap<String, ProcessHandle>>,
    /// Per-instance start/stop gates so distinct instances proceed in
    /// parallel while repeated calls for one instance serialize.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            handles: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Bring the instance up. Already-running and adoptable instances
    /// short-circuit without spawning anything.
    pub async fn start(
        &self,
        desc: &InstanceDescriptor,
    ) -> Result<StartOutcome, SupervisorError> {
        let gate = self.gate(&desc.name);
        let _guard = gate.lock().await;

        if let Some((port, cookie)) = self.live_summary(&desc.name) {
            if control_ping(port, &cookie, self.config.health_timeout).await {
                debug!(instance = %desc.name, "already running, start is a no-op");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        self.remove_handle(&desc.name);

        let data_dir = desc.resolve_data_dir(&self.config.base_dir);
        let cookie = data_dir.join(COOKIE_FILE);

        // A previous manager run may have left a live proxy behind. If
        // its control port accepts our cookie and its rendered config
        // still matches the descriptor it is ours to keep; a stale
        // config (re-pinned region, changed bridges) means the process
        // must come down and relaunch against a fresh torrc.
        match ControlClient::connect(desc.control_port, &cookie, self.config.health_timeout)
            .await
        {
            Ok(mut client) => {
                if self.torrc_current(desc, &data_dir).await {
                    self.insert_handle(desc, data_dir, None);
                    info!(
                        instance = %desc.name,
                        control_port = desc.control_port,
                        "adopted running instance"
                    );
                    return Ok(StartOutcome::Adopted);
                }
                info!(
                    instance = %desc.name,
                    "running instance has an outdated config, relaunching"
                );
                let _ = client.shutdown().await;
                drop(client);
                self.await_port_free(desc.control_port).await?;
            }
            Err(ControlError::AuthRejected(_)) => {
                return Err(SupervisorError::PortInUse(desc.control_port));
            }
            Err(_) => {}
        }

        preflight_bind(desc.socks_port).await?;
        preflight_bind(desc.control_port).await?;

        tokio::fs::create_dir_all(&data_dir).await?;
        if self.config.scrub_cache {
            scrub_consensus_cache(&data_dir).await;
        }
        let torrc_path = data_dir.join(torrc::TORRC_FILE);
        tokio::fs::write(&torrc_path, torrc::render(desc, &data_dir)).await?;

        let mut child = Command::new(&self.config.tor_binary)
            .arg("-f")
            .arg(&torrc_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: self.config.tor_binary.clone(),
                source,
            })?;
        info!(instance = %desc.name, pid = ?child.id(), "launched tor process");

        let deadline = self.startup_deadline(desc);
        if let Err(err) = self
            .await_bootstrap(&mut child, desc.control_port, &cookie, deadline)
            .await
        {
            warn!(instance = %desc.name, error = %err, "startup failed, reaping child");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(err);
        }

        self.insert_handle(desc, data_dir, Some(child));
        info!(instance = %desc.name, "instance bootstrapped");
        Ok(StartOutcome::Started)
    }

    /// Take the instance down: ask over the control channel first, kill
    /// after the grace period. Stopping a stopped instance is a no-op.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let gate = self.gate(name);
        let _guard = gate.lock().await;

        let Some(mut handle) = self.take_handle(name) else {
            return Ok(());
        };

        let cookie = handle.cookie_path();
        if let Ok(mut client) =
            ControlClient::connect(handle.control_port, &cookie, self.config.health_timeout)
                .await
        {
            let _ = client.shutdown().await;
        }

        match handle.child.take() {
            Some(mut child) => {
                if timeout(self.config.grace_period, child.wait()).await.is_ok() {
                    info!(instance = %name, "instance stopped");
                    return Ok(());
                }
                warn!(instance = %name, "graceful stop timed out, killing");
                let _ = child.start_kill();
                match timeout(self.config.grace_period, child.wait()).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(SupervisorError::TerminationTimeout(name.to_string())),
                }
            }
            None => {
                // Adopted instance: nothing to reap, watch the control
                // port go quiet instead.
                let started = Instant::now();
                loop {
                    let probe = timeout(
                        Duration::from_millis(250),
                        TcpStream::connect(("127.0.0.1", handle.control_port)),
                    )
                    .await;
                    match probe {
                        Ok(Err(_)) => {
                            info!(instance = %name, "instance stopped");
                            return Ok(());
                        }
                        Ok(Ok(_)) | Err(_) => {}
                    }
                    if started.elapsed() >= self.config.grace_period {
                        return Err(SupervisorError::TerminationTimeout(name.to_string()));
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Stop every supervised instance, returning the failures.
    pub async fn stop_all(&self) -> Vec<(String, SupervisorError)> {
        let mut failures = Vec::new();
        for name in self.names() {
            if let Err(err) = self.stop(&name).await {
                failures.push((name, err));
            }
        }
        failures
    }

    /// Process alive and control channel answering.
    pub async fn is_healthy(&self, name: &str) -> bool {
        let Some((port, cookie)) = self.live_summary(name) else {
            return false;
        };
        control_ping(port, &cookie, self.config.health_timeout).await
    }

    /// Authenticated control connection to a running instance.
    pub async fn control(&self, name: &str) -> Result<ControlClient, SupervisorError> {
        let (port, cookie) = self
            .live_summary(name)
            .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?;
        let client = ControlClient::connect(port, &cookie, self.config.control_timeout).await?;
        Ok(client)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.lock().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted snapshot of everything under supervision.
    pub fn running(&self) -> Vec<RunningInstance> {
        let handles = self.handles.lock().unwrap();
        let mut out: Vec<RunningInstance> = handles
            .values()
            .map(|handle| RunningInstance {
                name: handle.name.clone(),
                socks_port: handle.socks_port,
                control_port: handle.control_port,
                pid: handle.pid(),
                adopted: handle.adopted,
                started_at: handle.started_at,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    async fn await_bootstrap(
        &self,
        child: &mut Child,
        control_port: u16,
        cookie: &Path,
        deadline: Duration,
    ) -> Result<(), SupervisorError> {
        let started = Instant::now();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Some(status) = child.try_wait()? {
                return Err(SupervisorError::ExitedEarly(status.code()));
            }
            if let Ok(mut client) =
                ControlClient::connect(control_port, cookie, self.config.health_timeout).await
            {
                match client.bootstrap_progress().await {
                    Ok(100) => return Ok(()),
                    Ok(progress) => {
                        debug!(control_port, progress, "bootstrapping");
                    }
                    Err(_) => {}
                }
            }
            if started.elapsed() >= deadline {
                return Err(SupervisorError::StartupTimeout(deadline));
            }
        }
    }

    /// Does the torrc on disk still render from this descriptor?
    async fn torrc_current(&self, desc: &InstanceDescriptor, data_dir: &Path) -> bool {
        match tokio::fs::read_to_string(data_dir.join(torrc::TORRC_FILE)).await {
            Ok(existing) => torrc::matches(desc, data_dir, &existing),
            Err(_) => false,
        }
    }

    /// Bounded wait for a just-shut-down instance to release its port.
    async fn await_port_free(&self, port: u16) -> Result<(), SupervisorError> {
        let started = Instant::now();
        loop {
            if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if started.elapsed() >= self.config.grace_period {
                return Err(SupervisorError::PortInUse(port));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn startup_deadline(&self, desc: &InstanceDescriptor) -> Duration {
        if desc.uses_bridges() {
            self.config.startup_timeout + self.config.bridge_startup_extra
        } else {
            self.config.startup_timeout
        }
    }

    fn gate(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap();
        gates.entry(name.to_string()).or_default().clone()
    }

    /// Control target of a handle whose process has not exited, if any.
    fn live_summary(&self, name: &str) -> Option<(u16, PathBuf)> {
        let mut handles = self.handles.lock().unwrap();
        let handle = handles.get_mut(name)?;
        if let Some(child) = handle.child.as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                return None;
            }
        }
        Some((handle.control_port, handle.cookie_path()))
    }

    fn insert_handle(&self, desc: &InstanceDescriptor, data_dir: PathBuf, child: Option<Child>) {
        let handle = ProcessHandle {
            name: desc.name.clone(),
            socks_port: desc.socks_port,
            control_port: desc.control_port,
            data_dir,
            started_at: Utc::now(),
            adopted: child.is_none(),
            child,
        };
        self.handles.lock().unwrap().insert(desc.name.clone(), handle);
    }

    fn remove_handle(&self, name: &str) {
        self.handles.lock().unwrap().remove(name);
    }

    fn take_handle(&self, name: &str) -> Option<ProcessHandle> {
        self.handles.lock().unwrap().remove(name)
    }
}

async fn control_ping(port: u16, cookie: &Path, io_timeout: Duration) -> bool {
    match ControlClient::connect(port, cookie, io_timeout).await {
        Ok(mut client) => client.ping().await.is_ok(),
        Err(_) => false,
    }
}

async fn preflight_bind(port: u16) -> Result<(), SupervisorError> {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(_) => Err(SupervisorError::PortInUse(port)),
    }
}

/// Drop cached consensus documents and the state file left by an
/// earlier run.
async fn scrub_consensus_cache(data_dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(data_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("cached-") || name == "state" {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}
