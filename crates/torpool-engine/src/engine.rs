//! Engine facade: one object wiring the store, the supervisor, the
//! prober and the selection loop together.
//!
//! The command line talks to this and to the scheduler, nothing below
//! it.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use torpool_store::{FleetStore, InstanceDescriptor, StoreError};
use tracing::info;

use crate::control::{ControlError, ExitInfo};
use crate::probe::{ProbeConfig, ProbeError, ProbeReport, Prober};
use crate::scheduler::{Scheduler, TickReport};
use crate::selector::{
    run_selection, CancelFlag, RouteSource, SelectionOutcome, SelectionRun, SelectionSpec,
};
use crate::supervisor::{StartOutcome, Supervisor, SupervisorConfig, SupervisorError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown instance {0}")]
    UnknownInstance(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub supervisor: SupervisorConfig,
    pub probe: ProbeConfig,
    /// Pause between circuit renewal and measurement, letting the new
    /// circuit settle before it is judged.
    pub settle: Duration,
    /// Ceiling on one full probe, ladders included.
    pub probe_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            probe: ProbeConfig::default(),
            settle: Duration::from_secs(3),
            probe_deadline: Duration::from_secs(45),
        }
    }
}

pub struct FleetEngine {
    store: Arc<FleetStore>,
    supervisor: Arc<Supervisor>,
    prober: Arc<Prober>,
    config: EngineConfig,
}

/// Live instance viewed as a [`RouteSource`]. Each renewal opens a
/// fresh control connection; the proxy port is probed directly.
struct LiveRoute<'a> {
    engine: &'a FleetEngine,
    name: String,
    socks_port: u16,
}

impl RouteSource for LiveRoute<'_> {
    async fn renew(&self) -> Result<(), ControlError> {
        let mut client = match self.engine.supervisor.control(&self.name).await {
            Ok(client) => client,
            Err(SupervisorError::Control(err)) => return Err(err),
            Err(_) => return Err(ControlError::Closed),
        };
        client.renew_circuit().await
    }

    async fn measure(&self) -> Result<ProbeReport, ProbeError> {
        self.engine
            .prober
            .probe(self.socks_port, self.engine.config.probe_deadline)
            .await
    }
}

impl FleetEngine {
    pub fn new(store: Arc<FleetStore>, config: EngineConfig) -> Self {
        let supervisor = Arc::new(Supervisor::new(config.supervisor.clone()));
        let prober = Arc::new(Prober::new(config.probe.clone()));
        Self {
            store,
            supervisor,
            prober,
            config,
        }
    }

    pub fn store(&self) -> &Arc<FleetStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Bring an instance up without touching its route.
    pub async fn start_instance(&self, name: &str) -> Result<StartOutcome, EngineError> {
        let desc = self.descriptor(name)?;
        Ok(self.supervisor.start(&desc).await?)
    }

    /// Start the instance if needed, then hunt for a route matching its
    /// region within the attempt budget. An accepted route replaces the
    /// stored one; an exhausted run leaves it untouched.
    pub async fn select_route(
        &self,
        name: &str,
        budget_override: Option<u32>,
        cancel: &CancelFlag,
    ) -> Result<SelectionRun, EngineError> {
        let desc = self.descriptor(name)?;
        self.supervisor.start(&desc).await?;

        let settings = self.store.settings();
        let spec = SelectionSpec {
            region: desc.region.clone(),
            budget: budget_override.unwrap_or(settings.attempt_budget),
            settle: self.config.settle,
            policy: settings.acceptance,
        };
        let source = LiveRoute {
            engine: self,
            name: desc.name.clone(),
            socks_port: desc.socks_port,
        };
        let run = run_selection(&source, &spec, cancel).await;
        self.persist_outcome(&desc.name, &run)?;
        Ok(run)
    }

    /// Run selection across many instances under the scheduler's
    /// concurrency ceiling and busy-set.
    pub async fn select_routes(
        self: &Arc<Self>,
        scheduler: &Scheduler,
        names: Vec<String>,
        budget_override: Option<u32>,
    ) -> TickReport<Result<SelectionRun, EngineError>> {
        let cancel = scheduler.cancel_flag();
        scheduler
            .run_once(names, {
                let engine = self.clone();
                move |name| {
                    let engine = engine.clone();
                    let cancel = cancel.clone();
                    async move { engine.select_route(&name, budget_override, &cancel).await }
                }
            })
            .await
    }

    /// Probe the route an instance is using right now, without renewing
    /// or persisting anything.
    pub async fn measure_current(&self, name: &str) -> Result<ProbeReport, EngineError> {
        let desc = self.descriptor(name)?;
        if !self.supervisor.is_healthy(&desc.name).await {
            return Err(EngineError::Supervisor(SupervisorError::NotRunning(
                desc.name,
            )));
        }
        Ok(self
            .prober
            .probe(desc.socks_port, self.config.probe_deadline)
            .await?)
    }

    /// Fire a circuit renewal and return once Tor has acknowledged it.
    pub async fn renew_circuit(&self, name: &str) -> Result<(), EngineError> {
        self.descriptor(name)?;
        let mut client = self.supervisor.control(name).await?;
        client.renew_circuit().await?;
        Ok(())
    }

    /// Exit relay of the newest built circuit, from Tor's own view.
    pub async fn exit_info(&self, name: &str) -> Result<ExitInfo, EngineError> {
        self.descriptor(name)?;
        let mut client = self.supervisor.control(name).await?;
        Ok(client.exit_info().await?)
    }

    /// Stop every supervised instance, reporting per-instance failures.
    pub async fn stop_all(&self) -> Vec<(String, SupervisorError)> {
        self.supervisor.stop_all().await
    }

    fn descriptor(&self, name: &str) -> Result<InstanceDescriptor, EngineError> {
        self.store
            .descriptor(name)
            .ok_or_else(|| EngineError::UnknownInstance(name.to_string()))
    }

    fn persist_outcome(&self, name: &str, run: &SelectionRun) -> Result<(), EngineError> {
        match &run.outcome {
            SelectionOutcome::Accepted(route) => {
                self.store.accept_route(name, route.clone())?;
            }
            SelectionOutcome::Exhausted => {
                info!(
                    instance = %name,
                    attempts = run.attempts,
                    "selection exhausted, previous route kept"
                );
            }
            SelectionOutcome::Cancelled => {}
        }
        Ok(())
    }
}
