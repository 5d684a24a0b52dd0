//! torpool engine - Instance Lifecycle and Route Selection
//!
//! Runs a fleet of Tor client instances: launches and supervises the
//! processes, measures each instance's route through its own SOCKS
//! proxy, and renews circuits until an instance's exit matches the
//! region it was pinned to.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       FleetEngine                         │
//! │                                                           │
//! │  ┌───────────┐   ┌────────────┐   ┌────────────────────┐  │
//! │  │ Scheduler │──▶│  Selector  │──▶│ Supervisor / Probe │  │
//! │  │ (ceiling, │   │ (renew →   │   │ (tor process,      │  │
//! │  │ busy set) │   │  settle →  │   │  control channel,  │  │
//! │  └───────────┘   │  measure)  │   │  SOCKS probes)     │  │
//! │                  └─────┬──────┘   └─────────┬──────────┘  │
//! │                        │ accepted routes    │             │
//! │                        ▼                    ▼             │
//! │                  FleetStore          tor .. tor .. tor    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Behavior
//!
//! - **Detached children**: spawned Tor processes survive a manager
//!   restart; the supervisor adopts them back over the control port
//! - **Bounded hunting**: every selection run renews at most its
//!   budget's worth of circuits, then reports `Exhausted`
//! - **Honest figures**: latency is floored at one millisecond and
//!   throughput is only reported for complete transfers

mod control;
mod engine;
mod probe;
mod scheduler;
mod selector;
mod supervisor;
mod torrc;

#[cfg(test)]
mod testutil;

pub use control::{ControlClient, ControlError, ExitInfo, Reply, COOKIE_FILE};
pub use engine::{EngineConfig, EngineError, FleetEngine};
pub use probe::{GeoService, PayloadTarget, ProbeConfig, ProbeError, ProbeReport, Prober};
pub use scheduler::{Scheduler, TickReport};
pub use selector::{
    run_selection, CancelFlag, RejectReason, RouteRejection, RouteSource, SelectionOutcome,
    SelectionRun, SelectionSpec, SelectionState,
};
pub use supervisor::{
    ProcessHandle, RunningInstance, StartOutcome, Supervisor, SupervisorConfig, SupervisorError,
};
pub use torrc::render as render_torrc;
pub use torrc::TORRC_FILE;
