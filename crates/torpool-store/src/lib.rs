//! torpool store - Fleet Data Model and Descriptor Store
//!
//! Durable state for a fleet of Tor client instances: which instances
//! exist, where their proxies listen, which exit region each one wants,
//! and the best route each one has accepted so far.
//!
//! # Layout
//!
//! ```text
//! fleet.toml ──load──▶ FleetConfig ──▶ FleetStore (runtime)
//!     ▲                (validated,      │ per-record locks
//!     │                 bad entries     │ accept_route / update
//!     └────save──────── skipped)     ◀──┘ snapshot
//! ```
//!
//! # Persistence
//!
//! - TOML first, JSON supported, chosen by file extension
//! - One invalid instance entry skips that instance, never the file
//! - `RouteResult` round-trips identically; it is replaced wholesale on
//!   acceptance, never merged

mod bridge;
mod fleet;
mod instance;
mod region;
mod store;

pub use bridge::{BridgeConfig, BridgeParseError, Transport};
pub use fleet::{
    AcceptancePolicy, ConfigError, FleetConfig, FleetLoad, FleetSettings, SkippedInstance,
};
pub use instance::{InstanceDescriptor, RouteResult};
pub use region::{RegionCode, RegionParseError};
pub use store::{FleetStore, ProxyReady, StoreError};
