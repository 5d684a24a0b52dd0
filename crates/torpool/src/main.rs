//! torpool: fleet manager for region-pinned Tor client instances.
//!
//! Thin command line over `torpool-engine`. The fleet file lives at
//! `~/.torpool/fleet.toml` by default and instance working directories
//! under `~/.torpool/instances/`; both are overridable. Instances are
//! spawned detached, so `run`, `test` and `stop` find them again across
//! invocations through the control port.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use torpool_engine::{
    ControlClient, EngineConfig, EngineError, FleetEngine, Scheduler, SelectionOutcome,
    SelectionRun, SupervisorConfig, COOKIE_FILE,
};
use torpool_store::{BridgeConfig, FleetStore, InstanceDescriptor, RegionCode, RouteResult};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Fleet manager for region-pinned Tor client instances
#[derive(Parser)]
#[command(name = "torpool")]
#[command(about = "Run a pool of Tor clients, each pinned to an exit region", version)]
struct Cli {
    /// Fleet file (TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root for instance working directories
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add an instance to the fleet
    Add {
        /// Instance name
        name: String,

        /// Exit region: a two-letter country code, or "any"
        #[arg(long, default_value = "any")]
        region: String,

        /// Local SOCKS5 port
        #[arg(long)]
        socks_port: u16,

        /// Control port (defaults to the SOCKS port + 1)
        #[arg(long)]
        control_port: Option<u16>,

        /// File of bridge lines for censored networks
        #[arg(long)]
        bridge_file: Option<PathBuf>,
    },

    /// Remove an instance, stopping it first if it runs
    Remove {
        name: String,

        /// Also delete the instance's working directory
        #[arg(long)]
        purge_data: bool,
    },

    /// Show the fleet and its accepted routes
    List,

    /// Manage an instance's bridge lines
    Bridges {
        name: String,

        #[command(subcommand)]
        action: BridgeAction,
    },

    /// Hunt routes for instances (the whole fleet by default)
    Run {
        /// Instances to run
        names: Vec<String>,

        /// Override the attempt budget for this run
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=10))]
        budget: Option<u32>,

        /// Keep re-testing on the configured schedule until Ctrl-C
        #[arg(long)]
        periodic: bool,
    },

    /// Probe instances' current routes without renewing anything
    Test {
        /// Instances to probe
        names: Vec<String>,
    },

    /// Configure the periodic re-test interval
    Schedule {
        /// Interval in hours
        #[arg(long, conflicts_with = "off")]
        hours: Option<f64>,

        /// Disable periodic re-testing
        #[arg(long)]
        off: bool,
    },

    /// Set the default attempt budget per selection run
    Attempts {
        /// Renewal attempts, 1 through 10
        #[arg(value_parser = clap::value_parser!(u32).range(1..=10))]
        budget: u32,
    },

    /// Stop running instances (the whole fleet by default)
    Stop { names: Vec<String> },
}

#[derive(Subcommand)]
enum BridgeAction {
    /// Load bridge lines from a file
    Set { file: PathBuf },
    /// Drop all bridge lines
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("torpool=info,torpool_engine=info,torpool_store=info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let fleet_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_fleet_path()?,
    };
    let base_dir = match &cli.base_dir {
        Some(path) => path.clone(),
        None => default_base_dir()?,
    };

    let (store, skipped) = FleetStore::open(&fleet_path)
        .with_context(|| format!("loading fleet file {}", fleet_path.display()))?;
    for skip in &skipped {
        warn!(instance = %skip.name, reason = %skip.reason, "invalid instance skipped");
    }
    let store = Arc::new(store);

    match cli.command {
        Commands::Add {
            name,
            region,
            socks_port,
            control_port,
            bridge_file,
        } => cmd_add(&store, name, region, socks_port, control_port, bridge_file),
        Commands::Remove { name, purge_data } => {
            cmd_remove(&store, &base_dir, name, purge_data).await
        }
        Commands::List => {
            cmd_list(&store);
            Ok(())
        }
        Commands::Bridges { name, action } => cmd_bridges(&store, name, action),
        Commands::Run {
            names,
            budget,
            periodic,
        } => cmd_run(store, base_dir, names, budget, periodic).await,
        Commands::Test { names } => cmd_test(store, base_dir, names).await,
        Commands::Schedule { hours, off } => cmd_schedule(&store, hours, off),
        Commands::Attempts { budget } => {
            store.update_settings(|settings| settings.attempt_budget = budget);
            store.save()?;
            println!("attempt budget set to {budget}");
            Ok(())
        }
        Commands::Stop { names } => cmd_stop(&store, &base_dir, names).await,
    }
}

fn cmd_add(
    store: &FleetStore,
    name: String,
    region: String,
    socks_port: u16,
    control_port: Option<u16>,
    bridge_file: Option<PathBuf>,
) -> Result<()> {
    let region = RegionCode::parse(&region)?;
    let control_port = match control_port {
        Some(port) => port,
        None => socks_port
            .checked_add(1)
            .context("SOCKS port too high for the default control port")?,
    };
    let mut desc = InstanceDescriptor::new(&name, region, socks_port, control_port);
    if let Some(path) = bridge_file {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading bridge file {}", path.display()))?;
        desc.bridge = Some(BridgeConfig::parse(&text)?);
    }
    store.add(desc)?;
    store.save()?;
    println!("added {name} (socks {socks_port}, control {control_port})");
    Ok(())
}

async fn cmd_remove(
    store: &FleetStore,
    base_dir: &Path,
    name: String,
    purge_data: bool,
) -> Result<()> {
    let Some(desc) = store.remove(&name) else {
        bail!("no instance named {name}");
    };
    if shutdown_detached(&desc, base_dir).await {
        println!("{name}: stopped");
    }
    if purge_data {
        let dir = desc.resolve_data_dir(base_dir);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing {}", dir.display()))?;
            println!("{name}: removed {}", dir.display());
        }
    }
    store.save()?;
    println!("removed {name} from the fleet");
    Ok(())
}

fn cmd_list(store: &FleetStore) {
    if store.is_empty() {
        println!("fleet is empty; add instances with `torpool add`");
        return;
    }
    println!("{} instance(s):", store.len());
    for name in store.names() {
        let Some(desc) = store.descriptor(&name) else {
            continue;
        };
        let bridge = match &desc.bridge {
            Some(bridge) => format!("  {} {} bridge(s)", bridge.len(), bridge.transport),
            None => String::new(),
        };
        println!(
            "  {}  region {}  socks {}  control {}{}",
            desc.name, desc.region, desc.socks_port, desc.control_port, bridge
        );
        match &desc.best_route {
            Some(route) => println!("      route: {}", route_line(route)),
            None => println!("      route: none accepted yet"),
        }
    }
    let ready = store.proxy_ready();
    if !ready.is_empty() {
        println!("ready proxies, best first:");
        for entry in ready {
            println!("  socks5://127.0.0.1:{}  ({})", entry.socks_port, entry.name);
        }
    }
}

fn cmd_bridges(store: &FleetStore, name: String, action: BridgeAction) -> Result<()> {
    match action {
        BridgeAction::Set { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading bridge file {}", file.display()))?;
            let bridge = BridgeConfig::parse(&text)?;
            let count = bridge.len();
            let transport = bridge.transport;
            store.update(&name, |desc| desc.bridge = Some(bridge))?;
            store.save()?;
            println!("{name}: {count} {transport} bridge line(s); applies on next start");
        }
        BridgeAction::Clear => {
            store.update(&name, |desc| desc.bridge = None)?;
            store.save()?;
            println!("{name}: bridges cleared; applies on next start");
        }
    }
    Ok(())
}

async fn cmd_run(
    store: Arc<FleetStore>,
    base_dir: PathBuf,
    names: Vec<String>,
    budget: Option<u32>,
    periodic: bool,
) -> Result<()> {
    let targets = resolve_names(&store, names)?;
    if targets.is_empty() {
        bail!("fleet is empty; add instances first");
    }
    let settings = store.settings();
    let engine = Arc::new(FleetEngine::new(store.clone(), engine_config(base_dir)));
    let scheduler = Scheduler::new(settings.probe_concurrency);

    if periodic {
        let Some(every) = settings.schedule_interval_secs else {
            bail!("no schedule configured; set one with `torpool schedule --hours N`");
        };
        info!(every_secs = every, instances = targets.len(), "periodic mode, Ctrl-C stops");
        let tick_targets = targets.clone();
        let run_engine = engine.clone();
        let cancel = scheduler.cancel_flag();
        let periodic_loop = scheduler.run_periodic(
            Duration::from_secs(every),
            move || tick_targets.clone(),
            move |name| {
                let engine = run_engine.clone();
                let cancel = cancel.clone();
                async move {
                    let outcome = engine.select_route(&name, budget, &cancel).await;
                    print_outcome(&name, &outcome);
                }
            },
        );
        tokio::pin!(periodic_loop);
        tokio::select! {
            _ = &mut periodic_loop => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("interrupted, letting in-flight runs finish their step");
                scheduler.shutdown();
                // The loop drains its in-flight passes before returning,
                // so the save below sees every accepted route.
                periodic_loop.await;
            }
        }
    } else {
        let report = engine.select_routes(&scheduler, targets, budget).await;
        for (name, result) in &report.outcomes {
            print_outcome(name, result);
        }
        for name in &report.skipped {
            println!("{name}: skipped (busy)");
        }
    }
    store.save().context("saving fleet file")?;
    Ok(())
}

async fn cmd_test(store: Arc<FleetStore>, base_dir: PathBuf, names: Vec<String>) -> Result<()> {
    let targets = resolve_names(&store, names)?;
    if targets.is_empty() {
        bail!("fleet is empty; add instances first");
    }
    let engine = FleetEngine::new(store.clone(), engine_config(base_dir));
    for name in targets {
        if let Err(err) = engine.start_instance(&name).await {
            println!("{name}: cannot start: {err}");
            continue;
        }
        match engine.measure_current(&name).await {
            Ok(report) => {
                let place = match (&report.region, &report.city) {
                    (Some(region), Some(city)) => format!("{region} ({city})"),
                    (Some(region), None) => region.to_string(),
                    _ => "unknown region".to_string(),
                };
                let speed = match report.throughput_bps {
                    Some(bps) => {
                        let mbps = bps as f64 * 8.0 / 1_000_000.0;
                        format!("{mbps:.1} Mbps [{}]", speed_tier(mbps))
                    }
                    None => "throughput unavailable".to_string(),
                };
                println!(
                    "{name}: exit {} in {place}, {} ms, {speed}",
                    report.exit_ip, report.latency_ms
                );
            }
            Err(err) => println!("{name}: probe failed: {err}"),
        }
    }
    Ok(())
}

fn cmd_schedule(store: &FleetStore, hours: Option<f64>, off: bool) -> Result<()> {
    match (hours, off) {
        (Some(hours), false) => {
            if !(0.1..=168.0).contains(&hours) {
                bail!("interval must be between 0.1 and 168 hours");
            }
            let secs = (hours * 3600.0).round() as u64;
            store.update_settings(|settings| settings.schedule_interval_secs = Some(secs));
            store.save()?;
            println!("periodic re-testing every {hours} hour(s)");
        }
        (None, true) => {
            store.update_settings(|settings| settings.schedule_interval_secs = None);
            store.save()?;
            println!("periodic re-testing disabled");
        }
        _ => bail!("pass exactly one of --hours or --off"),
    }
    Ok(())
}

async fn cmd_stop(store: &FleetStore, base_dir: &Path, names: Vec<String>) -> Result<()> {
    let targets = resolve_names(store, names)?;
    for name in targets {
        let Some(desc) = store.descriptor(&name) else {
            continue;
        };
        if shutdown_detached(&desc, base_dir).await {
            println!("{name}: stopped");
        } else {
            println!("{name}: not running");
        }
    }
    Ok(())
}

/// Ask a detached instance to exit over its control port. The cookie
/// proves it is one of ours.
async fn shutdown_detached(desc: &InstanceDescriptor, base_dir: &Path) -> bool {
    let cookie = desc.resolve_data_dir(base_dir).join(COOKIE_FILE);
    match ControlClient::connect(desc.control_port, &cookie, Duration::from_secs(2)).await {
        Ok(mut client) => client.shutdown().await.is_ok(),
        Err(_) => false,
    }
}

fn print_outcome(name: &str, result: &Result<SelectionRun, EngineError>) {
    match result {
        Ok(run) => match &run.outcome {
            SelectionOutcome::Accepted(route) => {
                println!(
                    "{name}: accepted after {} attempt(s): {}",
                    run.attempts,
                    route_line(route)
                );
            }
            SelectionOutcome::Exhausted => {
                println!(
                    "{name}: budget exhausted after {} attempt(s), previous route kept",
                    run.attempts
                );
                for rejection in &run.rejections {
                    println!("    attempt {}: {}", rejection.attempt, rejection.reason);
                }
            }
            SelectionOutcome::Cancelled => println!("{name}: cancelled"),
        },
        Err(err) => println!("{name}: failed: {err}"),
    }
}

fn route_line(route: &RouteResult) -> String {
    match route.throughput_mbps() {
        Some(mbps) => format!("{} [{}]", route.describe(), speed_tier(mbps)),
        None => route.describe(),
    }
}

fn speed_tier(mbps: f64) -> &'static str {
    if mbps >= 5.0 {
        "HIGH-SPEED"
    } else if mbps >= 2.0 {
        "FAST"
    } else if mbps >= 0.5 {
        "GOOD"
    } else {
        "SLOW"
    }
}

fn resolve_names(store: &FleetStore, names: Vec<String>) -> Result<Vec<String>> {
    if names.is_empty() {
        return Ok(store.names());
    }
    for name in &names {
        if !store.contains(name) {
            bail!("no instance named {name}");
        }
    }
    Ok(names)
}

fn engine_config(base_dir: PathBuf) -> EngineConfig {
    EngineConfig {
        supervisor: SupervisorConfig {
            base_dir,
            ..SupervisorConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn default_fleet_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot locate a home directory")?;
    Ok(home.join(".torpool").join("fleet.toml"))
}

fn default_base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot locate a home directory")?;
    Ok(home.join(".torpool").join("instances"))
}
