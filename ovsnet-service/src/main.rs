//! ovsnet service
//!
//! Opens the persistent store, wires the lifecycle controller to either the
//! host backends or the in-memory ones, reconciles persisted networks and
//! then serves until shutdown. Subcommands run a single step and exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ovsnet_driver::{dispatch, DockerCliProvisioner, MemoryProvisioner, NetworkController, Orchestrator, ReconcileReport};
use ovsnet_network::{MemoryBridge, MemoryLinks, MemoryTopology, NetlinkLinks, OvnConnector, OvsdbBridge};
use ovsnet_store::{FileStore, RecoveryPolicy, StateStore};

mod config;

use config::{BackendMode, ServiceConfig};

const LOG_TARGETS: &[&str] = &["ovsnet", "ovsnet_driver", "ovsnet_network", "ovsnet_store"];

#[derive(Parser, Debug)]
#[command(name = "ovsnet")]
#[command(about = "OVS/OVN network plugin for container runtimes")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding networks.json and endpoints.json
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// strict | lenient | ignore
    #[arg(long)]
    recovery_policy: Option<RecoveryPolicy>,

    /// Adapter implementations to use
    #[arg(long, value_enum)]
    backend: Option<BackendMode>,

    /// Raise the default log level to debug
    #[arg(long)]
    debug: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile persisted networks against the backends and exit
    Reconcile,
    /// Run one runtime protocol call and print the response
    Call {
        /// e.g. NetworkDriver.CreateNetwork
        method: String,
        /// JSON request body
        #[arg(default_value = "{}")]
        body: String,
    },
    /// Print persisted networks and endpoints
    List,
    /// Print the effective configuration
    Config,
}

fn init_tracing(debug: bool, format: LogFormat) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for target in LOG_TARGETS {
        filter = filter.add_directive(format!("{}={}", target, level).parse()?);
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn resolve_config(args: &Args) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load_default(args.config.as_deref())?;
    config.apply_env().context("invalid OVSNET_* environment override")?;

    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(policy) = args.recovery_policy {
        config.recovery_policy = policy;
    }
    if let Some(mode) = args.backend {
        config.backend.mode = mode;
    }
    Ok(config)
}

fn build_controller(config: &ServiceConfig, store: Arc<FileStore>) -> NetworkController {
    let rpc = config.backend.rpc_settings();
    let settings = config.provisioner.orchestrator_settings();
    let orchestrator = match config.backend.mode {
        BackendMode::System => {
            info!(socket = %config.ovsdb_socket.display(), "Using host backends");
            Orchestrator::new(
                Arc::new(OvsdbBridge::connect(&config.ovsdb_socket, rpc.clone())),
                Arc::new(NetlinkLinks::with_timeout(rpc.timeout)),
                Arc::new(OvnConnector::new(rpc)),
                Arc::new(DockerCliProvisioner::new(config.provisioner.provisioner_settings())),
                settings,
            )
        }
        BackendMode::Memory => {
            warn!("Using in-memory backends; nothing on this host will be configured");
            Orchestrator::new(
                Arc::new(MemoryBridge::new()),
                Arc::new(MemoryLinks::new()),
                Arc::new(Arc::new(MemoryTopology::new())),
                Arc::new(MemoryProvisioner::reachable()),
                settings,
            )
        }
    };
    NetworkController::new(store, orchestrator, config.controller_settings())
}

fn log_report(report: &ReconcileReport) {
    for (network, reason) in &report.failed {
        error!(network = %network, "Reconcile failed: {}", reason);
    }
    info!(
        applied = report.applied.len(),
        failed = report.failed.len(),
        orphaned = report.orphaned_endpoints.len(),
        "Reconcile finished"
    );
}

async fn list(store: &FileStore) -> Result<Value> {
    let networks = store.list_networks().await.context("listing networks")?;
    let endpoints = store.list_endpoints().await.context("listing endpoints")?;
    Ok(json!({ "networks": networks, "endpoints": endpoints }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Environment file first so OVSNET_* and RUST_LOG from it apply
    let env_file = ovsnet_core::config::load_environment();

    let args = Args::parse();
    init_tracing(args.debug, args.log_format)?;
    if let Some(path) = env_file {
        info!("Environment loaded from {}", path);
    }

    let config = resolve_config(&args)?;
    if let Some(Commands::Config) = args.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = FileStore::open(&config.data_dir, config.recovery_policy)
        .with_context(|| format!("Failed to open state in {}", config.data_dir.display()))?;
    let report = store.recovery_report();
    if report.degraded() {
        warn!(networks = ?report.networks, endpoints = ?report.endpoints, "Started with quarantined state");
    } else {
        info!(networks = ?report.networks, endpoints = ?report.endpoints, "State recovered");
    }
    let store = Arc::new(store);

    if let Some(Commands::List) = args.command {
        println!("{}", serde_json::to_string_pretty(&list(&store).await?)?);
        return Ok(());
    }

    let controller = build_controller(&config, store);

    match args.command {
        Some(Commands::Call { method, body }) => {
            let body: Value = serde_json::from_str(&body).context("request body is not valid JSON")?;
            let response = dispatch(&controller, &method, body).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.get("Err").is_some() {
                std::process::exit(1);
            }
            return Ok(());
        }
        Some(Commands::Reconcile) => {
            let report = controller.reconcile().await.context("reconcile")?;
            log_report(&report);
            if !report.failed.is_empty() {
                std::process::exit(1);
            }
            return Ok(());
        }
        _ => {}
    }

    info!(
        data_dir = %config.data_dir.display(),
        scope = config.scope.as_str(),
        "Starting ovsnet"
    );
    // Backends that are down now are retried by the runtime's next call
    match controller.reconcile().await {
        Ok(report) => log_report(&report),
        Err(e) => error!("Startup reconcile failed: {:#}", e),
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutting down");
    Ok(())
}
