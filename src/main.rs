#![forbid(unsafe_code)]

//! `arras-node`, the per-host worker agent binary.
//!
//! Bootstraps configuration, launches the router sibling process,
//! registers with service discovery and the coordinator, and serves the
//! session control plane until asked to shut down.

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use arras_node::config::Config;
use arras_node::node::ArrasNode;
use arras_node::Result;

/// Exit code for initialization or argument failures.
const EXIT_INIT_FAILURE: i32 = -1;
/// Exit code for an unhandled error.
const EXIT_UNHANDLED: i32 = -3;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "arras-node", about = "Arras worker-node agent", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "arras-node.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log level [0-5] with 5 being the highest.
    #[arg(short = 'l', long, env = "ARRAS_LOG_LEVEL")]
    log_level: Option<i32>,

    /// Fixed node id (a fresh one is generated when omitted).
    #[arg(long)]
    node_id: Option<String>,

    /// Coordinator host; discovered via service discovery when omitted.
    #[arg(long, env = "ARRAS_COORDINATOR_HOST")]
    coordinator_host: Option<String>,

    /// Coordinator port (ignored unless --coordinator-host is given).
    #[arg(long, env = "ARRAS_COORDINATOR_PORT")]
    coordinator_port: Option<u16>,

    /// Coordinator endpoint path (ignored unless --coordinator-host is given).
    #[arg(long)]
    coordinator_endpoint: Option<String>,

    /// Service discovery host.
    #[arg(long, env = "ARRAS_CONSUL_HOST")]
    consul_host: Option<String>,

    /// Service discovery port.
    #[arg(long, env = "ARRAS_CONSUL_PORT")]
    consul_port: Option<u16>,

    /// Disable service discovery (requires --coordinator-host).
    #[arg(long)]
    no_consul: bool,

    /// Config service base URL used to locate discovery.
    #[arg(long, env = "DWA_CONFIG_SERVICE")]
    config_service_url: Option<String>,

    /// Environment to join.
    #[arg(long = "env")]
    environment: Option<String>,

    /// Datacenter for the environment.
    #[arg(long = "dc")]
    datacenter: Option<String>,

    /// Directory for the router IPC socket file.
    #[arg(long)]
    ipc_dir: Option<String>,

    /// HTTP port for the control plane (0 lets the OS pick).
    #[arg(long)]
    http_port: Option<u16>,

    /// Total memory available to computations, e.g. "48g".
    #[arg(long)]
    memory: Option<String>,

    /// Memory reserved for the node processes, e.g. "1g".
    #[arg(long)]
    max_node_memory: Option<String>,

    /// Cores available to computations (0 means all but one).
    #[arg(long)]
    cores: Option<u32>,

    /// Register with an exclusive_user tag ("_unspecified_" uses the
    /// login user).
    #[arg(long)]
    exclusive_user: Option<String>,

    /// Register with an exclusive_production tag.
    #[arg(long)]
    exclusive_production: Option<String>,

    /// Register with an exclusive_team tag (requires
    /// --exclusive-production).
    #[arg(long)]
    exclusive_team: Option<String>,

    /// Register with the over_subscribe tag.
    #[arg(long)]
    over_subscribe: bool,

    /// User name advertised at registration.
    #[arg(long, env = "LOGNAME")]
    user_name: Option<String>,

    /// Cloud preemption monitor: aws or azure.
    #[arg(long)]
    preemption_monitor: Option<String>,

    /// Disable the unknown-endpoint ban list.
    #[arg(long)]
    disable_banlist: bool,

    /// Stats/log sink environment exported to computations.
    #[arg(long)]
    athena_env: Option<String>,

    /// Stats/log sink host exported to computations.
    #[arg(long)]
    athena_host: Option<String>,

    /// Stats/log sink port exported to computations.
    #[arg(long)]
    athena_port: Option<u16>,
}

fn main() {
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // help/version are not failures
            if err.use_stderr() {
                eprintln!("{err}");
                process::exit(EXIT_INIT_FAILURE);
            }
            err.exit();
        }
    };

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("arras-node: {err}");
            process::exit(EXIT_INIT_FAILURE);
        }
    };

    init_tracing(args.log_format, config.computation.log_level);
    info!("arras-node bootstrap");

    // an escaped panic must not leave the process half-alive
    std::panic::set_hook(Box::new(|panic| {
        error!(%panic, "unhandled panic");
        process::exit(EXIT_UNHANDLED);
    }));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.node.num_http_threads.max(2))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start runtime");
            process::exit(EXIT_INIT_FAILURE);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            info!("arras-node exiting");
        }
        Err(err) => {
            error!(%err, "node initialization failed");
            process::exit(EXIT_INIT_FAILURE);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let node = ArrasNode::initialize(config.node, config.computation).await?;

    // SIGINT/SIGTERM trigger the same orderly shutdown as the control plane
    {
        let stop = node.stop_token();
        tokio::spawn(async move {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            info!("received shutdown signal");
            stop.cancel();
        });
    }

    node.run().await;
    Ok(())
}

/// Load the TOML file (when present) and fold in CLI overrides.
fn load_config(args: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(&args.config)?;

    let node = &mut config.node;
    macro_rules! set {
        ($field:ident) => {
            if let Some(value) = &args.$field {
                node.$field = value.clone();
            }
        };
    }
    set!(node_id);
    set!(coordinator_host);
    set!(coordinator_endpoint);
    set!(consul_host);
    set!(config_service_url);
    set!(environment);
    set!(datacenter);
    set!(ipc_dir);
    set!(memory);
    set!(max_node_memory);
    set!(exclusive_user);
    set!(exclusive_production);
    set!(exclusive_team);
    set!(user_name);
    set!(preemption_monitor);
    if let Some(port) = args.coordinator_port {
        node.coordinator_port = port;
    }
    if let Some(port) = args.consul_port {
        node.consul_port = port;
    }
    if let Some(port) = args.http_port {
        node.http_port = port;
    }
    if let Some(cores) = args.cores {
        node.cores = cores;
    }
    if args.no_consul {
        node.no_consul = true;
    }
    if args.over_subscribe {
        node.over_subscribe = true;
    }
    if args.disable_banlist {
        node.disable_banlist = true;
    }

    let computation = &mut config.computation;
    if let Some(level) = args.log_level {
        computation.log_level = level;
    }
    if let Some(env) = &args.athena_env {
        computation.athena_env = env.clone();
    }
    if let Some(host) = &args.athena_host {
        computation.athena_host = host.clone();
    }
    if let Some(port) = args.athena_port {
        computation.athena_port = port;
    }
    Ok(config)
}

fn init_tracing(format: LogFormat, log_level: i32) {
    let default_level = match log_level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "info",
        4 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
    }
}
