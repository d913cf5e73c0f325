#![forbid(unsafe_code)]

//! `arras-node-router`, the in-host message router binary.
//!
//! Launched by the agent as a sibling process. Listens on a TCP socket
//! for clients and peer nodes and on a Unix-domain socket for local
//! computations and the agent's control connection. Exits when the agent
//! disconnects or on SIGTERM.

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use arras_node::router::NodeRouter;
use arras_node::Result;

const EXIT_INIT_FAILURE: i32 = -1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "arras-node-router", about = "Arras in-host message router", version)]
struct Cli {
    /// Node id of the owning agent.
    #[arg(long)]
    node_id: Uuid,

    /// Path of the Unix-domain socket for computations and the agent.
    #[arg(long)]
    ipc: PathBuf,

    /// TCP port for clients and peer nodes (0 lets the OS pick; the
    /// chosen port is reported to the agent on connect).
    #[arg(long, default_value_t = 0)]
    tcp_port: u16,

    /// Log level [0-5] with 5 being the highest.
    #[arg(short = 'l', long, default_value_t = 3)]
    log_level: i32,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() {
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            if err.use_stderr() {
                eprintln!("{err}");
                process::exit(EXIT_INIT_FAILURE);
            }
            err.exit();
        }
    };

    init_tracing(args.log_format, args.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start runtime");
            process::exit(EXIT_INIT_FAILURE);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        error!(%err, "router failed to start");
        process::exit(EXIT_INIT_FAILURE);
    }
    info!("router exiting");
}

async fn run(args: Cli) -> Result<()> {
    let router = NodeRouter::start(args.node_id, args.tcp_port, &args.ipc).await?;

    {
        let router = router.clone();
        tokio::spawn(async move {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            info!("received shutdown signal");
            router.shutdown();
        });
    }

    router.wait().await;
    Ok(())
}

fn init_tracing(format: LogFormat, log_level: i32) {
    let default_level = match log_level {
        0 => "error",
        1 => "warn",
        2 | 3 => "info",
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
