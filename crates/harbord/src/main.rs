//! harbord — the Harbor daemon.
//!
//! One binary, two roles:
//! - **server**: holds a replica of the catalog (redb + openraft), serves
//!   RPC, reconciles membership into the catalog while leader, and runs a
//!   local agent for its own node
//! - **agent**: runs only the local agent, syncing this node's services
//!   and checks to the servers it joined
//!
//! # Usage
//!
//! ```text
//! harbord server --bootstrap --node srv1 --data-dir /var/lib/harbor
//! harbord server --dev
//! harbord agent --node web-1 --join 10.0.0.1:8300 --config /etc/harbor/harbord.toml
//! ```

mod agent_mode;
mod config;
mod membership_http;
mod server_mode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, Overrides};

#[derive(Parser)]
#[command(name = "harbord", about = "Harbor cluster coordination daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server: catalog replica, RPC endpoints and a local agent.
    Server {
        #[command(flatten)]
        overrides: Overrides,

        /// Initialise a new single-server cluster.
        #[arg(long)]
        bootstrap: bool,

        /// In-memory catalog, no replication. For local development.
        #[arg(long)]
        dev: bool,
    },
    /// Run a client agent that keeps this node registered with the servers.
    Agent {
        #[command(flatten)]
        overrides: Overrides,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,harbord=debug,harbor=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl-C after flipping `shutdown`.
pub(crate) async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
    }
    info!("shutdown signal received");
    shutdown.send_replace(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Server {
            overrides,
            bootstrap,
            dev,
        } => {
            let mut config = DaemonConfig::load(&overrides)?;
            config.server = true;
            config.bootstrap |= bootstrap || dev;
            config.validate()?;
            server_mode::run(config, dev).await
        }
        Command::Agent { overrides } => {
            let mut config = DaemonConfig::load(&overrides)?;
            config.server = false;
            config.validate()?;
            agent_mode::run(config).await
        }
    }
}
