//! `weir` binary: the supervisor/API server, and the worker subcommand the
//! supervisor spawns for each running node.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use weir::{Config, Supervisor};

#[derive(Parser)]
#[command(name = "weir", version, about = "Stream-processing engine")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the supervisor and its HTTP control API
    Server {
        /// Path to a configuration file (default: config.toml)
        #[arg(long)]
        config: Option<String>,
    },
    /// Run one node's worker (spawned by the supervisor, not by hand)
    #[command(hide = true)]
    Worker,
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Cmd::Worker => {
            let level = if std::env::var("debug").as_deref() == Ok("1") {
                "debug"
            } else {
                "info"
            };
            init_logging(level, false);
            weir::worker::run().context("worker failed")?;
            Ok(())
        }
        Cmd::Server { config } => {
            let config = match config {
                Some(path) => Config::from_file(&path).context("loading configuration")?,
                None => Config::load().context("loading configuration")?,
            };
            init_logging(&config.logging.level, config.logging.format == "json");
            let sup = Supervisor::new(config).context("starting supervisor")?;
            let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
            rt.block_on(weir::api::serve(sup)).context("server failed")?;
            Ok(())
        }
    }
}
