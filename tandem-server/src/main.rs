//! tandem-server: collaborative plain-text editing over WebSocket.
//!
//! Usage:
//! ```bash
//! tandem-server --config tandem.toml
//! tandem-server --bind 0.0.0.0:9090
//! RUST_LOG=debug tandem-server
//! ```
//!
//! Editors connect to `ws://<bind>/<document-uuid>`.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use tandem_collab::{ServerConfig, SyncServer};

use config::{Config, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(version, about = "Collaborative plain-text editing server", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on; overrides the configuration file
    #[arg(long, short)]
    bind: Option<String>,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let file = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let mut config = file.server_config();
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match cli.server_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting tandem-server v{}", env!("CARGO_PKG_VERSION"));
    let server = SyncServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} revisions integrated",
                stats.total_connections, stats.revisions_integrated
            );
        }
    }

    ExitCode::SUCCESS
}
