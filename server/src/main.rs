use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hashpin_common::{
    bootstrap::render_browser_script,
    config::{parse_addr, Mode, ServerConfig},
};
use hashpin_server::HelloServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hashpin-server")]
#[command(about = "Certificate-pinned WebTransport server")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// UDP address to listen on (overrides HASHPIN_ADDR)
    #[arg(short, long)]
    addr: Option<String>,

    /// Session path (overrides HASHPIN_ROUTE)
    #[arg(short, long)]
    route: Option<String>,

    /// Session behaviour: echo or bulk (overrides HASHPIN_MODE)
    #[arg(short, long)]
    mode: Option<Mode>,

    /// Certificate lifetime in days, at most 14 (overrides HASHPIN_VALIDITY_DAYS)
    #[arg(long)]
    validity_days: Option<u32>,

    /// Print connection details as JSON instead of the bare hash
    #[arg(long, conflicts_with = "bootstrap_script")]
    json: bool,

    /// Print a browser console script instead of the bare hash
    #[arg(long)]
    bootstrap_script: bool,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::from_env().context("Failed to read HASHPIN_* environment")?;

        if let Some(addr) = &self.addr {
            config = config.with_addr(parse_addr(addr)?);
        }
        if let Some(route) = &self.route {
            config = config.with_route(route.as_str());
        }
        if let Some(mode) = self.mode {
            config = config.with_mode(mode);
        }
        if let Some(days) = self.validity_days {
            config = config.with_validity(Duration::from_secs(u64::from(days) * 24 * 60 * 60));
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout only carries the pinning material.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting hashpin server...");

    let config = args.server_config()?;
    let server = HelloServer::new(config).context("Failed to create server")?;
    let listener = server.bind()?;
    let details = server.connection_details(listener.local_addr()?);

    if args.json {
        println!("{}", details.to_json()?);
    } else if args.bootstrap_script {
        println!("{}", render_browser_script(&details));
    } else {
        println!("{}", server.pinning_hash());
    }

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.serve(listener).await.context("Server error")?;
    Ok(())
}
