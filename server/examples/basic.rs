use std::time::Duration;

use anyhow::{Context, Result};
use hashpin_common::{bootstrap::render_browser_script, Mode, ServerConfig};
use hashpin_server::HelloServer;

/// Basic example of running a pinned WebTransport server
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== hashpin Server Basic Example ===");

    let mode = match std::env::args().nth(1).as_deref() {
        Some("bulk") => Mode::Bulk,
        _ => Mode::Echo,
    };

    // Any free port on localhost, one week of validity
    let config = ServerConfig::new()
        .with_addr("127.0.0.1:0".parse()?)
        .with_mode(mode)
        .with_validity(Duration::from_secs(7 * 24 * 60 * 60));

    let server = HelloServer::new(config).context("Failed to create hashpin server")?;
    let listener = server.bind()?;
    let addr = listener.local_addr()?;

    println!("✓ Server created successfully");
    println!("Mode: {mode}");
    println!("Listening on: {addr}");
    println!("Certificate hash (sha-256, base64): {}", server.pinning_hash());
    println!("Certificate hash (hex): {}", server.pinning_hash().to_hex());
    println!();
    println!("Paste this into a browser console to connect:");
    println!("{}", render_browser_script(&server.connection_details(addr)));
    println!("(Press Ctrl+C to stop the server)");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    server.serve(listener).await?;

    println!("✓ Server stopped");
    Ok(())
}
