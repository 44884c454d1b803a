use std::time::Duration;

use anyhow::{Context, Result};
use hashpin_client::{drain_bulk, receive_payloads, say_hello, ClientConfig, PinnedClient, Session};

/// Connects to a running hashpin server and exercises each stream behaviour.
///
/// Usage: `cargo run --example basic -- <base64 hash> [url] [bulk]`
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== hashpin Client Basic Example ===");

    let mut args = std::env::args().skip(1);
    let hash = args
        .next()
        .context("Pass the certificate hash printed by the server")?
        .parse()?;
    let url = args
        .next()
        .unwrap_or_else(|| "https://127.0.0.1:12345/say-hello".to_string());
    let bulk = args.next().as_deref() == Some("bulk");

    let config = ClientConfig::new()
        .with_url(url)
        .with_cert_hash(hash)
        .with_timeout(Duration::from_secs(5))
        .with_verbose(true);

    let client = PinnedClient::new(config)?;
    println!("Connecting to {}...", client.url());
    let session = client.connect().await?;
    println!("✓ Session established");

    if bulk {
        let bytes = drain_bulk(&session).await?;
        println!("✓ Bulk transfer finished: {bytes} bytes");
    } else {
        let reply = say_hello(&session, b"hello").await?;
        println!("✓ Server echoed: {}", String::from_utf8_lossy(&reply));

        for (i, payload) in receive_payloads(&session, 3).await?.iter().enumerate() {
            println!("✓ Payload {}: {payload:?}", i + 1);
        }
    }

    session.close(0, "example finished");
    client.close().await;

    println!("\n✓ Example completed successfully!");
    Ok(())
}
