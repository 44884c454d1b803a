use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hashpin_client::{
    drain_bulk, receive_payloads, say_hello, ClientConfig, PinnedClient, PinningHash, Session,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hashpin-client")]
#[command(about = "Certificate-pinned WebTransport client")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Session URL
    #[arg(short, long, default_value = "https://127.0.0.1:12345/say-hello")]
    url: String,

    /// Base64 SHA-256 of the server certificate, as printed by the server
    #[arg(long = "hash", required = true)]
    hashes: Vec<PinningHash>,

    /// Connection timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    /// Log connection progress
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and print the echo
    Hello {
        /// Message to send
        message: String,
    },
    /// Print the payloads of server-opened streams
    Listen {
        /// How many streams to wait for
        #[arg(short, long, default_value_t = 3)]
        count: usize,
    },
    /// Open one stream and count the bytes of a bulk transfer
    Bulk,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting hashpin client...");

    let config = ClientConfig::new()
        .with_url(args.url)
        .with_cert_hashes(args.hashes)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_verbose(args.verbose);

    let client = PinnedClient::new(config).context("Failed to create client")?;
    let session = client.connect().await.context("Failed to connect to server")?;

    match args.command {
        Commands::Hello { message } => {
            let reply = say_hello(&session, message.as_bytes())
                .await
                .context("Failed to say hello")?;
            println!("Server echoed: {}", String::from_utf8_lossy(&reply));
        }

        Commands::Listen { count } => {
            let payloads = receive_payloads(&session, count)
                .await
                .context("Failed to receive payloads")?;
            for (i, payload) in payloads.iter().enumerate() {
                println!("Payload {}: {payload:?}", i + 1);
            }
        }

        Commands::Bulk => {
            let started = Instant::now();
            let bytes = drain_bulk(&session)
                .await
                .context("Failed to drain bulk transfer")?;
            let elapsed = started.elapsed();
            println!(
                "Received {bytes} bytes in {elapsed:.2?} ({:.1} MiB/s)",
                bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON)
            );
        }
    }

    session.close(0, "done");
    client.close().await;
    Ok(())
}
