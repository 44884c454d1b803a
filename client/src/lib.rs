//! hashpin client library
//!
//! Connects to a hashpin server over WebTransport, trusting it by the SHA-256
//! hash of its certificate instead of a CA chain, and drives the server's
//! stream behaviours: hello echo, paced payloads and bulk transfer.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use hashpin_client::{say_hello, ClientConfig, PinnedClient};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ClientConfig::new()
//!     .with_url("https://127.0.0.1:12345/say-hello")
//!     .with_cert_hash("47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=".parse()?)
//!     .with_timeout(Duration::from_secs(10));
//!
//! let client = PinnedClient::new(config)?;
//! let session = client.connect().await?;
//!
//! let reply = say_hello(&session, b"hello").await?;
//! println!("Server echoed: {}", String::from_utf8_lossy(&reply));
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export the types callers need alongside the client
pub use hashpin_common::{PinningHash, Session, Stream};
