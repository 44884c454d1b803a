//! hashpin common library
//!
//! Shared building blocks of the hashpin server and client:
//!
//! - Ephemeral self-signed identity and its SHA-256 pinning hash
//! - Configuration and protocol constants
//! - The error taxonomy
//! - Session/stream traits with a WebTransport (quinn) implementation and an
//!   in-memory one for tests (feature `memory`)
//! - Client bootstrap material (connection details, browser script)

/// Client bootstrap material
pub mod bootstrap;

/// Configuration structures and protocol constants
pub mod config;

/// Error taxonomy
pub mod error;

/// Self-signed identity and pinning hash
pub mod identity;

/// In-process transport for tests
#[cfg(any(test, feature = "memory"))]
pub mod memory;

/// Transport traits
pub mod transport;

/// WebTransport over QUIC
pub mod webtransport;

// Re-export commonly used types for convenience
pub use config::{EngineConfig, Mode, ServerConfig, DEFAULT_ADDR, DEFAULT_ROUTE};
pub use error::{Error, Result, TransportError};
pub use identity::{compute_pinning_hash, generate_identity, Identity, PinningHash};
pub use transport::{Rejected, Session, Stream, UpgradeRequest};
