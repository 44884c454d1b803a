use std::{
    env, fmt,
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    webtransport::TransportTuning,
};

/// Default listen address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:12345";
const DEFAULT_PORT: u16 = 12345;
/// The single path sessions are bootstrapped on.
pub const DEFAULT_ROUTE: &str = "/say-hello";

/// Cap of the single read done on each inbound stream.
pub const READ_LIMIT: usize = 15;
/// Payload written on each outbound stream.
pub const OUTBOUND_PAYLOAD: [u8; 3] = [10, 10, 10];
/// Pause between two outbound streams of one session.
pub const OUTBOUND_INTERVAL: Duration = Duration::from_secs(1);

/// Number of chunks written by the bulk transfer.
pub const BULK_CHUNK_COUNT: usize = 256;
/// Size of each bulk chunk.
pub const BULK_CHUNK_SIZE: usize = 1024 * 1024;
/// How long the bulk transfer waits for the client's stream.
pub const BULK_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
/// Default certificate lifetime.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(10 * 24 * 60 * 60);
/// Longest lifetime browsers accept for hash-pinned certificates.
pub const MAX_PINNED_VALIDITY: Duration = Duration::from_secs(14 * 24 * 60 * 60);

const ADDR_ENV: &str = "HASHPIN_ADDR";
const ROUTE_ENV: &str = "HASHPIN_ROUTE";
const MODE_ENV: &str = "HASHPIN_MODE";
const VALIDITY_DAYS_ENV: &str = "HASHPIN_VALIDITY_DAYS";

/// What the server does with each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Inbound echo loop plus paced outbound loop.
    #[default]
    Echo,
    /// One stream, bulk writes, no pacing.
    Bulk,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Echo => f.write_str("echo"),
            Mode::Bulk => f.write_str("bulk"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "echo" => Ok(Mode::Echo),
            "bulk" => Ok(Mode::Bulk),
            other => Err(Error::Config(format!(
                "unknown mode '{other}', expected 'echo' or 'bulk'"
            ))),
        }
    }
}

/// Settings of the echo variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoConfig {
    /// Maximum bytes taken from an inbound stream.
    pub read_limit: usize,
    /// Write the bytes read back on the same stream before closing it.
    pub echo_reply: bool,
    /// Written once on every outbound stream.
    pub payload:    Vec<u8>,
    /// Pause after each outbound stream.
    pub interval:   Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            read_limit: READ_LIMIT,
            echo_reply: true,
            payload:    OUTBOUND_PAYLOAD.to_vec(),
            interval:   OUTBOUND_INTERVAL,
        }
    }
}

/// Settings of the bulk variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkConfig {
    /// Number of writes.
    pub chunk_count:    usize,
    /// Bytes per write.
    pub chunk_size:     usize,
    /// Bound on waiting for the client's stream.
    pub accept_timeout: Duration,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            chunk_count:    BULK_CHUNK_COUNT,
            chunk_size:     BULK_CHUNK_SIZE,
            accept_timeout: BULK_ACCEPT_TIMEOUT,
        }
    }
}

impl BulkConfig {
    /// Total bytes one transfer writes.
    pub fn total_bytes(&self) -> u64 {
        self.chunk_count as u64 * self.chunk_size as u64
    }
}

/// Per-session engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Which variant runs on each session.
    pub mode: Mode,
    /// Echo variant settings.
    pub echo: EchoConfig,
    /// Bulk variant settings.
    pub bulk: BulkConfig,
}

impl EngineConfig {
    /// Checks the invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.echo.read_limit == 0 {
            return Err(Error::Config("read limit must be at least 1 byte".into()));
        }
        if self.echo.payload.is_empty() {
            return Err(Error::Config("outbound payload must not be empty".into()));
        }
        if self.bulk.chunk_count == 0 || self.bulk.chunk_size == 0 {
            return Err(Error::Config(
                "bulk transfer needs a non-zero chunk count and size".into(),
            ));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP address the QUIC endpoint binds to.
    pub addr:      SocketAddr,
    /// Path accepted for session upgrades.
    pub route:     String,
    /// Lifetime of the generated certificate.
    pub validity:  Duration,
    /// Per-session behaviour.
    pub engine:    EngineConfig,
    /// QUIC tuning.
    pub transport: TransportTuning,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr:      SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            route:     DEFAULT_ROUTE.to_string(),
            validity:  DEFAULT_VALIDITY,
            engine:    EngineConfig::default(),
            transport: TransportTuning::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables
    ///
    /// Reads HASHPIN_ADDR, HASHPIN_ROUTE, HASHPIN_MODE and
    /// HASHPIN_VALIDITY_DAYS; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(addr) = env::var(ADDR_ENV) {
            config.addr = parse_addr(&addr)?;
        }
        if let Ok(route) = env::var(ROUTE_ENV) {
            config.route = route;
        }
        if let Ok(mode) = env::var(MODE_ENV) {
            config.engine.mode = mode.parse()?;
        }
        if let Ok(days) = env::var(VALIDITY_DAYS_ENV) {
            let days: u32 = days.trim().parse().map_err(|e| {
                Error::Config(format!("{VALIDITY_DAYS_ENV} must be a whole number: {e}"))
            })?;
            config.validity = DAY * days;
        }

        Ok(config)
    }

    /// Set the listen address
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Set the upgrade path
    pub fn with_route<S: Into<String>>(mut self, route: S) -> Self {
        self.route = route.into();
        self
    }

    /// Set the session mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.engine.mode = mode;
        self
    }

    /// Set the certificate lifetime
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Replace the engine settings
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Replace the QUIC tuning
    pub fn with_transport(mut self, transport: TransportTuning) -> Self {
        self.transport = transport;
        self
    }

    /// Checks the configuration before the server starts.
    pub fn validate(&self) -> Result<()> {
        if !self.route.starts_with('/') {
            return Err(Error::Config(format!(
                "route '{}' must start with '/'",
                self.route
            )));
        }
        if self.validity.is_zero() {
            return Err(Error::Config("certificate validity must be positive".into()));
        }
        if self.validity > MAX_PINNED_VALIDITY {
            return Err(Error::Config(format!(
                "certificate validity of {} days exceeds the {} day limit for hash-pinned certificates",
                self.validity.as_secs() / DAY.as_secs(),
                MAX_PINNED_VALIDITY.as_secs() / DAY.as_secs()
            )));
        }
        self.engine.validate()
    }
}

/// Parses a socket address, naming the bad input on failure.
pub fn parse_addr(s: &str) -> Result<SocketAddr> {
    s.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid address '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_protocol_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.addr, parse_addr(DEFAULT_ADDR).unwrap());
        assert_eq!(config.route, "/say-hello");
        assert_eq!(config.engine.mode, Mode::Echo);
        assert_eq!(config.engine.echo.read_limit, 15);
        assert_eq!(config.engine.echo.payload, vec![10, 10, 10]);
        assert_eq!(config.engine.echo.interval, Duration::from_secs(1));
        assert_eq!(config.engine.bulk.total_bytes(), 256 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Bulk".parse::<Mode>().unwrap(), Mode::Bulk);
        assert_eq!(" echo ".parse::<Mode>().unwrap(), Mode::Echo);
        assert!("stress".parse::<Mode>().is_err());
        assert_eq!(Mode::Bulk.to_string(), "bulk");
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let too_long = ServerConfig::new().with_validity(DAY * 15);
        assert!(matches!(too_long.validate(), Err(Error::Config(_))));

        let no_slash = ServerConfig::new().with_route("say-hello");
        assert!(no_slash.validate().is_err());

        let mut engine = EngineConfig::default();
        engine.echo.read_limit = 0;
        assert!(ServerConfig::new().with_engine(engine).validate().is_err());

        let mut engine = EngineConfig::default();
        engine.echo.payload.clear();
        assert!(engine.validate().is_err());

        let mut engine = EngineConfig::default();
        engine.bulk.chunk_count = 0;
        assert!(engine.validate().is_err());
    }

    #[test]
    fn addresses_are_checked() {
        assert!(parse_addr("127.0.0.1:4433").is_ok());
        assert!(parse_addr("localhost").is_err());
    }
}
