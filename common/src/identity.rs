//! Ephemeral self-signed server identity and its pinning hash.
//!
//! Clients trust the server by comparing the SHA-256 of its DER certificate
//! with a value received out of band, so the certificate never needs to chain
//! to an authority. Everything here is regenerated on every launch and never
//! written to disk.

use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// Length of a [`PinningHash`] in bytes.
pub const PINNING_HASH_LEN: usize = 32;

/// SHA-256 digest of a DER encoded certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinningHash([u8; PINNING_HASH_LEN]);

impl PinningHash {
    /// Wraps raw digest bytes.
    pub const fn from_bytes(bytes: [u8; PINNING_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; PINNING_HASH_LEN] {
        &self.0
    }

    /// Standard base64, the form printed at startup and embedded in client
    /// bootstrap material.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Lowercase hex, used in logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PinningHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PinningHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PinningHash({})", self.to_hex())
    }
}

impl FromStr for PinningHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(s.trim())
            .map_err(|e| Error::Config(format!("invalid certificate hash: {e}")))?;
        let bytes: [u8; PINNING_HASH_LEN] = decoded.try_into().map_err(|v: Vec<u8>| {
            Error::Config(format!(
                "certificate hash must be {PINNING_HASH_LEN} bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

/// Computes the pinning hash of a DER certificate.
pub fn compute_pinning_hash(certificate: &[u8]) -> PinningHash {
    PinningHash(Sha256::digest(certificate).into())
}

/// The process-wide self-signed identity.
pub struct Identity {
    certificate: CertificateDer<'static>,
    private_key: PrivatePkcs8KeyDer<'static>,
    not_before:  SystemTime,
    not_after:   SystemTime,
    serial:      u64,
    hash:        PinningHash,
}

impl Identity {
    /// Generates an identity valid from now for `validity`.
    pub fn generate(validity: Duration) -> Result<Self> {
        let now = SystemTime::now();
        generate_identity(now, now + validity)
    }

    /// DER encoded certificate.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// Certificate chain for a TLS server configuration.
    pub fn certificate_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.certificate.clone()]
    }

    /// A copy of the private key for a TLS server configuration.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.private_key.clone_key())
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// Certificate serial number.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Pinning hash of [`Identity::certificate`].
    pub fn pinning_hash(&self) -> PinningHash {
        self.hash
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// Generates a fresh ECDSA P-256 key and a self-signed certificate valid in
/// `[not_before, not_after)`.
pub fn generate_identity(not_before: SystemTime, not_after: SystemTime) -> Result<Identity> {
    // DER times carry whole seconds; keep the stored window identical to the
    // encoded one.
    let not_before = whole_seconds(not_before)?;
    let not_after = whole_seconds(not_after)?;
    if not_after <= not_before {
        return Err(Error::Crypto(
            "certificate validity window is empty".to_string(),
        ));
    }
    let serial = random_serial()?;

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Crypto(format!("key generation failed: {e}")))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.serial_number = Some(SerialNumber::from(serial));
    params.not_before = OffsetDateTime::from(not_before);
    params.not_after = OffsetDateTime::from(not_after);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Crypto(format!("certificate encoding failed: {e}")))?;

    let certificate = cert.der().clone();
    let hash = compute_pinning_hash(&certificate);

    tracing::debug!(serial, hash = %hash.to_hex(), "generated self-signed identity");

    Ok(Identity {
        certificate,
        private_key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        not_before,
        not_after,
        serial,
        hash,
    })
}

fn whole_seconds(t: SystemTime) -> Result<SystemTime> {
    let since_epoch = t
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Crypto(format!("validity bound before the unix epoch: {e}")))?;
    Ok(UNIX_EPOCH + Duration::from_secs(since_epoch.as_secs()))
}

/// Draws 8 random bytes as a signed big-endian integer and folds negative
/// values onto their magnitude.
///
/// `x` and `-x` map to the same serial. Every result fits in 63 bits except
/// the single draw `i64::MIN`, which becomes 2^63 and needs all 64 bits.
fn random_serial() -> Result<u64> {
    let mut buf = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::Crypto(format!("random source failed: {e}")))?;
    Ok(serial_from_bytes(buf))
}

fn serial_from_bytes(buf: [u8; 8]) -> u64 {
    i64::from_be_bytes(buf).unsigned_abs()
}
