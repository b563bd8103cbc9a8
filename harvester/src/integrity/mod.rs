//! Bundle integrity: signing outbound bundles and verifying inbound ones.
//!
//! Outbound bundles are signed with a one-time RSA key whose certificate is
//! issued by an operator CA for a short lifetime. Inbound signatures are checked
//! against the leaf of the accompanying chain, and the chain is validated up to
//! the operator-configured trust anchors.

mod error;
mod signer;
mod verifier;

use std::sync::Arc;

use serde::Deserialize;

pub use error::{ConfigError, SigningError, VerificationError};
pub use signer::{DiskSigner, DiskSignerConfig, NoOpSigner, DEFAULT_SIGNING_CERT_TTL};
pub use verifier::{DiskVerifier, DiskVerifierConfig, NoOpVerifier};

use crate::cert::Certificate;
use crate::clock::Clock;

/// A detached signature and the certificate chain that vouches for its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// PKCS#1 v1.5 signature over the SHA-256 of the payload.
    pub signature: Vec<u8>,
    /// Signing certificate chain, leaf first.
    pub chain: Vec<Certificate>,
}

/// Signs outbound bundle payloads.
pub trait BundleSigner: Send + Sync + std::fmt::Debug {
    /// Signs `payload`. Returns `None` when the signer does not sign.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError`] if key generation, certificate issuance or
    /// signing fails.
    fn sign(&self, payload: &[u8]) -> Result<Option<Signature>, SigningError>;
}

/// Verifies inbound bundle payloads.
pub trait BundleVerifier: Send + Sync + std::fmt::Debug {
    /// Verifies `signature` over `payload` using the leaf of `chain`, and
    /// `chain` against the configured trust anchors.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError`] describing the first failed check.
    fn verify(
        &self,
        payload: &[u8],
        signature: Option<&[u8]>,
        chain: &[Certificate],
    ) -> Result<(), VerificationError>;
}

/// `[integrity]` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrityConfig {
    /// Permits the no-op signer and verifier.
    #[serde(default)]
    pub allow_noop: bool,
    /// Outbound signer.
    pub signer: SignerConfig,
    /// Inbound verifier.
    pub verifier: VerifierConfig,
}

/// `[integrity.signer]` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignerConfig {
    /// CA key material loaded from disk.
    Disk(DiskSignerConfig),
    /// Publishes bundles unsigned.
    Noop,
}

/// `[integrity.verifier]` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VerifierConfig {
    /// Trust anchors loaded from disk.
    Disk(DiskVerifierConfig),
    /// Accepts every bundle.
    Noop,
}

impl IntegrityConfig {
    /// Builds the configured signer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the key material is unusable, or if the
    /// no-op signer is configured without `allow_noop`.
    pub fn build_signer(
        &self,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn BundleSigner>, ConfigError> {
        match &self.signer {
            SignerConfig::Disk(config) => Ok(Arc::new(DiskSigner::configure(config, clock)?)),
            SignerConfig::Noop if self.allow_noop => {
                tracing::warn!("Bundle signing is disabled; publishing unsigned bundles");
                Ok(Arc::new(NoOpSigner))
            }
            SignerConfig::Noop => Err(ConfigError::NoopRefused("signer")),
        }
    }

    /// Builds the configured verifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if no trust anchor can be loaded, or if the
    /// no-op verifier is configured without `allow_noop`.
    pub fn build_verifier(
        &self,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn BundleVerifier>, ConfigError> {
        match &self.verifier {
            VerifierConfig::Disk(config) => Ok(Arc::new(DiskVerifier::configure(config, clock)?)),
            VerifierConfig::Noop if self.allow_noop => {
                tracing::warn!("Bundle verification is disabled; accepting every federated bundle");
                Ok(Arc::new(NoOpVerifier))
            }
            VerifierConfig::Noop => Err(ConfigError::NoopRefused("verifier")),
        }
    }
}
