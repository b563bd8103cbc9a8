use std::path::PathBuf;

use thiserror::Error;

use crate::cert::CertificateError;

/// Signer or verifier misconfiguration, detected at start-up.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A certificate file could not be loaded.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// The CA private key could not be read.
    #[error("failed reading private key {path}: {source}")]
    ReadKey {
        /// Path of the key file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The CA private key could not be decoded.
    #[error("failed decoding private key {path}: {source}")]
    DecodeKey {
        /// Path of the key file.
        path: PathBuf,
        /// Underlying OpenSSL error.
        #[source]
        source: openssl::error::ErrorStack,
    },

    /// The private key does not belong to the CA certificate.
    #[error("CA private key does not match the CA certificate")]
    KeyMismatch,

    /// Without upstream trust anchors the CA must be a root.
    #[error("CA certificate is not self-signed and no trust bundle is configured")]
    NotSelfSigned,

    /// The CA chain does not verify against the configured trust anchors.
    #[error("CA certificate does not chain to the trust bundle: {0}")]
    UntrustedCa(String),

    /// The signing certificate lifetime must be positive.
    #[error("signing certificate TTL must be greater than zero")]
    InvalidTtl,

    /// A no-op provider was configured without opting in.
    #[error("{0} integrity provider \"noop\" requires integrity.allow_noop = true")]
    NoopRefused(&'static str),

    /// OpenSSL failed while processing key material.
    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Failure to sign a payload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SigningError {
    /// OpenSSL failed generating the key, the certificate or the signature.
    #[error("failed signing payload: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// The clock is outside the range representable in a certificate.
    #[error("signing certificate validity out of range")]
    Validity,

    /// The signing task was cancelled before completing.
    #[error("signing was interrupted")]
    Interrupted,
}

/// Rejection of an inbound bundle signature.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerificationError {
    /// No signing certificate chain accompanies the bundle.
    #[error("chain missing")]
    MissingChain,

    /// The bundle carries no signature.
    #[error("signature missing")]
    MissingSignature,

    /// The signature does not match the payload under the leaf key.
    #[error("invalid signature")]
    InvalidSignature,

    /// The signing certificate chain does not lead to a trust anchor.
    #[error("certificate chain verification failed: {0}")]
    Chain(String),
}
