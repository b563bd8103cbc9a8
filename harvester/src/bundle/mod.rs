//! Bundles as exchanged with the hub.
//!
//! A [`Bundle`] carries the serialized trust bundle of one trust domain together
//! with its SHA-256 digest and, for signed bundles, the signature and the DER of
//! the signing certificate chain. The digest is derived from the data and is
//! checked whenever a bundle is assembled from untrusted parts.

pub mod document;

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::trust_domain::TrustDomainName;

/// Length in bytes of a bundle [`Digest`].
pub const DIGEST_LENGTH: usize = 32;

/// Mapping from trust domain to bundle digest.
///
/// Ordered so that two states holding the same entries compare equal and
/// iterate identically.
pub type FederatedBundleState = BTreeMap<TrustDomainName, Digest>;

/// SHA-256 digest of a bundle's data.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Digest([u8; DIGEST_LENGTH]);

/// An error that can arise assembling a [`Bundle`] or decoding a [`Digest`].
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BundleError {
    /// The digest is not 32 bytes long.
    #[error("digest must be {DIGEST_LENGTH} bytes, got {0}")]
    InvalidDigestLength(usize),

    /// The digest is not valid base64.
    #[error("digest is not valid base64: {0}")]
    InvalidDigestEncoding(#[from] base64::DecodeError),

    /// The digest does not match the SHA-256 of the bundle data.
    #[error("digest does not match bundle data for trust domain {0}")]
    DigestMismatch(TrustDomainName),

    /// A signature was supplied without its signing certificate.
    #[error("bundle for trust domain {0} is signed but has no signing certificate")]
    MissingSigningCertificate(TrustDomainName),
}

impl Digest {
    /// Computes the SHA-256 digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Builds a digest from its raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::InvalidDigestLength`] unless `bytes` is exactly
    /// 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, BundleError> {
        <[u8; DIGEST_LENGTH]>::try_from(bytes)
            .map(Self)
            .map_err(|_| BundleError::InvalidDigestLength(bytes.len()))
    }

    /// Decodes a digest from its standard base64 wire form.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] if the input is not base64 or not 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, BundleError> {
        Self::from_slice(&STANDARD.decode(encoded)?)
    }

    /// Encodes the digest in its standard base64 wire form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    /// Short hex prefix used in log fields.
    pub fn short(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

/// The artifact exchanged with the hub for one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    trust_domain: TrustDomainName,
    data: Vec<u8>,
    digest: Digest,
    signature: Option<Vec<u8>>,
    signing_certificate: Option<Vec<u8>>,
}

impl Bundle {
    /// Creates an unsigned bundle, deriving the digest from `data`.
    pub fn new(trust_domain: TrustDomainName, data: Vec<u8>) -> Self {
        let digest = Digest::of(&data);
        Self {
            trust_domain,
            data,
            digest,
            signature: None,
            signing_certificate: None,
        }
    }

    /// Assembles a bundle received from the hub.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::DigestMismatch`] if `digest` is not the SHA-256
    /// of `data`, and [`BundleError::MissingSigningCertificate`] if a
    /// signature arrives without a certificate.
    pub fn from_parts(
        trust_domain: TrustDomainName,
        data: Vec<u8>,
        digest: Digest,
        signature: Option<Vec<u8>>,
        signing_certificate: Option<Vec<u8>>,
    ) -> Result<Self, BundleError> {
        if Digest::of(&data) != digest {
            return Err(BundleError::DigestMismatch(trust_domain));
        }
        if signature.is_some() && signing_certificate.is_none() {
            return Err(BundleError::MissingSigningCertificate(trust_domain));
        }
        Ok(Self {
            trust_domain,
            data,
            digest,
            signature,
            signing_certificate,
        })
    }

    /// Attaches a signature and the DER of its signing certificate chain.
    #[must_use]
    pub fn with_signature(mut self, signature: Vec<u8>, signing_certificate: Vec<u8>) -> Self {
        self.signature = Some(signature);
        self.signing_certificate = Some(signing_certificate);
        self
    }

    /// Returns the trust domain the bundle belongs to.
    pub fn trust_domain(&self) -> &TrustDomainName {
        &self.trust_domain
    }

    /// Returns the serialized bundle.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the SHA-256 digest of [`Bundle::data`].
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Returns the signature over the data, if signed.
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Returns the concatenated DER of the signing certificate chain, leaf
    /// first, if signed.
    pub fn signing_certificate(&self) -> Option<&[u8]> {
        self.signing_certificate.as_deref()
    }
}
