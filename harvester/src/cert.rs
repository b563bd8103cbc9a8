//! DER certificate chains as carried in `signing_certificate`, and PEM loading
//! of operator-supplied certificate files.

use std::path::Path;

use openssl::x509::X509;
use thiserror::Error;
use x509_parser::error::X509Error;
use x509_parser::nom::Err;

/// Maximum number of certificates accepted in a signing certificate chain.
///
/// A signing chain is a leaf plus the CA path toward the verifier's anchors; a
/// handful of certificates covers every legitimate deployment.
pub const MAX_CERT_CHAIN_LENGTH: usize = 16;

/// An error that may arise parsing certificates.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CertificateError {
    /// Error returned by the X.509 parsing library.
    #[error("failed parsing X.509 certificate: {0}")]
    ParseX509Certificate(#[from] X509Error),

    /// The chain has more certificates than [`MAX_CERT_CHAIN_LENGTH`].
    #[error("certificate chain has too many certificates (max {max})")]
    TooManyCertificates {
        /// Maximum number of certificates accepted.
        max: usize,
    },

    /// A certificate file could not be read.
    #[error("failed reading certificate file {path}: {source}")]
    Read {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A PEM file could not be decoded.
    #[error("failed decoding PEM certificates from {path}: {source}")]
    Pem {
        /// Path of the file.
        path: String,
        /// Underlying OpenSSL error.
        #[source]
        source: openssl::error::ErrorStack,
    },

    /// The file did not contain any certificate.
    #[error("no certificates found in {0}")]
    Empty(String),
}

/// A single DER-encoded X.509 certificate.
///
/// Invariant: instances are always validated as parseable DER-encoded X.509.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// Returns the certificate bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Certificate {
    type Error = CertificateError;

    fn try_from(der_bytes: &[u8]) -> Result<Self, Self::Error> {
        parse_single(der_bytes)?;
        Ok(Self(der_bytes.to_vec()))
    }
}

impl TryFrom<&X509> for Certificate {
    type Error = openssl::error::ErrorStack;

    fn try_from(cert: &X509) -> Result<Self, Self::Error> {
        Ok(Self(cert.to_der()?))
    }
}

/// Takes a concatenated chain of DER-encoded certificates and splits it into
/// its certificates, leaf first.
///
/// # Errors
///
/// Returns [`CertificateError`] if any certificate fails to parse or the chain
/// is longer than [`MAX_CERT_CHAIN_LENGTH`].
pub fn parse_chain(cert_chain_der: &[u8]) -> Result<Vec<Certificate>, CertificateError> {
    let mut rest = cert_chain_der;
    let mut certs = Vec::new();

    while !rest.is_empty() {
        if certs.len() >= MAX_CERT_CHAIN_LENGTH {
            return Err(CertificateError::TooManyCertificates {
                max: MAX_CERT_CHAIN_LENGTH,
            });
        }

        let (new_rest, _cert) = x509_parser::parse_x509_certificate(rest).map_err(map_nom_err)?;

        let cert_len = rest.len() - new_rest.len();
        certs.push(Certificate(rest[..cert_len].to_vec()));

        rest = new_rest;
    }

    Ok(certs)
}

/// Concatenates the DER encodings of a chain, the transport form of
/// `signing_certificate`.
pub fn encode_chain(chain: &[Certificate]) -> Vec<u8> {
    let total: usize = chain.iter().map(|c| c.as_bytes().len()).sum();
    let mut out = Vec::with_capacity(total);
    for cert in chain {
        out.extend_from_slice(cert.as_bytes());
    }
    out
}

/// Loads every certificate of a PEM file, in file order.
///
/// # Errors
///
/// Returns [`CertificateError`] if the file cannot be read, is not PEM, or
/// holds no certificate.
pub fn load_pem_certificates(path: &Path) -> Result<Vec<X509>, CertificateError> {
    let display = path.display().to_string();
    let pem = std::fs::read(path).map_err(|source| CertificateError::Read {
        path: display.clone(),
        source,
    })?;
    let certs = X509::stack_from_pem(&pem).map_err(|source| CertificateError::Pem {
        path: display.clone(),
        source,
    })?;
    if certs.is_empty() {
        return Err(CertificateError::Empty(display));
    }
    Ok(certs)
}

fn parse_single(der_bytes: &[u8]) -> Result<(), CertificateError> {
    x509_parser::parse_x509_certificate(der_bytes)
        .map(|_| ())
        .map_err(map_nom_err)
}

fn map_nom_err(e: Err<X509Error>) -> CertificateError {
    match e {
        Err::Incomplete(_) => CertificateError::ParseX509Certificate(X509Error::InvalidCertificate),
        Err::Error(err) | Err::Failure(err) => CertificateError::ParseX509Certificate(err),
    }
}
