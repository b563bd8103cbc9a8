use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::stack::Stack;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509NameBuilder, X509StoreContext, X509VerifyResult, X509};
use serde::Deserialize;

use super::error::{ConfigError, SigningError};
use super::{BundleSigner, Signature};
use crate::cert::{load_pem_certificates, Certificate};
use crate::clock::Clock;

/// Lifetime of signing certificates when none is configured.
pub const DEFAULT_SIGNING_CERT_TTL: Duration = Duration::from_secs(3600);

const SIGNING_KEY_BITS: u32 = 2048;
const SIGNING_CERT_CN: &str = "galadriel";
const SERIAL_BITS: i32 = 128;

/// Configuration of the [`DiskSigner`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskSignerConfig {
    /// PEM file with the CA certificate, optionally followed by the
    /// intermediates leading to the upstream trust anchors.
    pub ca_cert_path: PathBuf,
    /// PEM file with the CA private key.
    pub ca_private_key_path: PathBuf,
    /// PEM file with the upstream trust anchors. Without it the CA must be
    /// self-signed.
    #[serde(default)]
    pub trust_bundle_path: Option<PathBuf>,
    /// Lifetime of each signing certificate, in seconds.
    #[serde(default = "default_signing_cert_ttl_secs")]
    pub signing_cert_ttl_secs: u64,
}

fn default_signing_cert_ttl_secs() -> u64 {
    DEFAULT_SIGNING_CERT_TTL.as_secs()
}

impl DiskSignerConfig {
    /// Lifetime of each signing certificate.
    pub fn signing_cert_ttl(&self) -> Duration {
        Duration::from_secs(self.signing_cert_ttl_secs)
    }
}

/// Signs payloads with a fresh key certified by a CA loaded from disk.
pub struct DiskSigner {
    ca_cert: X509,
    ca_key: PKey<Private>,
    ca_self_signed: bool,
    intermediates: Vec<Certificate>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DiskSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSigner")
            .field("ca_subject", &self.ca_cert.subject_name())
            .field("intermediates", &self.intermediates.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl DiskSigner {
    /// Loads and validates the CA key material.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a file is unreadable, the key does not
    /// match the CA certificate, the CA does not chain to the configured trust
    /// bundle (or is not self-signed when none is configured), or the TTL is
    /// zero.
    pub fn configure(
        config: &DiskSignerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let ttl = config.signing_cert_ttl();
        if ttl.is_zero() {
            return Err(ConfigError::InvalidTtl);
        }

        let mut ca_chain = load_pem_certificates(&config.ca_cert_path)?.into_iter();
        let ca_cert = ca_chain
            .next()
            .ok_or_else(|| ConfigError::UntrustedCa("empty CA chain".to_owned()))?;
        let upstream: Vec<X509> = ca_chain.collect();

        let key_pem =
            std::fs::read(&config.ca_private_key_path).map_err(|source| ConfigError::ReadKey {
                path: config.ca_private_key_path.clone(),
                source,
            })?;
        let ca_key = PKey::private_key_from_pem(&key_pem).map_err(|source| ConfigError::DecodeKey {
            path: config.ca_private_key_path.clone(),
            source,
        })?;
        if !ca_cert.public_key()?.public_eq(&ca_key) {
            return Err(ConfigError::KeyMismatch);
        }

        let ca_self_signed = is_self_signed(&ca_cert);
        let intermediates = match &config.trust_bundle_path {
            None => {
                if !ca_self_signed {
                    return Err(ConfigError::NotSelfSigned);
                }
                Vec::new()
            }
            Some(path) => {
                let anchors = load_pem_certificates(path)?;
                verify_ca_chain(&ca_cert, &upstream, &anchors)?;
                upstream
                    .iter()
                    .map(Certificate::try_from)
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(Self {
            ca_cert,
            ca_key,
            ca_self_signed,
            intermediates,
            ttl,
            clock,
        })
    }

    fn issue_leaf(&self, key: &PKey<Private>) -> Result<X509, SigningError> {
        let now = self.clock.now();
        let ttl = time::Duration::try_from(self.ttl).map_err(|_| SigningError::Validity)?;
        let not_after = now.checked_add(ttl).ok_or(SigningError::Validity)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", SIGNING_CERT_CN)?;
        let name = name.build();

        let mut serial = BigNum::new()?;
        serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;

        let serial = serial.to_asn1_integer()?;
        let not_before = Asn1Time::from_unix(now.unix_timestamp() as _)?;
        let not_after = Asn1Time::from_unix(not_after.unix_timestamp() as _)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.ca_cert.subject_name())?;
        builder.set_pubkey(key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
        builder.sign(&self.ca_key, MessageDigest::sha256())?;
        Ok(builder.build())
    }
}

impl BundleSigner for DiskSigner {
    fn sign(&self, payload: &[u8]) -> Result<Option<Signature>, SigningError> {
        let key = PKey::from_rsa(Rsa::generate(SIGNING_KEY_BITS)?)?;
        let leaf = self.issue_leaf(&key)?;

        let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
        signer.update(payload)?;
        let signature = signer.sign_to_vec()?;

        let mut chain = vec![Certificate::try_from(&leaf)?];
        if !self.ca_self_signed {
            chain.push(Certificate::try_from(&self.ca_cert)?);
        }
        chain.extend(self.intermediates.iter().cloned());

        Ok(Some(Signature { signature, chain }))
    }
}

/// Publishes bundles without a signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSigner;

impl BundleSigner for NoOpSigner {
    fn sign(&self, _payload: &[u8]) -> Result<Option<Signature>, SigningError> {
        Ok(None)
    }
}

fn is_self_signed(cert: &X509) -> bool {
    cert.issued(cert) == X509VerifyResult::OK
        && cert
            .public_key()
            .and_then(|key| cert.verify(&key))
            .unwrap_or(false)
}

fn verify_ca_chain(ca_cert: &X509, upstream: &[X509], anchors: &[X509]) -> Result<(), ConfigError> {
    let mut store = X509StoreBuilder::new()?;
    for anchor in anchors {
        store.add_cert(anchor.clone())?;
    }
    store.set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
    let store = store.build();

    let mut untrusted = Stack::new()?;
    for cert in upstream {
        untrusted.push(cert.clone())?;
    }

    let mut ctx = X509StoreContext::new()?;
    let failure = ctx.init(&store, ca_cert, &untrusted, |c| {
        Ok(if c.verify_cert()? {
            None
        } else {
            Some(c.error().error_string().to_owned())
        })
    })?;

    match failure {
        None => Ok(()),
        Some(reason) => Err(ConfigError::UntrustedCa(reason)),
    }
}
