use std::path::PathBuf;
use std::sync::Arc;

use openssl::hash::MessageDigest;
use openssl::sign::Verifier;
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::{X509VerifyFlags, X509VerifyParam};
use openssl::x509::{X509StoreContext, X509};
use serde::Deserialize;

use super::error::{ConfigError, VerificationError};
use super::BundleVerifier;
use crate::cert::{load_pem_certificates, Certificate};
use crate::clock::Clock;

/// Configuration of the [`DiskVerifier`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskVerifierConfig {
    /// PEM file with the trust anchors signing chains must lead to.
    pub trust_bundle_path: PathBuf,
}

/// Verifies bundle signatures against trust anchors loaded from disk.
pub struct DiskVerifier {
    anchors: Vec<X509>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DiskVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskVerifier")
            .field("anchors", &self.anchors.len())
            .finish_non_exhaustive()
    }
}

impl DiskVerifier {
    /// Loads the trust anchors.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable or holds no
    /// certificate.
    pub fn configure(
        config: &DiskVerifierConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let anchors = load_pem_certificates(&config.trust_bundle_path)?;
        Ok(Self { anchors, clock })
    }

    // Rebuilt per call so the verification time follows the injected clock.
    fn store(&self) -> Result<X509Store, openssl::error::ErrorStack> {
        let mut builder = X509StoreBuilder::new()?;
        for anchor in &self.anchors {
            builder.add_cert(anchor.clone())?;
        }
        let mut param = X509VerifyParam::new()?;
        param.set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
        param.set_time(self.clock.now().unix_timestamp() as _);
        builder.set_param(&param)?;
        Ok(builder.build())
    }

    fn verify_chain(
        &self,
        leaf: &X509,
        intermediates: &[Certificate],
    ) -> Result<(), VerificationError> {
        let chain_err = |e: openssl::error::ErrorStack| VerificationError::Chain(e.to_string());

        let store = self.store().map_err(chain_err)?;
        let mut untrusted = Stack::new().map_err(chain_err)?;
        for cert in intermediates {
            let cert = X509::from_der(cert.as_bytes()).map_err(chain_err)?;
            untrusted.push(cert).map_err(chain_err)?;
        }

        let mut ctx = X509StoreContext::new().map_err(chain_err)?;
        let failure = ctx
            .init(&store, leaf, &untrusted, |c| {
                Ok(if c.verify_cert()? {
                    None
                } else {
                    Some(c.error().error_string().to_owned())
                })
            })
            .map_err(chain_err)?;

        match failure {
            None => Ok(()),
            Some(reason) => Err(VerificationError::Chain(reason)),
        }
    }
}

impl BundleVerifier for DiskVerifier {
    fn verify(
        &self,
        payload: &[u8],
        signature: Option<&[u8]>,
        chain: &[Certificate],
    ) -> Result<(), VerificationError> {
        let (leaf, intermediates) = chain.split_first().ok_or(VerificationError::MissingChain)?;
        let signature = signature.ok_or(VerificationError::MissingSignature)?;

        let leaf = X509::from_der(leaf.as_bytes())
            .map_err(|e| VerificationError::Chain(format!("malformed leaf certificate: {e}")))?;
        self.verify_chain(&leaf, intermediates)?;

        let valid = leaf
            .public_key()
            .and_then(|key| {
                let mut verifier = Verifier::new(MessageDigest::sha256(), &key)?;
                verifier.update(payload)?;
                verifier.verify(signature)
            })
            .unwrap_or(false);

        if valid {
            Ok(())
        } else {
            Err(VerificationError::InvalidSignature)
        }
    }
}

/// Accepts every bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpVerifier;

impl BundleVerifier for NoOpVerifier {
    fn verify(
        &self,
        _payload: &[u8],
        _signature: Option<&[u8]>,
        _chain: &[Certificate],
    ) -> Result<(), VerificationError> {
        Ok(())
    }
}
