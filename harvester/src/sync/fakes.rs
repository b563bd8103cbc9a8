//! In-memory collaborators for exercising the loops.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use spire_api::types::Bundle as SpireBundle;
use spire_api::BatchStatus;

use crate::bundle::{document, Bundle, FederatedBundleState};
use crate::cert::test_support::root_ca;
use crate::cert::Certificate;
use crate::hub::{Hub, HubError};
use crate::integrity::{BundleSigner, BundleVerifier, Signature, SigningError, VerificationError};
use crate::spire::{IdentityServer, UpstreamError};
use crate::trust_domain::TrustDomainName;

pub(crate) fn td(name: &str) -> TrustDomainName {
    TrustDomainName::new(name).unwrap()
}

pub(crate) fn spire_bundle(trust_domain: &str, sequence_number: u64) -> SpireBundle {
    SpireBundle {
        trust_domain: trust_domain.to_owned(),
        sequence_number,
        ..SpireBundle::default()
    }
}

/// DER of a throwaway certificate standing in for a signing chain.
pub(crate) fn signing_chain_der() -> Vec<u8> {
    static CHAIN: OnceLock<Vec<u8>> = OnceLock::new();
    CHAIN
        .get_or_init(|| root_ca("signing").cert.to_der().unwrap())
        .clone()
}

/// A signed hub bundle whose data is the document of
/// `spire_bundle(trust_domain, sequence_number)`.
pub(crate) fn hub_bundle(trust_domain: &str, sequence_number: u64) -> Bundle {
    let data = document::marshal(&spire_bundle(trust_domain, sequence_number)).unwrap();
    Bundle::new(td(trust_domain), data).with_signature(b"s1".to_vec(), signing_chain_der())
}

#[derive(Debug, Default)]
pub(crate) struct FakeIdentityServer {
    pub(crate) local: Mutex<SpireBundle>,
    pub(crate) federated: Mutex<BTreeMap<String, SpireBundle>>,
    pub(crate) rejected: Mutex<BTreeSet<String>>,
    pub(crate) set_calls: Mutex<Vec<Vec<SpireBundle>>>,
    pub(crate) delete_calls: Mutex<Vec<Vec<TrustDomainName>>>,
    pub(crate) unavailable: AtomicBool,
}

impl FakeIdentityServer {
    pub(crate) fn with_federated(bundles: impl IntoIterator<Item = SpireBundle>) -> Self {
        let server = Self::default();
        *server.federated.lock().unwrap() = bundles
            .into_iter()
            .map(|b| (b.trust_domain.clone(), b))
            .collect();
        server
    }

    pub(crate) fn installed(&self) -> BTreeSet<String> {
        self.federated.lock().unwrap().keys().cloned().collect()
    }

    fn check_available(&self) -> Result<(), UpstreamError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(UpstreamError::Timeout("fake"))
        } else {
            Ok(())
        }
    }

    fn status(&self, trust_domain: String) -> BatchStatus {
        let rejected = self.rejected.lock().unwrap().contains(&trust_domain);
        BatchStatus {
            trust_domain,
            code: if rejected {
                tonic::Code::InvalidArgument
            } else {
                tonic::Code::Ok
            },
            message: if rejected { "rejected".to_owned() } else { String::new() },
        }
    }
}

#[async_trait]
impl IdentityServer for FakeIdentityServer {
    async fn get_local_bundle(&self) -> Result<SpireBundle, UpstreamError> {
        self.check_available()?;
        Ok(self.local.lock().unwrap().clone())
    }

    async fn list_federated_bundles(&self) -> Result<Vec<SpireBundle>, UpstreamError> {
        self.check_available()?;
        Ok(self.federated.lock().unwrap().values().cloned().collect())
    }

    async fn set_federated_bundles(
        &self,
        bundles: Vec<SpireBundle>,
    ) -> Result<Vec<BatchStatus>, UpstreamError> {
        self.check_available()?;
        self.set_calls.lock().unwrap().push(bundles.clone());
        let mut statuses = Vec::new();
        for bundle in bundles {
            let status = self.status(bundle.trust_domain.clone());
            if status.is_ok() {
                self.federated
                    .lock()
                    .unwrap()
                    .insert(bundle.trust_domain.clone(), bundle);
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn delete_federated_bundles(
        &self,
        trust_domains: Vec<TrustDomainName>,
    ) -> Result<Vec<BatchStatus>, UpstreamError> {
        self.check_available()?;
        self.delete_calls.lock().unwrap().push(trust_domains.clone());
        let mut statuses = Vec::new();
        for td in trust_domains {
            let status = self.status(td.to_string());
            if status.is_ok() {
                self.federated.lock().unwrap().remove(td.as_str());
            }
            statuses.push(status);
        }
        Ok(statuses)
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeHub {
    pub(crate) sync_response: Mutex<(Vec<Bundle>, FederatedBundleState)>,
    pub(crate) sync_error: Mutex<Option<HubError>>,
    pub(crate) sync_calls: Mutex<Vec<Vec<Bundle>>>,
    pub(crate) publish_error: Mutex<Option<HubError>>,
    pub(crate) published: Mutex<Vec<Bundle>>,
    pub(crate) rotations: AtomicUsize,
    pub(crate) rotate_error: Mutex<Option<HubError>>,
}

impl FakeHub {
    pub(crate) fn respond(&self, updates: Vec<Bundle>, state: FederatedBundleState) {
        *self.sync_response.lock().unwrap() = (updates, state);
    }
}

#[async_trait]
impl Hub for FakeHub {
    async fn sync_bundles(
        &self,
        local_view: &[Bundle],
    ) -> Result<(Vec<Bundle>, FederatedBundleState), HubError> {
        self.sync_calls.lock().unwrap().push(local_view.to_vec());
        if let Some(e) = self.sync_error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.sync_response.lock().unwrap().clone())
    }

    async fn publish_bundle(&self, bundle: &Bundle) -> Result<(), HubError> {
        if let Some(e) = self.publish_error.lock().unwrap().take() {
            return Err(e);
        }
        self.published.lock().unwrap().push(bundle.clone());
        Ok(())
    }

    async fn rotate_token(&self) -> Result<(), HubError> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        match self.rotate_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeSigner {
    pub(crate) calls: AtomicUsize,
}

impl BundleSigner for FakeSigner {
    fn sign(&self, _payload: &[u8]) -> Result<Option<Signature>, SigningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Signature {
            signature: b"sig".to_vec(),
            chain: Vec::<Certificate>::new(),
        }))
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeVerifier {
    pub(crate) reject: AtomicBool,
    pub(crate) calls: AtomicUsize,
}

impl BundleVerifier for FakeVerifier {
    fn verify(
        &self,
        _payload: &[u8],
        _signature: Option<&[u8]>,
        _chain: &[Certificate],
    ) -> Result<(), VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            Err(VerificationError::InvalidSignature)
        } else {
            Ok(())
        }
    }
}
