use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use spire_api::types::Bundle as SpireBundle;
use spire_api::BatchStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    settle_tick, sleep_or_cancel, ErrorTracker, TaskError, TickError, MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::bundle::{document, Bundle, FederatedBundleState};
use crate::cert::parse_chain;
use crate::hub::Hub;
use crate::integrity::{BundleVerifier, VerificationError};
use crate::spire::IdentityServer;
use crate::trust_domain::TrustDomainName;

const TASK: &str = "federated_bundles_sync";

/// Pulls peer bundles from the hub, verifies them and reconciles the
/// identity server's federated bundles with the hub's authoritative state.
pub struct FederatedSynchronizer {
    identity_server: Arc<dyn IdentityServer>,
    hub: Arc<dyn Hub>,
    verifier: Arc<dyn BundleVerifier>,
    interval: Duration,
    last_seen_digests: Option<FederatedBundleState>,
}

impl std::fmt::Debug for FederatedSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedSynchronizer")
            .field("interval", &self.interval)
            .field("last_seen_digests", &self.last_seen_digests)
            .finish_non_exhaustive()
    }
}

impl FederatedSynchronizer {
    /// Creates a synchronizer that ticks every `interval`.
    pub fn new(
        identity_server: Arc<dyn IdentityServer>,
        hub: Arc<dyn Hub>,
        verifier: Arc<dyn BundleVerifier>,
        interval: Duration,
    ) -> Self {
        Self {
            identity_server,
            hub,
            verifier,
            interval,
            last_seen_digests: None,
        }
    }

    /// Runs until cancelled or until the hub rejects the bearer token for
    /// good.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Cancelled`] on cancellation and
    /// [`TaskError::Fatal`] on an unrecoverable hub error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), TaskError> {
        debug!(interval = ?self.interval, "Starting federated bundles synchronizer");
        let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(TaskError::Cancelled),
                outcome = self.tick() => outcome,
            };
            settle_tick(TASK, outcome, &mut error_tracker)?;

            if sleep_or_cancel(&cancel, self.interval).await {
                debug!("Cancellation signal received; stopping federated bundles synchronizer");
                return Err(TaskError::Cancelled);
            }
        }
    }

    pub(crate) async fn tick(&mut self) -> Result<(), TickError> {
        let installed = self.identity_server.list_federated_bundles().await?;
        let (installed_domains, local_view) = local_view(&installed);

        let (updates, new_state) = self.hub.sync_bundles(&local_view).await?;

        if self.last_seen_digests.as_ref() == Some(&new_state) {
            debug!(peers = new_state.len(), "Federated bundles unchanged");
            return Ok(());
        }

        let set_batch: Vec<SpireBundle> = updates
            .iter()
            .filter_map(|update| self.accept_update(update))
            .collect();
        if !set_batch.is_empty() {
            let count = set_batch.len();
            let statuses = self.identity_server.set_federated_bundles(set_batch).await?;
            let failed = log_failed_items("set", &statuses);
            info!(applied = count - failed, failed, "Applied federated bundle updates");
        }

        let delete_batch: Vec<TrustDomainName> = installed_domains
            .into_iter()
            .filter(|td| !new_state.contains_key(td))
            .collect();
        if !delete_batch.is_empty() {
            let count = delete_batch.len();
            let statuses = self
                .identity_server
                .delete_federated_bundles(delete_batch)
                .await?;
            let failed = log_failed_items("delete", &statuses);
            info!(deleted = count - failed, failed, "Removed federated bundles no longer approved");
        }

        self.last_seen_digests = Some(new_state);
        Ok(())
    }

    /// Verifies an update and converts it for the identity server. Rejected
    /// updates are logged and dropped.
    fn accept_update(&self, update: &Bundle) -> Option<SpireBundle> {
        let trust_domain = update.trust_domain();

        if let Err(e) = self.verify(update) {
            error!(
                trust_domain = %trust_domain,
                error = %e,
                "Federated bundle failed verification; skipping"
            );
            return None;
        }

        match document::unmarshal(trust_domain, update.data()) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                error!(
                    trust_domain = %trust_domain,
                    error = %e,
                    "Federated bundle is not a valid bundle document; skipping"
                );
                None
            }
        }
    }

    fn verify(&self, update: &Bundle) -> Result<(), VerificationError> {
        let chain = match update.signing_certificate() {
            Some(der) => parse_chain(der).map_err(|e| VerificationError::Chain(e.to_string()))?,
            None => Vec::new(),
        };
        self.verifier
            .verify(update.data(), update.signature(), &chain)
    }
}

/// Splits the installed bundles into the set of installed trust domains and
/// the digest-bearing view sent to the hub.
fn local_view(installed: &[SpireBundle]) -> (BTreeSet<TrustDomainName>, Vec<Bundle>) {
    let mut domains = BTreeSet::new();
    let mut view = Vec::with_capacity(installed.len());

    for bundle in installed {
        let trust_domain = match TrustDomainName::new(&bundle.trust_domain) {
            Ok(td) => td,
            Err(e) => {
                warn!(
                    trust_domain = %bundle.trust_domain,
                    error = %e,
                    "Ignoring federated bundle with invalid trust domain"
                );
                continue;
            }
        };
        domains.insert(trust_domain.clone());

        match document::marshal(bundle) {
            Ok(data) => view.push(Bundle::new(trust_domain, data)),
            Err(e) => {
                warn!(
                    trust_domain = %trust_domain,
                    error = %e,
                    "Cannot serialize installed federated bundle; hub will resend it"
                );
            }
        }
    }

    (domains, view)
}

fn log_failed_items(operation: &str, statuses: &[BatchStatus]) -> usize {
    let mut failed = 0;
    for status in statuses.iter().filter(|s| !s.is_ok()) {
        failed += 1;
        error!(
            operation,
            trust_domain = %status.trust_domain,
            code = ?status.code,
            message = %status.message,
            "SPIRE Server rejected federated bundle"
        );
    }
    failed
}
