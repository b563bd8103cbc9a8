use std::sync::Arc;
use std::time::Duration;

use spire_api::types::Bundle as SpireBundle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    settle_tick, sleep_or_cancel, ErrorTracker, TaskError, TickError, MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::bundle::{document, Bundle};
use crate::cert::encode_chain;
use crate::hub::Hub;
use crate::integrity::{BundleSigner, SigningError};
use crate::spire::IdentityServer;
use crate::trust_domain::TrustDomainName;

const TASK: &str = "local_bundle_sync";

/// Publishes the local trust domain's bundle to the hub whenever the identity
/// server reports a change.
pub struct LocalSynchronizer {
    trust_domain: TrustDomainName,
    identity_server: Arc<dyn IdentityServer>,
    hub: Arc<dyn Hub>,
    signer: Arc<dyn BundleSigner>,
    interval: Duration,
    last_local_bundle: Option<SpireBundle>,
}

impl std::fmt::Debug for LocalSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSynchronizer")
            .field("trust_domain", &self.trust_domain)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl LocalSynchronizer {
    /// Creates a synchronizer for `trust_domain` that ticks every `interval`.
    pub fn new(
        trust_domain: TrustDomainName,
        identity_server: Arc<dyn IdentityServer>,
        hub: Arc<dyn Hub>,
        signer: Arc<dyn BundleSigner>,
        interval: Duration,
    ) -> Self {
        Self {
            trust_domain,
            identity_server,
            hub,
            signer,
            interval,
            last_local_bundle: None,
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
        debug!(interval = ?self.interval, "Starting local bundle synchronizer");
        let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(TaskError::Cancelled),
                outcome = self.tick() => outcome,
            };
            settle_tick(TASK, outcome, &mut error_tracker)?;

            if sleep_or_cancel(&cancel, self.interval).await {
                debug!("Cancellation signal received; stopping local bundle synchronizer");
                return Err(TaskError::Cancelled);
            }
        }
    }

    pub(crate) async fn tick(&mut self) -> Result<(), TickError> {
        let current = self.identity_server.get_local_bundle().await?;
        if self.last_local_bundle.as_ref() == Some(&current) {
            debug!("Local bundle unchanged");
            return Ok(());
        }

        let data = document::marshal(&current)?;
        let bundle = self.sign(Bundle::new(self.trust_domain.clone(), data)).await?;

        self.hub.publish_bundle(&bundle).await?;
        info!(
            trust_domain = %self.trust_domain,
            digest = %bundle.digest().short(),
            sequence_number = current.sequence_number,
            "Published local bundle"
        );

        self.last_local_bundle = Some(current);
        Ok(())
    }

    async fn sign(&self, bundle: Bundle) -> Result<Bundle, SigningError> {
        // Key generation is CPU bound; keep it off the runtime workers.
        let signer = Arc::clone(&self.signer);
        let signed = tokio::task::spawn_blocking(move || {
            let signature = signer.sign(bundle.data())?;
            Ok::<_, SigningError>(match signature {
                Some(signature) => {
                    bundle.with_signature(signature.signature, encode_chain(&signature.chain))
                }
                None => bundle,
            })
        })
        .await;

        match signed {
            Ok(result) => result,
            Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Err(_) => Err(SigningError::Interrupted),
        }
    }
}
