//! Supervisor running the federation loops under one cancellation scope.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::hub::Hub;
use crate::integrity::{BundleSigner, BundleVerifier};
use crate::spire::IdentityServer;
use crate::sync::{FederatedSynchronizer, LocalSynchronizer, TaskError, TokenRotator};
use crate::trust_domain::TrustDomainName;

/// Default period of the federated bundle synchronizer.
pub const DEFAULT_FEDERATED_BUNDLES_POLL_INTERVAL: Duration = Duration::from_secs(120);
/// Default period of the local bundle synchronizer.
pub const DEFAULT_SPIRE_BUNDLE_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Default period of the token rotator.
pub const DEFAULT_TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(300);

/// Why the engine stopped before being cancelled.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A loop returned an unrecoverable error.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// A loop panicked.
    #[error("engine task panicked: {0}")]
    Panicked(String),
}

/// Periods of the three loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Federated bundle pull.
    pub federated_bundles: Duration,
    /// Local bundle publication.
    pub spire_bundle: Duration,
    /// Bearer token rotation.
    pub token_rotation: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            federated_bundles: DEFAULT_FEDERATED_BUNDLES_POLL_INTERVAL,
            spire_bundle: DEFAULT_SPIRE_BUNDLE_POLL_INTERVAL,
            token_rotation: DEFAULT_TOKEN_ROTATION_INTERVAL,
        }
    }
}

/// The bundle federation engine.
///
/// Owns the collaborators shared by the federated synchronizer, the local
/// synchronizer and the token rotator. [`Engine::run`] starts all three and
/// returns once every one of them has stopped.
pub struct Engine {
    trust_domain: TrustDomainName,
    identity_server: Arc<dyn IdentityServer>,
    hub: Arc<dyn Hub>,
    signer: Arc<dyn BundleSigner>,
    verifier: Arc<dyn BundleVerifier>,
    intervals: Intervals,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("trust_domain", &self.trust_domain)
            .field("signer", &self.signer)
            .field("verifier", &self.verifier)
            .field("intervals", &self.intervals)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine for the local `trust_domain`.
    pub fn new(
        trust_domain: TrustDomainName,
        identity_server: Arc<dyn IdentityServer>,
        hub: Arc<dyn Hub>,
        signer: Arc<dyn BundleSigner>,
        verifier: Arc<dyn BundleVerifier>,
        intervals: Intervals,
    ) -> Self {
        Self {
            trust_domain,
            identity_server,
            hub,
            signer,
            verifier,
            intervals,
        }
    }

    /// Runs the loops until `cancel` fires or one of them fails.
    ///
    /// The first failure cancels the remaining loops; the call returns after
    /// all of them have stopped.
    ///
    /// # Errors
    ///
    /// Returns the first unrecoverable loop error. Cancellation is not an
    /// error.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        let scope = cancel.child_token();
        let mut tasks = JoinSet::new();

        tasks.spawn(
            FederatedSynchronizer::new(
                Arc::clone(&self.identity_server),
                Arc::clone(&self.hub),
                Arc::clone(&self.verifier),
                self.intervals.federated_bundles,
            )
            .run(scope.clone()),
        );
        tasks.spawn(
            LocalSynchronizer::new(
                self.trust_domain.clone(),
                Arc::clone(&self.identity_server),
                Arc::clone(&self.hub),
                Arc::clone(&self.signer),
                self.intervals.spire_bundle,
            )
            .run(scope.clone()),
        );
        tasks.spawn(
            TokenRotator::new(Arc::clone(&self.hub), self.intervals.token_rotation)
                .run(scope.clone()),
        );

        info!(trust_domain = %self.trust_domain, "Federation engine started");

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(()) | Err(TaskError::Cancelled)) => continue,
                Ok(Err(e)) => EngineError::Task(e),
                Err(e) => EngineError::Panicked(e.to_string()),
            };
            if failure.is_none() {
                error!(error = %err, "Engine task failed; stopping remaining tasks");
                scope.cancel();
                failure = Some(err);
            } else {
                debug!(error = %err, "Additional engine task failure");
            }
        }

        match failure {
            Some(err) => Err(err),
            None => {
                info!("Federation engine stopped");
                Ok(())
            }
        }
    }
}
