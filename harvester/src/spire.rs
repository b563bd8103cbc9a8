//! Adapter over the SPIRE Server bundle API.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use spire_api::types::Bundle as SpireBundle;
use spire_api::{BatchStatus, BundleClient, DeleteMode, Endpoint, GrpcClientError};
use thiserror::Error;

use crate::trust_domain::TrustDomainName;

/// Deadline applied to each identity server call.
pub const SPIRE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The identity server could not serve a request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The call failed.
    #[error("SPIRE Server call failed: {0}")]
    Client(#[from] GrpcClientError),

    /// The call did not complete within [`SPIRE_CALL_TIMEOUT`].
    #[error("SPIRE Server call {0} timed out")]
    Timeout(&'static str),
}

/// Bundle operations the federation engine needs from the local identity
/// server.
#[async_trait]
pub trait IdentityServer: Send + Sync {
    /// Returns the bundle of the local trust domain.
    async fn get_local_bundle(&self) -> Result<SpireBundle, UpstreamError>;

    /// Returns every federated bundle installed on the server.
    async fn list_federated_bundles(&self) -> Result<Vec<SpireBundle>, UpstreamError>;

    /// Creates or replaces federated bundles, reporting one status per bundle.
    async fn set_federated_bundles(
        &self,
        bundles: Vec<SpireBundle>,
    ) -> Result<Vec<BatchStatus>, UpstreamError>;

    /// Deletes federated bundles in dissociate mode, reporting one status per
    /// trust domain.
    async fn delete_federated_bundles(
        &self,
        trust_domains: Vec<TrustDomainName>,
    ) -> Result<Vec<BatchStatus>, UpstreamError>;
}

/// [`IdentityServer`] backed by the SPIRE Server private API socket.
#[derive(Debug, Clone)]
pub struct SpireServer {
    client: BundleClient,
    timeout: Duration,
}

impl SpireServer {
    /// Creates an adapter for the server at `endpoint`. The connection is
    /// established on first use.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if the endpoint is invalid or unsupported on
    /// this platform.
    pub async fn new(endpoint: &str) -> Result<Self, UpstreamError> {
        let endpoint = Endpoint::parse(endpoint).map_err(GrpcClientError::from)?;
        let client = BundleClient::connect_lazy(endpoint).await?;
        Ok(Self::from_client(client))
    }

    /// Wraps an existing client.
    pub fn from_client(client: BundleClient) -> Self {
        Self {
            client,
            timeout: SPIRE_CALL_TIMEOUT,
        }
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, UpstreamError>
    where
        F: Future<Output = Result<T, GrpcClientError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(UpstreamError::Timeout(operation)),
        }
    }
}

#[async_trait]
impl IdentityServer for SpireServer {
    async fn get_local_bundle(&self) -> Result<SpireBundle, UpstreamError> {
        self.call("GetBundle", self.client.get_bundle()).await
    }

    async fn list_federated_bundles(&self) -> Result<Vec<SpireBundle>, UpstreamError> {
        self.call("ListFederatedBundles", self.client.list_federated_bundles())
            .await
    }

    async fn set_federated_bundles(
        &self,
        bundles: Vec<SpireBundle>,
    ) -> Result<Vec<BatchStatus>, UpstreamError> {
        self.call(
            "BatchSetFederatedBundle",
            self.client.batch_set_federated_bundle(bundles),
        )
        .await
    }

    async fn delete_federated_bundles(
        &self,
        trust_domains: Vec<TrustDomainName>,
    ) -> Result<Vec<BatchStatus>, UpstreamError> {
        let trust_domains = trust_domains.into_iter().map(|td| td.to_string()).collect();
        self.call(
            "BatchDeleteFederatedBundle",
            self.client
                .batch_delete_federated_bundle(trust_domains, DeleteMode::Dissociate),
        )
        .await
    }
}
