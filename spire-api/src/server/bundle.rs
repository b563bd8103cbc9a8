//! Bundle (SPIRE Server API).
//!
//! Protobuf:
//! - `https://github.com/spiffe/spire-api-sdk/blob/main/proto/spire/api/server/bundle/v1/bundle.proto`
//!
//! Notes:
//! - This API must be used over the SPIRE Server **private** socket.
//! - Batch operations report one status per requested item. A failed item does not fail the
//!   whole call; callers inspect [`BatchStatus::is_ok`] per item.

use crate::endpoint::Endpoint;
use crate::error::GrpcClientError;
use crate::pb::spire::api::server::bundle::v1::batch_delete_federated_bundle_request::Mode;
use crate::pb::spire::api::server::bundle::v1::bundle_client::BundleClient as BundleApiClient;
use crate::pb::spire::api::server::bundle::v1::{
    BatchDeleteFederatedBundleRequest, BatchSetFederatedBundleRequest, GetBundleRequest,
    ListFederatedBundlesRequest,
};
use crate::transport;
use crate::types::{full_bundle_mask, Bundle, Status};

/// Number of federated bundles requested per page when listing.
pub const LIST_PAGE_SIZE: i32 = 100;

/// How registration entries that federate with a deleted trust domain are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Fails the deletion if any registration entry federates with the trust domain.
    Restrict,
    /// Deletes the registration entries that federate with the trust domain.
    Delete,
    /// Keeps the registration entries and only unlinks them from the trust domain.
    Dissociate,
}

impl From<DeleteMode> for Mode {
    fn from(mode: DeleteMode) -> Self {
        match mode {
            DeleteMode::Restrict => Mode::Restrict,
            DeleteMode::Delete => Mode::Delete,
            DeleteMode::Dissociate => Mode::Dissociate,
        }
    }
}

/// Outcome of one item of a batch set or batch delete call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    /// Trust domain name of the item the status refers to.
    pub trust_domain: String,
    /// gRPC code reported by the server for this item.
    pub code: tonic::Code,
    /// Developer-facing message reported by the server.
    pub message: String,
}

impl BatchStatus {
    /// Returns `true` if the item was applied.
    pub fn is_ok(&self) -> bool {
        self.code == tonic::Code::Ok
    }

    fn from_proto(trust_domain: String, status: Option<Status>) -> Self {
        match status {
            Some(status) => BatchStatus {
                trust_domain,
                code: tonic::Code::from_i32(status.code),
                message: status.message,
            },
            None => BatchStatus {
                trust_domain,
                code: tonic::Code::Unknown,
                message: "missing status in batch result".to_owned(),
            },
        }
    }
}

/// Client for the SPIRE Server `Bundle` API.
#[derive(Debug, Clone)]
pub struct BundleClient {
    client: BundleApiClient<tonic::transport::Channel>,
}

/// Constructors
impl BundleClient {
    /// Create a client by connecting to the given endpoint string.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - A bare socket path, a `unix:` URI or a `tcp:` URI.
    ///
    /// # Errors
    ///
    /// Returns [`GrpcClientError`] if the endpoint is invalid or the connection fails.
    pub async fn connect_to(endpoint: impl AsRef<str>) -> Result<Self, GrpcClientError> {
        let endpoint = Endpoint::parse(endpoint.as_ref())?;
        Self::connect(endpoint).await
    }

    /// Create a client by connecting to a parsed [`Endpoint`].
    ///
    /// # Errors
    ///
    /// Returns [`GrpcClientError`] if the connection fails or the endpoint is unsupported.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, GrpcClientError> {
        let channel = transport::connect(&endpoint).await?;
        Ok(Self::new(channel))
    }

    /// Create a client whose connection is established on first use.
    ///
    /// # Errors
    ///
    /// Returns [`GrpcClientError`] if the endpoint is unsupported on this platform.
    pub async fn connect_lazy(endpoint: Endpoint) -> Result<Self, GrpcClientError> {
        let channel = transport::connect_lazy(&endpoint).await?;
        Ok(Self::new(channel))
    }

    /// Creates a new [`BundleClient`] from an established gRPC channel.
    ///
    /// This constructor does not perform any network I/O.
    pub fn new(conn: tonic::transport::Channel) -> Self {
        BundleClient {
            client: BundleApiClient::new(conn),
        }
    }
}

impl BundleClient {
    /// Fetches the bundle of the server's own trust domain, with every field populated.
    ///
    /// # Errors
    ///
    /// Returns [`GrpcClientError`] if the gRPC call fails.
    pub async fn get_bundle(&self) -> Result<Bundle, GrpcClientError> {
        let request = GetBundleRequest {
            output_mask: Some(full_bundle_mask()),
        };

        Ok(self.client.clone().get_bundle(request).await?.into_inner())
    }

    /// Lists every federated bundle installed on the server.
    ///
    /// Pages of [`LIST_PAGE_SIZE`] bundles are requested until the server returns an
    /// empty `next_page_token`.
    ///
    /// # Errors
    ///
    /// Returns [`GrpcClientError`] if any page request fails.
    pub async fn list_federated_bundles(&self) -> Result<Vec<Bundle>, GrpcClientError> {
        let mut bundles = Vec::new();
        let mut page_token = String::new();

        loop {
            let request = ListFederatedBundlesRequest {
                output_mask: Some(full_bundle_mask()),
                page_size: LIST_PAGE_SIZE,
                page_token,
            };

            let response = self
                .client
                .clone()
                .list_federated_bundles(request)
                .await?
                .into_inner();

            bundles.extend(response.bundles);

            if response.next_page_token.is_empty() {
                return Ok(bundles);
            }
            page_token = response.next_page_token;
        }
    }

    /// Creates or replaces the given federated bundles.
    ///
    /// Returns one [`BatchStatus`] per bundle, in request order.
    ///
    /// # Errors
    ///
    /// Returns [`GrpcClientError`] if the call fails as a whole or the response does not
    /// carry one result per bundle.
    pub async fn batch_set_federated_bundle(
        &self,
        bundles: Vec<Bundle>,
    ) -> Result<Vec<BatchStatus>, GrpcClientError> {
        let trust_domains: Vec<String> = bundles.iter().map(|b| b.trust_domain.clone()).collect();
        let request = BatchSetFederatedBundleRequest {
            bundle: bundles,
            output_mask: None,
        };

        let results = self
            .client
            .clone()
            .batch_set_federated_bundle(request)
            .await?
            .into_inner()
            .results;

        ensure_one_result_per_item(trust_domains.len(), results.len())?;

        Ok(trust_domains
            .into_iter()
            .zip(results)
            .map(|(td, result)| BatchStatus::from_proto(td, result.status))
            .collect())
    }

    /// Deletes the federated bundles of the given trust domains.
    ///
    /// Returns one [`BatchStatus`] per trust domain, in request order.
    ///
    /// # Errors
    ///
    /// Returns [`GrpcClientError`] if the call fails as a whole or the response does not
    /// carry one result per trust domain.
    pub async fn batch_delete_federated_bundle(
        &self,
        trust_domains: Vec<String>,
        mode: DeleteMode,
    ) -> Result<Vec<BatchStatus>, GrpcClientError> {
        let expected = trust_domains.len();
        let request = BatchDeleteFederatedBundleRequest {
            trust_domains,
            mode: i32::from(Mode::from(mode)),
        };

        let results = self
            .client
            .clone()
            .batch_delete_federated_bundle(request)
            .await?
            .into_inner()
            .results;

        ensure_one_result_per_item(expected, results.len())?;

        Ok(results
            .into_iter()
            .map(|result| BatchStatus::from_proto(result.trust_domain, result.status))
            .collect())
    }
}

fn ensure_one_result_per_item(expected: usize, actual: usize) -> Result<(), GrpcClientError> {
    if expected == actual {
        Ok(())
    } else {
        Err(GrpcClientError::MismatchedResults { expected, actual })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pb::spire::api::server::bundle::v1::bundle_server::{
        Bundle as BundleService, BundleServer,
    };
    use crate::pb::spire::api::server::bundle::v1::{
        batch_delete_federated_bundle_response, batch_set_federated_bundle_response,
        BatchDeleteFederatedBundleResponse, BatchSetFederatedBundleResponse,
        ListFederatedBundlesResponse,
    };
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::UnixListener;
    use tokio_stream::wrappers::UnixListenerStream;
    use tonic::{Request, Response};

    #[derive(Debug, Default)]
    struct ServerState {
        federated: BTreeMap<String, Bundle>,
        page_sizes: Vec<i32>,
        delete_modes: Vec<i32>,
    }

    #[derive(Debug, Default, Clone)]
    struct FakeBundleServer {
        state: Arc<Mutex<ServerState>>,
    }

    #[tonic::async_trait]
    impl BundleService for FakeBundleServer {
        async fn get_bundle(
            &self,
            _request: Request<GetBundleRequest>,
        ) -> Result<Response<Bundle>, tonic::Status> {
            Ok(Response::new(bundle("local.test", 7)))
        }

        async fn list_federated_bundles(
            &self,
            request: Request<ListFederatedBundlesRequest>,
        ) -> Result<Response<ListFederatedBundlesResponse>, tonic::Status> {
            let request = request.into_inner();
            let mut state = self.state.lock().unwrap();
            state.page_sizes.push(request.page_size);

            let offset: usize = if request.page_token.is_empty() {
                0
            } else {
                request
                    .page_token
                    .parse()
                    .map_err(|_| tonic::Status::invalid_argument("bad page token"))?
            };
            let page_size = usize::try_from(request.page_size).unwrap();
            let bundles: Vec<Bundle> = state
                .federated
                .values()
                .skip(offset)
                .take(page_size)
                .cloned()
                .collect();
            let next = offset + bundles.len();
            let next_page_token = if next < state.federated.len() {
                next.to_string()
            } else {
                String::new()
            };

            Ok(Response::new(ListFederatedBundlesResponse {
                bundles,
                next_page_token,
            }))
        }

        async fn batch_set_federated_bundle(
            &self,
            request: Request<BatchSetFederatedBundleRequest>,
        ) -> Result<Response<BatchSetFederatedBundleResponse>, tonic::Status> {
            let mut state = self.state.lock().unwrap();
            let results = request
                .into_inner()
                .bundle
                .into_iter()
                .map(|b| {
                    if b.trust_domain == "bad.test" {
                        return batch_set_federated_bundle_response::Result {
                            status: Some(Status {
                                code: tonic::Code::InvalidArgument as i32,
                                message: "failed to convert bundle".to_owned(),
                            }),
                            bundle: None,
                        };
                    }
                    state.federated.insert(b.trust_domain.clone(), b.clone());
                    batch_set_federated_bundle_response::Result {
                        status: Some(Status {
                            code: 0,
                            message: "OK".to_owned(),
                        }),
                        bundle: Some(b),
                    }
                })
                .collect();

            Ok(Response::new(BatchSetFederatedBundleResponse { results }))
        }

        async fn batch_delete_federated_bundle(
            &self,
            request: Request<BatchDeleteFederatedBundleRequest>,
        ) -> Result<Response<BatchDeleteFederatedBundleResponse>, tonic::Status> {
            let request = request.into_inner();
            let mut state = self.state.lock().unwrap();
            state.delete_modes.push(request.mode);

            let results = request
                .trust_domains
                .into_iter()
                .map(|td| {
                    let code = if state.federated.remove(&td).is_some() {
                        tonic::Code::Ok
                    } else {
                        tonic::Code::NotFound
                    };
                    batch_delete_federated_bundle_response::Result {
                        status: Some(Status {
                            code: code as i32,
                            message: String::new(),
                        }),
                        trust_domain: td,
                    }
                })
                .collect();

            Ok(Response::new(BatchDeleteFederatedBundleResponse { results }))
        }
    }

    fn bundle(trust_domain: &str, sequence_number: u64) -> Bundle {
        Bundle {
            trust_domain: trust_domain.to_owned(),
            sequence_number,
            ..Bundle::default()
        }
    }

    async fn start_server(server: FakeBundleServer) -> (BundleClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(BundleServer::new(server))
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
                .unwrap();
        });

        let client = BundleClient::connect(Endpoint::Unix(socket)).await.unwrap();
        (client, dir)
    }

    #[tokio::test]
    async fn get_bundle_returns_local_bundle() {
        let (client, _dir) = start_server(FakeBundleServer::default()).await;

        let local = client.get_bundle().await.unwrap();
        assert_eq!(local.trust_domain, "local.test");
        assert_eq!(local.sequence_number, 7);
    }

    #[tokio::test]
    async fn list_federated_bundles_follows_page_tokens() {
        let server = FakeBundleServer::default();
        {
            let mut state = server.state.lock().unwrap();
            for i in 0..250 {
                let td = format!("td-{i:03}.test");
                state.federated.insert(td.clone(), bundle(&td, 1));
            }
        }
        let (client, _dir) = start_server(server.clone()).await;

        let bundles = client.list_federated_bundles().await.unwrap();

        assert_eq!(bundles.len(), 250);
        assert_eq!(bundles[0].trust_domain, "td-000.test");
        assert_eq!(bundles[249].trust_domain, "td-249.test");
        assert_eq!(
            server.state.lock().unwrap().page_sizes,
            vec![LIST_PAGE_SIZE; 3]
        );
    }

    #[tokio::test]
    async fn batch_set_reports_per_item_status_in_request_order() {
        let server = FakeBundleServer::default();
        let (client, _dir) = start_server(server.clone()).await;

        let statuses = client
            .batch_set_federated_bundle(vec![bundle("bad.test", 1), bundle("peer.test", 2)])
            .await
            .unwrap();

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].trust_domain, "bad.test");
        assert_eq!(statuses[0].code, tonic::Code::InvalidArgument);
        assert!(!statuses[0].is_ok());
        assert_eq!(statuses[1].trust_domain, "peer.test");
        assert!(statuses[1].is_ok());
        assert!(server
            .state
            .lock()
            .unwrap()
            .federated
            .contains_key("peer.test"));
    }

    #[tokio::test]
    async fn batch_delete_sends_requested_mode() {
        let server = FakeBundleServer::default();
        server
            .state
            .lock()
            .unwrap()
            .federated
            .insert("other.test".to_owned(), bundle("other.test", 1));
        let (client, _dir) = start_server(server.clone()).await;

        let statuses = client
            .batch_delete_federated_bundle(
                vec!["other.test".to_owned(), "missing.test".to_owned()],
                DeleteMode::Dissociate,
            )
            .await
            .unwrap();

        assert!(statuses[0].is_ok());
        assert_eq!(statuses[1].code, tonic::Code::NotFound);
        let state = server.state.lock().unwrap();
        assert_eq!(state.delete_modes, vec![Mode::Dissociate as i32]);
        assert!(state.federated.is_empty());
    }
}
