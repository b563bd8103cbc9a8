//! Client for the Galadriel hub's harvester API.
//!
//! The client enrolls the trust domain with a one-time join token, keeps the
//! resulting bearer token fresh, exchanges digest-keyed bundle state with the
//! hub and publishes the local bundle. Every request except enrollment carries
//! `Authorization: Bearer <token>`. A 401 or 403 answer triggers one token
//! rotation and one retry before the call fails with [`HubError::Auth`].

mod token;
mod wire;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

pub use token::{BearerToken, TokenStore, TOKEN_FILE_NAME};
pub use wire::{ConsentStatus, Relationship};

use crate::bundle::{Bundle, BundleError, Digest, FederatedBundleState};
use crate::trust_domain::TrustDomainName;
use wire::{BundleMessage, ConsentUpdate, SyncRequest, SyncResponse, TokenResponse};

/// Deadline applied to each hub call.
pub const HUB_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// TLS server name the hub certificate is issued for.
pub const HUB_SERVER_NAME: &str = "galadriel-server";

const ERROR_BODY_LIMIT: usize = 256;

/// Failure of a hub call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HubError {
    /// No bearer token is available, or enrollment was refused.
    #[error("trust domain is not onboarded: {0}")]
    NotOnboarded(String),

    /// The hub could not be reached or the connection failed.
    #[error("hub request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The hub answered with an unexpected status or a malformed body.
    #[error("unexpected hub response: {0}")]
    Protocol(String),

    /// The hub rejected the bearer token even after a rotation.
    #[error("hub rejected the bearer token with status {0}")]
    Auth(StatusCode),

    /// A new bearer token could not be persisted.
    #[error("failed persisting bearer token: {0}")]
    TokenPersistence(#[source] std::io::Error),

    /// The client could not be set up.
    #[error("invalid hub client configuration: {0}")]
    Config(String),
}

impl From<BundleError> for HubError {
    fn from(e: BundleError) -> Self {
        HubError::Protocol(e.to_string())
    }
}

/// Hub operations used by the synchronizers and the token rotator.
#[async_trait]
pub trait Hub: Send + Sync {
    /// Sends the digests of the locally installed peer bundles and returns
    /// the changed bundles together with the authoritative peer state.
    async fn sync_bundles(
        &self,
        local_view: &[Bundle],
    ) -> Result<(Vec<Bundle>, FederatedBundleState), HubError>;

    /// Publishes the local trust domain's bundle.
    async fn publish_bundle(&self, bundle: &Bundle) -> Result<(), HubError>;

    /// Exchanges the current bearer token for a fresh one.
    async fn rotate_token(&self) -> Result<(), HubError>;
}

/// Settings needed to reach the hub.
#[derive(Debug, Clone)]
pub struct HubClientConfig {
    /// Local trust domain, used as path parameter.
    pub trust_domain: TrustDomainName,
    /// Hub `host:port`.
    pub server_address: String,
    /// PEM file with the roots the hub certificate must chain to.
    pub server_trust_bundle_path: PathBuf,
    /// Directory holding the persisted bearer token.
    pub data_dir: PathBuf,
    /// Accepts tokens wrapped in quotes or in a JSON string body.
    pub accept_legacy_token_format: bool,
}

/// HTTPS client for the hub.
#[derive(Debug)]
pub struct HubClient {
    http: reqwest::Client,
    base_url: Url,
    trust_domain: TrustDomainName,
    tokens: TokenStore,
    accept_legacy_token_format: bool,
}

impl HubClient {
    /// Builds a client that trusts only the configured roots and pins the
    /// hub's server name.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] if the trust bundle or data directory are
    /// unusable, or the hub address does not resolve.
    pub async fn connect(config: &HubClientConfig) -> Result<Self, HubError> {
        let pem = std::fs::read(&config.server_trust_bundle_path).map_err(|e| {
            HubError::Config(format!(
                "reading {}: {e}",
                config.server_trust_bundle_path.display()
            ))
        })?;
        let roots = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
            HubError::Config(format!(
                "parsing {}: {e}",
                config.server_trust_bundle_path.display()
            ))
        })?;
        if roots.is_empty() {
            return Err(HubError::Config(format!(
                "no certificates in {}",
                config.server_trust_bundle_path.display()
            )));
        }

        let addr = tokio::net::lookup_host(config.server_address.as_str())
            .await
            .map_err(|e| HubError::Config(format!("resolving {}: {e}", config.server_address)))?
            .next()
            .ok_or_else(|| {
                HubError::Config(format!("{} did not resolve", config.server_address))
            })?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .resolve(HUB_SERVER_NAME, addr)
            .timeout(HUB_CALL_TIMEOUT);
        for root in roots {
            builder = builder.add_root_certificate(root);
        }
        let http = builder.build()?;

        let base_url = Url::parse(&format!("https://{HUB_SERVER_NAME}:{}/", addr.port()))
            .map_err(|e| HubError::Config(e.to_string()))?;

        let tokens = open_token_store(&config.data_dir)?;
        Ok(Self::new(http, base_url, config.trust_domain.clone(), tokens)
            .with_legacy_token_format(config.accept_legacy_token_format))
    }

    /// Creates a client over an existing HTTP client.
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        trust_domain: TrustDomainName,
        tokens: TokenStore,
    ) -> Self {
        Self {
            http,
            base_url,
            trust_domain,
            tokens,
            accept_legacy_token_format: false,
        }
    }

    /// Sets whether quoted or JSON-string-wrapped tokens are accepted.
    #[must_use]
    pub fn with_legacy_token_format(mut self, accept: bool) -> Self {
        self.accept_legacy_token_format = accept;
        self
    }

    /// Returns `true` if a bearer token is available.
    pub fn is_onboarded(&self) -> bool {
        self.tokens.current().is_some()
    }

    /// The token store backing this client.
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Exchanges a one-time join token for the first bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotOnboarded`] if the hub refuses the join token or
    /// answers without a token.
    pub async fn enroll(&self, join_token: &str) -> Result<(), HubError> {
        let response = self
            .http
            .post(self.url("onboard")?)
            .query(&[("join_token", join_token)])
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(HubError::NotOnboarded(format!(
                "enrollment refused with status {}",
                response.status()
            )));
        }

        let token = self.parse_token(&response.bytes().await?)?;
        self.store_token(token).await?;
        info!(trust_domain = %self.trust_domain, "Enrolled with the hub");
        Ok(())
    }

    /// Lists the relationships of the local trust domain, optionally
    /// filtered by consent status.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] if the call fails.
    pub async fn get_relationships(
        &self,
        status: Option<ConsentStatus>,
    ) -> Result<Vec<Relationship>, HubError> {
        let url = self.url("relationships")?;
        let response = self
            .send_authorized(|http| {
                let request = http.get(url.clone());
                match status {
                    Some(status) => request.query(&[("consentStatus", status.as_str())]),
                    None => request,
                }
            })
            .await?;
        json_body(expect_ok(response).await?).await
    }

    /// Sets the local trust domain's consent on a relationship.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] if the call fails.
    pub async fn update_relationship(
        &self,
        id: Uuid,
        consent_status: ConsentStatus,
    ) -> Result<Relationship, HubError> {
        let url = self.url(&format!("relationships/{id}"))?;
        let body = ConsentUpdate { consent_status };
        let response = self
            .send_authorized(|http| http.request(Method::PATCH, url.clone()).json(&body))
            .await?;
        json_body(expect_ok(response).await?).await
    }

    fn url(&self, suffix: &str) -> Result<Url, HubError> {
        self.base_url
            .join(&format!("trust-domain/{}/{suffix}", self.trust_domain))
            .map_err(|e| HubError::Config(e.to_string()))
    }

    async fn store_token(&self, token: BearerToken) -> Result<(), HubError> {
        self.tokens
            .replace(token)
            .await
            .map_err(HubError::TokenPersistence)
    }

    fn parse_token(&self, body: &[u8]) -> Result<BearerToken, HubError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| HubError::Protocol(format!("malformed token response: {e}")))?;

        let response: TokenResponse = match value {
            serde_json::Value::String(inner) if self.accept_legacy_token_format => {
                serde_json::from_str(&inner)
                    .map_err(|e| HubError::Protocol(format!("malformed token response: {e}")))?
            }
            serde_json::Value::String(_) => {
                return Err(HubError::Protocol(
                    "token response is a JSON string, not an object".to_owned(),
                ))
            }
            value => serde_json::from_value(value)
                .map_err(|e| HubError::Protocol(format!("malformed token response: {e}")))?,
        };

        let mut token = response.token.trim();
        if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
            if !self.accept_legacy_token_format {
                return Err(HubError::Protocol("token is wrapped in quotes".to_owned()));
            }
            token = token[1..token.len() - 1].trim();
        }

        BearerToken::new(token)
            .ok_or_else(|| HubError::NotOnboarded("hub answered with an empty token".to_owned()))
    }

    async fn send_with_token<F>(&self, build: &F) -> Result<Response, HubError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        // The header reflects whichever token is current when the request is assembled.
        let token = self
            .tokens
            .current()
            .ok_or_else(|| HubError::NotOnboarded("no bearer token".to_owned()))?;
        Ok(build(&self.http)
            .bearer_auth(token.expose())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?)
    }

    async fn send_authorized<F>(&self, build: F) -> Result<Response, HubError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let response = self.send_with_token(&build).await?;
        if !is_auth_failure(response.status()) {
            return Ok(response);
        }

        debug!(status = %response.status(), "Hub rejected bearer token; rotating once");
        self.rotate_token().await?;

        let response = self.send_with_token(&build).await?;
        if is_auth_failure(response.status()) {
            return Err(HubError::Auth(response.status()));
        }
        Ok(response)
    }

    fn decode_update(td: &str, message: BundleMessage) -> Result<Bundle, HubError> {
        let trust_domain = parse_trust_domain(td)?;
        let digest = Digest::from_base64(&message.digest)?;
        let signature = decode_optional(message.signature.as_deref(), "signature")?;
        let signing_certificate =
            decode_optional(message.signing_certificate.as_deref(), "signing_certificate")?;
        Ok(Bundle::from_parts(
            trust_domain,
            message.trust_bundle.into_bytes(),
            digest,
            signature,
            signing_certificate,
        )?)
    }
}

#[async_trait]
impl Hub for HubClient {
    async fn sync_bundles(
        &self,
        local_view: &[Bundle],
    ) -> Result<(Vec<Bundle>, FederatedBundleState), HubError> {
        let request = SyncRequest {
            state: local_view
                .iter()
                .map(|b| (b.trust_domain().to_string(), b.digest().to_base64()))
                .collect(),
        };
        let url = self.url("bundle-sync")?;
        let response = self
            .send_authorized(|http| http.post(url.clone()).json(&request))
            .await?;
        let response: SyncResponse = json_body(expect_ok(response).await?).await?;

        let updates = decode_updates(response.updates);

        let state = response
            .state
            .iter()
            .map(|(td, digest)| -> Result<_, HubError> {
                Ok((parse_trust_domain(td)?, Digest::from_base64(digest)?))
            })
            .collect::<Result<FederatedBundleState, HubError>>()?;

        debug!(updates = updates.len(), peers = state.len(), "Bundle sync completed");
        Ok((updates, state))
    }

    async fn publish_bundle(&self, bundle: &Bundle) -> Result<(), HubError> {
        let trust_bundle = String::from_utf8(bundle.data().to_vec())
            .map_err(|_| HubError::Protocol("bundle data is not UTF-8".to_owned()))?;
        let body = BundleMessage {
            trust_bundle,
            digest: bundle.digest().to_base64(),
            signature: bundle.signature().map(|s| STANDARD.encode(s)),
            signing_certificate: bundle.signing_certificate().map(|c| STANDARD.encode(c)),
            trust_domain: Some(bundle.trust_domain().to_string()),
        };
        let url = self.url("bundle")?;
        let response = self
            .send_authorized(|http| http.put(url.clone()).json(&body))
            .await?;
        expect_ok(response).await?;
        Ok(())
    }

    async fn rotate_token(&self) -> Result<(), HubError> {
        let url = self.url("jwt")?;
        let response = self.send_with_token(&|http: &reqwest::Client| http.get(url.clone())).await?;
        if is_auth_failure(response.status()) {
            return Err(HubError::Auth(response.status()));
        }
        let response = expect_ok(response).await?;
        let token = self.parse_token(&response.bytes().await?)?;
        self.store_token(token).await?;
        info!(trust_domain = %self.trust_domain, "Rotated hub bearer token");
        Ok(())
    }
}

// A malformed peer update only drops that peer's entry.
fn decode_updates(updates: impl IntoIterator<Item = (String, BundleMessage)>) -> Vec<Bundle> {
    updates
        .into_iter()
        .filter_map(|(td, message)| match HubClient::decode_update(&td, message) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                error!(trust_domain = %td, error = %e, "Discarding malformed bundle update");
                None
            }
        })
        .collect()
}

fn open_token_store(data_dir: &Path) -> Result<TokenStore, HubError> {
    TokenStore::open(data_dir).map_err(|e| {
        HubError::Config(format!(
            "opening token file in {}: {e}",
            data_dir.display()
        ))
    })
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

async fn expect_ok(response: Response) -> Result<Response, HubError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let url = response.url().path().to_owned();
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    Err(HubError::Protocol(format!("{url} returned {status}: {}", body.trim())))
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, HubError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| HubError::Protocol(format!("malformed body: {e}")))
}

fn parse_trust_domain(td: &str) -> Result<TrustDomainName, HubError> {
    TrustDomainName::new(td).map_err(|e| HubError::Protocol(format!("trust domain {td:?}: {e}")))
}

fn decode_optional(value: Option<&str>, field: &str) -> Result<Option<Vec<u8>>, HubError> {
    match value {
        None | Some("") => Ok(None),
        Some(encoded) => STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| HubError::Protocol(format!("{field} is not valid base64: {e}"))),
    }
}
