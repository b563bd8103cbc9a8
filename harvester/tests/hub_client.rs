#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use galadriel_harvester::hub::TokenStore;
use galadriel_harvester::{
    Bundle, ConsentStatus, Digest, Hub, HubClient, HubError, TrustDomainName,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;
use url::Url;
use uuid::Uuid;

const JOIN_TOKEN: &str = "abc";
const RELATIONSHIP_ID: &str = "7d0b4f0e-2c57-4c77-9a53-3b0a1ad64b3e";

#[derive(Default)]
struct Tokens {
    /// Token accepted by the data endpoints.
    current: Option<String>,
    /// Tokens that may be exchanged on `/jwt`.
    rotatable: HashSet<String>,
    issued: u32,
}

impl Tokens {
    fn issue(&mut self) -> String {
        self.issued += 1;
        let token = format!("T{}", self.issued);
        self.current = Some(token.clone());
        self.rotatable.insert(token.clone());
        token
    }
}

#[derive(Default)]
struct FakeHub {
    tokens: Mutex<Tokens>,
    deny_data: AtomicBool,
    seen_auth: Mutex<Vec<String>>,
    sync_requests: Mutex<Vec<Value>>,
    sync_response: Mutex<Value>,
    published: Mutex<Vec<Value>>,
    /// When set, `bundle-sync` holds authorized requests until notified.
    sync_gate: Mutex<Option<Arc<Notify>>>,
    sync_entered: Notify,
}

type Shared = Arc<FakeHub>;

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

impl FakeHub {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        let token = bearer(headers);
        self.seen_auth
            .lock()
            .unwrap()
            .push(token.clone().unwrap_or_default());
        let current = self.tokens.lock().unwrap().current.clone();
        if self.deny_data.load(Ordering::SeqCst) || token.is_none() || token != current {
            return Err(StatusCode::UNAUTHORIZED.into_response());
        }
        Ok(())
    }
}

async fn onboard(
    State(hub): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if query.get("join_token").map(String::as_str) != Some(JOIN_TOKEN) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let token = hub.tokens.lock().unwrap().issue();
    Json(json!({ "token": token })).into_response()
}

async fn jwt(State(hub): State<Shared>, headers: HeaderMap) -> Response {
    let mut tokens = hub.tokens.lock().unwrap();
    match bearer(&headers) {
        Some(token) if tokens.rotatable.contains(&token) => {
            Json(json!({ "token": tokens.issue() })).into_response()
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn bundle_sync(State(hub): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Err(response) = hub.authorize(&headers) {
        return response;
    }
    hub.sync_requests.lock().unwrap().push(body);
    let gate = hub.sync_gate.lock().unwrap().clone();
    if let Some(gate) = gate {
        hub.sync_entered.notify_one();
        gate.notified().await;
    }
    let response = hub.sync_response.lock().unwrap().clone();
    let response = if response.is_null() {
        json!({ "updates": {}, "state": {} })
    } else {
        response
    };
    Json(response).into_response()
}

async fn publish(State(hub): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Err(response) = hub.authorize(&headers) {
        return response;
    }
    hub.published.lock().unwrap().push(body);
    StatusCode::OK.into_response()
}

fn relationship(td_a_consent: &str) -> Value {
    json!({
        "id": RELATIONSHIP_ID,
        "trust_domain_a_name": "example.org",
        "trust_domain_b_name": "peer.test",
        "trust_domain_a_consent": td_a_consent,
        "trust_domain_b_consent": "approved",
        "created_at": "2024-01-01T00:00:00Z"
    })
}

async fn relationships(
    State(hub): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(response) = hub.authorize(&headers) {
        return response;
    }
    let all = vec![relationship("pending")];
    let filtered: Vec<Value> = match query.get("consentStatus") {
        Some(status) => all
            .into_iter()
            .filter(|r| r["trust_domain_a_consent"] == status.as_str())
            .collect(),
        None => all,
    };
    Json(Value::Array(filtered)).into_response()
}

async fn update_relationship(
    State(hub): State<Shared>,
    headers: HeaderMap,
    Path((_td, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = hub.authorize(&headers) {
        return response;
    }
    if id != RELATIONSHIP_ID {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(relationship(body["consent_status"].as_str().unwrap_or_default())).into_response()
}

struct Harness {
    hub: Shared,
    client: HubClient,
    data_dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let hub = Shared::default();
        let app = Router::new()
            .route("/trust-domain/{td}/onboard", post(onboard))
            .route("/trust-domain/{td}/jwt", get(jwt))
            .route("/trust-domain/{td}/bundle-sync", post(bundle_sync))
            .route("/trust-domain/{td}/bundle", put(publish))
            .route("/trust-domain/{td}/relationships", get(relationships))
            .route("/trust-domain/{td}/relationships/{id}", patch(update_relationship))
            .with_state(hub.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let data_dir = tempfile::tempdir().unwrap();
        let client = HubClient::new(
            reqwest::Client::new(),
            Url::parse(&format!("http://{addr}/")).unwrap(),
            TrustDomainName::new("example.org").unwrap(),
            TokenStore::open(data_dir.path()).unwrap(),
        );

        Self {
            hub,
            client,
            data_dir,
        }
    }

    async fn enrolled() -> Self {
        let harness = Self::start().await;
        harness.client.enroll(JOIN_TOKEN).await.unwrap();
        harness
    }

    fn token_on_disk(&self) -> String {
        std::fs::read_to_string(self.data_dir.path().join("jwt-token")).unwrap()
    }
}

#[tokio::test]
async fn enrollment_then_first_pull() {
    let h = Harness::start().await;
    assert!(!h.client.is_onboarded());

    h.client.enroll(JOIN_TOKEN).await.unwrap();

    assert_eq!(h.token_on_disk(), "T1");
    let mode = std::fs::metadata(h.data_dir.path().join("jwt-token"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    let (updates, state) = h.client.sync_bundles(&[]).await.unwrap();
    assert!(updates.is_empty());
    assert!(state.is_empty());
    assert_eq!(*h.hub.seen_auth.lock().unwrap(), vec!["T1".to_owned()]);
}

#[tokio::test]
async fn wrong_join_token_is_not_onboarded() {
    let h = Harness::start().await;

    let err = h.client.enroll("nope").await.unwrap_err();

    assert!(matches!(err, HubError::NotOnboarded(_)));
    assert!(!h.client.is_onboarded());
    assert_eq!(h.token_on_disk(), "");
}

#[tokio::test]
async fn sync_exchanges_base64_digests() {
    let h = Harness::enrolled().await;
    let peer_digest = Digest::of(b"B");
    *h.hub.sync_response.lock().unwrap() = json!({
        "updates": {
            "peer.test": {
                "trust_bundle": "B",
                "digest": peer_digest.to_base64(),
                "signature": STANDARD.encode(b"s1"),
                "signing_certificate": STANDARD.encode(b"c1"),
            }
        },
        "state": { "peer.test": peer_digest.to_base64() }
    });
    let local = Bundle::new(TrustDomainName::new("other.test").unwrap(), b"D".to_vec());

    let (updates, state) = h.client.sync_bundles(&[local.clone()]).await.unwrap();

    let sent = h.hub.sync_requests.lock().unwrap()[0].clone();
    assert_eq!(sent, json!({ "state": { "other.test": local.digest().to_base64() } }));

    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!(update.trust_domain().as_str(), "peer.test");
    assert_eq!(update.data(), b"B");
    assert_eq!(update.digest(), &peer_digest);
    assert_eq!(update.signature(), Some(&b"s1"[..]));
    assert_eq!(update.signing_certificate(), Some(&b"c1"[..]));

    let expected: BTreeMap<_, _> = [(TrustDomainName::new("peer.test").unwrap(), peer_digest)].into();
    assert_eq!(state, expected);
}

#[tokio::test]
async fn malformed_update_is_dropped_from_the_batch() {
    let h = Harness::enrolled().await;
    let good_digest = Digest::of(b"G");
    let bad_digest = Digest::of(b"B");
    *h.hub.sync_response.lock().unwrap() = json!({
        "updates": {
            "good.test": { "trust_bundle": "G", "digest": good_digest.to_base64() },
            "bad.test": { "trust_bundle": "B", "digest": Digest::of(b"other").to_base64() },
        },
        "state": {
            "good.test": good_digest.to_base64(),
            "bad.test": bad_digest.to_base64(),
        }
    });

    let (updates, state) = h.client.sync_bundles(&[]).await.unwrap();

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].trust_domain().as_str(), "good.test");
    assert_eq!(updates[0].data(), b"G");
    assert_eq!(state.len(), 2);
    assert_eq!(
        state.get(&TrustDomainName::new("bad.test").unwrap()),
        Some(&bad_digest)
    );
}

#[tokio::test]
async fn malformed_state_fails_the_sync() {
    let h = Harness::enrolled().await;
    *h.hub.sync_response.lock().unwrap() = json!({
        "updates": {},
        "state": { "peer.test": "not base64!" }
    });

    let err = h.client.sync_bundles(&[]).await.unwrap_err();

    assert!(matches!(err, HubError::Protocol(_)));
}

#[tokio::test]
async fn publish_sends_signed_bundle() {
    let h = Harness::enrolled().await;
    let bundle = Bundle::new(TrustDomainName::new("example.org").unwrap(), b"{\"keys\":[]}".to_vec())
        .with_signature(b"sig".to_vec(), b"chain".to_vec());

    h.client.publish_bundle(&bundle).await.unwrap();

    let published = h.hub.published.lock().unwrap()[0].clone();
    assert_eq!(
        published,
        json!({
            "trust_bundle": "{\"keys\":[]}",
            "digest": bundle.digest().to_base64(),
            "signature": STANDARD.encode(b"sig"),
            "signing_certificate": STANDARD.encode(b"chain"),
            "trust_domain": "example.org",
        })
    );
}

#[tokio::test]
async fn rejected_token_is_rotated_and_request_retried() {
    let h = Harness::enrolled().await;
    // T1 may still be exchanged but no longer opens the data endpoints.
    h.hub.tokens.lock().unwrap().current = None;

    h.client.sync_bundles(&[]).await.unwrap();

    assert_eq!(
        *h.hub.seen_auth.lock().unwrap(),
        vec!["T1".to_owned(), "T2".to_owned()]
    );
    assert_eq!(h.token_on_disk(), "T2");
}

#[tokio::test]
async fn second_rejection_is_an_auth_error() {
    let h = Harness::enrolled().await;
    h.hub.deny_data.store(true, Ordering::SeqCst);

    let err = h.client.sync_bundles(&[]).await.unwrap_err();

    assert!(matches!(err, HubError::Auth(status) if status == reqwest::StatusCode::UNAUTHORIZED));
    assert_eq!(h.hub.seen_auth.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn rotation_with_revoked_token_is_an_auth_error() {
    let h = Harness::enrolled().await;
    h.hub.tokens.lock().unwrap().rotatable.clear();

    let err = h.client.rotate_token().await.unwrap_err();

    assert!(matches!(err, HubError::Auth(_)));
    assert_eq!(h.token_on_disk(), "T1");
}

#[tokio::test]
async fn requests_after_rotation_use_new_token() {
    let h = Harness::enrolled().await;

    h.client.rotate_token().await.unwrap();
    h.client.sync_bundles(&[]).await.unwrap();

    assert_eq!(*h.hub.seen_auth.lock().unwrap(), vec!["T2".to_owned()]);
    assert_eq!(h.token_on_disk(), "T2");

    let reopened = TokenStore::open(h.data_dir.path()).unwrap();
    assert_eq!(reopened.current().unwrap().expose(), "T2");
}

#[tokio::test]
async fn rotation_during_in_flight_sync() {
    let h = Harness::enrolled().await;
    let gate = Arc::new(Notify::new());
    *h.hub.sync_gate.lock().unwrap() = Some(gate.clone());

    let in_flight = h.client.sync_bundles(&[]);
    let rotate = async {
        h.hub.sync_entered.notified().await;
        h.client.rotate_token().await.unwrap();
        assert_eq!(h.token_on_disk(), "T2");
        *h.hub.sync_gate.lock().unwrap() = None;
        gate.notify_one();
    };
    let (synced, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(in_flight, rotate)
    })
    .await
    .expect("sync did not complete");
    synced.unwrap();

    h.client.sync_bundles(&[]).await.unwrap();

    assert_eq!(
        *h.hub.seen_auth.lock().unwrap(),
        vec!["T1".to_owned(), "T2".to_owned()]
    );
    assert_eq!(h.token_on_disk(), "T2");
}

#[tokio::test]
async fn calls_without_token_are_not_onboarded() {
    let h = Harness::start().await;

    let err = h.client.sync_bundles(&[]).await.unwrap_err();

    assert!(matches!(err, HubError::NotOnboarded(_)));
    assert!(h.hub.seen_auth.lock().unwrap().is_empty());
}

#[tokio::test]
async fn relationships_are_listed_and_updated() {
    let h = Harness::enrolled().await;

    let pending = h
        .client
        .get_relationships(Some(ConsentStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].trust_domain_b_name, "peer.test");
    assert_eq!(pending[0].trust_domain_a_consent, ConsentStatus::Pending);

    let approved = h
        .client
        .get_relationships(Some(ConsentStatus::Approved))
        .await
        .unwrap();
    assert!(approved.is_empty());

    let id = Uuid::parse_str(RELATIONSHIP_ID).unwrap();
    let updated = h
        .client
        .update_relationship(id, ConsentStatus::Approved)
        .await
        .unwrap();
    assert_eq!(updated.id, id);
    assert_eq!(updated.trust_domain_a_consent, ConsentStatus::Approved);
}
