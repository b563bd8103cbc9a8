//! JSON bodies of the hub's harvester API.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of the onboard and token rotation responses.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub(crate) token: String,
}

/// Body of `POST /trust-domain/{td}/bundle-sync`.
#[derive(Debug, Serialize)]
pub(crate) struct SyncRequest {
    pub(crate) state: BTreeMap<String, String>,
}

/// Response of `POST /trust-domain/{td}/bundle-sync`.
#[derive(Debug, Deserialize)]
pub(crate) struct SyncResponse {
    #[serde(default)]
    pub(crate) updates: BTreeMap<String, BundleMessage>,
    #[serde(default)]
    pub(crate) state: BTreeMap<String, String>,
}

/// A bundle as it travels between harvester and hub.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BundleMessage {
    pub(crate) trust_bundle: String,
    pub(crate) digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) signing_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) trust_domain: Option<String>,
}

/// Body of `PATCH /trust-domain/{td}/relationships/{id}`.
#[derive(Debug, Serialize)]
pub(crate) struct ConsentUpdate {
    pub(crate) consent_status: ConsentStatus,
}

/// Consent a trust domain has given to a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    /// The trust domain federates with its peer.
    Approved,
    /// The trust domain refused the relationship.
    Denied,
    /// The trust domain has not decided yet.
    Pending,
}

impl ConsentStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentStatus::Approved => "approved",
            ConsentStatus::Denied => "denied",
            ConsentStatus::Pending => "pending",
        }
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A federation relationship between two trust domains, as stored by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship identifier.
    pub id: Uuid,
    /// Name of the first trust domain.
    pub trust_domain_a_name: String,
    /// Name of the second trust domain.
    pub trust_domain_b_name: String,
    /// Consent of the first trust domain.
    pub trust_domain_a_consent: ConsentStatus,
    /// Consent of the second trust domain.
    pub trust_domain_b_consent: ConsentStatus,
    /// Creation time as reported by the hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Last update time as reported by the hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}
