//! Harvester configuration file.
//!
//! The file is TOML with three tables: `[harvester]`, `[integrity]` and
//! `[logging]`. Durations are whole seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::engine::{
    Intervals, DEFAULT_FEDERATED_BUNDLES_POLL_INTERVAL, DEFAULT_SPIRE_BUNDLE_POLL_INTERVAL,
    DEFAULT_TOKEN_ROTATION_INTERVAL,
};
use crate::hub::HubClientConfig;
use crate::integrity::{IntegrityConfig, SignerConfig, VerifierConfig};
use crate::trust_domain::TrustDomainName;

/// Default identity server endpoint.
pub const DEFAULT_SPIRE_SOCKET_PATH: &str = "unix:///tmp/spire-server/private/api.sock";

/// Errors loading the configuration file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed reading config file {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unknown or missing keys.
    #[error("failed parsing config file {path}: {source}")]
    Parse {
        /// Path of the file.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `[harvester]`
    pub harvester: HarvesterConfig,
    /// `[integrity]`
    pub integrity: IntegrityConfig,
    /// `[logging]`
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[harvester]` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarvesterConfig {
    /// Local trust domain.
    pub trust_domain: TrustDomainName,
    /// Hub `host:port`.
    pub server_address: String,
    /// PEM file with the roots trusted for the hub's TLS certificate.
    pub server_trust_bundle_path: PathBuf,
    /// Directory holding the bearer token.
    pub data_dir: PathBuf,
    /// Identity server endpoint.
    #[serde(default = "default_spire_socket_path")]
    pub spire_socket_path: String,
    /// Federated bundle pull period, in seconds.
    #[serde(default = "default_federated_bundles_poll_interval_secs")]
    pub federated_bundles_poll_interval_secs: u64,
    /// Local bundle publication period, in seconds.
    #[serde(default = "default_spire_bundle_poll_interval_secs")]
    pub spire_bundle_poll_interval_secs: u64,
    /// Bearer token rotation period, in seconds.
    #[serde(default = "default_token_rotation_interval_secs")]
    pub token_rotation_interval_secs: u64,
    /// One-time enrollment token.
    #[serde(default)]
    pub join_token: Option<String>,
    /// Accepts tokens returned quoted or JSON-encoded twice.
    #[serde(default)]
    pub accept_legacy_token_format: bool,
}

fn default_spire_socket_path() -> String {
    DEFAULT_SPIRE_SOCKET_PATH.to_owned()
}

fn default_federated_bundles_poll_interval_secs() -> u64 {
    DEFAULT_FEDERATED_BUNDLES_POLL_INTERVAL.as_secs()
}

fn default_spire_bundle_poll_interval_secs() -> u64 {
    DEFAULT_SPIRE_BUNDLE_POLL_INTERVAL.as_secs()
}

fn default_token_rotation_interval_secs() -> u64 {
    DEFAULT_TOKEN_ROTATION_INTERVAL.as_secs()
}

/// `[logging]` configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `galadriel_harvester=debug`.
    pub level: String,
    /// Emits JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// a value is out of range.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.harvester;
        for (key, value) in [
            ("federated_bundles_poll_interval_secs", h.federated_bundles_poll_interval_secs),
            ("spire_bundle_poll_interval_secs", h.spire_bundle_poll_interval_secs),
            ("token_rotation_interval_secs", h.token_rotation_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
            }
        }
        if h.server_address.is_empty() {
            return Err(ConfigError::Invalid("server_address must not be empty".to_owned()));
        }

        let integrity = &self.integrity;
        if let SignerConfig::Disk(signer) = &integrity.signer {
            if signer.signing_cert_ttl_secs == 0 {
                return Err(ConfigError::Invalid(
                    "signing_cert_ttl_secs must be greater than zero".to_owned(),
                ));
            }
        }
        if !integrity.allow_noop {
            if matches!(integrity.signer, SignerConfig::Noop) {
                return Err(ConfigError::Invalid(
                    "signer \"noop\" requires integrity.allow_noop = true".to_owned(),
                ));
            }
            if matches!(integrity.verifier, VerifierConfig::Noop) {
                return Err(ConfigError::Invalid(
                    "verifier \"noop\" requires integrity.allow_noop = true".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Loop periods.
    pub fn intervals(&self) -> Intervals {
        let h = &self.harvester;
        Intervals {
            federated_bundles: Duration::from_secs(h.federated_bundles_poll_interval_secs),
            spire_bundle: Duration::from_secs(h.spire_bundle_poll_interval_secs),
            token_rotation: Duration::from_secs(h.token_rotation_interval_secs),
        }
    }

    /// Settings for [`HubClient::connect`](crate::hub::HubClient::connect).
    pub fn hub_client_config(&self) -> HubClientConfig {
        let h = &self.harvester;
        HubClientConfig {
            trust_domain: h.trust_domain.clone(),
            server_address: h.server_address.clone(),
            server_trust_bundle_path: h.server_trust_bundle_path.clone(),
            data_dir: h.data_dir.clone(),
            accept_legacy_token_format: h.accept_legacy_token_format,
        }
    }
}
