#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Bundle federation engine of the Galadriel harvester.
//!
//! The harvester runs next to a SPIRE Server and keeps its federated trust
//! bundles in sync with the Galadriel hub:
//!
//! - the [`FederatedSynchronizer`] pulls the bundles of federated trust domains
//!   from the hub, verifies their signatures and installs them in the SPIRE
//!   Server, removing those the hub no longer lists;
//! - the [`LocalSynchronizer`] signs the SPIRE Server's own bundle and
//!   publishes it whenever it changes;
//! - the [`TokenRotator`] keeps the hub bearer token fresh.
//!
//! An [`Engine`] runs the three under a single cancellation scope.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use galadriel_harvester::clock::SystemClock;
//! use galadriel_harvester::{Config, Engine, HubClient, SpireServer};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(std::path::Path::new("harvester.toml"))?;
//! let clock = Arc::new(SystemClock);
//!
//! let hub = HubClient::connect(&config.hub_client_config()).await?;
//! let spire = SpireServer::new(&config.harvester.spire_socket_path).await?;
//!
//! let engine = Engine::new(
//!     config.harvester.trust_domain.clone(),
//!     Arc::new(spire),
//!     Arc::new(hub),
//!     config.integrity.build_signer(clock.clone())?,
//!     config.integrity.build_verifier(clock)?,
//!     config.intervals(),
//! );
//! engine.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod cert;
pub mod clock;
pub mod config;
pub mod engine;
pub mod hub;
pub mod integrity;
pub mod spire;
pub mod sync;
pub mod trust_domain;

pub use bundle::{Bundle, BundleError, Digest, FederatedBundleState};
pub use config::Config;
pub use engine::{Engine, EngineError, Intervals};
pub use hub::{ConsentStatus, Hub, HubClient, HubClientConfig, HubError, Relationship};
pub use integrity::{BundleSigner, BundleVerifier, IntegrityConfig};
pub use spire::{IdentityServer, SpireServer, UpstreamError};
pub use sync::{FederatedSynchronizer, LocalSynchronizer, TaskError, TokenRotator};
pub use trust_domain::{TrustDomainError, TrustDomainName};
