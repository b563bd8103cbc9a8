#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Rust bindings for the SPIRE Server bundle API, as defined in the
//! [SDK](https://github.com/spiffe/spire-api-sdk).
//!
//! The crate exposes a [`BundleClient`] that reads the local trust bundle of a
//! SPIRE Server and manages its federated bundles over the server's private
//! admin socket.
//!
//! ```no_run
//! use spire_api::{BundleClient, DeleteMode};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = BundleClient::connect_to("unix:///tmp/spire-server/private/api.sock").await?;
//!
//! let local = client.get_bundle().await?;
//! println!("local trust domain: {}", local.trust_domain);
//!
//! for bundle in client.list_federated_bundles().await? {
//!     println!("federated with: {}", bundle.trust_domain);
//! }
//!
//! client
//!     .batch_delete_federated_bundle(vec!["old.test".to_owned()], DeleteMode::Dissociate)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod pb;

pub mod endpoint;
pub mod error;
pub mod server;
pub mod transport;
pub mod types;

// Core spire-api types re-exported for simplified access.
pub use endpoint::{Endpoint, EndpointError};
pub use error::GrpcClientError;
pub use server::bundle::{BatchStatus, BundleClient, DeleteMode, LIST_PAGE_SIZE};
