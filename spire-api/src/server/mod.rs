//! Server API
//!
//! Consists of the following APIs:
//! - `bundle`: For reading the local bundle and managing federated bundles.
//!
//! # Note
//! Access these APIs via the SPIRE Server private socket (`socket_path` in the
//! [server configuration file](https://spiffe.io/docs/latest/deploying/spire_server/#server-configuration-file)).
pub mod bundle;
