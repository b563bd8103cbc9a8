//! Error types for SPIRE Server API client operations.

use crate::endpoint::EndpointError;
use thiserror::Error;

/// Errors produced by the SPIRE Server API clients.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GrpcClientError {
    /// Failed to parse the SPIRE Server API endpoint string.
    #[error("invalid SPIRE Server endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    /// The endpoint transport is unsupported on the current platform.
    #[error("unsupported endpoint transport: {scheme}")]
    UnsupportedEndpointTransport {
        /// The unsupported transport scheme.
        scheme: &'static str,
    },

    /// gRPC status returned by the SPIRE Server.
    #[error("gRPC status: {0}")]
    Grpc(#[source] tonic::Status),

    /// Transport error while connecting to the SPIRE Server.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A batch response did not carry one result per requested item.
    #[error("batch response carried {actual} results for {expected} requested items")]
    MismatchedResults {
        /// Number of items in the request.
        expected: usize,
        /// Number of results in the response.
        actual: usize,
    },
}

impl From<tonic::Status> for GrpcClientError {
    fn from(status: tonic::Status) -> Self {
        GrpcClientError::Grpc(status)
    }
}
