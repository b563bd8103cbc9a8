//! gRPC channel connector for SPIRE Server endpoints.
//!
//! Builds a `tonic::transport::Channel` from a parsed [`Endpoint`].
//!
//! Supported transports:
//! - `unix:///path` (Unix domain sockets; Unix platforms only)
//! - `tcp://1.2.3.4:port`

use std::net::IpAddr;
use std::path::Path;

use tonic::transport::{Channel, Endpoint as TonicEndpoint};

use crate::endpoint::Endpoint;
use crate::error::GrpcClientError;

#[cfg(unix)]
const TONIC_DUMMY_URI: &str = "http://[::]:50051";

/// Connect to a SPIRE Server endpoint and return a `tonic` gRPC channel.
///
/// ## Errors
///
/// Returns [`GrpcClientError`] if the endpoint transport is unsupported on the
/// current platform or the underlying connection fails.
pub async fn connect(endpoint: &Endpoint) -> Result<Channel, GrpcClientError> {
    match endpoint {
        Endpoint::Unix(path) => connect_unix(path, false).await,
        Endpoint::Tcp { host, port } => Ok(tcp_endpoint(*host, *port)?.connect().await?),
    }
}

/// Build a channel that connects on first use and reconnects transparently.
///
/// The SPIRE Server may start after the caller; a lazy channel defers the
/// failure to the first request instead of failing at construction.
///
/// ## Errors
///
/// Returns [`GrpcClientError`] if the endpoint transport is unsupported on the
/// current platform or the tonic endpoint could not be constructed.
pub async fn connect_lazy(endpoint: &Endpoint) -> Result<Channel, GrpcClientError> {
    match endpoint {
        Endpoint::Unix(path) => connect_unix(path, true).await,
        Endpoint::Tcp { host, port } => Ok(tcp_endpoint(*host, *port)?.connect_lazy()),
    }
}

fn tcp_endpoint(host: IpAddr, port: u16) -> Result<TonicEndpoint, GrpcClientError> {
    let uri = match host {
        IpAddr::V4(v4) => format!("http://{v4}:{port}"),
        IpAddr::V6(v6) => format!("http://[{v6}]:{port}"),
    };
    Ok(TonicEndpoint::try_from(uri)?)
}

async fn connect_unix(path: &Path, lazy: bool) -> Result<Channel, GrpcClientError> {
    #[cfg(not(unix))]
    {
        let _ = (path, lazy);
        return Err(GrpcClientError::UnsupportedEndpointTransport { scheme: "unix" });
    }

    #[cfg(unix)]
    {
        use std::path::PathBuf;
        use std::sync::Arc;

        use hyper_util::rt::TokioIo;
        use tokio::net::UnixStream;
        use tonic::transport::Uri;
        use tower::service_fn;

        let path: Arc<PathBuf> = Arc::new(path.to_path_buf());
        let connector = service_fn(move |_: Uri| {
            let path = Arc::clone(&path);
            async move {
                let stream = UnixStream::connect(path.as_path()).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        });

        let endpoint = TonicEndpoint::try_from(TONIC_DUMMY_URI)?;
        if lazy {
            Ok(endpoint.connect_with_connector_lazy(connector))
        } else {
            Ok(endpoint.connect_with_connector(connector).await?)
        }
    }
}
