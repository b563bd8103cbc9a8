//! SPIRE Server API endpoint parsing and validation.
//!
//! The SPIRE Server exposes its administrative APIs on a private UNIX domain
//! socket (`/tmp/spire-server/private/api.sock` by default). Operators usually
//! configure the bare socket path, so this module accepts that form alongside
//! the `unix:` and `tcp:` URI forms.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

const TCP_SCHEME: &str = "tcp";
const UNIX_SCHEME: &str = "unix";

/// Default path of the SPIRE Server private API socket.
pub const DEFAULT_SERVER_SOCKET_PATH: &str = "/tmp/spire-server/private/api.sock";

/// Parsed SPIRE Server API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// UNIX domain socket endpoint (POSIX systems).
    Unix(PathBuf),

    /// TCP endpoint (host must be an IP address).
    Tcp {
        /// IP address of the endpoint.
        host: IpAddr,
        /// TCP port of the endpoint.
        port: u16,
    },
}

/// Errors returned by [`Endpoint::parse`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    /// The input is empty.
    #[error("endpoint cannot be empty")]
    Empty,

    /// The input could not be parsed as a valid URI.
    #[error("endpoint is not a valid URI")]
    Parse(#[from] url::ParseError),

    /// The URI scheme is not supported.
    #[error("endpoint URI scheme must be unix: or tcp:")]
    InvalidScheme,

    /// Query values, fragments and user info are not allowed.
    #[error("endpoint URI must not include user info, query values or a fragment")]
    UnexpectedComponent,

    /// UNIX endpoints must include an absolute path and no authority.
    #[error("unix: endpoint URI must include an absolute path and no authority")]
    InvalidUnixPath,

    /// TCP endpoints must use an IP address (not a hostname).
    #[error("tcp: endpoint URI host must be an IP address")]
    TcpHostNotIp,

    /// TCP endpoints must include a port.
    #[error("tcp: endpoint URI must include a port")]
    TcpMissingPort,

    /// TCP endpoints must not include a non-empty path.
    #[error("tcp: endpoint URI must not include a path")]
    TcpUnexpectedPath,
}

impl Endpoint {
    /// Parse and validate a SPIRE Server API endpoint.
    ///
    /// ## Accepted formats
    ///
    /// - `/path/to/socket` (bare absolute path)
    /// - `unix:///path/to/socket`
    /// - `unix:/path/to/socket`
    /// - `tcp://1.2.3.4:8081`
    ///
    /// ## Errors
    ///
    /// Returns an [`EndpointError`] if the input is empty, is not a valid URI,
    /// uses an unsupported scheme or does not satisfy the rules of its scheme.
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EndpointError::Empty);
        }

        if input.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(input)));
        }

        let url = Url::parse(&normalize_endpoint_uri(input))?;

        if !url.username().is_empty()
            || url.password().is_some()
            || url.query().is_some()
            || url.fragment().is_some()
        {
            return Err(EndpointError::UnexpectedComponent);
        }

        match url.scheme() {
            UNIX_SCHEME => {
                let path = url.path();
                if url.host_str().is_some() || !path.starts_with('/') || path == "/" {
                    return Err(EndpointError::InvalidUnixPath);
                }
                Ok(Self::Unix(PathBuf::from(path)))
            }

            TCP_SCHEME => {
                let host = match url.host() {
                    Some(url::Host::Ipv4(ipv4)) => IpAddr::V4(ipv4),
                    Some(url::Host::Ipv6(ipv6)) => IpAddr::V6(ipv6),
                    Some(url::Host::Domain(domain)) => {
                        IpAddr::from_str(domain).map_err(|_| EndpointError::TcpHostNotIp)?
                    }
                    None => return Err(EndpointError::TcpHostNotIp),
                };
                let port = url.port().ok_or(EndpointError::TcpMissingPort)?;

                let path = url.path();
                if !path.is_empty() && path != "/" {
                    return Err(EndpointError::TcpUnexpectedPath);
                }

                Ok(Self::Tcp { host, port })
            }

            _ => Err(EndpointError::InvalidScheme),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Unix(PathBuf::from(DEFAULT_SERVER_SOCKET_PATH))
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn normalize_endpoint_uri(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("unix:/") {
        if !rest.starts_with('/') {
            return format!("unix:///{rest}");
        }
    }

    if let Some(rest) = input.strip_prefix("tcp:") {
        if !rest.starts_with("//") {
            return format!("tcp://{rest}");
        }
    }

    input.to_owned()
}
