//! Trust domain names as exchanged with the hub and the SPIRE Server.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const MAX_TRUST_DOMAIN_LENGTH: usize = 255;
const VALID_TRUST_DOMAIN_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._";

/// Name of a trust domain, e.g. `example.org`.
///
/// Names are opaque and compared case-sensitively. They are limited to ASCII
/// letters, digits, `-`, `.` and `_`, at most 255 bytes long, and may not
/// consist of dots only. A valid name is therefore always a single URL path
/// segment.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrustDomainName(String);

/// An error that can arise parsing a [`TrustDomainName`].
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum TrustDomainError {
    /// An empty string is not a trust domain name.
    #[error("trust domain name cannot be empty")]
    Empty,

    /// The name exceeds the maximum length.
    #[error("trust domain name exceeds {MAX_TRUST_DOMAIN_LENGTH} bytes")]
    TooLong,

    /// The name contains a character that cannot appear in a trust domain.
    #[error("trust domain name contains invalid character {0:?}")]
    InvalidChar(char),

    /// The name is made of dots only.
    #[error("trust domain name cannot consist of dots only")]
    DotsOnly,
}

impl TrustDomainName {
    /// Parses a trust domain name.
    ///
    /// # Errors
    ///
    /// Returns [`TrustDomainError`] if the name is empty, too long, made of
    /// dots only, or contains a character outside the trust domain set.
    ///
    /// # Examples
    ///
    /// ```
    /// use galadriel_harvester::TrustDomainName;
    ///
    /// let td = TrustDomainName::new("example.org").unwrap();
    /// assert_eq!(td.as_str(), "example.org");
    /// assert!(TrustDomainName::new("spiffe://example.org/path").is_err());
    /// ```
    pub fn new(name: &str) -> Result<Self, TrustDomainError> {
        if name.is_empty() {
            return Err(TrustDomainError::Empty);
        }
        if name.len() > MAX_TRUST_DOMAIN_LENGTH {
            return Err(TrustDomainError::TooLong);
        }
        if let Some(c) = name.chars().find(|c| !VALID_TRUST_DOMAIN_CHARS.contains(*c)) {
            return Err(TrustDomainError::InvalidChar(c));
        }
        if name.chars().all(|c| c == '.') {
            return Err(TrustDomainError::DotsOnly);
        }
        Ok(Self(name.to_owned()))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustDomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TrustDomainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TrustDomainName {
    type Err = TrustDomainError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::new(name)
    }
}

impl TryFrom<&str> for TrustDomainName {
    type Error = TrustDomainError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl TryFrom<String> for TrustDomainName {
    type Error = TrustDomainError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(&name)
    }
}

impl Serialize for TrustDomainName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TrustDomainName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::new(&name).map_err(serde::de::Error::custom)
    }
}
