//! Protobuf message types shared by the SPIRE APIs.
//!
//! These are the wire types of the `spire.api.types` package. The harvester
//! treats them as the identity server's native bundle representation.

pub use crate::pb::spire::api::types::{Bundle, BundleMask, JwtKey, Status, X509Certificate};

/// A [`BundleMask`] selecting every bundle field.
pub fn full_bundle_mask() -> BundleMask {
    BundleMask {
        x509_authorities: true,
        jwt_authorities: true,
        refresh_hint: true,
        sequence_number: true,
    }
}
