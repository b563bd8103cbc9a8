//! SPIFFE trust bundle documents.
//!
//! The serialized form of a bundle is the JWKS-based SPIFFE bundle document:
//!
//! ```json
//! {
//!   "keys": [
//!     { "use": "x509-svid", "kty": "EC", "crv": "P-256", "x": "...", "y": "...", "x5c": ["..."] },
//!     { "use": "jwt-svid", "kty": "RSA", "kid": "key-1", "n": "...", "e": "AQAB" }
//!   ],
//!   "spiffe_refresh_hint": 300,
//!   "spiffe_sequence": 4
//! }
//! ```
//!
//! Marshalling is deterministic: the same identity server bundle always yields
//! the same bytes, so digests of unchanged bundles are stable across reads.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Public};
use openssl::rsa::Rsa;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use spire_api::types::{Bundle as SpireBundle, JwtKey, X509Certificate};
use thiserror::Error;

use crate::trust_domain::TrustDomainName;

const X509_SVID_USE: &str = "x509-svid";
const JWT_SVID_USE: &str = "jwt-svid";

/// An error that can arise converting between identity server bundles and
/// SPIFFE bundle documents.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DocumentError {
    /// The document is not valid JSON or does not have the expected shape.
    #[error("malformed bundle document: {0}")]
    Json(#[from] serde_json::Error),

    /// A key parameter is not valid base64.
    #[error("malformed key parameter: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A key or certificate could not be processed.
    #[error("invalid key material: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// A key entry misses a parameter required for its use and type.
    #[error("{key_use} key is missing parameter {param}")]
    MissingParameter {
        /// `use` of the key entry.
        key_use: &'static str,
        /// Name of the missing parameter.
        param: &'static str,
    },

    /// The key type or curve is not supported.
    #[error("unsupported key type: {0}")]
    UnsupportedKey(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    keys: Vec<Jwk>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    spiffe_refresh_hint: i64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    spiffe_sequence: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Jwk {
    #[serde(rename = "use")]
    key_use: String,
    kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x5c: Option<Vec<String>>,
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Serializes an identity server bundle into a SPIFFE bundle document.
///
/// X.509 authorities come first, in server order, followed by JWT
/// authorities in server order.
///
/// # Errors
///
/// Returns [`DocumentError`] if an authority holds a certificate or public key
/// that cannot be parsed or uses an unsupported key type.
pub fn marshal(bundle: &SpireBundle) -> Result<Vec<u8>, DocumentError> {
    let mut keys = Vec::with_capacity(bundle.x509_authorities.len() + bundle.jwt_authorities.len());

    for authority in &bundle.x509_authorities {
        let cert = X509::from_der(&authority.asn1)?;
        let mut jwk = public_jwk(&cert.public_key()?)?;
        jwk.key_use = X509_SVID_USE.to_owned();
        jwk.x5c = Some(vec![STANDARD.encode(&authority.asn1)]);
        keys.push(jwk);
    }

    for authority in &bundle.jwt_authorities {
        let key = PKey::public_key_from_der(&authority.public_key)?;
        let mut jwk = public_jwk(&key)?;
        jwk.key_use = JWT_SVID_USE.to_owned();
        jwk.kid = Some(authority.key_id.clone());
        keys.push(jwk);
    }

    let document = Document {
        keys,
        spiffe_refresh_hint: bundle.refresh_hint,
        spiffe_sequence: bundle.sequence_number,
    };
    Ok(serde_json::to_vec(&document)?)
}

/// Parses a SPIFFE bundle document into the identity server representation.
///
/// Keys with an unknown `use` are skipped.
///
/// # Errors
///
/// Returns [`DocumentError`] if the document is malformed or a key cannot be
/// reconstructed.
pub fn unmarshal(
    trust_domain: &TrustDomainName,
    data: &[u8],
) -> Result<SpireBundle, DocumentError> {
    let document: Document = serde_json::from_slice(data)?;

    let mut bundle = SpireBundle {
        trust_domain: trust_domain.to_string(),
        refresh_hint: document.spiffe_refresh_hint,
        sequence_number: document.spiffe_sequence,
        ..SpireBundle::default()
    };

    for jwk in document.keys {
        match jwk.key_use.as_str() {
            X509_SVID_USE => {
                let der = match jwk.x5c.as_deref() {
                    Some([first, ..]) => STANDARD.decode(first)?,
                    _ => {
                        return Err(DocumentError::MissingParameter {
                            key_use: X509_SVID_USE,
                            param: "x5c",
                        })
                    }
                };
                X509::from_der(&der)?;
                bundle.x509_authorities.push(X509Certificate {
                    asn1: der.into(),
                    tainted: false,
                });
            }
            JWT_SVID_USE => {
                let key_id = jwk.kid.clone().ok_or(DocumentError::MissingParameter {
                    key_use: JWT_SVID_USE,
                    param: "kid",
                })?;
                let public_key = jwk_public_key(&jwk)?.public_key_to_der()?;
                bundle.jwt_authorities.push(JwtKey {
                    public_key: public_key.into(),
                    key_id,
                    expires_at: 0,
                    tainted: false,
                });
            }
            other => {
                tracing::debug!(key_use = other, "Skipping bundle key with unknown use");
            }
        }
    }

    Ok(bundle)
}

fn public_jwk(key: &PKey<Public>) -> Result<Jwk, DocumentError> {
    match key.id() {
        Id::RSA => {
            let rsa = key.rsa()?;
            Ok(Jwk {
                kty: "RSA".to_owned(),
                n: Some(URL_SAFE_NO_PAD.encode(rsa.n().to_vec())),
                e: Some(URL_SAFE_NO_PAD.encode(rsa.e().to_vec())),
                ..Jwk::default()
            })
        }
        Id::EC => {
            let ec = key.ec_key()?;
            let group = ec.group();
            let (crv, size) = curve_params(group.curve_name())?;
            let mut x = BigNum::new()?;
            let mut y = BigNum::new()?;
            let mut ctx = BigNumContext::new()?;
            ec.public_key()
                .affine_coordinates(group, &mut x, &mut y, &mut ctx)?;
            Ok(Jwk {
                kty: "EC".to_owned(),
                crv: Some(crv.to_owned()),
                x: Some(URL_SAFE_NO_PAD.encode(x.to_vec_padded(size)?)),
                y: Some(URL_SAFE_NO_PAD.encode(y.to_vec_padded(size)?)),
                ..Jwk::default()
            })
        }
        Id::ED25519 => Ok(Jwk {
            kty: "OKP".to_owned(),
            crv: Some("Ed25519".to_owned()),
            x: Some(URL_SAFE_NO_PAD.encode(key.raw_public_key()?)),
            ..Jwk::default()
        }),
        other => Err(DocumentError::UnsupportedKey(format!("{other:?}"))),
    }
}

fn jwk_public_key(jwk: &Jwk) -> Result<PKey<Public>, DocumentError> {
    let param = |value: &Option<String>, name: &'static str| -> Result<Vec<u8>, DocumentError> {
        let encoded = value.as_deref().ok_or(DocumentError::MissingParameter {
            key_use: JWT_SVID_USE,
            param: name,
        })?;
        Ok(URL_SAFE_NO_PAD.decode(encoded)?)
    };

    match jwk.kty.as_str() {
        "RSA" => {
            let n = BigNum::from_slice(&param(&jwk.n, "n")?)?;
            let e = BigNum::from_slice(&param(&jwk.e, "e")?)?;
            Ok(PKey::from_rsa(Rsa::from_public_components(n, e)?)?)
        }
        "EC" => {
            let nid = match jwk.crv.as_deref() {
                Some("P-256") => Nid::X9_62_PRIME256V1,
                Some("P-384") => Nid::SECP384R1,
                Some("P-521") => Nid::SECP521R1,
                other => {
                    return Err(DocumentError::UnsupportedKey(format!(
                        "EC curve {}",
                        other.unwrap_or("<none>")
                    )))
                }
            };
            let group = EcGroup::from_curve_name(nid)?;
            let x = BigNum::from_slice(&param(&jwk.x, "x")?)?;
            let y = BigNum::from_slice(&param(&jwk.y, "y")?)?;
            let ec = EcKey::from_public_key_affine_coordinates(&group, &x, &y)?;
            ec.check_key()?;
            Ok(PKey::from_ec_key(ec)?)
        }
        "OKP" if jwk.crv.as_deref() == Some("Ed25519") => {
            let x = param(&jwk.x, "x")?;
            Ok(PKey::public_key_from_raw_bytes(&x, Id::ED25519)?)
        }
        other => Err(DocumentError::UnsupportedKey(other.to_owned())),
    }
}

fn curve_params(curve: Option<Nid>) -> Result<(&'static str, i32), DocumentError> {
    match curve {
        Some(Nid::X9_62_PRIME256V1) => Ok(("P-256", 32)),
        Some(Nid::SECP384R1) => Ok(("P-384", 48)),
        Some(Nid::SECP521R1) => Ok(("P-521", 66)),
        other => Err(DocumentError::UnsupportedKey(format!("EC curve {other:?}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cert::test_support::root_ca;

    fn ec_public_der(nid: Nid) -> Vec<u8> {
        let group = EcGroup::from_curve_name(nid).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        key.public_key_to_der().unwrap()
    }

    fn spire_bundle() -> SpireBundle {
        let ca = root_ca("authority");
        let rsa = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let ed = PKey::generate_ed25519().unwrap();
        SpireBundle {
            trust_domain: "example.org".to_owned(),
            x509_authorities: vec![X509Certificate {
                asn1: ca.cert.to_der().unwrap().into(),
                tainted: false,
            }],
            jwt_authorities: vec![
                JwtKey {
                    public_key: ec_public_der(Nid::X9_62_PRIME256V1).into(),
                    key_id: "ec-256".to_owned(),
                    expires_at: 0,
                    tainted: false,
                },
                JwtKey {
                    public_key: ec_public_der(Nid::SECP521R1).into(),
                    key_id: "ec-521".to_owned(),
                    expires_at: 0,
                    tainted: false,
                },
                JwtKey {
                    public_key: rsa.public_key_to_der().unwrap().into(),
                    key_id: "rsa".to_owned(),
                    expires_at: 0,
                    tainted: false,
                },
                JwtKey {
                    public_key: ed.public_key_to_der().unwrap().into(),
                    key_id: "ed".to_owned(),
                    expires_at: 0,
                    tainted: false,
                },
            ],
            refresh_hint: 300,
            sequence_number: 7,
        }
    }

    #[test]
    fn marshal_is_deterministic() {
        let bundle = spire_bundle();
        assert_eq!(marshal(&bundle).unwrap(), marshal(&bundle).unwrap());
    }

    #[test]
    fn unmarshal_restores_authorities() {
        let bundle = spire_bundle();
        let td = TrustDomainName::new("example.org").unwrap();

        let parsed = unmarshal(&td, &marshal(&bundle).unwrap()).unwrap();

        assert_eq!(parsed, bundle);
    }

    #[test]
    fn document_uses_spiffe_field_names() {
        let doc: serde_json::Value = serde_json::from_slice(&marshal(&spire_bundle()).unwrap()).unwrap();
        assert_eq!(doc["spiffe_refresh_hint"], 300);
        assert_eq!(doc["spiffe_sequence"], 7);
        assert_eq!(doc["keys"][0]["use"], "x509-svid");
        assert_eq!(doc["keys"][0]["kty"], "RSA");
        assert!(doc["keys"][0]["x5c"].is_array());
        assert_eq!(doc["keys"][1]["use"], "jwt-svid");
        assert_eq!(doc["keys"][1]["kid"], "ec-256");
        assert_eq!(doc["keys"][1]["crv"], "P-256");
        assert_eq!(doc["keys"][4]["kty"], "OKP");
    }

    #[test]
    fn unmarshal_skips_unknown_key_use() {
        let td = TrustDomainName::new("peer.test").unwrap();
        let parsed = unmarshal(&td, br#"{"keys":[{"use":"other","kty":"RSA"}]}"#).unwrap();
        assert!(parsed.x509_authorities.is_empty());
        assert!(parsed.jwt_authorities.is_empty());
        assert_eq!(parsed.trust_domain, "peer.test");
    }

    #[test]
    fn unmarshal_rejects_jwt_key_without_kid() {
        let td = TrustDomainName::new("peer.test").unwrap();
        let err = unmarshal(&td, br#"{"keys":[{"use":"jwt-svid","kty":"RSA","n":"AQAB","e":"AQAB"}]}"#)
            .unwrap_err();
        assert!(matches!(err, DocumentError::MissingParameter { param: "kid", .. }));
    }

    #[test]
    fn unmarshal_rejects_malformed_json() {
        let td = TrustDomainName::new("peer.test").unwrap();
        assert!(matches!(unmarshal(&td, b"B"), Err(DocumentError::Json(_))));
    }
}
