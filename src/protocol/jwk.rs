/// JSON Web Key (JWK) representation for account keys
use crate::crypto::hash::{b64url, b64url_decode, sha256};
use crate::error::{AcmeError, Result};
use serde::{Deserialize, Serialize};

/// Public JWK as carried in JWS protected headers and registrations.
///
/// Only the key types the engine signs or verifies with are modelled; the
/// members are exactly the REQUIRED ones, which keeps wire equality checks
/// meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    /// Elliptic-curve key (P-256)
    #[serde(rename = "EC")]
    Ec {
        /// Curve name
        crv: String,
        /// Base64url x coordinate
        x: String,
        /// Base64url y coordinate
        y: String,
    },
    /// RSA key
    #[serde(rename = "RSA")]
    Rsa {
        /// Base64url public exponent
        e: String,
        /// Base64url modulus
        n: String,
    },
}

impl Jwk {
    /// Create a P-256 EC JWK from base64url coordinates
    pub fn ec_p256(x: impl Into<String>, y: impl Into<String>) -> Self {
        Jwk::Ec {
            crv: "P-256".to_string(),
            x: x.into(),
            y: y.into(),
        }
    }

    /// Create an RSA JWK from base64url modulus and exponent
    pub fn rsa(n: impl Into<String>, e: impl Into<String>) -> Self {
        Jwk::Rsa {
            e: e.into(),
            n: n.into(),
        }
    }

    /// Canonical JWK form per RFC 7638: required members only, in
    /// lexicographic order, with no whitespace.
    pub fn canonical_json(&self) -> String {
        match self {
            Jwk::Ec { crv, x, y } => {
                format!(
                    r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                    crv, x, y
                )
            }
            Jwk::Rsa { e, n } => {
                format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n)
            }
        }
    }

    /// JWK thumbprint: base64url(SHA-256(canonical JWK))
    pub fn thumbprint(&self) -> String {
        b64url(&sha256(self.canonical_json().as_bytes()))
    }

    /// Signature algorithm implied by the key type
    pub fn alg(&self) -> &'static str {
        match self {
            Jwk::Ec { .. } => "ES256",
            Jwk::Rsa { .. } => "RS256",
        }
    }

    /// Uncompressed SEC1 point for an EC key (0x04 || x || y)
    pub fn ec_public_point(&self) -> Result<Vec<u8>> {
        match self {
            Jwk::Ec { crv, x, y } => {
                if crv != "P-256" {
                    return Err(AcmeError::jose(format!("unsupported curve: {}", crv)));
                }
                let x = b64url_decode(x)?;
                let y = b64url_decode(y)?;
                if x.len() != 32 || y.len() != 32 {
                    return Err(AcmeError::jose("EC coordinates must be 32 octets"));
                }
                let mut point = Vec::with_capacity(65);
                point.push(0x04);
                point.extend_from_slice(&x);
                point.extend_from_slice(&y);
                Ok(point)
            }
            Jwk::Rsa { .. } => Err(AcmeError::jose("not an EC key")),
        }
    }

    /// Raw big-endian modulus and exponent for an RSA key
    pub fn rsa_components(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        match self {
            Jwk::Rsa { e, n } => Ok((b64url_decode(n)?, b64url_decode(e)?)),
            Jwk::Ec { .. } => Err(AcmeError::jose("not an RSA key")),
        }
    }

    /// Convert to a JSON value for embedding in a JWS header
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsa_thumbprint_rfc7638_vector() {
        // The example key from RFC 7638 section 3.1
        let jwk = Jwk::rsa(
            "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "AQAB",
        );
        assert_eq!(jwk.thumbprint(), "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs");
    }

    #[test]
    fn test_ec_canonical_order() {
        let jwk = Jwk::ec_p256("eks", "why");
        assert_eq!(
            jwk.canonical_json(),
            r#"{"crv":"P-256","kty":"EC","x":"eks","y":"why"}"#
        );
    }

    #[test]
    fn test_alg_by_kty() {
        assert_eq!(Jwk::ec_p256("a", "b").alg(), "ES256");
        assert_eq!(Jwk::rsa("a", "AQAB").alg(), "RS256");
    }

    #[test]
    fn test_wire_shape_carries_kty() {
        let value = Jwk::ec_p256("a", "b").to_value();
        assert_eq!(value["kty"], "EC");
        assert_eq!(value["crv"], "P-256");

        let parsed: Jwk = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, Jwk::ec_p256("a", "b"));
    }

    #[test]
    fn test_ec_point_rejects_bad_coordinates() {
        let jwk = Jwk::ec_p256("AAAA", "BBBB");
        assert!(jwk.ec_public_point().is_err());
    }
}
