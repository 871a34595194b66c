/// Flattened JWS signing and verification for ACME requests
use crate::crypto::hash::{b64url, b64url_decode};
use crate::crypto::keypair::AccountKey;
use crate::error::{AcmeError, Result};
use crate::protocol::jwk::Jwk;
use ring::signature::{RsaPublicKeyComponents, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED, RSA_PKCS1_2048_8192_SHA256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protected header carried by every signed request.
///
/// `alg`, `jwk`, `nonce` and `url` are all REQUIRED; verification fails when
/// any is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedHeader {
    /// Signature algorithm
    pub alg: String,
    /// Signer's public key
    pub jwk: Jwk,
    /// Anti-replay token
    pub nonce: String,
    /// Absolute URL the request is bound to
    pub url: String,
}

/// Result of verifying a flattened JWS
#[derive(Debug, Clone)]
pub struct VerifiedJws {
    /// The signer's public key, taken from the protected header
    pub jwk: Jwk,
    /// Decoded protected header
    pub header: ProtectedHeader,
    /// Decoded payload
    pub payload: Value,
}

/// Sign `payload` into a flattened JWS bound to `nonce` and `url`
pub fn sign(key: &AccountKey, payload: &Value, nonce: &str, url: &str) -> Result<Value> {
    let header = ProtectedHeader {
        alg: key.alg().to_string(),
        jwk: key.public_jwk(),
        nonce: nonce.to_string(),
        url: url.to_string(),
    };
    let protected = b64url(serde_json::to_string(&header)?.as_bytes());
    let payload_b64 = b64url(serde_json::to_string(payload)?.as_bytes());

    let signing_input = format!("{}.{}", protected, payload_b64);
    let signature = b64url(&key.sign(signing_input.as_bytes())?);

    Ok(serde_json::json!({
        "protected": protected,
        "payload": payload_b64,
        "signature": signature,
    }))
}

/// Verify a flattened JWS and return the signer's key, header and payload.
///
/// Rejects the general (non-flattened) serialization and any protected header
/// missing a required field.
pub fn verify(jws: &Value) -> Result<VerifiedJws> {
    let obj = jws
        .as_object()
        .ok_or_else(|| AcmeError::jose("JWS must be a JSON object"))?;
    if obj.contains_key("signatures") {
        return Err(AcmeError::jose("only the flattened JWS form is accepted"));
    }
    let protected = field_str(obj, "protected")?;
    let payload_b64 = field_str(obj, "payload")?;
    let signature = field_str(obj, "signature")?;

    let header_bytes = b64url_decode(protected)
        .map_err(|_| AcmeError::jose("protected header is not base64url"))?;
    let header: ProtectedHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| AcmeError::jose(format!("bad protected header: {}", e)))?;

    let signing_input = format!("{}.{}", protected, payload_b64);
    let sig = b64url_decode(signature).map_err(|_| AcmeError::jose("signature is not base64url"))?;
    verify_signature(&header.jwk, &header.alg, signing_input.as_bytes(), &sig)?;

    let payload_bytes =
        b64url_decode(payload_b64).map_err(|_| AcmeError::jose("payload is not base64url"))?;
    let payload = if payload_bytes.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(&payload_bytes)
            .map_err(|e| AcmeError::jose(format!("payload is not JSON: {}", e)))?
    };

    Ok(VerifiedJws {
        jwk: header.jwk.clone(),
        header,
        payload,
    })
}

fn field_str<'a>(obj: &'a serde_json::Map<String, Value>, name: &str) -> Result<&'a str> {
    obj.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| AcmeError::jose(format!("missing JWS field: {}", name)))
}

fn verify_signature(jwk: &Jwk, alg: &str, message: &[u8], signature: &[u8]) -> Result<()> {
    match (alg, jwk) {
        ("ES256", Jwk::Ec { .. }) => {
            let point = jwk.ec_public_point()?;
            UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &point)
                .verify(message, signature)
                .map_err(|_| AcmeError::jose("ES256 signature verification failed"))
        }
        ("RS256", Jwk::Rsa { .. }) => {
            let (n, e) = jwk.rsa_components()?;
            RsaPublicKeyComponents { n: &n, e: &e }
                .verify(&RSA_PKCS1_2048_8192_SHA256, message, signature)
                .map_err(|_| AcmeError::jose("RS256 signature verification failed"))
        }
        _ => Err(AcmeError::jose(format!(
            "algorithm {} does not match the presented key",
            alg
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_verify_round_trip() {
        let key = AccountKey::generate().unwrap();
        let payload = json!({"contact": ["mailto:admin@example.com"]});
        let jws = sign(&key, &payload, "42", "https://ca.example/acme/new-reg").unwrap();

        let verified = verify(&jws).unwrap();
        assert_eq!(verified.payload, payload);
        assert_eq!(verified.header.nonce, "42");
        assert_eq!(verified.header.url, "https://ca.example/acme/new-reg");
        assert_eq!(verified.jwk, key.public_jwk());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let key = AccountKey::generate().unwrap();
        let mut jws = sign(&key, &json!({"n": 1}), "7", "https://ca.example/x").unwrap();
        jws["payload"] = json!(b64url(br#"{"n":2}"#));
        assert!(verify(&jws).is_err());
    }

    #[test]
    fn test_general_form_rejected() {
        let key = AccountKey::generate().unwrap();
        let flat = sign(&key, &json!({}), "7", "https://ca.example/x").unwrap();
        let general = json!({
            "payload": flat["payload"],
            "signatures": [{"protected": flat["protected"], "signature": flat["signature"]}],
        });
        assert!(verify(&general).is_err());
    }

    #[test]
    fn test_missing_nonce_rejected() {
        let key = AccountKey::generate().unwrap();
        // A header built without the nonce member
        let header = json!({
            "alg": "ES256",
            "jwk": key.public_jwk().to_value(),
            "url": "https://ca.example/x",
        });
        let protected = b64url(header.to_string().as_bytes());
        let payload = b64url(b"{}");
        let input = format!("{}.{}", protected, payload);
        let signature = b64url(&key.sign(input.as_bytes()).unwrap());
        let jws = json!({"protected": protected, "payload": payload, "signature": signature});
        let err = verify(&jws).unwrap_err();
        assert!(err.to_string().contains("protected header"));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = AccountKey::generate().unwrap();
        let other = AccountKey::generate().unwrap();
        let mut jws = sign(&signer, &json!({}), "7", "https://ca.example/x").unwrap();

        // Re-point the header at a different key; the signature no longer matches
        let header = ProtectedHeader {
            alg: "ES256".to_string(),
            jwk: other.public_jwk(),
            nonce: "7".to_string(),
            url: "https://ca.example/x".to_string(),
        };
        jws["protected"] = json!(b64url(serde_json::to_string(&header).unwrap().as_bytes()));
        assert!(verify(&jws).is_err());
    }
}
