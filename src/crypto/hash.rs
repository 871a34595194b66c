/// Digest and encoding helpers shared across the protocol layers
use crate::error::{AcmeError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// SHA-256 digest of arbitrary bytes
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Base64url (no padding) encoding
pub fn b64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Base64url (no padding) decoding
pub fn b64url_decode(data: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| AcmeError::invalid_input(format!("invalid base64url: {}", e)))
}

/// base64url(SHA-256(data)), the form used by key-authorization digests
pub fn sha256_b64url(data: &[u8]) -> String {
    b64url(&sha256(data))
}

/// Lowercase hex SHA-256, the form split into TLS-SNI name labels
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}
