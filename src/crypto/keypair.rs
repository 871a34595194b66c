/// Account key pairs backed by ring
use crate::crypto::hash::b64url;
use crate::error::{AcmeError, Result};
use crate::protocol::jwk::Jwk;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING};

/// An asymmetric account key (ES256).
///
/// The private half never leaves this type; peers see only the public [`Jwk`].
/// The canonical account identity is the JWK thumbprint.
pub struct AccountKey {
    pkcs8: Vec<u8>,
    inner: EcdsaKeyPair,
    rng: SystemRandom,
}

impl AccountKey {
    /// Generate a fresh P-256 key pair
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| AcmeError::crypto("key generation failed"))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Reconstruct a key pair from PKCS#8 DER
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();
        let inner = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
            .map_err(|e| AcmeError::crypto(format!("invalid PKCS#8 key: {}", e)))?;
        Ok(Self {
            pkcs8: pkcs8.to_vec(),
            inner,
            rng,
        })
    }

    /// PKCS#8 DER bytes, for persisting or cloning the key
    pub fn to_pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Public half as a JWK
    pub fn public_jwk(&self) -> Jwk {
        // ring exposes the uncompressed SEC1 point: 0x04 || x || y
        let point = self.inner.public_key().as_ref();
        Jwk::ec_p256(b64url(&point[1..33]), b64url(&point[33..65]))
    }

    /// JWK thumbprint of the public half
    pub fn thumbprint(&self) -> String {
        self.public_jwk().thumbprint()
    }

    /// JWS algorithm name for this key
    pub fn alg(&self) -> &'static str {
        "ES256"
    }

    /// ES256 signature (fixed-length r || s form, as JWS requires)
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.inner
            .sign(&self.rng, message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|_| AcmeError::crypto("signing failed"))
    }
}

impl Clone for AccountKey {
    fn clone(&self) -> Self {
        // from_pkcs8 cannot fail on bytes this type produced
        Self::from_pkcs8(&self.pkcs8).expect("reparse of own PKCS#8")
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}
