//! # acmeforge — a reference ACME engine
//!
//! Two cooperating peers built around one protocol core: a small certificate
//! authority front-end (the server) and a certificate requester (the
//! client), speaking the draft ACME dialect of new-reg/new-app resources.
//!
//! ## What lives where
//!
//! - **Protocol**: flattened JWS transport, JWK thumbprints, anti-replay
//!   nonces, directory and problem documents
//! - **PKI**: CSR validation, an in-memory issuing CA, certificate matching
//! - **Challenges**: paired server verifier / client responder modules for
//!   http-01, dns-01, tls-sni-02 and out-of-band page views
//! - **Server**: transport gates, resource handlers and issuance
//!   coordination over an in-memory store
//! - **Client**: registration, key change, application submission,
//!   authorization fulfilment, polling and revocation
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use acmeforge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> acmeforge::Result<()> {
//!     let key = AccountKey::generate()?;
//!     let config = ClientConfig::new("https://ca.example/acme/directory");
//!     let client = AcmeClient::new(config, key)?
//!         .with_validation(Http01Validation::new(80));
//!     client.register(&["mailto:admin@example.com".to_string()]).await?;
//!     Ok(())
//! }
//! ```

pub mod challenge;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod pki;
pub mod protocol;
pub mod server;
pub mod store;
pub mod types;

pub use challenge::{
    AutoChallenge, AutoValidation, ChallengeRegistry, ChallengeVerifier, Dns01Challenge,
    Dns01Validation, Http01Challenge, Http01Validation, OobChallenge, OobSignals, OobValidation,
    ProbeConfig, TlsSni02Challenge, TlsSni02Validation, ValidationRegistry, ValidationResponder,
};
pub use client::{AcmeClient, CertificateBundle};
pub use config::{ClientConfig, RateLimitConfig, ServerConfig};
pub use crypto::AccountKey;
pub use error::{AcmeError, Result};
pub use pki::CertificateAuthority;
pub use protocol::{Directory, Jwk, NonceSource, Problem};
pub use server::AcmeServer;
pub use types::{
    ApplicationStatus, AuthorizationStatus, ChallengeStatus, Identifier, RegistrationStatus,
    RevocationReason,
};

/// Prelude with the types most embeddings need
pub mod prelude {
    pub use crate::challenge::{
        AutoValidation, Dns01Validation, Http01Validation, OobValidation, ProbeConfig,
        TlsSni02Validation,
    };
    pub use crate::client::{AcmeClient, CertificateBundle};
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::crypto::AccountKey;
    pub use crate::error::{AcmeError, Result};
    pub use crate::pki::CertificateAuthority;
    pub use crate::server::AcmeServer;
}
