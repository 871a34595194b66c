pub mod directory;
pub mod jwk;
pub mod jws;
pub mod nonce;
pub mod problem;

pub use directory::{Directory, DirectoryMeta};
pub use jwk::Jwk;
pub use jws::{ProtectedHeader, VerifiedJws};
pub use nonce::NonceSource;
pub use problem::Problem;

/// Media type for signed request bodies
pub const JOSE_CONTENT_TYPE: &str = "application/jose+json";

/// Media type for DER certificates
pub const PKIX_CERT_CONTENT_TYPE: &str = "application/pkix-cert";

/// Header carrying a fresh anti-replay token on every response
pub const REPLAY_NONCE_HEADER: &str = "Replay-Nonce";

/// Header carrying the revocation reason on revoked certificate fetches
pub const REVOCATION_REASON_HEADER: &str = "Revocation-Reason";
