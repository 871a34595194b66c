pub mod hash;
pub mod keypair;

pub use hash::{b64url, b64url_decode, sha256, sha256_b64url, sha256_hex};
pub use keypair::AccountKey;
