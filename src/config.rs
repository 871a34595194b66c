//! Configuration for the server and client engines
//!
//! Both peers are configured by the embedding process; there is no file or
//! environment layer here.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface the listener binds to
    #[serde(default = "default_host")]
    pub host: String,

    /// Listener port; 0 lets the OS choose
    #[serde(default)]
    pub port: u16,

    /// Path prefix every resource URL lives under
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Whether the scheme gate rejects non-HTTPS requests
    #[serde(default = "default_true")]
    pub require_https: bool,

    /// Authorization lifetime in seconds
    #[serde(default = "default_authz_expiry")]
    pub authz_expiry_secs: u64,

    /// Upper bound on requested certificate validity, in seconds
    #[serde(default = "default_max_validity")]
    pub max_validity_secs: u64,

    /// Challenge types offered inside new authorizations, in order
    #[serde(default = "default_challenge_types")]
    pub challenge_types: Vec<String>,

    /// Out-of-band handlers; each adds one out-of-band requirement per
    /// application
    #[serde(default)]
    pub oob_handlers: Vec<String>,

    /// POST rate limit
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Terms-of-service URL advertised in the directory, if any
    #[serde(default)]
    pub terms_of_service: Option<String>,

    /// First value of the nonce counter
    #[serde(default = "default_nonce_start")]
    pub nonce_start: u64,
}

/// Sliding-window POST rate limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Number of POSTs admitted per window
    #[serde(default = "default_rate_limit_posts")]
    pub max_posts: usize,

    /// Window length in seconds
    #[serde(default = "default_rate_limit_window")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_posts: default_rate_limit_posts(),
            window_secs: default_rate_limit_window(),
        }
    }
}

impl RateLimitConfig {
    /// Window length as a [`Duration`]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            base_path: default_base_path(),
            require_https: true,
            authz_expiry_secs: default_authz_expiry(),
            max_validity_secs: default_max_validity(),
            challenge_types: default_challenge_types(),
            oob_handlers: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            terms_of_service: None,
            nonce_start: default_nonce_start(),
        }
    }
}

impl ServerConfig {
    /// Absolute base URL of the engine, scheme chosen by `require_https`
    pub fn base_url(&self) -> String {
        let scheme = if self.require_https { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.base_path)
    }

    /// Absolute URL of a stored resource
    pub fn url_for(&self, kind: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url(), kind, id)
    }

    /// Absolute URL of a challenge inside an authorization
    pub fn challenge_url(&self, authz_id: &str, index: usize) -> String {
        format!("{}/authz/{}/{}", self.base_url(), authz_id, index)
    }
}

/// Client-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory URL of the server to talk to
    pub directory_url: String,

    /// Accept plain-HTTP servers; for debugging only
    #[serde(default)]
    pub allow_insecure: bool,

    /// Attempts for the generic fetch-until poll helper
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: usize,

    /// Spacing between generic poll attempts, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts while waiting for an application to become valid
    #[serde(default = "default_issuance_attempts")]
    pub issuance_attempts: usize,

    /// Fallback delay when a rate-limit response carries no usable
    /// Retry-After, in milliseconds
    #[serde(default = "default_retry_fallback_ms")]
    pub retry_fallback_ms: u64,
}

impl ClientConfig {
    /// Configuration with defaults for the given directory URL
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            allow_insecure: false,
            fetch_attempts: default_fetch_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            issuance_attempts: default_issuance_attempts(),
            retry_fallback_ms: default_retry_fallback_ms(),
        }
    }

    /// Spacing between poll attempts
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Rate-limit fallback delay
    pub fn retry_fallback(&self) -> Duration {
        Duration::from_millis(self.retry_fallback_ms)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_base_path() -> String {
    "/acme".to_string()
}

fn default_true() -> bool {
    true
}

fn default_authz_expiry() -> u64 {
    // 30 days
    30 * 24 * 3600
}

fn default_max_validity() -> u64 {
    // 365 days
    365 * 24 * 3600
}

fn default_challenge_types() -> Vec<String> {
    vec!["http-01".to_string(), "dns-01".to_string()]
}

fn default_nonce_start() -> u64 {
    0x100
}

fn default_rate_limit_posts() -> usize {
    100
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_fetch_attempts() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_issuance_attempts() -> usize {
    30
}

fn default_retry_fallback_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_scheme_follows_https_flag() {
        let mut config = ServerConfig {
            host: "ca.example".to_string(),
            port: 443,
            ..ServerConfig::default()
        };
        assert_eq!(config.base_url(), "https://ca.example:443/acme");

        config.require_https = false;
        assert_eq!(config.base_url(), "http://ca.example:443/acme");
    }

    #[test]
    fn test_url_for() {
        let config = ServerConfig {
            host: "ca.example".to_string(),
            port: 8443,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.url_for("authz", "abc"),
            "https://ca.example:8443/acme/authz/abc"
        );
        assert_eq!(
            config.challenge_url("abc", 1),
            "https://ca.example:8443/acme/authz/abc/1"
        );
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::new("https://ca.example/acme/directory");
        assert!(!config.allow_insecure);
        assert_eq!(config.fetch_attempts, 4);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.issuance_attempts, 30);
    }
}
