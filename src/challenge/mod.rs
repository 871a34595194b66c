//! Identifier-validation challenge modules
//!
//! Each validation type is a pair: a server-side [`ChallengeVerifier`] that
//! checks the client's response and probes the applicant, and a client-side
//! [`ValidationResponder`] that computes the response and stands up whatever
//! listener the probe expects. Dispatch is by type string through the two
//! registries; configuration holds an ordered list of type names.

use crate::crypto::hash::b64url;
use crate::error::Result;
use crate::types::ChallengeStatus;
use async_trait::async_trait;
use rand::RngCore;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub mod auto;
pub mod dns01;
pub mod http01;
pub mod oob;
pub mod tlssni02;

pub use auto::{AutoChallenge, AutoValidation};
pub use dns01::{Dns01Challenge, Dns01Validation};
pub use http01::{Http01Challenge, Http01Validation};
pub use oob::{OobChallenge, OobSignals, OobValidation};
pub use tlssni02::{TlsSni02Challenge, TlsSni02Validation};

/// A freshly generated challenge token: 32 random octets, base64url
pub fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    b64url(&bytes)
}

/// The key authorization binding a token to an account key
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// Where and how probes reach the applicant.
///
/// Defaults follow the protocol (ports 80/443, a local resolver for DNS);
/// tests point these at loopback listeners.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Port for http-01 probes
    pub http_port: u16,
    /// Port for tls-sni-02 probes
    pub tls_port: u16,
    /// TCP resolver queried for dns-01 probes
    pub dns_server: SocketAddr,
    /// Host probes connect to in place of the identifier; tests set this to
    /// loopback since the names under validation do not resolve
    pub probe_host: Option<String>,
    /// Per-probe timeout
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            http_port: 80,
            tls_port: 443,
            dns_server: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
            probe_host: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl ProbeConfig {
    /// Host to dial when probing `name`
    pub fn target_host<'a>(&'a self, name: &'a str) -> &'a str {
        self.probe_host.as_deref().unwrap_or(name)
    }
}

/// Server-side verifier for one challenge within an authorization
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    /// Challenge type string, e.g. `http-01`
    fn kind(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ChallengeStatus;

    /// The challenge token
    fn token(&self) -> &str;

    /// The key authorization the client must prove control with
    fn key_authorization(&self) -> &str;

    /// Apply a client-supplied response and run the validation probe.
    ///
    /// A response of the wrong type or with a mismatched key authorization
    /// moves the challenge to `invalid` without probing. Probe failure or
    /// timeout also yields `invalid`; probe success yields `valid`.
    async fn update(&mut self, response: &Value) -> ChallengeStatus;

    /// Public wire view: `{type, status, token, keyAuthorization?}`
    fn to_json(&self) -> Value {
        let mut view = serde_json::json!({
            "type": self.kind(),
            "status": self.status(),
            "token": self.token(),
        });
        if self.status() != ChallengeStatus::Pending {
            view["keyAuthorization"] = Value::String(self.key_authorization().to_string());
        }
        view
    }
}

/// Checks shared by every verifier's `update`: correct type and matching key
/// authorization. OOB responses carry no key authorization and skip the
/// second check.
pub fn response_matches(
    response: &Value,
    kind: &str,
    expected_key_authorization: Option<&str>,
) -> bool {
    if response.get("type").and_then(Value::as_str) != Some(kind) {
        return false;
    }
    match expected_key_authorization {
        Some(expected) => {
            response.get("keyAuthorization").and_then(Value::as_str) == Some(expected)
        }
        None => true,
    }
}

/// Handle on a listener stood up by a client-side responder.
///
/// Await [`ValidationListener::served`] to learn that the server's probe hit
/// the listener; the listener is torn down on success, failure and drop.
pub struct ValidationListener {
    served: tokio::sync::oneshot::Receiver<()>,
    shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl ValidationListener {
    /// Wrap a served-signal receiver and a teardown action
    pub fn new(
        served: tokio::sync::oneshot::Receiver<()>,
        shutdown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            served,
            shutdown: Some(Box::new(shutdown)),
        }
    }

    /// A listener that is already satisfied (used by validations with no
    /// listening component)
    pub fn ready() -> Self {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = tx.send(());
        Self {
            served: rx,
            shutdown: None,
        }
    }

    /// Wait until the probe has been served, then release the listener
    pub async fn served(mut self, timeout: Duration) -> Result<()> {
        let outcome = tokio::time::timeout(timeout, &mut self.served).await;
        if let Some(shutdown) = self.shutdown.take() {
            shutdown();
        }
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(crate::error::AcmeError::validation(
                "listener",
                "listener closed before the probe arrived",
            )),
            Err(_) => Err(crate::error::AcmeError::timeout(
                "validation probe was never served",
            )),
        }
    }
}

impl Drop for ValidationListener {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown();
        }
    }
}

/// Client-side responder for one challenge type
#[async_trait]
pub trait ValidationResponder: Send + Sync {
    /// Challenge type string this responder answers
    fn kind(&self) -> &'static str;

    /// Build the response object to POST to the challenge URL
    fn make_response(&self, key_authorization: &str) -> Value {
        serde_json::json!({
            "type": self.kind(),
            "keyAuthorization": key_authorization,
        })
    }

    /// Stand up the listener that will serve the server's probe.
    ///
    /// Returns once the listener is ready to accept the probe, so the caller
    /// can safely POST the challenge response afterwards.
    async fn respond(
        &self,
        name: &str,
        challenge: &Value,
        response: &Value,
    ) -> Result<ValidationListener>;
}

type VerifierFactory = Arc<dyn Fn(&str, &str) -> Box<dyn ChallengeVerifier> + Send + Sync>;

/// Ordered registry of server-side challenge constructors
#[derive(Clone, Default)]
pub struct ChallengeRegistry {
    factories: Vec<(String, VerifierFactory)>,
}

impl ChallengeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a challenge type
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(&str, &str) -> Box<dyn ChallengeVerifier> + Send + Sync + 'static,
    ) {
        self.factories.push((kind.into(), Arc::new(factory)));
    }

    /// Registry holding every built-in verifier
    pub fn standard(probe: ProbeConfig, oob_signals: OobSignals) -> Self {
        let mut registry = Self::new();
        let http_probe = probe.clone();
        registry.register("http-01", move |name, thumbprint| {
            Box::new(Http01Challenge::new(name, thumbprint, http_probe.clone()))
        });
        let dns_probe = probe.clone();
        registry.register("dns-01", move |name, thumbprint| {
            Box::new(Dns01Challenge::new(name, thumbprint, dns_probe.clone()))
        });
        let tls_probe = probe.clone();
        registry.register("tls-sni-02", move |name, thumbprint| {
            Box::new(TlsSni02Challenge::new(name, thumbprint, tls_probe.clone()))
        });
        let oob_timeout = probe.timeout;
        registry.register("oob-01", move |_name, thumbprint| {
            Box::new(OobChallenge::new(
                thumbprint,
                oob_signals.clone(),
                oob_timeout,
            ))
        });
        registry.register("auto", |_name, thumbprint| {
            Box::new(AutoChallenge::new(thumbprint))
        });
        registry
    }

    /// Construct verifiers for `name` in the order given by `kinds`,
    /// skipping unknown type names
    pub fn create_for(
        &self,
        kinds: &[String],
        name: &str,
        thumbprint: &str,
    ) -> Vec<Box<dyn ChallengeVerifier>> {
        kinds
            .iter()
            .filter_map(|kind| {
                self.factories
                    .iter()
                    .find(|(registered, _)| registered == kind)
                    .map(|(_, factory)| factory(name, thumbprint))
            })
            .collect()
    }
}

/// Client-side registry: responders by challenge type, in preference order
#[derive(Default)]
pub struct ValidationRegistry {
    responders: Vec<Box<dyn ValidationResponder>>,
}

impl ValidationRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a responder; earlier registrations are preferred
    pub fn register(&mut self, responder: impl ValidationResponder + 'static) -> &mut Self {
        self.responders.push(Box::new(responder));
        self
    }

    /// Responder for a given challenge type
    pub fn get(&self, kind: &str) -> Option<&dyn ValidationResponder> {
        self.responders
            .iter()
            .find(|r| r.kind() == kind)
            .map(|r| r.as_ref())
    }

    /// Whether every one of `kinds` is supported
    pub fn supports_all(&self, kinds: &[&str]) -> bool {
        kinds.iter().all(|kind| self.get(kind).is_some())
    }

    /// Registered type names, in preference order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.responders.iter().map(|r| r.kind()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_shape() {
        let token = new_token();
        // 32 octets -> 43 base64url chars, no padding
        assert_eq!(token.len(), 43);
        assert!(!token.contains('='));
        assert_ne!(token, new_token());
    }

    #[test]
    fn test_key_authorization_format() {
        assert_eq!(key_authorization("tok", "print"), "tok.print");
    }

    #[test]
    fn test_response_matches() {
        let response = serde_json::json!({"type": "http-01", "keyAuthorization": "t.p"});
        assert!(response_matches(&response, "http-01", Some("t.p")));
        assert!(!response_matches(&response, "dns-01", Some("t.p")));
        assert!(!response_matches(&response, "http-01", Some("other")));
        assert!(response_matches(
            &serde_json::json!({"type": "oob-01"}),
            "oob-01",
            None
        ));
    }

    #[test]
    fn test_registry_order_and_unknown_kinds() {
        let registry =
            ChallengeRegistry::standard(ProbeConfig::default(), OobSignals::new_shared());
        let kinds = vec![
            "dns-01".to_string(),
            "no-such-type".to_string(),
            "http-01".to_string(),
        ];
        let verifiers = registry.create_for(&kinds, "example.com", "print");
        let created: Vec<&str> = verifiers.iter().map(|v| v.kind()).collect();
        assert_eq!(created, vec!["dns-01", "http-01"]);
    }
}
