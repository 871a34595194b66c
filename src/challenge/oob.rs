/// Out-of-band (page-view) validation
///
/// The server exposes a random URL and treats a GET on it as proof; the
/// verifier waits for that page view with a timeout. The client side simply
/// opens the URL.
use super::{
    key_authorization, new_token, response_matches, ChallengeVerifier, ValidationListener,
    ValidationResponder,
};
use crate::error::{AcmeError, Result};
use crate::types::ChallengeStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Pending page-view signals, shared between the server's `/oob/{token}`
/// route and the verifiers waiting on it. Lives outside the resource store
/// so a page view never contends with a request handler.
#[derive(Clone, Default)]
pub struct OobSignals {
    base_url: Arc<Mutex<String>>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl OobSignals {
    /// A fresh shared signal map
    pub fn new_shared() -> Self {
        Self::default()
    }

    /// Set the server base URL used to mint page-view hrefs
    pub fn set_base_url(&self, url: &str) {
        if let Ok(mut guard) = self.base_url.lock() {
            *guard = url.to_string();
        }
    }

    /// Absolute URL a page view must GET for this token
    pub fn href_for(&self, token: &str) -> String {
        let base = self.base_url.lock().map(|g| g.clone()).unwrap_or_default();
        format!("{}/oob/{}", base, token)
    }

    /// Register a token; the returned receiver resolves on page view
    pub fn register(&self, token: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut guard) = self.pending.lock() {
            guard.insert(token.to_string(), tx);
        }
        rx
    }

    /// Fire the signal for a token. Returns whether the token was known.
    pub fn signal(&self, token: &str) -> bool {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut guard| guard.remove(token));
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Server-side verifier
pub struct OobChallenge {
    status: ChallengeStatus,
    token: String,
    key_auth: String,
    signals: OobSignals,
    page_view: Option<oneshot::Receiver<()>>,
    timeout: Duration,
}

impl OobChallenge {
    pub fn new(thumbprint: &str, signals: OobSignals, timeout: Duration) -> Self {
        let token = new_token();
        let key_auth = key_authorization(&token, thumbprint);
        let page_view = Some(signals.register(&token));
        Self {
            status: ChallengeStatus::Pending,
            token,
            key_auth,
            signals,
            page_view,
            timeout,
        }
    }
}

#[async_trait]
impl ChallengeVerifier for OobChallenge {
    fn kind(&self) -> &'static str {
        "oob-01"
    }

    fn status(&self) -> ChallengeStatus {
        self.status
    }

    fn token(&self) -> &str {
        &self.token
    }

    fn key_authorization(&self) -> &str {
        &self.key_auth
    }

    async fn update(&mut self, response: &Value) -> ChallengeStatus {
        // An OOB response carries only the type
        if !response_matches(response, self.kind(), None) {
            self.status = ChallengeStatus::Invalid;
            return self.status;
        }
        let Some(page_view) = self.page_view.take() else {
            self.status = ChallengeStatus::Invalid;
            return self.status;
        };
        self.status = match tokio::time::timeout(self.timeout, page_view).await {
            Ok(Ok(())) => ChallengeStatus::Valid,
            _ => {
                info!(token = %self.token, "oob-01 page view never arrived");
                ChallengeStatus::Invalid
            }
        };
        self.status
    }

    fn to_json(&self) -> Value {
        serde_json::json!({
            "type": self.kind(),
            "status": self.status,
            "token": self.token,
            "href": self.signals.href_for(&self.token),
        })
    }
}

/// Client-side responder: performs the page view
pub struct OobValidation;

#[async_trait]
impl ValidationResponder for OobValidation {
    fn kind(&self) -> &'static str {
        "oob-01"
    }

    fn make_response(&self, _key_authorization: &str) -> Value {
        serde_json::json!({"type": self.kind()})
    }

    async fn respond(
        &self,
        _name: &str,
        challenge: &Value,
        _response: &Value,
    ) -> Result<ValidationListener> {
        let href = challenge
            .get("href")
            .and_then(Value::as_str)
            .ok_or_else(|| AcmeError::protocol("oob challenge has no href"))?;
        debug!(%href, "performing oob-01 page view");
        let response = reqwest::get(href)
            .await
            .map_err(|e| AcmeError::transport(format!("page view failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AcmeError::validation(
                "oob-01",
                &format!("page view returned HTTP {}", response.status()),
            ));
        }
        Ok(ValidationListener::ready())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_page_view_before_update_verifies() {
        let signals = OobSignals::new_shared();
        let mut challenge = OobChallenge::new("print", signals.clone(), Duration::from_secs(1));
        assert!(signals.signal(challenge.token()));

        let response = serde_json::json!({"type": "oob-01"});
        assert_eq!(challenge.update(&response).await, ChallengeStatus::Valid);
    }

    #[tokio::test]
    async fn test_no_page_view_times_out_invalid() {
        let signals = OobSignals::new_shared();
        let mut challenge =
            OobChallenge::new("print", signals, Duration::from_millis(50));
        let response = serde_json::json!({"type": "oob-01"});
        assert_eq!(challenge.update(&response).await, ChallengeStatus::Invalid);
    }

    #[tokio::test]
    async fn test_wrong_type_rejected_without_waiting() {
        let signals = OobSignals::new_shared();
        let mut challenge =
            OobChallenge::new("print", signals, Duration::from_secs(30));
        let response = serde_json::json!({"type": "http-01"});
        assert_eq!(challenge.update(&response).await, ChallengeStatus::Invalid);
    }

    #[test]
    fn test_signal_unknown_token() {
        let signals = OobSignals::new_shared();
        assert!(!signals.signal("unknown"));
    }

    #[test]
    fn test_href_uses_base_url() {
        let signals = OobSignals::new_shared();
        signals.set_base_url("https://ca.example/acme");
        let challenge = OobChallenge::new("print", signals, Duration::from_secs(1));
        let view = challenge.to_json();
        let href = view["href"].as_str().unwrap();
        assert!(href.starts_with("https://ca.example/acme/oob/"));
    }
}
