/// HTTP identifier validation
///
/// The verifier fetches `/.well-known/acme-challenge/{token}` from the
/// applicant over plain HTTP and compares the body against the key
/// authorization. The responder serves that path from a short-lived axum
/// listener.
use super::{
    key_authorization, new_token, response_matches, ChallengeVerifier, ProbeConfig,
    ValidationListener, ValidationResponder,
};
use crate::error::{AcmeError, Result};
use crate::types::ChallengeStatus;
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Well-known path prefix the probe fetches under
pub const CHALLENGE_PATH: &str = "/.well-known/acme-challenge";

/// Server-side verifier
pub struct Http01Challenge {
    name: String,
    status: ChallengeStatus,
    token: String,
    key_auth: String,
    probe: ProbeConfig,
}

impl Http01Challenge {
    pub fn new(name: &str, thumbprint: &str, probe: ProbeConfig) -> Self {
        let token = new_token();
        let key_auth = key_authorization(&token, thumbprint);
        Self {
            name: name.to_string(),
            status: ChallengeStatus::Pending,
            token,
            key_auth,
            probe,
        }
    }

    async fn probe_applicant(&self) -> Result<()> {
        let url = format!(
            "http://{}:{}{}/{}",
            self.probe.target_host(&self.name),
            self.probe.http_port,
            CHALLENGE_PATH,
            self.token
        );
        debug!(%url, "http-01 probe");
        let client = reqwest::Client::builder()
            .timeout(self.probe.timeout)
            .build()
            .map_err(|e| AcmeError::transport(format!("probe client: {}", e)))?;
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| AcmeError::transport(format!("probe failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AcmeError::validation(
                "http-01",
                &format!("probe returned HTTP {}", response.status()),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| AcmeError::transport(format!("probe body: {}", e)))?;
        if body.trim_end() != self.key_auth {
            return Err(AcmeError::validation(
                "http-01",
                "provisioned key authorization does not match",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ChallengeVerifier for Http01Challenge {
    fn kind(&self) -> &'static str {
        "http-01"
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
        if !response_matches(response, self.kind(), Some(&self.key_auth)) {
            self.status = ChallengeStatus::Invalid;
            return self.status;
        }
        self.status = match self.probe_applicant().await {
            Ok(()) => ChallengeStatus::Valid,
            Err(e) => {
                info!(name = %self.name, error = %e, "http-01 validation failed");
                ChallengeStatus::Invalid
            }
        };
        self.status
    }
}

struct ResponderState {
    token: String,
    key_auth: String,
    served: Mutex<Option<oneshot::Sender<()>>>,
}

async fn serve_key_authorization(
    Path(token): Path<String>,
    State(state): State<Arc<ResponderState>>,
) -> std::result::Result<String, StatusCode> {
    if token != state.token {
        return Err(StatusCode::NOT_FOUND);
    }
    if let Ok(mut guard) = state.served.lock() {
        if let Some(tx) = guard.take() {
            let _ = tx.send(());
        }
    }
    Ok(state.key_auth.clone())
}

/// Client-side responder
pub struct Http01Validation {
    listen_port: u16,
}

impl Http01Validation {
    /// Responder listening on the given port (80 in real deployments)
    pub fn new(listen_port: u16) -> Self {
        Self { listen_port }
    }
}

#[async_trait]
impl ValidationResponder for Http01Validation {
    fn kind(&self) -> &'static str {
        "http-01"
    }

    async fn respond(
        &self,
        _name: &str,
        challenge: &Value,
        response: &Value,
    ) -> Result<ValidationListener> {
        let token = challenge
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| AcmeError::protocol("challenge has no token"))?
            .to_string();
        let key_auth = response
            .get("keyAuthorization")
            .and_then(Value::as_str)
            .ok_or_else(|| AcmeError::protocol("response has no keyAuthorization"))?
            .to_string();

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(ResponderState {
            token,
            key_auth,
            served: Mutex::new(Some(tx)),
        });
        let app = Router::new()
            .route(&format!("{}/:token", CHALLENGE_PATH), get(serve_key_authorization))
            .with_state(state);

        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .map_err(|e| AcmeError::transport(format!("http-01 listener bind: {}", e)))?;
        debug!(port = self.listen_port, "http-01 responder listening");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(ValidationListener::new(rx, move || handle.abort()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback_probe(port: u16) -> ProbeConfig {
        ProbeConfig {
            http_port: port,
            probe_host: Some("127.0.0.1".to_string()),
            timeout: Duration::from_secs(2),
            ..ProbeConfig::default()
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_round_trip_against_responder() {
        let port = free_port().await;
        let mut challenge =
            Http01Challenge::new("app.example.com", "print", loopback_probe(port));
        let responder = Http01Validation::new(port);
        let response = responder.make_response(challenge.key_authorization());
        let wire = challenge.to_json();

        let listener = responder
            .respond("app.example.com", &wire, &response)
            .await
            .unwrap();
        assert_eq!(challenge.update(&response).await, ChallengeStatus::Valid);
        listener.served(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_listener_turns_invalid() {
        let port = free_port().await;
        let mut challenge =
            Http01Challenge::new("app.example.com", "print", loopback_probe(port));
        let response = serde_json::json!({
            "type": "http-01",
            "keyAuthorization": challenge.key_authorization(),
        });
        assert_eq!(challenge.update(&response).await, ChallengeStatus::Invalid);
    }

    #[tokio::test]
    async fn test_mismatched_response_skips_probe() {
        let mut challenge =
            Http01Challenge::new("app.example.com", "print", loopback_probe(1));
        let response = serde_json::json!({"type": "http-01", "keyAuthorization": "wrong"});
        assert_eq!(challenge.update(&response).await, ChallengeStatus::Invalid);
    }
}
