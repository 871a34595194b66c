/// Deterministic challenge that verifies without probing
///
/// Used to exercise the full issuance pipeline where no applicant
/// infrastructure exists: the response is checked against the expected key
/// authorization and the challenge completes immediately.
use super::{
    key_authorization, new_token, response_matches, ChallengeVerifier, ValidationListener,
    ValidationResponder,
};
use crate::error::Result;
use crate::types::ChallengeStatus;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Server-side verifier
pub struct AutoChallenge {
    status: ChallengeStatus,
    token: String,
    key_auth: String,
}

impl AutoChallenge {
    pub fn new(thumbprint: &str) -> Self {
        let token = new_token();
        let key_auth = key_authorization(&token, thumbprint);
        Self {
            status: ChallengeStatus::Pending,
            token,
            key_auth,
        }
    }
}

#[async_trait]
impl ChallengeVerifier for AutoChallenge {
    fn kind(&self) -> &'static str {
        "auto"
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
        self.status = if response_matches(response, self.kind(), Some(&self.key_auth)) {
            ChallengeStatus::Valid
        } else {
            debug!("auto challenge response mismatch");
            ChallengeStatus::Invalid
        };
        self.status
    }
}

/// Client-side responder; there is nothing to listen for
pub struct AutoValidation;

#[async_trait]
impl ValidationResponder for AutoValidation {
    fn kind(&self) -> &'static str {
        "auto"
    }

    async fn respond(
        &self,
        _name: &str,
        _challenge: &Value,
        _response: &Value,
    ) -> Result<ValidationListener> {
        Ok(ValidationListener::ready())
    }
}
