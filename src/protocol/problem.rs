/// RFC 7807 problem documents with the ACME error namespace
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// URN prefix for ACME error types
pub const ERROR_URN_PREFIX: &str = "urn:ietf:params:acme:error:";

/// Media type for problem documents
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// A problem document as returned to clients on any request failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// Error type URI
    #[serde(rename = "type")]
    pub problem_type: String,
    /// Human-readable detail
    pub detail: String,
    /// HTTP status the document was sent with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Problem {
    fn new(kind: &str, detail: impl Into<String>, status: u16) -> Self {
        Self {
            problem_type: format!("{}{}", ERROR_URN_PREFIX, kind),
            detail: detail.into(),
            status: Some(status),
        }
    }

    /// Request could not be parsed or violates the protocol
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new("malformed", detail, 400)
    }

    /// Signer does not own the referenced resource
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new("unauthorized", detail, 401)
    }

    /// Too many requests in the window
    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new("rateLimited", detail, 403)
    }

    /// Internal failure, detail deliberately vague
    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new("serverInternal", detail, 500)
    }

    /// Override the HTTP status the document renders with
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// The error kind without its URN prefix
    pub fn kind(&self) -> &str {
        self.problem_type
            .strip_prefix(ERROR_URN_PREFIX)
            .unwrap_or(&self.problem_type)
    }

    /// Whether this document carries the given kind
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind() == kind
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status.unwrap_or(500))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_vec(&self).unwrap_or_default();
        (
            status,
            [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urn_and_kind() {
        let problem = Problem::malformed("bad nonce");
        assert_eq!(problem.problem_type, "urn:ietf:params:acme:error:malformed");
        assert!(problem.is_kind("malformed"));
        assert_eq!(problem.status, Some(400));
    }

    #[test]
    fn test_status_override() {
        let problem = Problem::unauthorized("wrong key").with_status(403);
        assert_eq!(problem.status, Some(403));
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(Problem::rate_limited("slow down")).unwrap();
        assert_eq!(value["type"], "urn:ietf:params:acme:error:rateLimited");
        assert_eq!(value["detail"], "slow down");
    }
}
