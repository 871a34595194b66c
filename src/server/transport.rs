/// Server-side transport: scheme gate, nonce attachment, rate limiting and
/// JWS verification
///
/// Every request passes the gates in order; POST bodies are then verified
/// per-handler so the bound URL can be checked against the exact route.
use super::ServerState;
use crate::error::Result;
use crate::protocol::jwk::Jwk;
use crate::protocol::jws::{self, ProtectedHeader};
use crate::protocol::problem::Problem;
use crate::protocol::REPLAY_NONCE_HEADER;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Sliding window over the timestamps of admitted POSTs
#[derive(Debug)]
pub struct RateWindow {
    capacity: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            stamps: VecDeque::new(),
        }
    }

    /// Admit a POST now, or return the seconds until the oldest slot frees
    pub fn try_admit(&mut self) -> std::result::Result<(), u64> {
        let now = Instant::now();
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        if self.stamps.len() >= self.capacity {
            let oldest = self.stamps.front().copied().unwrap_or(now);
            let remaining = self.window.saturating_sub(now.duration_since(oldest));
            // Round up: a client sleeping exactly this long must find a slot
            let mut secs = remaining.as_secs();
            if remaining.subsec_nanos() > 0 {
                secs += 1;
            }
            return Err(secs.max(1));
        }
        self.stamps.push_back(now);
        Ok(())
    }
}

/// The ordered request gates: scheme, rate limit, then a fresh `Replay-Nonce`
/// on whatever response goes out.
pub async fn transport_gate(
    State(state): State<ServerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = gated(&state, request, next).await;
    let nonce = {
        let mut nonces = state.nonces.lock().expect("nonce source");
        nonces.next()
    };
    if let Ok(value) = HeaderValue::from_str(&nonce) {
        response.headers_mut().insert(REPLAY_NONCE_HEADER, value);
    }
    response
}

async fn gated(state: &ServerState, request: Request<Body>, next: Next) -> Response {
    if state.config.require_https && !request_is_https(&request, state) {
        warn!("rejected non-HTTPS request");
        return Problem::malformed("HTTPS is required")
            .with_status(500)
            .into_response();
    }

    if request.method() == Method::POST {
        let admitted = {
            let mut window = state.rate.lock().expect("rate window");
            window.try_admit()
        };
        if let Err(retry_after) = admitted {
            debug!(retry_after, "rate limit window is full");
            let mut response = Problem::rate_limited("too many requests").into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
            return response;
        }
    }

    next.run(request).await
}

fn request_is_https(request: &Request<Body>, state: &ServerState) -> bool {
    if let Some(forwarded) = request
        .headers()
        .get("X-Forwarded-Proto")
        .and_then(|v| v.to_str().ok())
    {
        return forwarded.eq_ignore_ascii_case("https");
    }
    if let Some(scheme) = request.uri().scheme_str() {
        return scheme.eq_ignore_ascii_case("https");
    }
    // No scheme on the wire; fall back to how the engine itself is addressed
    state.config.base_url().starts_with("https://")
}

/// Identity and payload attached to a verified POST
#[derive(Debug, Clone)]
pub struct PostContext {
    pub jwk: Jwk,
    pub thumbprint: String,
    pub header: ProtectedHeader,
    pub payload: Value,
}

/// Verify a POST body: JWS signature, nonce consumption, then URL binding.
/// Any failure is a 400 `malformed` problem.
pub fn verify_post(
    state: &ServerState,
    expected_url: &str,
    body: &[u8],
) -> std::result::Result<PostContext, Problem> {
    let jws_value: Value = serde_json::from_slice(body)
        .map_err(|_| Problem::malformed("request body is not JSON"))?;
    let verified = jws::verify(&jws_value)
        .map_err(|e| Problem::malformed(format!("JWS verification failed: {}", e)))?;

    let nonce_ok = {
        let mut nonces = state.nonces.lock().expect("nonce source");
        nonces.use_nonce(&verified.header.nonce)
    };
    if !nonce_ok {
        return Err(Problem::malformed(format!(
            "invalid nonce: {}",
            verified.header.nonce
        )));
    }

    // Compare as parsed URLs so equivalent spellings (default ports, case in
    // the authority) bind to the same resource
    let bound = Url::parse(&verified.header.url);
    let expected = Url::parse(expected_url);
    if !matches!((&bound, &expected), (Ok(bound), Ok(expected)) if bound == expected) {
        return Err(Problem::malformed(format!(
            "request URL mismatch: signed for {}, received at {}",
            verified.header.url, expected_url
        )));
    }

    Ok(PostContext {
        thumbprint: verified.jwk.thumbprint(),
        jwk: verified.jwk,
        header: verified.header,
        payload: verified.payload,
    })
}

/// Verify the inner JWS of a key-change payload. No nonce is consumed; only
/// presence is required of it.
pub fn verify_inner_jws(payload: &Value) -> Result<jws::VerifiedJws> {
    jws::verify(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_window_admits_until_full() {
        let mut window = RateWindow::new(2, Duration::from_secs(60));
        assert!(window.try_admit().is_ok());
        assert!(window.try_admit().is_ok());
        let retry = window.try_admit().unwrap_err();
        assert!(retry >= 1 && retry <= 60);
    }

    #[test]
    fn test_rate_window_frees_after_window() {
        let mut window = RateWindow::new(1, Duration::from_millis(0));
        assert!(window.try_admit().is_ok());
        // Zero-length window: the slot has already expired
        assert!(window.try_admit().is_ok());
    }
}
