/// Client-side transport: nonce reservoir, signed POSTs, retry and polling
use crate::config::ClientConfig;
use crate::crypto::keypair::AccountKey;
use crate::error::{AcmeError, Result};
use crate::protocol::jws;
use crate::protocol::problem::Problem;
use crate::protocol::{JOSE_CONTENT_TYPE, REPLAY_NONCE_HEADER};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A response with everything the protocol layers look at
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Response body as JSON
    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| AcmeError::protocol(format!("response is not JSON: {}", e)))
    }

    /// Problem document, when the body carries one
    pub fn problem(&self) -> Option<Problem> {
        serde_json::from_slice(&self.body).ok()
    }

    /// A named header as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP plumbing shared by every client operation
pub struct ClientTransport {
    http: reqwest::Client,
    config: ClientConfig,
    nonces: Mutex<VecDeque<String>>,
}

impl ClientTransport {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AcmeError::transport(format!("client construction failed: {}", e)))?;
        Ok(Self {
            http,
            config,
            nonces: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Refuse plain-HTTP servers unless explicitly allowed
    fn check_url(&self, url: &str) -> Result<()> {
        if url.starts_with("https://") {
            return Ok(());
        }
        if self.config.allow_insecure && url.starts_with("http://") {
            return Ok(());
        }
        Err(AcmeError::transport(format!(
            "refusing non-HTTPS URL: {}",
            url
        )))
    }

    async fn remember_nonce(&self, headers: &HeaderMap) {
        if let Some(nonce) = headers
            .get(REPLAY_NONCE_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.nonces.lock().await.push_back(nonce.to_string());
        }
    }

    /// Pop a nonce, issuing a preflight HEAD only when the reservoir is empty
    pub async fn take_nonce(&self) -> Result<String> {
        if let Some(nonce) = self.nonces.lock().await.pop_front() {
            return Ok(nonce);
        }
        let url = &self.config.directory_url;
        self.check_url(url)?;
        debug!(%url, "nonce reservoir empty, issuing HEAD");
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|e| AcmeError::transport(format!("HEAD failed: {}", e)))?;
        response
            .headers()
            .get(REPLAY_NONCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::protocol("no Replay-Nonce header on HEAD response"))
    }

    /// GET returning JSON
    pub async fn get_json(&self, url: &str) -> Result<(u16, HeaderMap, Value)> {
        let (status, headers, body) = self.get_bytes(url).await?;
        let value = serde_json::from_slice(&body)
            .map_err(|e| AcmeError::protocol(format!("response is not JSON: {}", e)))?;
        Ok((status, headers, value))
    }

    /// GET returning raw bytes (certificate transport)
    pub async fn get_bytes(&self, url: &str) -> Result<(u16, HeaderMap, Vec<u8>)> {
        self.check_url(url)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AcmeError::transport(format!("GET {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        self.remember_nonce(&headers).await;
        let body = response
            .bytes()
            .await
            .map_err(|e| AcmeError::transport(format!("GET {} body: {}", url, e)))?
            .to_vec();
        Ok((status, headers, body))
    }

    /// Sign `payload` for `url` and POST it, retrying once on a rate limit
    pub async fn post_signed(
        &self,
        key: &AccountKey,
        url: &str,
        payload: &Value,
    ) -> Result<TransportResponse> {
        let response = self.post_once(key, url, payload).await?;
        if response.status == 403 {
            if let Some(problem) = response.problem() {
                if problem.is_kind("rateLimited") {
                    let delay =
                        retry_after_delay(&response.headers, self.config.retry_fallback());
                    warn!(?delay, %url, "rate limited, retrying once");
                    tokio::time::sleep(delay).await;
                    return self.post_once(key, url, payload).await;
                }
            }
        }
        Ok(response)
    }

    async fn post_once(
        &self,
        key: &AccountKey,
        url: &str,
        payload: &Value,
    ) -> Result<TransportResponse> {
        self.check_url(url)?;
        let nonce = self.take_nonce().await?;
        let jws = jws::sign(key, payload, &nonce, url)?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, JOSE_CONTENT_TYPE)
            .body(jws.to_string())
            .send()
            .await
            .map_err(|e| AcmeError::transport(format!("POST {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        self.remember_nonce(&headers).await;
        let body = response
            .bytes()
            .await
            .map_err(|e| AcmeError::transport(format!("POST {} body: {}", url, e)))?
            .to_vec();
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }

    /// Re-fetch `url` until `done` accepts the JSON or attempts run out
    pub async fn poll<F>(
        &self,
        url: &str,
        attempts: usize,
        interval: Duration,
        done: F,
    ) -> Result<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let mut last = Value::Null;
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            let (status, _, value) = self.get_json(url).await?;
            if status == StatusCode::OK.as_u16() && done(&value) {
                return Ok(value);
            }
            last = value;
        }
        Err(AcmeError::timeout(format!(
            "condition not reached after {} polls of {}; last state: {}",
            attempts, url, last
        )))
    }
}

/// Delay from a Retry-After header: integer seconds or an HTTP-date.
/// Invalid or already-past values fall back to the given default.
pub fn retry_after_delay(headers: &HeaderMap, fallback: Duration) -> Duration {
    let Some(value) = headers.get("Retry-After").and_then(|v| v.to_str().ok()) else {
        return fallback;
    };
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Duration::from_secs(secs);
    }
    // HTTP-dates use "GMT" where RFC 2822 writes a numeric zone
    let rewritten = value.trim().replace("GMT", "+0000");
    if let Ok(when) = OffsetDateTime::parse(&rewritten, &Rfc2822) {
        let delta = when - OffsetDateTime::now_utc();
        if delta > time::Duration::ZERO {
            return Duration::from_secs(delta.whole_seconds().max(1) as u64);
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with_retry(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_retry_after_integer_seconds() {
        let headers = headers_with_retry("3");
        assert_eq!(
            retry_after_delay(&headers, Duration::from_millis(500)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_retry_after_http_date() {
        let future = OffsetDateTime::now_utc() + time::Duration::seconds(90);
        let formatted = future.format(&Rfc2822).unwrap().replace("+0000", "GMT");
        let headers = headers_with_retry(&formatted);
        let delay = retry_after_delay(&headers, Duration::from_millis(500));
        assert!(delay >= Duration::from_secs(85) && delay <= Duration::from_secs(95));
    }

    #[test]
    fn test_retry_after_garbage_and_past_fall_back() {
        let fallback = Duration::from_millis(500);
        assert_eq!(
            retry_after_delay(&headers_with_retry("soon"), fallback),
            fallback
        );
        let past = OffsetDateTime::now_utc() - time::Duration::hours(1);
        let formatted = past.format(&Rfc2822).unwrap().replace("+0000", "GMT");
        assert_eq!(
            retry_after_delay(&headers_with_retry(&formatted), fallback),
            fallback
        );
        assert_eq!(retry_after_delay(&HeaderMap::new(), fallback), fallback);
    }

    #[test]
    fn test_insecure_urls_refused_by_default() {
        let transport =
            ClientTransport::new(ClientConfig::new("https://ca.example/acme/directory")).unwrap();
        assert!(transport.check_url("https://ca.example/acme/new-reg").is_ok());
        assert!(transport.check_url("http://ca.example/acme/new-reg").is_err());

        let mut config = ClientConfig::new("http://127.0.0.1:4000/acme/directory");
        config.allow_insecure = true;
        let transport = ClientTransport::new(config).unwrap();
        assert!(transport.check_url("http://127.0.0.1:4000/acme/new-reg").is_ok());
    }
}
