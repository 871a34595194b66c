//! ACME client core
//!
//! Drives the full requester side of the protocol: registration and account
//! lifecycle, application submission, authorization fulfilment through the
//! registered validation responders, polling, certificate retrieval and
//! revocation.

pub mod transport;

use crate::challenge::{key_authorization, ValidationRegistry};
use crate::config::ClientConfig;
use crate::crypto::hash::b64url;
use crate::crypto::keypair::AccountKey;
use crate::error::{AcmeError, Result};
use crate::pki;
use crate::protocol::directory::Directory;
use crate::protocol::jwk::Jwk;
use crate::protocol::jws;
use serde_json::{json, Value};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};
use transport::{ClientTransport, TransportResponse};

/// Upper bound on waiting for a validation listener to be served
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// An issued certificate with where it came from
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub url: String,
    pub der: Vec<u8>,
}

type AgreementCallback = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// The ACME client engine
pub struct AcmeClient {
    transport: ClientTransport,
    key: std::sync::Mutex<AccountKey>,
    validations: ValidationRegistry,
    directory: tokio::sync::Mutex<Option<Directory>>,
    registration_url: std::sync::Mutex<Option<String>>,
    agreement_callback: Option<AgreementCallback>,
}

impl AcmeClient {
    /// Client for the given directory, signing with `key`
    pub fn new(config: ClientConfig, key: AccountKey) -> Result<Self> {
        Ok(Self {
            transport: ClientTransport::new(config)?,
            key: std::sync::Mutex::new(key),
            validations: ValidationRegistry::new(),
            directory: tokio::sync::Mutex::new(None),
            registration_url: std::sync::Mutex::new(None),
            agreement_callback: None,
        })
    }

    /// Add a validation responder; earlier registrations are preferred
    pub fn with_validation(
        mut self,
        responder: impl crate::challenge::ValidationResponder + 'static,
    ) -> Self {
        self.validations.register(responder);
        self
    }

    /// Decide whether to agree to a terms-of-service URL during registration
    pub fn with_agreement_callback(
        mut self,
        callback: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.agreement_callback = Some(Box::new(callback));
        self
    }

    fn key(&self) -> AccountKey {
        self.key.lock().expect("account key").clone()
    }

    /// The account key's public JWK thumbprint
    pub fn thumbprint(&self) -> String {
        self.key.lock().expect("account key").thumbprint()
    }

    /// The registration URL captured at registration time
    pub fn registration_url(&self) -> Option<String> {
        self.registration_url.lock().expect("registration url").clone()
    }

    /// Fetch and cache the directory
    pub async fn directory(&self) -> Result<Directory> {
        let mut cached = self.directory.lock().await;
        if let Some(directory) = cached.as_ref() {
            return Ok(directory.clone());
        }
        let url = self.transport.config().directory_url.clone();
        let (status, _, value) = self.transport.get_json(&url).await?;
        if status != 200 {
            return Err(AcmeError::protocol(format!(
                "directory fetch returned HTTP {}",
                status
            )));
        }
        let directory: Directory = serde_json::from_value(value)
            .map_err(|e| AcmeError::protocol(format!("directory does not parse: {}", e)))?;
        *cached = Some(directory.clone());
        Ok(directory)
    }

    /// Register the account key, echo-checking the server's answer.
    ///
    /// When the server links a terms-of-service document and the agreement
    /// callback accepts it, the agreement is posted back to the new
    /// registration.
    pub async fn register(&self, contact: &[String]) -> Result<Value> {
        let directory = self.directory().await?;
        let key = self.key();
        let payload = json!({ "contact": contact });
        let response = self
            .transport
            .post_signed(&key, &directory.new_reg, &payload)
            .await?;
        if response.status != 201 {
            return Err(response_error("registration", &response));
        }
        let body = response.json()?;

        let returned_key: Jwk = serde_json::from_value(body["key"].clone())
            .map_err(|_| AcmeError::protocol("registration echoes no key"))?;
        if returned_key != key.public_jwk() {
            return Err(AcmeError::protocol(
                "registration echoes a different account key",
            ));
        }
        if body["contact"] != json!(contact) {
            return Err(AcmeError::protocol("registration echoes different contacts"));
        }

        let location = response
            .header("location")
            .ok_or_else(|| AcmeError::protocol("registration carries no Location"))?
            .to_string();
        info!(%location, "account registered");
        *self.registration_url.lock().expect("registration url") = Some(location.clone());

        if let (Some(terms), Some(callback)) =
            (terms_of_service_link(&response), self.agreement_callback.as_ref())
        {
            if callback(&terms) {
                debug!(%terms, "agreeing to terms of service");
                let agreement = json!({ "agreement": terms });
                let agreed = self
                    .transport
                    .post_signed(&key, &location, &agreement)
                    .await?;
                if !agreed.is_success() {
                    return Err(response_error("agreement", &agreed));
                }
                return agreed.json();
            }
        }
        Ok(body)
    }

    /// Replace the account key using the dual-signature key-change protocol.
    /// The current key stays in place unless the server accepts the change.
    pub async fn change_key(&self, new_key: AccountKey) -> Result<()> {
        let directory = self.directory().await?;
        let account = self
            .registration_url()
            .ok_or_else(|| AcmeError::protocol("no registration to re-key"))?;
        let old_key = self.key();

        let inner_payload = json!({
            "account": account,
            "oldKey": old_key.thumbprint(),
            "newKey": new_key.thumbprint(),
        });
        let inner_nonce = self.transport.take_nonce().await?;
        let inner = jws::sign(&old_key, &inner_payload, &inner_nonce, &directory.key_change)?;

        let response = self
            .transport
            .post_signed(&new_key, &directory.key_change, &inner)
            .await?;
        if !response.is_success() {
            return Err(response_error("key-change", &response));
        }
        info!("account key replaced");
        *self.key.lock().expect("account key") = new_key;
        Ok(())
    }

    /// Deactivate the account and forget the registration
    pub async fn deactivate_account(&self) -> Result<()> {
        let account = self
            .registration_url()
            .ok_or_else(|| AcmeError::protocol("no registration to deactivate"))?;
        let key = self.key();
        let response = self
            .transport
            .post_signed(&key, &account, &json!({"status": "deactivated"}))
            .await?;
        if !response.is_success() {
            return Err(response_error("deactivation", &response));
        }
        *self.registration_url.lock().expect("registration url") = None;
        info!("account deactivated");
        Ok(())
    }

    /// Apply for a certificate and drive it to issuance.
    ///
    /// Submits the CSR, fulfils every requirement through the registered
    /// validation responders, polls until the application is valid, fetches
    /// the certificate and structurally verifies it against the CSR.
    pub async fn request_certificate(
        &self,
        csr_der: &[u8],
        not_before: Option<OffsetDateTime>,
        not_after: Option<OffsetDateTime>,
    ) -> Result<CertificateBundle> {
        let directory = self.directory().await?;
        let key = self.key();
        let csr_b64 = b64url(csr_der);

        let mut payload = json!({ "csr": csr_b64 });
        if let Some(begin) = not_before {
            payload["notBefore"] = json!(format_date(begin)?);
        }
        if let Some(end) = not_after {
            payload["notAfter"] = json!(format_date(end)?);
        }

        let response = self
            .transport
            .post_signed(&key, &directory.new_app, &payload)
            .await?;
        if response.status != 201 {
            return Err(response_error("application", &response));
        }
        let app = response.json()?;
        validate_application(&app, &csr_b64, not_before, not_after)?;
        let app_url = response
            .header("location")
            .ok_or_else(|| AcmeError::protocol("application carries no Location"))?
            .to_string();
        debug!(%app_url, "application accepted");

        if let Some(cert_url) = app["certificate"].as_str() {
            // Issued immediately; nothing left to validate
            return self
                .fetch_certificate(cert_url, csr_der, not_before, not_after)
                .await;
        }

        let requirements = app["requirements"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for requirement in &requirements {
            if requirement["status"].as_str() == Some("valid") {
                continue;
            }
            let url = requirement["url"]
                .as_str()
                .ok_or_else(|| AcmeError::protocol("requirement has no url"))?;
            match requirement["type"].as_str() {
                Some("authorization") => self.fulfil_authorization(&key, url).await?,
                Some("out-of-band") => self.fulfil_out_of_band(url).await?,
                other => {
                    return Err(AcmeError::protocol(format!(
                        "unsupported requirement type: {:?}",
                        other
                    )))
                }
            }
        }

        let config = self.transport.config();
        let settled = self
            .transport
            .poll(
                &app_url,
                config.issuance_attempts,
                config.poll_interval(),
                |state| {
                    let status = state["status"].as_str().unwrap_or_default();
                    status == "invalid"
                        || (status == "valid" && state["certificate"].is_string())
                },
            )
            .await?;
        if settled["status"].as_str() != Some("valid") {
            return Err(AcmeError::protocol("application failed validation"));
        }
        let cert_url = settled["certificate"]
            .as_str()
            .ok_or_else(|| AcmeError::protocol("valid application carries no certificate"))?;

        self.fetch_certificate(cert_url, csr_der, not_before, not_after)
            .await
    }

    async fn fetch_certificate(
        &self,
        cert_url: &str,
        csr_der: &[u8],
        not_before: Option<OffsetDateTime>,
        not_after: Option<OffsetDateTime>,
    ) -> Result<CertificateBundle> {
        let (status, _, der) = self.transport.get_bytes(cert_url).await?;
        if status != 200 {
            return Err(AcmeError::protocol(format!(
                "certificate fetch returned HTTP {}",
                status
            )));
        }
        pki::check_cert_match(&der, csr_der, not_before, not_after)?;
        info!(%cert_url, "certificate retrieved and verified");
        Ok(CertificateBundle {
            url: cert_url.to_string(),
            der,
        })
    }

    async fn fulfil_authorization(&self, key: &AccountKey, authz_url: &str) -> Result<()> {
        let (status, _, authz) = self.transport.get_json(authz_url).await?;
        if status != 200 {
            return Err(AcmeError::protocol(format!(
                "authorization fetch returned HTTP {}",
                status
            )));
        }
        validate_authorization(&authz)?;
        if authz["status"].as_str() == Some("valid") {
            return Ok(());
        }

        let name = authz["identifier"]["value"]
            .as_str()
            .ok_or_else(|| AcmeError::protocol("authorization names no identifier"))?
            .to_string();
        let challenges = authz["challenges"]
            .as_array()
            .ok_or_else(|| AcmeError::protocol("authorization has no challenges"))?;

        for index in self.choose_challenges(&authz, challenges)? {
            let challenge = &challenges[index];
            if challenge["status"].as_str() == Some("valid") {
                continue;
            }
            let kind = challenge["type"]
                .as_str()
                .ok_or_else(|| AcmeError::protocol("challenge has no type"))?;
            let responder = self
                .validations
                .get(kind)
                .ok_or_else(|| AcmeError::protocol(format!("no responder for {}", kind)))?;

            let token = challenge["token"]
                .as_str()
                .ok_or_else(|| AcmeError::protocol("challenge has no token"))?;
            let key_auth = key_authorization(token, &key.thumbprint());
            let response = responder.make_response(&key_auth);

            // Listener first, so the server's probe finds it when the POST
            // lands.
            let listener = responder.respond(&name, challenge, &response).await?;
            let uri = challenge["uri"]
                .as_str()
                .ok_or_else(|| AcmeError::protocol("challenge has no uri"))?;
            debug!(%uri, kind, "responding to challenge");
            let posted = self.transport.post_signed(key, uri, &response).await?;
            if !posted.is_success() {
                return Err(response_error("challenge response", &posted));
            }
            listener.served(VALIDATION_TIMEOUT).await?;

            // Short settle poll; the verifier usually finishes inside the POST
            let config = self.transport.config();
            let settled = self
                .transport
                .poll(
                    authz_url,
                    config.fetch_attempts,
                    config.poll_interval(),
                    |state| {
                        !matches!(state["status"].as_str(), Some("pending") | None)
                    },
                )
                .await?;
            if settled["status"].as_str() != Some("valid") {
                return Err(AcmeError::validation(
                    kind,
                    &format!("authorization for {} failed", name),
                ));
            }
            break;
        }
        Ok(())
    }

    /// Indices of the challenges to run: the first supported combination if
    /// the authorization offers combinations, the first supported challenge
    /// otherwise.
    fn choose_challenges(&self, authz: &Value, challenges: &[Value]) -> Result<Vec<usize>> {
        let kind_of = |index: usize| -> Option<&str> {
            challenges.get(index).and_then(|c| c["type"].as_str())
        };
        if let Some(combinations) = authz["combinations"].as_array() {
            for combination in combinations {
                let indices: Vec<usize> = combination
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_u64)
                            .map(|v| v as usize)
                            .collect()
                    })
                    .unwrap_or_default();
                if !indices.is_empty()
                    && indices.iter().all(|&i| {
                        kind_of(i).map(|k| self.validations.get(k).is_some()).unwrap_or(false)
                    })
                {
                    return Ok(indices);
                }
            }
        } else {
            for (index, challenge) in challenges.iter().enumerate() {
                if let Some(kind) = challenge["type"].as_str() {
                    if self.validations.get(kind).is_some() {
                        return Ok(vec![index]);
                    }
                }
            }
        }
        Err(AcmeError::protocol(
            "no challenge combination is locally supported",
        ))
    }

    async fn fulfil_out_of_band(&self, url: &str) -> Result<()> {
        debug!(%url, "opening out-of-band URL");
        let (status, _, _) = self.transport.get_bytes(url).await?;
        if status != 200 {
            return Err(AcmeError::protocol(format!(
                "out-of-band URL returned HTTP {}",
                status
            )));
        }
        Ok(())
    }

    /// Deactivate an authorization after confirming its shape
    pub async fn deactivate_authorization(&self, authz_url: &str) -> Result<()> {
        let (status, _, authz) = self.transport.get_json(authz_url).await?;
        if status != 200 {
            return Err(AcmeError::protocol(format!(
                "authorization fetch returned HTTP {}",
                status
            )));
        }
        validate_authorization(&authz)?;

        let key = self.key();
        let response = self
            .transport
            .post_signed(&key, authz_url, &json!({"status": "deactivated"}))
            .await?;
        if !response.is_success() {
            return Err(response_error("authorization deactivation", &response));
        }
        Ok(())
    }

    /// Revoke a certificate by value. `reason`, when given, is the numeric
    /// CRLReason code.
    pub async fn revoke_certificate(&self, cert_b64: &str, reason: Option<i64>) -> Result<()> {
        let directory = self.directory().await?;
        let key = self.key();
        let mut payload = json!({ "certificate": cert_b64 });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        let response = self
            .transport
            .post_signed(&key, &directory.revoke_cert, &payload)
            .await?;
        if !response.is_success() {
            return Err(response_error("revocation", &response));
        }
        info!("certificate revoked");
        Ok(())
    }
}

fn format_date(odt: OffsetDateTime) -> Result<String> {
    odt.replace_nanosecond(0)
        .unwrap_or(odt)
        .format(&Rfc3339)
        .map_err(|e| AcmeError::invalid_input(format!("unformattable date: {}", e)))
}

fn response_error(operation: &str, response: &TransportResponse) -> AcmeError {
    match response.problem() {
        Some(problem) => AcmeError::protocol(format!(
            "{} failed: HTTP {} {} ({})",
            operation, response.status, problem.kind(), problem.detail
        )),
        None => AcmeError::protocol(format!("{} failed: HTTP {}", operation, response.status)),
    }
}

/// The Link header's terms-of-service target, if present
fn terms_of_service_link(response: &TransportResponse) -> Option<String> {
    for value in response.headers.get_all("link") {
        let Ok(text) = value.to_str() else { continue };
        for part in text.split(',') {
            if part.contains("rel=\"terms-of-service\"") {
                let start = part.find('<')?;
                let end = part.find('>')?;
                if start < end {
                    return Some(part[start + 1..end].to_string());
                }
            }
        }
    }
    None
}

/// Check an application as echoed by the server: CSR verbatim, dates to the
/// second, and a requirements list
fn validate_application(
    app: &Value,
    csr_b64: &str,
    not_before: Option<OffsetDateTime>,
    not_after: Option<OffsetDateTime>,
) -> Result<()> {
    if app["status"].as_str().is_none() {
        return Err(AcmeError::protocol("application has no status"));
    }
    if app["csr"].as_str() != Some(csr_b64) {
        return Err(AcmeError::protocol("application does not echo the CSR"));
    }
    if !app["requirements"].is_array() {
        return Err(AcmeError::protocol("application has no requirements"));
    }
    for (field, expected) in [("notBefore", not_before), ("notAfter", not_after)] {
        if let Some(expected) = expected {
            let echoed = app[field]
                .as_str()
                .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
                .ok_or_else(|| {
                    AcmeError::protocol(format!("application does not echo {}", field))
                })?;
            if echoed.unix_timestamp() != expected.unix_timestamp() {
                return Err(AcmeError::protocol(format!(
                    "application echoes a different {}",
                    field
                )));
            }
        }
    }
    Ok(())
}

/// Check an authorization's wire shape before acting on it
fn validate_authorization(authz: &Value) -> Result<()> {
    if authz["status"].as_str().is_none() {
        return Err(AcmeError::protocol("authorization has no status"));
    }
    if authz["identifier"]["type"].as_str() != Some("dns") {
        return Err(AcmeError::protocol("authorization identifier is not dns"));
    }
    if authz["identifier"]["value"].as_str().is_none() {
        return Err(AcmeError::protocol("authorization identifier has no value"));
    }
    if !authz["challenges"].is_array() {
        return Err(AcmeError::protocol("authorization has no challenges"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn response_with_link(link: &str) -> TransportResponse {
        let mut headers = HeaderMap::new();
        headers.insert("link", HeaderValue::from_str(link).unwrap());
        TransportResponse {
            status: 201,
            headers,
            body: Vec::new(),
        }
    }

    #[test]
    fn test_terms_of_service_link() {
        let response =
            response_with_link("<https://ca.example/terms>;rel=\"terms-of-service\"");
        assert_eq!(
            terms_of_service_link(&response),
            Some("https://ca.example/terms".to_string())
        );

        let response = response_with_link("<https://ca.example/other>;rel=\"author\"");
        assert_eq!(terms_of_service_link(&response), None);
    }

    #[test]
    fn test_validate_application_echo() {
        let app = json!({
            "status": "pending",
            "csr": "Zm9v",
            "requirements": [],
            "notBefore": "2026-01-01T00:00:00Z",
        });
        let begin = OffsetDateTime::parse("2026-01-01T00:00:00Z", &Rfc3339).unwrap();
        validate_application(&app, "Zm9v", Some(begin), None).unwrap();

        assert!(validate_application(&app, "YmFy", Some(begin), None).is_err());
        let other = begin + time::Duration::seconds(5);
        assert!(validate_application(&app, "Zm9v", Some(other), None).is_err());
    }

    #[test]
    fn test_validate_authorization_shape() {
        let good = json!({
            "status": "pending",
            "identifier": {"type": "dns", "value": "example.com"},
            "challenges": [],
        });
        validate_authorization(&good).unwrap();

        let bad = json!({"status": "pending", "identifier": {"type": "ip", "value": "1.2.3.4"}, "challenges": []});
        assert!(validate_authorization(&bad).is_err());
    }
}
