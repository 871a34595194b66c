/// DNS identifier validation
///
/// The verifier queries `_acme-challenge.{name}` TXT through a TCP resolver
/// and expects the base64url SHA-256 of the key authorization. The responder
/// is a minimal single-record TXT server speaking DNS over TCP.
use super::{
    key_authorization, new_token, response_matches, ChallengeVerifier, ProbeConfig,
    ValidationListener, ValidationResponder,
};
use crate::crypto::hash::sha256_b64url;
use crate::error::{AcmeError, Result};
use crate::types::ChallengeStatus;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Label queried in front of the identifier
pub const CHALLENGE_LABEL: &str = "_acme-challenge";

/// Server-side verifier
pub struct Dns01Challenge {
    name: String,
    status: ChallengeStatus,
    token: String,
    key_auth: String,
    probe: ProbeConfig,
}

impl Dns01Challenge {
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

    /// The record value the applicant must publish
    pub fn expected_record(&self) -> String {
        sha256_b64url(self.key_auth.as_bytes())
    }

    async fn probe_applicant(&self) -> Result<()> {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(self.probe.dns_server, Protocol::Tcp));
        let mut opts = ResolverOpts::default();
        opts.timeout = self.probe.timeout;
        opts.attempts = 1;
        let resolver = TokioAsyncResolver::tokio(config, opts);

        let fqdn = format!("{}.{}.", CHALLENGE_LABEL, self.name);
        debug!(%fqdn, "dns-01 probe");
        let lookup = resolver
            .txt_lookup(fqdn)
            .await
            .map_err(|e| AcmeError::validation("dns-01", &format!("TXT lookup failed: {}", e)))?;

        let expected = self.expected_record();
        for record in lookup.iter() {
            let text: String = record
                .txt_data()
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect();
            if text == expected {
                return Ok(());
            }
        }
        Err(AcmeError::validation(
            "dns-01",
            "no TXT record carries the expected digest",
        ))
    }
}

#[async_trait]
impl ChallengeVerifier for Dns01Challenge {
    fn kind(&self) -> &'static str {
        "dns-01"
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
                info!(name = %self.name, error = %e, "dns-01 validation failed");
                ChallengeStatus::Invalid
            }
        };
        self.status
    }
}

/// Client-side responder: answers exactly one TXT name over DNS-over-TCP
pub struct Dns01Validation {
    listen_port: u16,
}

impl Dns01Validation {
    /// Responder listening on the given port (53 in real deployments)
    pub fn new(listen_port: u16) -> Self {
        Self { listen_port }
    }
}

async fn answer_query(
    stream: &mut tokio::net::TcpStream,
    zone: &str,
    record_value: &str,
) -> Result<bool> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    let request = Message::from_vec(&buf)
        .map_err(|e| AcmeError::protocol(format!("bad DNS query: {}", e)))?;

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);

    let mut answered = false;
    for query in request.queries() {
        response.add_query(query.clone());
        let qname = query.name().to_utf8();
        if query.query_type() == RecordType::TXT
            && qname.trim_end_matches('.').eq_ignore_ascii_case(zone)
        {
            let rdata = RData::TXT(TXT::new(vec![record_value.to_string()]));
            response.add_answer(Record::from_rdata(query.name().clone(), 0, rdata));
            answered = true;
        }
    }
    if !answered {
        response.set_response_code(ResponseCode::NXDomain);
    }

    let bytes = response
        .to_vec()
        .map_err(|e| AcmeError::protocol(format!("DNS response encoding: {}", e)))?;
    stream
        .write_all(&(bytes.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(answered)
}

#[async_trait]
impl ValidationResponder for Dns01Validation {
    fn kind(&self) -> &'static str {
        "dns-01"
    }

    async fn respond(
        &self,
        name: &str,
        _challenge: &Value,
        response: &Value,
    ) -> Result<ValidationListener> {
        let key_auth = response
            .get("keyAuthorization")
            .and_then(Value::as_str)
            .ok_or_else(|| AcmeError::protocol("response has no keyAuthorization"))?;
        let record_value = sha256_b64url(key_auth.as_bytes());
        let zone = format!("{}.{}", CHALLENGE_LABEL, name);

        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .map_err(|e| AcmeError::transport(format!("dns-01 listener bind: {}", e)))?;
        debug!(port = self.listen_port, %zone, "dns-01 responder listening");

        let (tx, rx) = oneshot::channel();
        let served = Arc::new(Mutex::new(Some(tx)));
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                match answer_query(&mut stream, &zone, &record_value).await {
                    Ok(true) => {
                        if let Ok(mut guard) = served.lock() {
                            if let Some(tx) = guard.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(e) => debug!(error = %e, "dns-01 responder query failed"),
                }
            }
        });

        Ok(ValidationListener::new(rx, move || handle.abort()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn loopback_probe(port: u16) -> ProbeConfig {
        ProbeConfig {
            dns_server: SocketAddr::new("127.0.0.1".parse().unwrap(), port),
            timeout: Duration::from_secs(2),
            ..ProbeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_round_trip_against_responder() {
        let port = free_port().await;
        let mut challenge =
            Dns01Challenge::new("app.example.com", "print", loopback_probe(port));
        let responder = Dns01Validation::new(port);
        let response = responder.make_response(challenge.key_authorization());

        let listener = responder
            .respond("app.example.com", &challenge.to_json(), &response)
            .await
            .unwrap();
        assert_eq!(challenge.update(&response).await, ChallengeStatus::Valid);
        listener.served(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_record_turns_invalid() {
        let port = free_port().await;
        let mut challenge =
            Dns01Challenge::new("app.example.com", "print", loopback_probe(port));
        let responder = Dns01Validation::new(port);
        // Respond for a different key authorization: the digest will differ
        let response = responder.make_response("other-token.other-print");
        let _listener = responder
            .respond("app.example.com", &challenge.to_json(), &response)
            .await
            .unwrap();

        let update = serde_json::json!({
            "type": "dns-01",
            "keyAuthorization": challenge.key_authorization(),
        });
        assert_eq!(challenge.update(&update).await, ChallengeStatus::Invalid);
    }

    #[test]
    fn test_expected_record_is_digest_of_key_authorization() {
        let challenge =
            Dns01Challenge::new("app.example.com", "print", ProbeConfig::default());
        assert_eq!(
            challenge.expected_record(),
            sha256_b64url(challenge.key_authorization().as_bytes())
        );
    }
}
