/// TLS-SNI identifier validation
///
/// The verifier opens a TLS connection to the applicant with a synthetic SNI
/// derived from the token and checks that the presented certificate carries
/// both derived `.acme.invalid` names in its SAN extension. The responder
/// serves a self-signed certificate with exactly those names.
use super::{
    key_authorization, new_token, response_matches, ChallengeVerifier, ProbeConfig,
    ValidationListener, ValidationResponder,
};
use crate::crypto::hash::sha256_hex;
use crate::error::{AcmeError, Result};
use crate::pki::cert_san_names;
use crate::types::ChallengeStatus;
use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Derive one `.acme.invalid` SAN from a digest input
pub fn sni_name(input: &str) -> String {
    let digest = sha256_hex(input.as_bytes());
    format!("{}.{}.acme.invalid", &digest[..32], &digest[32..64])
}

/// Server-side verifier
pub struct TlsSni02Challenge {
    name: String,
    status: ChallengeStatus,
    token: String,
    key_auth: String,
    san_a: String,
    san_b: String,
    probe: ProbeConfig,
}

impl TlsSni02Challenge {
    pub fn new(name: &str, thumbprint: &str, probe: ProbeConfig) -> Self {
        let token = new_token();
        let key_auth = key_authorization(&token, thumbprint);
        let san_a = sni_name(&token);
        let san_b = sni_name(&key_auth);
        Self {
            name: name.to_string(),
            status: ChallengeStatus::Pending,
            token,
            key_auth,
            san_a,
            san_b,
            probe,
        }
    }

    async fn probe_applicant(&self) -> Result<()> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let host = self.probe.target_host(&self.name).to_string();
        debug!(host = %host, port = self.probe.tls_port, sni = %self.san_a, "tls-sni-02 probe");
        let tcp = tokio::time::timeout(
            self.probe.timeout,
            TcpStream::connect((host.as_str(), self.probe.tls_port)),
        )
        .await
        .map_err(|_| AcmeError::timeout("tls-sni-02 connect"))?
        .map_err(|e| AcmeError::transport(format!("tls-sni-02 connect: {}", e)))?;

        let server_name = ServerName::try_from(self.san_a.clone())
            .map_err(|_| AcmeError::validation("tls-sni-02", "derived SNI is not a valid name"))?;
        let tls = tokio::time::timeout(self.probe.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| AcmeError::timeout("tls-sni-02 handshake"))?
            .map_err(|e| AcmeError::validation("tls-sni-02", &format!("handshake: {}", e)))?;

        let (_, connection) = tls.get_ref();
        let peer = connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| AcmeError::validation("tls-sni-02", "no certificate presented"))?;
        let sans = cert_san_names(peer.as_ref())?;
        if sans.iter().any(|n| n == &self.san_a) && sans.iter().any(|n| n == &self.san_b) {
            Ok(())
        } else {
            Err(AcmeError::validation(
                "tls-sni-02",
                &format!("certificate SANs {:?} lack the derived names", sans),
            ))
        }
    }
}

#[async_trait]
impl ChallengeVerifier for TlsSni02Challenge {
    fn kind(&self) -> &'static str {
        "tls-sni-02"
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
                info!(name = %self.name, error = %e, "tls-sni-02 validation failed");
                ChallengeStatus::Invalid
            }
        };
        self.status
    }
}

/// Certificate verifier that accepts anything; the probe checks SANs itself
/// and the responder's certificate is self-signed by design.
#[derive(Debug)]
struct AcceptAnyServerCert(WebPkiSupportedAlgorithms);

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self(
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms,
        )
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// Client-side responder
pub struct TlsSni02Validation {
    listen_port: u16,
}

impl TlsSni02Validation {
    /// Responder listening on the given port (443 in real deployments)
    pub fn new(listen_port: u16) -> Self {
        Self { listen_port }
    }

    fn responder_config(san_a: &str, san_b: &str) -> Result<rustls::ServerConfig> {
        let key = KeyPair::generate()
            .map_err(|e| AcmeError::crypto(format!("responder key generation: {}", e)))?;
        let mut params =
            CertificateParams::new(vec![san_a.to_string(), san_b.to_string()])
                .map_err(|e| AcmeError::crypto(format!("responder params: {}", e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "tls-sni-responder.acme.invalid");
        params.distinguished_name = dn;
        let cert = params
            .self_signed(&key)
            .map_err(|e| AcmeError::crypto(format!("responder certificate: {}", e)))?;

        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![cert.der().clone()],
                PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
            )
            .map_err(|e| AcmeError::crypto(format!("responder TLS config: {}", e)))
    }
}

#[async_trait]
impl ValidationResponder for TlsSni02Validation {
    fn kind(&self) -> &'static str {
        "tls-sni-02"
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
            .ok_or_else(|| AcmeError::protocol("challenge has no token"))?;
        let key_auth = response
            .get("keyAuthorization")
            .and_then(Value::as_str)
            .ok_or_else(|| AcmeError::protocol("response has no keyAuthorization"))?;
        let san_a = sni_name(token);
        let san_b = sni_name(key_auth);

        let config = Self::responder_config(&san_a, &san_b)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .map_err(|e| AcmeError::transport(format!("tls-sni-02 listener bind: {}", e)))?;
        debug!(port = self.listen_port, sni = %san_a, "tls-sni-02 responder listening");

        let (tx, rx) = oneshot::channel();
        let served = Arc::new(Mutex::new(Some(tx)));
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                match acceptor.accept(stream).await {
                    Ok(_) => {
                        if let Ok(mut guard) = served.lock() {
                            if let Some(tx) = guard.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Err(e) => debug!(error = %e, "tls-sni-02 responder handshake failed"),
                }
            }
        });

        Ok(ValidationListener::new(rx, move || handle.abort()))
    }
}
