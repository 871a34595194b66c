#![allow(dead_code)]

use acmeforge::challenge::ProbeConfig;
use acmeforge::client::AcmeClient;
use acmeforge::config::{ClientConfig, ServerConfig};
use acmeforge::crypto::hash::b64url;
use acmeforge::crypto::AccountKey;
use acmeforge::pki::CertificateAuthority;
use acmeforge::protocol::jws;
use acmeforge::server::{AcmeServer, ServerState};
use serde_json::Value;
use std::sync::Once;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// An in-process server bound to an ephemeral loopback port
pub struct TestServer {
    pub base_url: String,
    pub directory_url: String,
    pub state: ServerState,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a server over plain HTTP on loopback. The scheme gate is relaxed;
/// the client side opts in with `allow_insecure`.
pub async fn spawn_server(config: ServerConfig) -> TestServer {
    spawn_server_with(config, ProbeConfig::default()).await
}

/// Same, with explicit probe settings for challenge round trips
pub async fn spawn_server_with(mut config: ServerConfig, probe: ProbeConfig) -> TestServer {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    config.host = "127.0.0.1".to_string();
    config.port = addr.port();
    config.require_https = false;

    let server = AcmeServer::new(config, CertificateAuthority::default(), probe);
    let state = server.state().clone();
    let base_url = state.config.base_url();
    let directory_url = format!("{}/directory", base_url);
    let handle = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestServer {
        base_url,
        directory_url,
        state,
        handle,
    }
}

/// Server config with only the deterministic auto challenge enabled
pub fn auto_config() -> ServerConfig {
    ServerConfig {
        challenge_types: vec!["auto".to_string()],
        ..ServerConfig::default()
    }
}

/// A client for the test server that can complete auto challenges
pub fn auto_client(server: &TestServer, key: AccountKey) -> AcmeClient {
    let mut config = ClientConfig::new(&server.directory_url);
    config.allow_insecure = true;
    AcmeClient::new(config, key)
        .expect("client")
        .with_validation(acmeforge::challenge::AutoValidation)
}

/// A CSR whose subject CN is the first name and whose SANs are all names
pub fn csr_for(names: &[&str]) -> Vec<u8> {
    let key = rcgen::KeyPair::generate().expect("csr key");
    csr_with_key(names, &key)
}

/// Same, over a caller-provided key pair
pub fn csr_with_key(names: &[&str], key: &rcgen::KeyPair) -> Vec<u8> {
    let mut params = rcgen::CertificateParams::new(
        names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
    )
    .expect("csr params");
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, names[0]);
    params.distinguished_name = dn;
    params.serialize_request(key).expect("csr").der().to_vec()
}

/// Take a fresh nonce from any response's Replay-Nonce header
pub async fn fresh_nonce(server: &TestServer) -> String {
    let response = reqwest::Client::new()
        .head(&server.directory_url)
        .send()
        .await
        .expect("HEAD directory");
    response
        .headers()
        .get("Replay-Nonce")
        .and_then(|v| v.to_str().ok())
        .expect("Replay-Nonce header")
        .to_string()
}

/// POST a flattened JWS signed for `signed_url` to `target_url`
pub async fn raw_post(
    key: &AccountKey,
    target_url: &str,
    signed_url: &str,
    payload: &Value,
    nonce: &str,
) -> reqwest::Response {
    let body = jws::sign(key, payload, nonce, signed_url).expect("sign");
    reqwest::Client::new()
        .post(target_url)
        .header("Content-Type", "application/jose+json")
        .body(body.to_string())
        .send()
        .await
        .expect("POST")
}

/// base64url of DER bytes, as revocation payloads carry certificates
pub fn cert_b64(der: &[u8]) -> String {
    b64url(der)
}
