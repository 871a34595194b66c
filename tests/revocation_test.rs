mod common;

use acmeforge::crypto::AccountKey;
use acmeforge::prelude::*;
use common::{auto_client, auto_config, cert_b64, csr_for, csr_with_key, spawn_server};

#[tokio::test]
async fn test_revocation_by_owning_account() -> Result<()> {
    let server = spawn_server(auto_config()).await;
    let client = auto_client(&server, AccountKey::generate()?);
    client
        .register(&["mailto:anonymous@example.com".to_string()])
        .await?;

    let csr = csr_for(&["mine.example.com"]);
    let bundle = client.request_certificate(&csr, None, None).await?;

    client
        .revoke_certificate(&cert_b64(&bundle.der), Some(4))
        .await?;

    let response = reqwest::get(&bundle.url).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response
            .headers()
            .get("Revocation-Reason")
            .and_then(|v| v.to_str().ok()),
        Some("4")
    );
    Ok(())
}

#[tokio::test]
async fn test_revocation_by_san_holder() -> Result<()> {
    let server = spawn_server(auto_config()).await;

    // Account A owns the certificate
    let client_a = auto_client(&server, AccountKey::generate()?);
    client_a
        .register(&["mailto:a@example.com".to_string()])
        .await?;
    let bundle = client_a
        .request_certificate(&csr_for(&["shared.example.com"]), None, None)
        .await?;

    // Account B proves control of every SAN by completing its own
    // authorization for the name
    let client_b = auto_client(&server, AccountKey::generate()?);
    client_b
        .register(&["mailto:b@example.com".to_string()])
        .await?;
    client_b
        .request_certificate(&csr_for(&["shared.example.com"]), None, None)
        .await?;

    client_b
        .revoke_certificate(&cert_b64(&bundle.der), Some(1))
        .await?;

    let response = reqwest::get(&bundle.url).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("Revocation-Reason")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
    Ok(())
}

#[tokio::test]
async fn test_revocation_by_certificate_key_holder() -> Result<()> {
    let server = spawn_server(auto_config()).await;

    // The certificate key doubles as an account key, so possession of it can
    // be proven over the signed transport
    let cert_key = AccountKey::generate()?;
    let rcgen_key = rcgen::KeyPair::try_from(cert_key.to_pkcs8()).expect("shared key");
    let csr = csr_with_key(&["keyed.example.com"], &rcgen_key);

    let owner = auto_client(&server, AccountKey::generate()?);
    owner
        .register(&["mailto:owner@example.com".to_string()])
        .await?;
    let bundle = owner.request_certificate(&csr, None, None).await?;

    // The holder of the certificate key never registers; the proof is the
    // key itself
    let holder = auto_client(&server, cert_key);
    holder
        .revoke_certificate(&cert_b64(&bundle.der), None)
        .await?;

    let response = reqwest::get(&bundle.url).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("Revocation-Reason")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );
    Ok(())
}

#[tokio::test]
async fn test_revocation_by_stranger_refused() -> Result<()> {
    let server = spawn_server(auto_config()).await;

    let owner = auto_client(&server, AccountKey::generate()?);
    owner
        .register(&["mailto:owner@example.com".to_string()])
        .await?;
    let bundle = owner
        .request_certificate(&csr_for(&["private.example.com"]), None, None)
        .await?;

    // A registered account with no claim to the name or the key
    let stranger = auto_client(&server, AccountKey::generate()?);
    stranger
        .register(&["mailto:stranger@example.com".to_string()])
        .await?;
    let outcome = stranger
        .revoke_certificate(&cert_b64(&bundle.der), Some(1))
        .await;
    assert!(outcome.is_err());

    // Still not revoked
    let response = reqwest::get(&bundle.url).await.unwrap();
    assert!(response.headers().get("Revocation-Reason").is_none());
    Ok(())
}

#[tokio::test]
async fn test_revocation_of_unknown_certificate() -> Result<()> {
    let server = spawn_server(auto_config()).await;
    let client = auto_client(&server, AccountKey::generate()?);
    client
        .register(&["mailto:anonymous@example.com".to_string()])
        .await?;

    let outcome = client
        .revoke_certificate(&cert_b64(b"never issued"), None)
        .await;
    assert!(outcome.is_err());
    Ok(())
}

#[tokio::test]
async fn test_revocation_reason_saturates_at_bounds() -> Result<()> {
    let server = spawn_server(auto_config()).await;
    let client = auto_client(&server, AccountKey::generate()?);
    client
        .register(&["mailto:anonymous@example.com".to_string()])
        .await?;
    let bundle = client
        .request_certificate(&csr_for(&["bounds.example.com"]), None, None)
        .await?;

    // A negative code floors at 0
    client
        .revoke_certificate(&cert_b64(&bundle.der), Some(-5))
        .await?;
    let response = reqwest::get(&bundle.url).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("Revocation-Reason")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );

    // An oversized code saturates instead of wrapping modulo 256
    client
        .revoke_certificate(&cert_b64(&bundle.der), Some(300))
        .await?;
    let response = reqwest::get(&bundle.url).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("Revocation-Reason")
            .and_then(|v| v.to_str().ok()),
        Some("255")
    );
    Ok(())
}

#[tokio::test]
async fn test_double_revocation_is_idempotent() -> Result<()> {
    let server = spawn_server(auto_config()).await;
    let client = auto_client(&server, AccountKey::generate()?);
    client
        .register(&["mailto:anonymous@example.com".to_string()])
        .await?;
    let bundle = client
        .request_certificate(&csr_for(&["twice.example.com"]), None, None)
        .await?;

    client.revoke_certificate(&cert_b64(&bundle.der), Some(1)).await?;
    client.revoke_certificate(&cert_b64(&bundle.der), Some(5)).await?;

    let response = reqwest::get(&bundle.url).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("Revocation-Reason")
            .and_then(|v| v.to_str().ok()),
        Some("5")
    );
    Ok(())
}
