/// Certificate fetch and revocation handlers
use super::transport::verify_post;
use super::ServerState;
use crate::crypto::hash::b64url_decode;
use crate::pki;
use crate::protocol::problem::Problem;
use crate::protocol::{PKIX_CERT_CONTENT_TYPE, REVOCATION_REASON_HEADER};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::info;

/// GET cert/{id}: DER body, plus the revocation reason once revoked
pub async fn fetch_cert(Path(id): Path<String>, State(state): State<ServerState>) -> Response {
    let store = state.store.lock().await;
    let Some(cert) = store.certificate(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PKIX_CERT_CONTENT_TYPE)],
        cert.der.clone(),
    )
        .into_response();
    if cert.revoked {
        let reason = cert.revocation_reason.unwrap_or(0);
        if let Ok(value) = HeaderValue::from_str(&reason.to_string()) {
            response
                .headers_mut()
                .insert(REVOCATION_REASON_HEADER, value);
        }
    }
    response
}

/// POST revoke-cert.
///
/// The submitter must prove one of: ownership of the issuing account,
/// authorization over every SAN in the certificate, or possession of the
/// certificate key itself.
pub async fn revoke_cert(State(state): State<ServerState>, body: Bytes) -> Response {
    let expected = format!("{}/revoke-cert", state.config.base_url());
    let ctx = match verify_post(&state, &expected, &body) {
        Ok(ctx) => ctx,
        Err(problem) => return problem.into_response(),
    };

    let Some(cert_b64) = ctx.payload.get("certificate").and_then(Value::as_str) else {
        return Problem::malformed("revocation carries no certificate").into_response();
    };
    let Ok(der) = b64url_decode(cert_b64) else {
        return Problem::malformed("certificate is not base64url").into_response();
    };

    let mut store = state.store.lock().await;
    let Some(cert) = store.cert_by_der(&der) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let cert_id = cert.id.clone();
    let owner_reg_id = cert.reg_id.clone();

    let owns_account = store
        .registration(&owner_reg_id)
        .map(|reg| reg.thumbprint == ctx.thumbprint)
        .unwrap_or(false);

    let holds_all_sans = if owns_account {
        true
    } else {
        match pki::cert_san_names(&der) {
            Ok(names) => store
                .reg_by_thumbprint(&ctx.thumbprint)
                .map(|reg| store.authorized_for(&reg.id, &names))
                .unwrap_or(false),
            Err(_) => false,
        }
    };

    let holds_cert_key = owns_account
        || holds_all_sans
        || pki::cert_key_thumbprint(&der)
            .map(|print| print == ctx.thumbprint)
            .unwrap_or(false);

    if !(owns_account || holds_all_sans || holds_cert_key) {
        return Problem::unauthorized("no proof of control over this certificate")
            .with_status(403)
            .into_response();
    }

    // Saturate into u8 range; a negative or oversized code must not wrap
    // into a different reason than the caller named
    let reason = ctx
        .payload
        .get("reason")
        .and_then(Value::as_i64)
        .map(|value| value.clamp(0, 255) as u8)
        .unwrap_or(0);
    if let Some(cert) = store.certificate_mut(&cert_id) {
        cert.revoked = true;
        cert.revocation_reason = Some(reason);
    }
    info!(cert = %cert_id, reason, "certificate revoked");
    StatusCode::OK.into_response()
}
