/// Registration handlers: creation, update, deactivation and key change
use super::transport::{verify_inner_jws, verify_post};
use super::{json_response, ServerState};
use crate::protocol::problem::Problem;
use crate::store::{random_id, Registration};
use crate::types::RegistrationStatus;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{info, warn};

fn contact_list(payload: &Value) -> Option<Vec<String>> {
    payload.get("contact").and_then(Value::as_array).map(|list| {
        list.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

fn terms_link(state: &ServerState) -> Option<HeaderValue> {
    state
        .config
        .terms_of_service
        .as_ref()
        .and_then(|url| HeaderValue::from_str(&format!("<{}>;rel=\"terms-of-service\"", url)).ok())
}

/// POST new-reg: create an account unless the key is already registered
pub async fn new_reg(State(state): State<ServerState>, body: Bytes) -> Response {
    let expected = format!("{}/new-reg", state.config.base_url());
    let ctx = match verify_post(&state, &expected, &body) {
        Ok(ctx) => ctx,
        Err(problem) => return problem.into_response(),
    };

    let mut store = state.store.lock().await;
    if let Some(existing) = store.reg_by_thumbprint(&ctx.thumbprint) {
        let location = state.config.url_for("reg", &existing.id);
        let mut response = StatusCode::CONFLICT.into_response();
        if let Ok(value) = HeaderValue::from_str(&location) {
            response.headers_mut().insert(header::LOCATION, value);
        }
        return response;
    }

    let reg = Registration {
        id: random_id(),
        thumbprint: ctx.thumbprint.clone(),
        key: ctx.jwk.clone(),
        contact: contact_list(&ctx.payload).unwrap_or_default(),
        agreement: None,
        status: RegistrationStatus::Good,
    };
    let location = state.config.url_for("reg", &reg.id);
    info!(thumbprint = %ctx.thumbprint, "registered new account");
    let view = reg.marshal();
    store.insert_registration(reg);

    let mut response = json_response(StatusCode::CREATED, &view);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    if let Some(link) = terms_link(&state) {
        response.headers_mut().insert(header::LINK, link);
    }
    response
}

/// POST reg/{id}: contact and agreement updates, or deactivation
pub async fn update_reg(
    Path(id): Path<String>,
    State(state): State<ServerState>,
    body: Bytes,
) -> Response {
    let expected = state.config.url_for("reg", &id);
    let ctx = match verify_post(&state, &expected, &body) {
        Ok(ctx) => ctx,
        Err(problem) => return problem.into_response(),
    };

    let mut store = state.store.lock().await;
    let Some(reg) = store.registration(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if reg.thumbprint != ctx.thumbprint {
        return Problem::unauthorized("account key does not own this registration")
            .into_response();
    }

    if ctx.payload.get("status").and_then(Value::as_str) == Some("deactivated") {
        store.delete_registration(&id);
        info!(reg_id = %id, "account deactivated");
        return json_response(
            StatusCode::OK,
            &serde_json::json!({"status": "deactivated"}),
        );
    }

    if let Some(agreement) = ctx.payload.get("agreement").and_then(Value::as_str) {
        if state.config.terms_of_service.as_deref() != Some(agreement) {
            return Problem::malformed(format!(
                "agreement {} does not match the current terms of service",
                agreement
            ))
            .into_response();
        }
        if let Some(reg) = store.registration_mut(&id) {
            reg.agreement = Some(agreement.to_string());
        }
    }
    if let Some(contact) = contact_list(&ctx.payload) {
        if let Some(reg) = store.registration_mut(&id) {
            reg.contact = contact;
        }
    }

    let view = store
        .registration(&id)
        .map(Registration::marshal)
        .unwrap_or_default();
    json_response(StatusCode::OK, &view)
}

/// GET reg/{id} is never allowed; registrations are only readable by POSTing
/// with the owning key
pub async fn fetch_reg(Path(_id): Path<String>, State(_state): State<ServerState>) -> Response {
    Problem::unauthorized("registrations require an authenticated request").into_response()
}

/// POST key-change: replace an account key given proof of both keys.
///
/// The outer JWS is signed with the replacement key; its payload is an inner
/// JWS signed with the current account key naming both thumbprints and the
/// registration URL.
pub async fn key_change(State(state): State<ServerState>, body: Bytes) -> Response {
    let expected = format!("{}/key-change", state.config.base_url());
    let ctx = match verify_post(&state, &expected, &body) {
        Ok(ctx) => ctx,
        Err(problem) => return problem.into_response(),
    };

    let inner = match verify_inner_jws(&ctx.payload) {
        Ok(inner) => inner,
        Err(e) => {
            return Problem::malformed(format!("inner JWS invalid: {}", e)).into_response();
        }
    };

    let refused =
        || Problem::unauthorized("key-change proof does not match").with_status(403);

    if inner.header.url != ctx.header.url {
        warn!("key-change inner URL mismatch");
        return refused().into_response();
    }
    let old_thumbprint = inner.jwk.thumbprint();
    if inner.payload.get("oldKey").and_then(Value::as_str) != Some(old_thumbprint.as_str()) {
        return refused().into_response();
    }
    if inner.payload.get("newKey").and_then(Value::as_str) != Some(ctx.thumbprint.as_str()) {
        return refused().into_response();
    }

    let mut store = state.store.lock().await;
    let Some(reg_id) = store
        .reg_by_thumbprint(&old_thumbprint)
        .map(|reg| reg.id.clone())
    else {
        return refused().into_response();
    };
    let account_url = state.config.url_for("reg", &reg_id);
    if inner.payload.get("account").and_then(Value::as_str) != Some(account_url.as_str()) {
        return refused().into_response();
    }

    let Some(reg) = store.registration_mut(&reg_id) else {
        return refused().into_response();
    };
    reg.key = ctx.jwk.clone();
    reg.thumbprint = ctx.thumbprint.clone();
    info!(reg_id = %reg_id, "account key replaced");
    let view = reg.marshal();
    json_response(StatusCode::OK, &view)
}
