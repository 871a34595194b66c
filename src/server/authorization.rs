/// Authorization handlers: deactivation and challenge updates
use super::application::propagate_requirement;
use super::transport::verify_post;
use super::{json_response, ServerState};
use crate::protocol::problem::Problem;
use crate::types::AuthorizationStatus;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, info};

/// GET authz/{id}
pub async fn fetch_authz(Path(id): Path<String>, State(state): State<ServerState>) -> Response {
    let store = state.store.lock().await;
    match store.authorization(&id) {
        Some(authz) => json_response(StatusCode::OK, &authz.marshal(&state.config)),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// POST authz/{id}: holder-requested deactivation
pub async fn update_authz(
    Path(id): Path<String>,
    State(state): State<ServerState>,
    body: Bytes,
) -> Response {
    let expected = state.config.url_for("authz", &id);
    let ctx = match verify_post(&state, &expected, &body) {
        Ok(ctx) => ctx,
        Err(problem) => return problem.into_response(),
    };

    let mut store = state.store.lock().await;
    let Some(authz) = store.authorization(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let reg_id = authz.reg_id.clone();
    let owner_thumbprint = store
        .registration(&reg_id)
        .map(|reg| reg.thumbprint.clone());
    if owner_thumbprint.as_deref() != Some(ctx.thumbprint.as_str()) {
        return Problem::unauthorized("account key does not own this authorization")
            .into_response();
    }

    if ctx.payload.get("status").and_then(Value::as_str) != Some("deactivated") {
        return Problem::malformed("only {\"status\":\"deactivated\"} updates are accepted")
            .into_response();
    }

    let authz_url = state.config.url_for("authz", &id);
    {
        let Some(authz) = store.authorization_mut(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        match authz.status {
            AuthorizationStatus::Pending | AuthorizationStatus::Valid => {
                authz.status = AuthorizationStatus::Deactivated;
            }
            _ => {
                return Problem::malformed("authorization is already settled")
                    .with_status(403)
                    .into_response();
            }
        }
    }
    info!(authz = %id, "authorization deactivated");
    if let Err(e) = propagate_requirement(
        &mut store,
        Some(&reg_id),
        &authz_url,
        AuthorizationStatus::Deactivated,
        &state.ca,
        &state.config,
    ) {
        tracing::error!(error = %e, "propagation failed");
        return Problem::server_internal("internal error").into_response();
    }

    let view = store
        .authorization(&id)
        .map(|authz| authz.marshal(&state.config))
        .unwrap_or_default();
    json_response(StatusCode::OK, &view)
}

/// POST authz/{id}/{index}: drive one challenge with a client response
pub async fn update_challenge(
    Path((id, index)): Path<(String, usize)>,
    State(state): State<ServerState>,
    body: Bytes,
) -> Response {
    let expected = state.config.challenge_url(&id, index);
    let ctx = match verify_post(&state, &expected, &body) {
        Ok(ctx) => ctx,
        Err(problem) => return problem.into_response(),
    };

    let mut store = state.store.lock().await;
    let Some(authz) = store.authorization(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let reg_id = authz.reg_id.clone();
    let before = authz.status;
    let owner_thumbprint = store
        .registration(&reg_id)
        .map(|reg| reg.thumbprint.clone());
    if owner_thumbprint.as_deref() != Some(ctx.thumbprint.as_str()) {
        return Problem::unauthorized("account key does not own this authorization")
            .into_response();
    }
    if before != AuthorizationStatus::Pending {
        return Problem::unauthorized("authorization is no longer pending")
            .with_status(403)
            .into_response();
    }

    // Run the challenge verifier, including its outbound probe, then fold the
    // outcome back into the authorization.
    let after = {
        let Some(authz) = store.authorization_mut(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let Some(challenge) = authz.challenges.get_mut(index) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let challenge_status = challenge.update(&ctx.payload).await;
        debug!(authz = %id, index, status = %challenge_status, "challenge updated");
        authz.recompute_status();
        authz.status
    };

    if after != before {
        let authz_url = state.config.url_for("authz", &id);
        if let Err(e) = propagate_requirement(
            &mut store,
            Some(&reg_id),
            &authz_url,
            after,
            &state.ca,
            &state.config,
        ) {
            tracing::error!(error = %e, "propagation failed");
            return Problem::server_internal("internal error").into_response();
        }
    }

    let view = store
        .authorization(&id)
        .map(|authz| authz.marshal(&state.config))
        .unwrap_or_default();
    json_response(StatusCode::OK, &view)
}
