/// Application handlers and issuance coordination
use super::transport::verify_post;
use super::{json_response, ServerState};
use crate::challenge::new_token;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::pki;
use crate::pki::CertificateAuthority;
use crate::protocol::problem::Problem;
use crate::store::{
    random_id, Application, Authorization, CertificateResource, OobSubject, Requirement,
    RequirementKind, Store,
};
use crate::types::{ApplicationStatus, AuthorizationStatus, Identifier};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

fn parse_date(payload: &Value, field: &str) -> std::result::Result<Option<OffsetDateTime>, Problem> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => OffsetDateTime::parse(s, &Rfc3339)
            .map(Some)
            .map_err(|_| Problem::malformed(format!("{} is not an ISO-8601 date: {}", field, s))),
        Some(_) => Err(Problem::malformed(format!("{} must be a string", field))),
    }
}

/// POST new-app: validate the CSR, assemble requirements, and issue
/// immediately when nothing is outstanding
pub async fn new_app(State(state): State<ServerState>, body: Bytes) -> Response {
    let expected = format!("{}/new-app", state.config.base_url());
    let ctx = match verify_post(&state, &expected, &body) {
        Ok(ctx) => ctx,
        Err(problem) => return problem.into_response(),
    };

    let mut store = state.store.lock().await;
    let Some(reg) = store.reg_by_thumbprint(&ctx.thumbprint) else {
        return Problem::unauthorized("unknown account key").into_response();
    };
    let reg_id = reg.id.clone();

    let Some(csr_b64) = ctx.payload.get("csr").and_then(Value::as_str) else {
        return Problem::malformed("application carries no csr").into_response();
    };
    let csr_der = match pki::parse_csr(csr_b64) {
        Ok(der) => der,
        Err(e) => return Problem::malformed(e.to_string()).into_response(),
    };
    let names = match pki::check_csr(&csr_der) {
        Ok(names) => names,
        Err(e) => return Problem::malformed(e.to_string()).into_response(),
    };

    let not_before = match parse_date(&ctx.payload, "notBefore") {
        Ok(value) => value,
        Err(problem) => return problem.into_response(),
    };
    let not_after = match parse_date(&ctx.payload, "notAfter") {
        Ok(value) => value,
        Err(problem) => return problem.into_response(),
    };
    if not_after.is_some() && not_before.is_none() {
        return Problem::malformed("notAfter requires notBefore").into_response();
    }
    if let (Some(begin), Some(end)) = (not_before, not_after) {
        let span = end - begin;
        if span <= time::Duration::ZERO {
            return Problem::malformed("notAfter precedes notBefore").into_response();
        }
        if span > time::Duration::seconds(state.config.max_validity_secs as i64) {
            return Problem::malformed(format!(
                "requested validity exceeds the {}s policy maximum",
                state.config.max_validity_secs
            ))
            .into_response();
        }
    }

    // One authorization requirement per name, reusing live authorizations
    let mut requirements = Vec::with_capacity(names.len());
    for name in &names {
        let (authz_id, status) = match store.authz_for(&reg_id, name) {
            Some(authz) => (authz.id.clone(), authz.status),
            None => {
                let authz = Authorization {
                    id: random_id(),
                    reg_id: reg_id.clone(),
                    identifier: Identifier::dns(name.clone()),
                    status: AuthorizationStatus::Pending,
                    expires: OffsetDateTime::now_utc()
                        + time::Duration::seconds(state.config.authz_expiry_secs as i64),
                    challenges: state.registry.create_for(
                        &state.config.challenge_types,
                        name,
                        &ctx.thumbprint,
                    ),
                };
                let id = authz.id.clone();
                let status = authz.status;
                debug!(name = %name, authz = %id, "created authorization");
                store.insert_authorization(authz);
                (id, status)
            }
        };
        requirements.push(Requirement {
            kind: RequirementKind::Authorization,
            url: state.config.url_for("authz", &authz_id),
            status,
        });
    }

    for handler in &state.config.oob_handlers {
        let subject = OobSubject {
            id: new_token(),
            handler: handler.clone(),
            status: AuthorizationStatus::Pending,
        };
        requirements.push(Requirement {
            kind: RequirementKind::OutOfBand,
            url: state.config.url_for("oob", &subject.id),
            status: subject.status,
        });
        store.insert_oob(subject);
    }

    let app = Application {
        id: random_id(),
        reg_id,
        csr_b64: csr_b64.to_string(),
        csr_der,
        not_before,
        not_after,
        status: ApplicationStatus::Pending,
        requirements,
        certificate: None,
    };
    let app_id = app.id.clone();
    let location = state.config.url_for("app", &app_id);
    store.insert_application(app);

    if let Err(e) = issue_if_ready(&mut store, &app_id, &state.ca, &state.config) {
        tracing::error!(error = %e, "issuance failed");
        return Problem::server_internal("internal error").into_response();
    }

    let view = store
        .application(&app_id)
        .map(Application::marshal)
        .unwrap_or_default();
    let mut response = json_response(StatusCode::CREATED, &view);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

/// GET app/{id}
pub async fn fetch_app(Path(id): Path<String>, State(state): State<ServerState>) -> Response {
    let store = state.store.lock().await;
    match store.application(&id) {
        Some(app) => json_response(StatusCode::OK, &app.marshal()),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Issue a certificate for an application whose requirements are all valid.
///
/// Idempotent: an application that is already valid (or not pending) is left
/// untouched. The status flip and the certificate URL are written together.
pub fn issue_if_ready(
    store: &mut Store,
    app_id: &str,
    ca: &CertificateAuthority,
    config: &ServerConfig,
) -> Result<()> {
    let (csr_der, not_before, not_after, reg_id) = {
        let Some(app) = store.application(app_id) else {
            return Ok(());
        };
        if app.status != ApplicationStatus::Pending {
            return Ok(());
        }
        let ready = !app.requirements.is_empty()
            && app
                .requirements
                .iter()
                .all(|req| req.status == AuthorizationStatus::Valid);
        if !ready {
            return Ok(());
        }
        (
            app.csr_der.clone(),
            app.not_before,
            app.not_after,
            app.reg_id.clone(),
        )
    };

    let der = ca.issue(&csr_der, not_before, not_after)?;
    let cert = CertificateResource {
        id: random_id(),
        reg_id,
        der,
        revoked: false,
        revocation_reason: None,
    };
    let cert_url = config.url_for("cert", &cert.id);
    info!(app = %app_id, cert = %cert.id, "application complete, certificate issued");
    store.insert_certificate(cert);

    if let Some(app) = store.application_mut(app_id) {
        app.certificate = Some(cert_url);
        app.status = ApplicationStatus::Valid;
    }
    Ok(())
}

/// Push a requirement status change into every application that references
/// `url`, then try issuance on each touched application. A requirement that
/// can no longer become valid makes its application invalid. `reg_id` scopes
/// the scan to one registration's applications where the owner is known.
pub fn propagate_requirement(
    store: &mut Store,
    reg_id: Option<&str>,
    url: &str,
    status: AuthorizationStatus,
    ca: &CertificateAuthority,
    config: &ServerConfig,
) -> Result<()> {
    let app_ids: Vec<String> = match reg_id {
        Some(reg_id) => store.application_ids_for_reg(reg_id),
        None => store.all_application_ids(),
    };

    for app_id in app_ids {
        let mut touched = false;
        if let Some(app) = store.application_mut(&app_id) {
            for req in &mut app.requirements {
                if req.url == url && req.status != status {
                    req.status = status;
                    touched = true;
                }
            }
            if touched
                && app.status == ApplicationStatus::Pending
                && app.requirements.iter().any(|req| {
                    matches!(
                        req.status,
                        AuthorizationStatus::Invalid | AuthorizationStatus::Deactivated
                    )
                })
            {
                app.status = ApplicationStatus::Invalid;
            }
        }
        if touched {
            issue_if_ready(store, &app_id, ca, config)?;
        }
    }
    Ok(())
}
