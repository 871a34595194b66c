//! ACME server core
//!
//! Assembles the transport gates, resource handlers and issuance
//! coordination around one shared in-memory store. The embedding process
//! supplies the listener; everything else is driven by [`ServerConfig`].

pub mod application;
pub mod authorization;
pub mod certificate;
pub mod registration;
pub mod transport;

use crate::challenge::{ChallengeRegistry, OobSignals, ProbeConfig};
use crate::config::ServerConfig;
use crate::error::{AcmeError, Result};
use crate::pki::CertificateAuthority;
use crate::protocol::directory::Directory;
use crate::protocol::nonce::NonceSource;
use crate::store::Store;
use crate::types::AuthorizationStatus;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use transport::RateWindow;

/// Shared handler state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<tokio::sync::Mutex<Store>>,
    pub nonces: Arc<std::sync::Mutex<NonceSource>>,
    pub rate: Arc<std::sync::Mutex<RateWindow>>,
    pub ca: Arc<CertificateAuthority>,
    pub registry: Arc<ChallengeRegistry>,
    pub oob_signals: OobSignals,
}

/// The ACME server engine
pub struct AcmeServer {
    state: ServerState,
}

impl AcmeServer {
    /// Build a server from its configuration, CA and probe settings
    pub fn new(config: ServerConfig, ca: CertificateAuthority, probe: ProbeConfig) -> Self {
        let oob_signals = OobSignals::new_shared();
        oob_signals.set_base_url(&config.base_url());
        let registry = ChallengeRegistry::standard(probe, oob_signals.clone());
        let rate = RateWindow::new(config.rate_limit.max_posts, config.rate_limit.window());
        let nonces = NonceSource::new(config.nonce_start);
        Self {
            state: ServerState {
                config: Arc::new(config),
                store: Arc::new(tokio::sync::Mutex::new(Store::new())),
                nonces: Arc::new(std::sync::Mutex::new(nonces)),
                rate: Arc::new(std::sync::Mutex::new(rate)),
                ca: Arc::new(ca),
                registry: Arc::new(registry),
                oob_signals,
            },
        }
    }

    /// Handler state, exposed for tests that assert on stored resources
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// The full router, nested under the configured base path
    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let routes = Router::new()
            .route("/directory", get(directory_handler))
            .route("/new-reg", post(registration::new_reg))
            .route(
                "/reg/:id",
                post(registration::update_reg).get(registration::fetch_reg),
            )
            .route("/key-change", post(registration::key_change))
            .route("/new-app", post(application::new_app))
            .route("/app/:id", get(application::fetch_app))
            .route(
                "/authz/:id",
                post(authorization::update_authz).get(authorization::fetch_authz),
            )
            .route("/authz/:id/:index", post(authorization::update_challenge))
            .route("/cert/:id", get(certificate::fetch_cert))
            .route("/revoke-cert", post(certificate::revoke_cert))
            .route("/oob/:token", get(oob_page_view))
            .with_state(state.clone());

        // The gates wrap the whole tree so even 404s carry a fresh nonce
        Router::new()
            .nest(&state.config.base_path, routes)
            .layer(middleware::from_fn_with_state(
                state,
                transport::transport_gate,
            ))
    }

    /// Serve on an already-bound listener until it fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(base = %self.state.config.base_url(), "ACME server listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| AcmeError::transport(format!("server failed: {}", e)))
    }
}

async fn directory_handler(State(state): State<ServerState>) -> Response {
    let directory = Directory::for_base(
        &state.config.base_url(),
        state.config.terms_of_service.clone(),
    );
    json_response(StatusCode::OK, &serde_json::to_value(directory).unwrap_or_default())
}

/// A page view on an out-of-band URL: fires any waiting challenge and marks
/// the matching requirement subject valid.
async fn oob_page_view(Path(token): Path<String>, State(state): State<ServerState>) -> Response {
    let signalled = state.oob_signals.signal(&token);

    let mut store = state.store.lock().await;
    let subject_hit = match store.oob_mut(&token) {
        Some(subject) if subject.status == AuthorizationStatus::Pending => {
            subject.status = AuthorizationStatus::Valid;
            true
        }
        Some(_) => true,
        None => false,
    };
    if subject_hit {
        let url = state.config.url_for("oob", &token);
        let outcome = application::propagate_requirement(
            &mut store,
            None,
            &url,
            AuthorizationStatus::Valid,
            &state.ca,
            &state.config,
        );
        if let Err(e) = outcome {
            tracing::error!(error = %e, "propagation failed");
            return crate::protocol::problem::Problem::server_internal("internal error")
                .into_response();
        }
    }

    if signalled || subject_hit {
        (StatusCode::OK, "thank you").into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// JSON response with the ACME resource content type
pub(crate) fn json_response(status: StatusCode, value: &Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        value.to_string(),
    )
        .into_response()
}
