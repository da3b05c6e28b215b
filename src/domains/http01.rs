//! In-process HTTP-01 challenge provider.
//!
//! Serves ACME key authorizations under
//! `/.well-known/acme-challenge/<token>`, matched by token and by `Host`
//! header prefix. The token map is process-wide: the ACME task writes,
//! the HTTP handler reads, a mutex guards both.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Http01Challenge {
    domain: String,
    key_auth: String,
}

/// Process-wide HTTP-01 challenge token map plus its HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct Http01Provider {
    tokens: Arc<Mutex<HashMap<String, Http01Challenge>>>,
}

impl Http01Provider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a challenge so the handler can answer it.
    pub fn present(&self, domain: &str, token: &str, key_auth: &str) {
        debug!(domain = %domain, token = %token, "Presenting HTTP-01 challenge");
        self.tokens.lock().expect("challenge token map lock poisoned").insert(
            token.to_string(),
            Http01Challenge { domain: domain.to_string(), key_auth: key_auth.to_string() },
        );
    }

    /// Remove a solved or abandoned challenge.
    pub fn clean_up(&self, token: &str) {
        self.tokens.lock().expect("challenge token map lock poisoned").remove(token);
    }

    /// Router serving the ACME challenge path.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
            .with_state(self.clone())
    }
}

async fn serve_challenge(
    State(provider): State<Http01Provider>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    let challenge = {
        let tokens = provider.tokens.lock().expect("challenge token map lock poisoned");
        tokens.get(&token).cloned()
    };

    let Some(challenge) = challenge else {
        return (StatusCode::NOT_FOUND, "token not found").into_response();
    };

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if host.starts_with(&challenge.domain) {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            challenge.key_auth,
        )
            .into_response();
    }

    warn!(
        host = %host,
        domain = %challenge.domain,
        "Challenge request host did not match; ensure the Host header is passed through"
    );

    (StatusCode::BAD_REQUEST, "host mismatch").into_response()
}
