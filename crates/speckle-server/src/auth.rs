use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ServerError;
use crate::state::ServerState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Anonymous,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| Credentials::Bearer(token.trim().to_string()))
            .unwrap_or(Credentials::Anonymous)
    }

    /// Whether these credentials satisfy the configured token, if any.
    pub fn satisfies(&self, required: Option<&str>) -> bool {
        match (required, self) {
            (None, _) => true,
            (Some(required), Credentials::Bearer(token)) => token == required,
            (Some(_), Credentials::Anonymous) => false,
        }
    }
}

/// Middleware rejecting requests without the configured bearer token.
pub async fn require_token(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let credentials = Credentials::from_headers(request.headers());
    if !credentials.satisfies(state.config().required_token.as_deref()) {
        return Err(ServerError::AuthFailed("missing or invalid bearer token".into()));
    }
    Ok(next.run(request).await)
}
