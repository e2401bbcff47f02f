//! Bearer token gate for the administrative routes.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use secrecy::ExposeSecret;

use super::error::ApiError;
use super::state::AppState;

/// Middleware that requires the configured admin token, if there is one.
///
/// The token must be provided in the `Authorization` header as:
/// ```text
/// Authorization: Bearer <token>
/// ```
///
/// Without a configured `admin_token` every request passes.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_token.as_ref() else {
        return Ok(next.run(request).await);
    };

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "));

    match token {
        Some(token) if token == expected.expose_secret() => Ok(next.run(request).await),
        Some(_) => {
            tracing::debug!("invalid admin token");
            Err(ApiError::Unauthorized)
        }
        None => {
            tracing::debug!("missing or malformed authorization header");
            Err(ApiError::Unauthorized)
        }
    }
}
