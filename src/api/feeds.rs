//! Subscriber endpoints under `/api/{access_key}`.
//!
//! The access key is always checked before the source id is looked at, so a
//! bad key yields 401 whatever the rest of the path holds.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use super::error::ApiError;
use super::state::AppState;

const ATOM_CONTENT_TYPE: &str = "application/atom+xml; charset=utf-8";

/// `GET /api/{access_key}/feeds`
pub async fn merged_feed(
    State(state): State<AppState>,
    Path(access_key): Path<String>,
) -> Result<Response, ApiError> {
    let self_link = state.feed_url(&access_key);
    let body = state.service.feed_for(&access_key, &self_link).await?;
    Ok(([(header::CONTENT_TYPE, ATOM_CONTENT_TYPE)], body).into_response())
}

/// `PUT /api/{access_key}/feeds/{source_id}`
pub async fn subscribe(
    State(state): State<AppState>,
    Path((access_key, source_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let subscriber = state.service.authenticate(&access_key).await?;
    // A non-numeric id cannot name a registered source
    let source_id: i64 = source_id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("source {source_id}")))?;

    state.service.subscribe_as(&subscriber, source_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/{access_key}/feeds/{source_id}`
pub async fn unsubscribe(
    State(state): State<AppState>,
    Path((access_key, source_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let subscriber = state.service.authenticate(&access_key).await?;
    if let Ok(source_id) = source_id.parse::<i64>() {
        state.service.unsubscribe_as(&subscriber, source_id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}
