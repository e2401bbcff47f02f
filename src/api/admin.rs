//! Source registry endpoints at `/`.

use axum::extract::State;
use axum::response::Redirect;
use axum::{Form, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::state::AppState;
use crate::storage::Source;

/// A registered source as listed by `GET /`.
#[derive(Debug, Clone, Serialize)]
pub struct SourceView {
    pub id: i64,
    pub url: String,
    pub patterns: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Source> for SourceView {
    fn from(source: Source) -> Self {
        Self {
            id: source.id,
            url: source.url,
            patterns: source.patterns,
            created_at: DateTime::from_timestamp(source.created_at, 0),
        }
    }
}

/// Body of `POST /`. `regex_patterns` holds one pattern per line.
#[derive(Debug, Deserialize)]
pub struct RegisterForm {
    pub url: String,
    #[serde(default)]
    pub regex_patterns: String,
}

/// `GET /`
pub async fn list_sources(State(state): State<AppState>) -> Result<Json<Vec<SourceView>>, ApiError> {
    let sources = state.service.list_sources().await?;
    Ok(Json(sources.into_iter().map(SourceView::from).collect()))
}

/// `POST /`: register a source, then send the browser back to the list.
pub async fn register_source(
    State(state): State<AppState>,
    Form(form): Form<RegisterForm>,
) -> Result<Redirect, ApiError> {
    let patterns = pattern_lines(&form.regex_patterns);
    state.service.register_source(&form.url, &patterns).await?;
    Ok(Redirect::to("/"))
}

/// Split a textarea into patterns, dropping blank lines.
fn pattern_lines(raw: &str) -> Vec<&str> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}
