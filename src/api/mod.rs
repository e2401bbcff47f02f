//! HTTP surface.
//!
//! - **AppState**: the aggregation service plus link and auth settings
//! - **Auth**: optional bearer token gate for the registry routes
//! - **Routes**: subscriber feed endpoints, registry endpoints, health

mod admin;
mod auth;
mod error;
mod feeds;
mod health;
mod state;

use axum::middleware;
use axum::routing::{get, put};
use axum::Router;

pub use self::admin::{RegisterForm, SourceView};
pub use self::auth::require_admin;
pub use self::error::ApiError;
pub use self::state::AppState;

/// Build the complete router.
///
/// ## Public
/// - `GET /health` - Health check
/// - `GET /api/{access_key}/feeds` - Merged Atom feed
/// - `PUT /api/{access_key}/feeds/{source_id}` - Subscribe
/// - `DELETE /api/{access_key}/feeds/{source_id}` - Unsubscribe
///
/// ## Admin (bearer token when `admin_token` is configured)
/// - `GET /` - List sources
/// - `POST /` - Register a source (form: `url`, `regex_patterns`)
pub fn router(state: AppState) -> Router {
    let public: Router<AppState> = Router::new().route("/health", get(health::health_check));

    let subscriber: Router<AppState> = Router::new()
        .route("/api/{access_key}/feeds", get(feeds::merged_feed))
        .route(
            "/api/{access_key}/feeds/{source_id}",
            put(feeds::subscribe).delete(feeds::unsubscribe),
        );

    let admin: Router<AppState> = Router::new()
        .route("/", get(admin::list_sources).post(admin::register_source))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .merge(public)
        .merge(subscriber)
        .merge(admin)
        .with_state(state)
}
