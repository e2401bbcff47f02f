//! Shared handler state.

use secrecy::SecretString;
use std::sync::Arc;
use url::Url;

use crate::service::AggregationService;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AggregationService>,
    /// When set, `GET /` and `POST /` require `Authorization: Bearer <token>`.
    pub admin_token: Option<Arc<SecretString>>,
    /// External base URL used to build feed self links.
    pub base_url: Arc<Url>,
}

impl AppState {
    pub fn new(
        service: Arc<AggregationService>,
        base_url: Url,
        admin_token: Option<SecretString>,
    ) -> Self {
        Self {
            service,
            admin_token: admin_token.map(Arc::new),
            base_url: Arc::new(base_url),
        }
    }

    /// Public URL of the merged feed for `access_key`.
    pub fn feed_url(&self, access_key: &str) -> String {
        let mut url = (*self.base_url).clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", access_key, "feeds"]);
        }
        url.to_string()
    }
}
