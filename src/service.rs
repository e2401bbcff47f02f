//! Request orchestration.
//!
//! A feed read walks `validate key -> resolve sources -> fetch and filter
//! each source -> merge -> render`. An unknown key stops the walk before any
//! subscription or source is touched. Source failures never surface here;
//! the fetcher turns them into empty contributions.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::feed::{merge, render_atom, AtomFeed, Entry, Fetcher, PatternSet};
use crate::retention::RetentionSweeper;
use crate::storage::{Database, DatabaseError, Source, Subscriber, ValidationError};
use crate::util::validate_public_url;

/// Compiled pattern sets kept across requests
const PATTERN_CACHE_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Access key does not identify a subscriber
    #[error("Unknown access key")]
    Unauthorized,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Source {0} not found")]
    NotFound(i64),

    /// Too many aggregations in flight
    #[error("Server is busy, try again later")]
    Busy,

    #[error(transparent)]
    Database(DatabaseError),

    #[error("Failed to render feed: {0}")]
    Render(anyhow::Error),
}

impl From<DatabaseError> for ServiceError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Validation(e) => ServiceError::Validation(e),
            DatabaseError::SourceNotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Database(other),
        }
    }
}

/// Service tunables, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub max_concurrent_fetches: usize,
    pub max_concurrent_aggregations: usize,
    /// 0 keeps every merged entry
    pub max_feed_entries: usize,
    pub allow_private_sources: bool,
    pub sweep_on_read: bool,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_fetches: config.max_concurrent_fetches,
            max_concurrent_aggregations: config.max_concurrent_aggregations,
            max_feed_entries: config.max_feed_entries,
            allow_private_sources: config.allow_private_sources,
            sweep_on_read: config.sweep_on_read,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct AggregationService {
    db: Database,
    fetcher: Fetcher,
    sweeper: Arc<RetentionSweeper>,
    settings: ServiceSettings,
    aggregations: Semaphore,
    pattern_cache: Mutex<LruCache<i64, Arc<PatternSet>>>,
}

impl AggregationService {
    pub fn new(
        db: Database,
        fetcher: Fetcher,
        sweeper: Arc<RetentionSweeper>,
        settings: ServiceSettings,
    ) -> Self {
        let cache_size = NonZeroUsize::new(PATTERN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            fetcher,
            sweeper,
            aggregations: Semaphore::new(settings.max_concurrent_aggregations.max(1)),
            settings,
            pattern_cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Subscriber-facing operations
    // ========================================================================

    /// Resolve an access key, or fail with `Unauthorized`.
    pub async fn authenticate(&self, access_key: &str) -> Result<Subscriber, ServiceError> {
        self.db
            .find_subscriber(access_key)
            .await?
            .ok_or(ServiceError::Unauthorized)
    }

    /// Filtered, merged entries across everything `access_key` subscribes to.
    pub async fn merged_entries(&self, access_key: &str) -> Result<Vec<Entry>, ServiceError> {
        let subscriber = self.authenticate(access_key).await?;

        let _permit = self.aggregations.try_acquire().map_err(|_| {
            tracing::warn!(
                subscriber_id = subscriber.id,
                limit = self.settings.max_concurrent_aggregations,
                "Aggregation limit reached, rejecting read"
            );
            ServiceError::Busy
        })?;

        let sources = self.db.sources_for(subscriber.id).await?;

        // buffered (not buffer_unordered) keeps per-source results in source
        // order, which fixes merge tie-breaks.
        let fetches: Vec<_> = sources
            .iter()
            .map(|source| self.fetch_filtered(source))
            .collect();
        let per_source: Vec<Vec<Entry>> = stream::iter(fetches)
            .buffered(self.settings.max_concurrent_fetches.max(1))
            .collect()
            .await;

        let mut entries = merge(per_source);
        if self.settings.max_feed_entries > 0 {
            entries.truncate(self.settings.max_feed_entries);
        }

        tracing::info!(
            subscriber_id = subscriber.id,
            sources = sources.len(),
            entries = entries.len(),
            "Aggregated feed"
        );

        if self.settings.sweep_on_read {
            self.sweep_in_background();
        }

        Ok(entries)
    }

    /// Render the merged feed for `access_key` as an Atom document.
    ///
    /// `self_link` becomes the feed id and its `rel="self"` link.
    pub async fn feed_for(&self, access_key: &str, self_link: &str) -> Result<String, ServiceError> {
        let entries = self.merged_entries(access_key).await?;
        let title = format!("Merged feed for {access_key}");
        let feed = AtomFeed {
            title: &title,
            subtitle: "Filtered and merged entries from all subscribed sources",
            self_link,
            entries: &entries,
            generated_at: Utc::now(),
        };
        render_atom(&feed).map_err(ServiceError::Render)
    }

    /// Subscribe the key's owner to a source. Idempotent.
    pub async fn subscribe(&self, access_key: &str, source_id: i64) -> Result<(), ServiceError> {
        let subscriber = self.authenticate(access_key).await?;
        self.subscribe_as(&subscriber, source_id).await
    }

    /// Drop a subscription. Unknown pairs are not an error.
    pub async fn unsubscribe(&self, access_key: &str, source_id: i64) -> Result<(), ServiceError> {
        let subscriber = self.authenticate(access_key).await?;
        self.unsubscribe_as(&subscriber, source_id).await
    }

    /// [`AggregationService::subscribe`] for an already authenticated subscriber.
    pub async fn subscribe_as(
        &self,
        subscriber: &Subscriber,
        source_id: i64,
    ) -> Result<(), ServiceError> {
        self.db.subscribe(subscriber.id, source_id).await?;
        Ok(())
    }

    pub async fn unsubscribe_as(
        &self,
        subscriber: &Subscriber,
        source_id: i64,
    ) -> Result<(), ServiceError> {
        self.db.unsubscribe(subscriber.id, source_id).await?;
        Ok(())
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Register a source after applying the outbound URL policy.
    pub async fn register_source<S: AsRef<str>>(
        &self,
        url: &str,
        patterns: &[S],
    ) -> Result<i64, ServiceError> {
        if !self.settings.allow_private_sources {
            validate_public_url(url).map_err(ValidationError::from)?;
        }
        Ok(self.db.register_source(url, patterns).await?)
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>, ServiceError> {
        Ok(self.db.list_sources().await?)
    }

    /// Create a subscriber. Without a key, a random one is issued.
    ///
    /// Returns the new subscriber id and the key it answers to.
    pub async fn add_subscriber(
        &self,
        access_key: Option<&str>,
    ) -> Result<(i64, String), ServiceError> {
        let key = match access_key {
            Some(k) => k.trim().to_string(),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        let id = self.db.add_subscriber(&key).await?;
        Ok((id, key))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn fetch_filtered(&self, source: &Source) -> Vec<Entry> {
        let Some(patterns) = self.patterns_for(source) else {
            return Vec::new();
        };
        let entries = self.fetcher.fetch(source).await;
        patterns.apply(entries)
    }

    /// Compiled patterns for `source`, from cache when the stored list is
    /// unchanged. `None` if a stored pattern no longer compiles.
    fn patterns_for(&self, source: &Source) -> Option<Arc<PatternSet>> {
        if let Ok(mut cache) = self.pattern_cache.lock() {
            if let Some(set) = cache.get(&source.id) {
                if set.patterns() == source.patterns.as_slice() {
                    return Some(Arc::clone(set));
                }
            }
        }

        let set = match PatternSet::compile(source.patterns.as_slice()) {
            Ok(set) => Arc::new(set),
            Err(e) => {
                tracing::warn!(
                    source_id = source.id,
                    error = %e,
                    "Stored pattern does not compile, skipping source"
                );
                return None;
            }
        };

        if let Ok(mut cache) = self.pattern_cache.lock() {
            cache.put(source.id, Arc::clone(&set));
        }
        Some(set)
    }

    fn sweep_in_background(&self) {
        let sweeper = Arc::clone(&self.sweeper);
        tokio::spawn(async move {
            if let Err(e) = sweeper.sweep(Utc::now()).await {
                tracing::warn!(error = %e, "Post-read retention sweep failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(items: &[(&str, &str)]) -> String {
        let items: String = items
            .iter()
            .map(|(title, date)| {
                format!(
                    "<item><title>{title}</title><link>https://example.com/{}</link><pubDate>{date}</pubDate></item>",
                    title.replace(' ', "-")
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>T</title>{items}</channel></rss>"#
        )
    }

    async fn service(settings: ServiceSettings) -> AggregationService {
        service_with_timeout(settings, Duration::from_secs(5)).await
    }

    async fn service_with_timeout(
        settings: ServiceSettings,
        fetch_timeout: Duration,
    ) -> AggregationService {
        let db = Database::open(":memory:").await.unwrap();
        let fetcher = Fetcher::new(fetch_timeout, true)
            .unwrap()
            .with_retry_base_delay(Duration::from_millis(1));
        let sweeper = Arc::new(RetentionSweeper::new(db.clone(), chrono::Duration::days(7)));
        AggregationService::new(db, fetcher, sweeper, settings)
    }

    fn local_settings() -> ServiceSettings {
        ServiceSettings {
            allow_private_sources: true,
            ..ServiceSettings::default()
        }
    }

    async fn mount_feed(server: &MockServer, route: &str, body: String) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_unknown_key_is_unauthorized() {
        let svc = service(local_settings()).await;
        assert!(matches!(
            svc.merged_entries("nope").await,
            Err(ServiceError::Unauthorized)
        ));
        assert!(matches!(
            svc.subscribe("nope", 1).await,
            Err(ServiceError::Unauthorized)
        ));
        assert!(matches!(
            svc.unsubscribe("nope", 1).await,
            Err(ServiceError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_no_subscriptions_yields_empty_feed() {
        let svc = service(local_settings()).await;
        let (_, key) = svc.add_subscriber(None).await.unwrap();
        assert!(svc.merged_entries(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filters_and_merges_across_sources() {
        let server = MockServer::start().await;
        mount_feed(
            &server,
            "/a",
            rss(&[
                ("Breaking: X", "Mon, 01 Jan 2024 10:00:00 GMT"),
                ("Weather", "Mon, 01 Jan 2024 11:00:00 GMT"),
            ]),
        )
        .await;
        mount_feed(
            &server,
            "/b",
            rss(&[("Other", "Mon, 01 Jan 2024 15:00:00 GMT")]),
        )
        .await;

        let svc = service(local_settings()).await;
        let (_, key) = svc.add_subscriber(Some("reader")).await.unwrap();
        let a = svc
            .register_source(&format!("{}/a", server.uri()), &["^Breaking"])
            .await
            .unwrap();
        let b = svc
            .register_source::<&str>(&format!("{}/b", server.uri()), &[])
            .await
            .unwrap();
        svc.subscribe(&key, a).await.unwrap();
        svc.subscribe(&key, b).await.unwrap();

        let titles: Vec<String> = svc
            .merged_entries(&key)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["Other", "Breaking: X"]);
    }

    #[tokio::test]
    async fn test_failing_source_degrades_to_other_sources() {
        let server = MockServer::start().await;
        mount_feed(
            &server,
            "/ok",
            rss(&[("Fine", "Mon, 01 Jan 2024 10:00:00 GMT")]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let svc = service(local_settings()).await;
        let (_, key) = svc.add_subscriber(Some("reader")).await.unwrap();
        for route in ["/ok", "/down"] {
            let id = svc
                .register_source::<&str>(&format!("{}{route}", server.uri()), &[])
                .await
                .unwrap();
            svc.subscribe(&key, id).await.unwrap();
        }

        let entries = svc.merged_entries(&key).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Fine");
    }

    #[tokio::test]
    async fn test_max_feed_entries_truncates_newest_first() {
        let server = MockServer::start().await;
        mount_feed(
            &server,
            "/feed",
            rss(&[
                ("Old", "Mon, 01 Jan 2024 10:00:00 GMT"),
                ("New", "Mon, 01 Jan 2024 12:00:00 GMT"),
                ("Mid", "Mon, 01 Jan 2024 11:00:00 GMT"),
            ]),
        )
        .await;

        let svc = service(ServiceSettings {
            max_feed_entries: 2,
            ..local_settings()
        })
        .await;
        let (_, key) = svc.add_subscriber(Some("reader")).await.unwrap();
        let id = svc
            .register_source::<&str>(&format!("{}/feed", server.uri()), &[])
            .await
            .unwrap();
        svc.subscribe(&key, id).await.unwrap();

        let titles: Vec<String> = svc
            .merged_entries(&key)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["New", "Mid"]);
    }

    #[tokio::test]
    async fn test_saturated_service_is_busy() {
        let svc = service(ServiceSettings {
            max_concurrent_aggregations: 1,
            ..local_settings()
        })
        .await;
        let (_, key) = svc.add_subscriber(Some("reader")).await.unwrap();

        let held = svc.aggregations.try_acquire().unwrap();
        assert!(matches!(
            svc.merged_entries(&key).await,
            Err(ServiceError::Busy)
        ));
        drop(held);
        assert!(svc.merged_entries(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_private_sources_rejected_by_default() {
        let svc = service(ServiceSettings::default()).await;
        let err = svc
            .register_source::<&str>("http://127.0.0.1:8080/rss", &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::InvalidUrl(_))
        ));
        assert!(svc.list_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_source_is_not_found() {
        let svc = service(local_settings()).await;
        let (_, key) = svc.add_subscriber(Some("reader")).await.unwrap();
        assert!(matches!(
            svc.subscribe(&key, 99).await,
            Err(ServiceError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_pattern_cache_follows_replaced_patterns() {
        let svc = service(local_settings()).await;
        let id = svc
            .register_source("https://example.com/rss", &["^A"])
            .await
            .unwrap();
        let source = svc.db.get_source(id).await.unwrap().unwrap();
        let first = svc.patterns_for(&source).unwrap();
        assert!(Arc::ptr_eq(&first, &svc.patterns_for(&source).unwrap()));

        svc.db.replace_patterns(id, &["^B"]).await.unwrap();
        let source = svc.db.get_source(id).await.unwrap().unwrap();
        let second = svc.patterns_for(&source).unwrap();
        assert_eq!(second.patterns(), ["^B".to_string()]);
    }

    async fn mount_delayed_feed(server: &MockServer, route: &str, body: String, delay: Duration) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .set_delay(delay),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_slow_sources_are_fetched_concurrently() {
        let server = MockServer::start().await;
        let delay = Duration::from_millis(1200);
        mount_delayed_feed(
            &server,
            "/a",
            rss(&[("From A", "Mon, 01 Jan 2024 10:00:00 GMT")]),
            delay,
        )
        .await;
        mount_delayed_feed(
            &server,
            "/b",
            rss(&[("From B", "Mon, 01 Jan 2024 11:00:00 GMT")]),
            delay,
        )
        .await;

        let settings = ServiceSettings {
            max_concurrent_fetches: 4,
            ..local_settings()
        };
        let svc = service_with_timeout(settings, Duration::from_secs(5)).await;
        let (_, key) = svc.add_subscriber(None).await.unwrap();
        for route in ["/a", "/b"] {
            let id = svc
                .register_source::<&str>(&format!("{}{route}", server.uri()), &[])
                .await
                .unwrap();
            svc.subscribe(&key, id).await.unwrap();
        }

        let started = std::time::Instant::now();
        let entries = svc.merged_entries(&key).await.unwrap();
        let elapsed = started.elapsed();

        let titles: Vec<&str> = entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["From B", "From A"]);
        // Sequential fetches would need at least twice the delay
        assert!(elapsed < delay * 2, "read took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_hung_source_does_not_hold_back_the_read() {
        let server = MockServer::start().await;
        mount_delayed_feed(
            &server,
            "/hung",
            rss(&[("Never", "Mon, 01 Jan 2024 12:00:00 GMT")]),
            Duration::from_secs(30),
        )
        .await;
        mount_feed(
            &server,
            "/fast",
            rss(&[("Fast", "Mon, 01 Jan 2024 09:00:00 GMT")]),
        )
        .await;

        let svc = service_with_timeout(local_settings(), Duration::from_millis(500)).await;
        let (_, key) = svc.add_subscriber(None).await.unwrap();
        for route in ["/hung", "/fast"] {
            let id = svc
                .register_source::<&str>(&format!("{}{route}", server.uri()), &[])
                .await
                .unwrap();
            svc.subscribe(&key, id).await.unwrap();
        }

        let started = std::time::Instant::now();
        let entries = svc.merged_entries(&key).await.unwrap();
        let elapsed = started.elapsed();

        let titles: Vec<&str> = entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Fast"]);
        assert!(elapsed < Duration::from_secs(5), "read took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_generated_keys_are_distinct() {
        let svc = service(local_settings()).await;
        let (_, a) = svc.add_subscriber(None).await.unwrap();
        let (_, b) = svc.add_subscriber(None).await.unwrap();
        assert_ne!(a, b);
        assert!(svc.authenticate(&a).await.is_ok());
    }
}
