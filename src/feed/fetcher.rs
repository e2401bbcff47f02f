use crate::feed::parser::{parse_feed, Entry};
use crate::storage::Source;
use crate::util::validate_public_url;
use futures::stream::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

const MAX_RETRIES: u32 = 3;
const MAX_REDIRECTS: usize = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const USER_AGENT: &str = concat!("feedsieve/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while fetching one source.
///
/// None of these ever leave [`Fetcher::fetch`]; a failing source simply
/// contributes no entries to the merged feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Fetch exceeded the per-source timeout
    #[error("Request timed out")]
    Timeout,
    /// Body could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Retrieves and parses source documents.
///
/// Every call is independent: nothing fetched is cached between calls.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    retry_base_delay: Duration,
}

impl Fetcher {
    /// Build a fetcher with its own HTTP client.
    ///
    /// `timeout` bounds one whole fetch, retries included. Unless
    /// `allow_private` is set, redirects into localhost or private networks
    /// are refused.
    pub fn new(timeout: Duration, allow_private: bool) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .redirect(redirect_policy(allow_private))
            .build()?;
        Ok(Self::with_client(client, timeout))
    }

    /// Build a fetcher around an existing client (allows custom configuration)
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            retry_base_delay: Duration::from_millis(500),
        }
    }

    /// Override the first backoff delay; later retries double it.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Fetch one source, absorbing every failure.
    ///
    /// Transport errors, bad statuses, oversize or malformed bodies and
    /// timeouts are logged and yield an empty list.
    pub async fn fetch(&self, source: &Source) -> Vec<Entry> {
        let outcome = tokio::time::timeout(self.timeout, self.try_fetch(source.id, &source.url))
            .await
            .unwrap_or(Err(FetchError::Timeout));

        match outcome {
            Ok(entries) => {
                tracing::debug!(
                    source_id = source.id,
                    url = %source.url,
                    entries = entries.len(),
                    "Fetched source"
                );
                entries
            }
            Err(e) => {
                tracing::warn!(
                    source_id = source.id,
                    url = %source.url,
                    error = %e,
                    "Source fetch failed, contributing no entries"
                );
                Vec::new()
            }
        }
    }

    /// Fetch and parse `url`, reporting what went wrong.
    ///
    /// Rate limiting (HTTP 429), server errors (5xx) and truncated bodies are
    /// retried with exponential backoff up to 3 times. This is not bounded by
    /// the fetcher timeout; [`Fetcher::fetch`] applies it.
    pub async fn try_fetch(&self, source_id: i64, url: &str) -> Result<Vec<Entry>, FetchError> {
        let mut retry_count = 0;

        let bytes = loop {
            let response = self.client.get(url).send().await?;

            // EDGE-004: Handle rate limiting with exponential backoff
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::RateLimited(MAX_RETRIES));
                }

                let delay = self.backoff(retry_count);
                tracing::warn!(
                    url = %url,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if response.status().is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::HttpStatus(response.status().as_u16()));
                }

                let delay = self.backoff(retry_count);
                tracing::warn!(
                    url = %url,
                    status = %response.status(),
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx errors fail immediately
            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            match read_limited_bytes(response, MAX_FEED_SIZE).await {
                Ok(bytes) => break bytes,
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    if retry_count >= MAX_RETRIES {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }

                    let delay = self.backoff(retry_count);
                    tracing::debug!(
                        url = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        parse_feed(&bytes, source_id).map_err(|e| FetchError::Parse(e.to_string()))
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        self.retry_base_delay.saturating_mul(2u32.saturating_pow(retry_count))
    }
}

/// Redirect policy with loop detection and limited hops.
///
/// Every hop target passes the same public-address check as registration,
/// so an accepted source cannot bounce the server onto an internal host.
fn redirect_policy(allow_private: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        if !allow_private {
            if let Err(e) = validate_public_url(url.as_str()) {
                tracing::warn!(to = %url, error = %e, "Refusing redirect");
                return attempt.error(e);
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // EDGE-005: fewer bytes than Content-Length means the transfer was cut short
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    fn fetcher() -> Fetcher {
        Fetcher::new(Duration::from_secs(5), true)
            .unwrap()
            .with_retry_base_delay(Duration::from_millis(1))
    }

    fn source(url: String) -> Source {
        Source {
            id: 42,
            url,
            patterns: Vec::new(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;

        let entries = fetcher()
            .fetch(&source(format!("{}/feed", mock_server.uri())))
            .await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Test");
        assert_eq!(entries[0].source_id, 42);
    }

    #[tokio::test]
    async fn test_404_is_reported_and_absorbed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        match fetcher().try_fetch(1, &url).await {
            Err(FetchError::HttpStatus(404)) => {}
            other => panic!("Expected HttpStatus(404), got {:?}", other.map(|e| e.len())),
        }
        assert!(fetcher().fetch(&source(url)).await.is_empty());
    }

    #[tokio::test]
    async fn test_500_error_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        match fetcher().try_fetch(1, &url).await {
            Err(FetchError::HttpStatus(500)) => {}
            other => panic!("Expected HttpStatus(500), got {:?}", other.map(|e| e.len())),
        }
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        let mock_server = MockServer::start().await;

        // First two requests return 503, third succeeds
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let entries = fetcher().try_fetch(1, &url).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        match fetcher().try_fetch(1, &url).await {
            Err(FetchError::Parse(_)) => {}
            other => panic!("Expected Parse error, got {:?}", other.map(|e| e.len())),
        }
        assert!(fetcher().fetch(&source(url)).await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_source_times_out_empty() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new(Duration::from_millis(200), true).unwrap();
        let started = std::time::Instant::now();
        let entries = fetcher
            .fetch(&source(format!("{}/feed", mock_server.uri())))
            .await;
        assert!(entries.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    fn redirect(to: String) -> ResponseTemplate {
        ResponseTemplate::new(302).insert_header("Location", to.as_str())
    }

    #[tokio::test]
    async fn test_redirect_into_private_network_refused() {
        let mock_server = MockServer::start().await;
        Mock::given(path("/feed"))
            .respond_with(redirect(format!("{}/secret", mock_server.uri())))
            .mount(&mock_server)
            .await;
        Mock::given(path("/secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(0)
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new(Duration::from_secs(5), false).unwrap();
        let url = format!("{}/feed", mock_server.uri());
        match fetcher.try_fetch(1, &url).await {
            Err(FetchError::Network(e)) => assert!(e.is_redirect(), "{e}"),
            other => panic!("Expected redirect error, got {:?}", other.map(|e| e.len())),
        }
        assert!(fetcher.fetch(&source(url)).await.is_empty());
    }

    #[tokio::test]
    async fn test_redirect_followed_when_private_allowed() {
        let mock_server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(redirect(format!("{}/new", mock_server.uri())))
            .mount(&mock_server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/old", mock_server.uri());
        let entries = fetcher().try_fetch(1, &url).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_redirect_loop_detected() {
        let mock_server = MockServer::start().await;
        Mock::given(path("/a"))
            .respond_with(redirect(format!("{}/b", mock_server.uri())))
            .mount(&mock_server)
            .await;
        Mock::given(path("/b"))
            .respond_with(redirect(format!("{}/a", mock_server.uri())))
            .mount(&mock_server)
            .await;

        let url = format!("{}/a", mock_server.uri());
        match fetcher().try_fetch(1, &url).await {
            Err(FetchError::Network(e)) => assert!(e.is_redirect(), "{e}"),
            other => panic!("Expected redirect error, got {:?}", other.map(|e| e.len())),
        }
    }

    #[tokio::test]
    async fn test_long_redirect_chain_refused() {
        let mock_server = MockServer::start().await;
        for hop in 0..5 {
            Mock::given(path(format!("/hop{hop}")))
                .respond_with(redirect(format!("{}/hop{}", mock_server.uri(), hop + 1)))
                .mount(&mock_server)
                .await;
        }
        Mock::given(path("/hop5"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(0)
            .mount(&mock_server)
            .await;

        let url = format!("{}/hop0", mock_server.uri());
        match fetcher().try_fetch(1, &url).await {
            Err(FetchError::Network(e)) => assert!(e.is_redirect(), "{e}"),
            other => panic!("Expected redirect error, got {:?}", other.map(|e| e.len())),
        }
    }

    #[tokio::test]
    async fn test_unreachable_source_is_empty() {
        // Port 1 is reserved (tcpmux) and refuses connections on test hosts
        let entries = fetcher()
            .fetch(&source("http://127.0.0.1:1/feed".to_string()))
            .await;
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_empty_feed_success() {
        let empty_rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel></channel></rss>"#;

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(empty_rss))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let entries = fetcher().try_fetch(1, &url).await.unwrap();
        assert!(entries.is_empty());
    }
}
