use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use super::audit::{AuditEntry, AuditSink};
use super::error::{FetchError, SyncError};

pub const DEFAULT_BASE_URL: &str = "https://www.keyforgegame.com/api";

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// How many times one page may be requested within a run.
///
/// The default (`max_attempts = 1`) fails fast and leaves the retry to the next scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exp = next_attempt.saturating_sub(2).min(16);
        self.backoff.saturating_mul(1u32 << exp)
    }
}

/// A successfully fetched catalog page.
#[derive(Debug, Clone)]
pub struct Page {
    pub number: u32,
    pub url: String,
    pub status: u16,
    pub payload: Value,
}

/// KeyForge public deck catalog client.
///
/// Endpoint: `GET {base}/decks/?page=N&page_size=S&links=cards&ordering=-date`
///
/// Every HTTP attempt is written to the audit sink before its outcome is inspected.
#[derive(Debug, Clone)]
pub struct KeyforgeClient {
    decks_url: Url,
    http: Client,
    page_size: u32,
    retry: RetryPolicy,
}

impl KeyforgeClient {
    pub fn new(base_url: Option<&str>, page_size: u32, timeout: Duration) -> Result<Self> {
        let base = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/');
        let decks_url = Url::parse(&format!("{base}/decks/"))
            .with_context(|| format!("invalid catalog base url {base}"))?;
        let http = Client::builder()
            .user_agent(concat!("keyforge-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            decks_url,
            http,
            page_size,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_url(&self, page: u32) -> Url {
        let mut url = self.decks_url.clone();
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("page_size", &self.page_size.to_string())
            .append_pair("links", "cards")
            .append_pair("ordering", "-date");
        url
    }

    /// Fetch one page, retrying transient failures per the configured [`RetryPolicy`].
    #[instrument(skip(self, audit), fields(page_size = self.page_size))]
    pub async fn fetch_page<A>(&self, page: u32, audit: &A) -> Result<Page, SyncError>
    where
        A: AuditSink + ?Sized,
    {
        let url = self.page_url(page);
        let mut attempt = 1;
        loop {
            match self.attempt(page, &url, audit).await {
                Err(SyncError::Fetch(err))
                    if err.is_transient() && attempt < self.retry.max_attempts =>
                {
                    attempt += 1;
                    let delay = self.retry.delay_before(attempt);
                    warn!(
                        page,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "keyforge: transient fetch failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn attempt<A>(&self, page: u32, url: &Url, audit: &A) -> Result<Page, SyncError>
    where
        A: AuditSink + ?Sized,
    {
        let called_at = Utc::now();
        let resp = match self
            .http
            .get(url.clone())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                let message = err.to_string();
                record(
                    audit,
                    AuditEntry::transport_failure(url.as_str(), called_at, message.clone()),
                )
                .await?;
                return Err(FetchError {
                    status: None,
                    message,
                }
                .into());
            }
        };

        let status = resp.status();
        record(
            audit,
            AuditEntry::response(url.as_str(), called_at, status.as_u16()),
        )
        .await?;

        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 500);
            return Err(FetchError {
                status: Some(status.as_u16()),
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            }
            .into());
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedPage(format!("page {page}: body is not json: {e}")))?;
        debug!(page, status = status.as_u16(), "keyforge: page fetched");
        Ok(Page {
            number: page,
            url: url.to_string(),
            status: status.as_u16(),
            payload,
        })
    }
}

async fn record<A>(audit: &A, entry: AuditEntry) -> Result<(), SyncError>
where
    A: AuditSink + ?Sized,
{
    audit
        .append(&entry)
        .await
        .map_err(|e| SyncError::StorageUnavailable(format!("audit write failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str) -> KeyforgeClient {
        KeyforgeClient::new(Some(base), 10, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn builds_catalog_query() {
        let url = client("https://example.test/api/").page_url(3);
        assert_eq!(
            url.as_str(),
            "https://example.test/api/decks/?page=3&page_size=10&links=cards&ordering=-date"
        );
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn success_is_audited_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/decks/"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 0, "data": [], "_linked": {}
            })))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let page = client(&server.uri()).fetch_page(2, &store).await.unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.number, 2);

        let audit = store.audit_entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].response_code, Some(200));
        assert_eq!(audit[0].url, page.url);
    }

    #[tokio::test]
    async fn server_error_is_fetch_error_and_audited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let err = client(&server.uri()).fetch_page(1, &store).await.unwrap_err();
        match err {
            SyncError::Fetch(FetchError { status, message }) => {
                assert_eq!(status, Some(503));
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected {other:?}"),
        }
        let audit = store.audit_entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].response_code, Some(503));
    }

    #[tokio::test]
    async fn transport_failure_is_audited_without_status() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let store = MemoryStore::new();
        let err = client(&format!("http://{addr}"))
            .fetch_page(1, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch(FetchError { status: None, .. })));

        let audit = store.audit_entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].response_code, None);
        assert!(audit[0].error.is_some());
    }

    #[tokio::test]
    async fn retries_transient_failures_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 0, "data": []
            })))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let page = client(&server.uri())
            .with_retry(RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            })
            .fetch_page(5, &store)
            .await
            .unwrap();
        assert_eq!(page.status, 200);

        let codes: Vec<_> = store
            .audit_entries()
            .await
            .into_iter()
            .map(|e| e.response_code)
            .collect();
        assert_eq!(codes, vec![Some(502), Some(200)]);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let err = client(&server.uri())
            .with_retry(RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            })
            .fetch_page(9, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch(FetchError { status: Some(404), .. })));
        assert_eq!(store.audit_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn non_json_success_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let err = client(&server.uri()).fetch_page(1, &store).await.unwrap_err();
        assert!(matches!(err, SyncError::MalformedPage(_)));
        assert_eq!(store.audit_entries().await.len(), 1);
    }
}
