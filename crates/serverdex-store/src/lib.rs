//! HTTP fetch utilities and the persistence seam for serverdex.
//!
//! The sync engine talks to storage through the [`CatalogStore`] and
//! [`SyncLedger`] traits. [`PgCatalogStore`] backs them with Postgres;
//! [`MemoryCatalogStore`] backs them with in-process maps for tests and
//! offline runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serverdex_core::{
    Lifecycle, Ownership, ServerRecord, ServerStatus, SyncFailure, SyncLockRow, SyncRunRow,
    SyncRunStatus,
};
use thiserror::Error;
use tracing::info_span;
use uuid::Uuid;

mod memory;
mod pg;

pub use memory::MemoryCatalogStore;
pub use pg::PgCatalogStore;

pub const CRATE_NAME: &str = "serverdex-store";

/// Hard cap on failure rows persisted per run.
pub const MAX_RECORDED_FAILURES: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Slice of a persisted row the reconciler needs to decide create/update/skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingRow {
    pub slug: String,
    pub ownership: Ownership,
    pub lifecycle: Lifecycle,
    pub content_hash: String,
}

/// Slice of a persisted row the stale manager needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRow {
    pub slug: String,
    pub lifecycle: Lifecycle,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Rows matching any of the given slugs, keyed by slug.
    async fn existing_by_slug(
        &self,
        slugs: &[String],
    ) -> Result<HashMap<String, ExistingRow>, StoreError>;

    /// Lowercased canonical repo URL -> owning slug, for cross-source merge.
    async fn slug_by_repo_url(&self) -> Result<HashMap<String, String>, StoreError>;

    /// Auto-owned rows still in the active-or-grace window; the stale
    /// baseline.
    async fn auto_managed_rows(&self) -> Result<Vec<LifecycleRow>, StoreError>;

    /// Upsert a batch atomically, keyed on slug. Any row failing fails the
    /// whole batch; callers fall back to [`CatalogStore::upsert_row`].
    async fn upsert_batch(&self, rows: &[ServerRecord]) -> Result<(), StoreError>;

    async fn upsert_row(&self, row: &ServerRecord) -> Result<(), StoreError>;

    /// Lifecycle transition for one row; `status` is only written when the
    /// transition demands it (rejection).
    async fn apply_lifecycle(
        &self,
        slug: &str,
        lifecycle: Lifecycle,
        status: Option<ServerStatus>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireLockResult {
    pub acquired: bool,
    pub locked_until: Option<DateTime<Utc>>,
    /// The backing store was unreachable and the lock was granted fail-open.
    pub degraded: bool,
}

/// Wrapper for best-effort ledger reads.
#[derive(Debug, Clone)]
pub struct LedgerRead<T> {
    pub degraded: bool,
    pub data: T,
}

#[derive(Debug, Clone, Default)]
pub struct FinishRun {
    pub status: Option<SyncRunStatus>,
    pub duration_ms: i64,
    pub fetched: i64,
    pub upserted: i64,
    pub failed: i64,
    pub stale_marked: i64,
    pub error_summary: Option<String>,
}

/// Best-effort run bookkeeping. Nothing here returns an error: observability
/// must not become a dependency of correctness.
#[async_trait]
pub trait SyncLedger: Send + Sync {
    /// TTL lock acquisition: read-then-upsert-then-verify. Not an atomic
    /// compare-and-set; two holders racing inside the verify window can both
    /// win. Store unavailability grants the lock with `degraded = true`.
    async fn acquire_lock(
        &self,
        lock_key: &str,
        holder_id: Uuid,
        ttl: Duration,
    ) -> AcquireLockResult;

    /// Expire the lock early, only if still held by `holder_id`.
    async fn release_lock(&self, lock_key: &str, holder_id: Uuid);

    /// Insert a `running` ledger row. `None` when the store is unavailable.
    async fn start_run(&self, trigger: &str, source_scope: &[String]) -> Option<Uuid>;

    async fn finish_run(&self, run_id: Uuid, finish: FinishRun);

    /// Persist a bounded, sanitized failure sample. `limit` is clamped to
    /// [`MAX_RECORDED_FAILURES`].
    async fn record_failures(&self, run_id: Uuid, failures: &[SyncFailure], limit: usize);

    async fn recent_runs(&self, limit: usize) -> LedgerRead<Vec<SyncRunRow>>;

    async fn active_locks(&self) -> LedgerRead<Vec<SyncLockRow>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying GET client shared by every source adapter. Each request carries
/// the configured timeout; retryable failures (5xx, 429, transport errors)
/// back off exponentially up to `max_retries`.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Fetch `url`, optionally with a bearer token. The token is attached to
    /// the request only; it is deliberately absent from the span and from
    /// every error this method produces.
    pub async fn fetch_bytes(
        &self,
        source: &str,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url).header("accept", "application/json");
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_classification_covers_throttling() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }
}
