//! In-memory catalog store and ledger.
//!
//! Implements the same traits as the Postgres store so the reconciliation
//! pipeline can be exercised end to end without a database. Also useful for
//! offline smoke runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serverdex_core::{
    Lifecycle, Ownership, ServerRecord, ServerStatus, SyncFailure, SyncLockRow, SyncRunRow,
    SyncRunStatus,
};
use uuid::Uuid;

use crate::{
    AcquireLockResult, CatalogStore, ExistingRow, FinishRun, LedgerRead, LifecycleRow, StoreError,
    SyncLedger, MAX_RECORDED_FAILURES,
};

#[derive(Default)]
pub struct MemoryCatalogStore {
    servers: Mutex<BTreeMap<String, ServerRecord>>,
    locks: Mutex<HashMap<String, SyncLockRow>>,
    runs: Mutex<Vec<SyncRunRow>>,
    failures: Mutex<Vec<(Uuid, SyncFailure)>>,
    // Slugs whose writes fail, for exercising the batch-then-row fallback.
    failing_slugs: Mutex<HashSet<String>>,
    ledger_unavailable: AtomicBool,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_record(&self, record: ServerRecord) {
        self.servers
            .lock()
            .expect("servers mutex poisoned")
            .insert(record.slug.clone(), record);
    }

    pub fn record(&self, slug: &str) -> Option<ServerRecord> {
        self.servers
            .lock()
            .expect("servers mutex poisoned")
            .get(slug)
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.servers.lock().expect("servers mutex poisoned").len()
    }

    /// Make every write touching `slug` fail, to simulate a malformed row.
    pub fn fail_writes_for(&self, slug: &str) {
        self.failing_slugs
            .lock()
            .expect("failing slugs mutex poisoned")
            .insert(slug.to_string());
    }

    /// Simulate ledger/lock store unavailability (fail-open paths).
    pub fn set_ledger_unavailable(&self, unavailable: bool) {
        self.ledger_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    pub fn recorded_failures(&self) -> Vec<(Uuid, SyncFailure)> {
        self.failures
            .lock()
            .expect("failures mutex poisoned")
            .clone()
    }

    pub fn runs(&self) -> Vec<SyncRunRow> {
        self.runs.lock().expect("runs mutex poisoned").clone()
    }

    fn slug_fails(&self, slug: &str) -> bool {
        self.failing_slugs
            .lock()
            .expect("failing slugs mutex poisoned")
            .contains(slug)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn existing_by_slug(
        &self,
        slugs: &[String],
    ) -> Result<HashMap<String, ExistingRow>, StoreError> {
        let servers = self.servers.lock().expect("servers mutex poisoned");
        let mut out = HashMap::new();
        for slug in slugs {
            if let Some(record) = servers.get(slug) {
                out.insert(
                    slug.clone(),
                    ExistingRow {
                        slug: record.slug.clone(),
                        ownership: record.ownership,
                        lifecycle: record.lifecycle,
                        content_hash: record.content_hash.clone(),
                    },
                );
            }
        }
        Ok(out)
    }

    async fn slug_by_repo_url(&self) -> Result<HashMap<String, String>, StoreError> {
        let servers = self.servers.lock().expect("servers mutex poisoned");
        let mut out = HashMap::new();
        for record in servers.values() {
            if let Some(repo_url) = &record.repo_url {
                out.entry(repo_url.to_lowercase())
                    .or_insert_with(|| record.slug.clone());
            }
        }
        Ok(out)
    }

    async fn auto_managed_rows(&self) -> Result<Vec<LifecycleRow>, StoreError> {
        let servers = self.servers.lock().expect("servers mutex poisoned");
        Ok(servers
            .values()
            .filter(|r| {
                r.ownership == Ownership::Auto
                    && matches!(r.lifecycle, Lifecycle::Active | Lifecycle::StaleCandidate)
            })
            .map(|r| LifecycleRow {
                slug: r.slug.clone(),
                lifecycle: r.lifecycle,
            })
            .collect())
    }

    async fn upsert_batch(&self, rows: &[ServerRecord]) -> Result<(), StoreError> {
        // Batch semantics mirror the transactional Postgres path: one bad
        // row fails the lot and nothing is applied.
        if let Some(bad) = rows.iter().find(|r| self.slug_fails(&r.slug)) {
            return Err(StoreError::Message(format!(
                "simulated write failure for {}",
                bad.slug
            )));
        }
        let mut servers = self.servers.lock().expect("servers mutex poisoned");
        for row in rows {
            servers.insert(row.slug.clone(), row.clone());
        }
        Ok(())
    }

    async fn upsert_row(&self, row: &ServerRecord) -> Result<(), StoreError> {
        if self.slug_fails(&row.slug) {
            return Err(StoreError::Message(format!(
                "simulated write failure for {}",
                row.slug
            )));
        }
        self.servers
            .lock()
            .expect("servers mutex poisoned")
            .insert(row.slug.clone(), row.clone());
        Ok(())
    }

    async fn apply_lifecycle(
        &self,
        slug: &str,
        lifecycle: Lifecycle,
        status: Option<ServerStatus>,
    ) -> Result<(), StoreError> {
        if self.slug_fails(slug) {
            return Err(StoreError::Message(format!(
                "simulated write failure for {slug}"
            )));
        }
        let mut servers = self.servers.lock().expect("servers mutex poisoned");
        if let Some(record) = servers.get_mut(slug) {
            record.lifecycle = lifecycle;
            if let Some(status) = status {
                record.status = status;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncLedger for MemoryCatalogStore {
    async fn acquire_lock(
        &self,
        lock_key: &str,
        holder_id: Uuid,
        ttl: Duration,
    ) -> AcquireLockResult {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            return AcquireLockResult {
                acquired: true,
                locked_until: None,
                degraded: true,
            };
        }

        let now = Utc::now();
        let locked_until =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut locks = self.locks.lock().expect("locks mutex poisoned");

        if let Some(existing) = locks.get(lock_key) {
            if existing.locked_until > now && existing.holder_id != holder_id {
                return AcquireLockResult {
                    acquired: false,
                    locked_until: Some(existing.locked_until),
                    degraded: false,
                };
            }
        }

        locks.insert(
            lock_key.to_string(),
            SyncLockRow {
                lock_key: lock_key.to_string(),
                holder_id,
                locked_until,
            },
        );
        AcquireLockResult {
            acquired: true,
            locked_until: Some(locked_until),
            degraded: false,
        }
    }

    async fn release_lock(&self, lock_key: &str, holder_id: Uuid) {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            return;
        }
        let mut locks = self.locks.lock().expect("locks mutex poisoned");
        if let Some(existing) = locks.get_mut(lock_key) {
            if existing.holder_id == holder_id {
                existing.locked_until = Utc::now();
            }
        }
    }

    async fn start_run(&self, trigger: &str, source_scope: &[String]) -> Option<Uuid> {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            return None;
        }
        let run_id = Uuid::new_v4();
        self.runs.lock().expect("runs mutex poisoned").push(SyncRunRow {
            id: run_id,
            trigger: trigger.to_string(),
            status: SyncRunStatus::Running.as_str().to_string(),
            source_scope: source_scope.to_vec(),
            started_at: Utc::now(),
            finished_at: None,
            fetched: 0,
            upserted: 0,
            failed: 0,
            stale_marked: 0,
            duration_ms: None,
            error_summary: None,
        });
        Some(run_id)
    }

    async fn finish_run(&self, run_id: Uuid, finish: FinishRun) {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            return;
        }
        let mut runs = self.runs.lock().expect("runs mutex poisoned");
        if let Some(run) = runs.iter_mut().find(|r| r.id == run_id) {
            run.status = finish
                .status
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| SyncRunStatus::Error.as_str().to_string());
            run.finished_at = Some(Utc::now());
            run.duration_ms = Some(finish.duration_ms.max(0));
            run.fetched = finish.fetched.max(0);
            run.upserted = finish.upserted.max(0);
            run.failed = finish.failed.max(0);
            run.stale_marked = finish.stale_marked.max(0);
            run.error_summary = finish.error_summary;
        }
    }

    async fn record_failures(&self, run_id: Uuid, failures: &[SyncFailure], limit: usize) {
        if self.ledger_unavailable.load(Ordering::SeqCst) || failures.is_empty() {
            return;
        }
        let bounded = limit.clamp(1, MAX_RECORDED_FAILURES);
        let mut stored = self.failures.lock().expect("failures mutex poisoned");
        for failure in failures.iter().take(bounded) {
            stored.push((run_id, failure.clone()));
        }
    }

    async fn recent_runs(&self, limit: usize) -> LedgerRead<Vec<SyncRunRow>> {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            return LedgerRead {
                degraded: true,
                data: Vec::new(),
            };
        }
        let runs = self.runs.lock().expect("runs mutex poisoned");
        let bounded = limit.clamp(1, 50);
        let mut data = runs.clone();
        data.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        data.truncate(bounded);
        LedgerRead {
            degraded: false,
            data,
        }
    }

    async fn active_locks(&self) -> LedgerRead<Vec<SyncLockRow>> {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            return LedgerRead {
                degraded: true,
                data: Vec::new(),
            };
        }
        let now = Utc::now();
        let locks = self.locks.lock().expect("locks mutex poisoned");
        let mut data = locks
            .values()
            .filter(|l| l.locked_until > now)
            .cloned()
            .collect::<Vec<_>>();
        data.sort_by(|a, b| b.locked_until.cmp(&a.locked_until));
        LedgerRead {
            degraded: false,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serverdex_core::{AuthType, Candidate, Maintainer, VerificationLevel};

    fn record(slug: &str) -> ServerRecord {
        ServerRecord::from_candidate(Candidate {
            slug: slug.to_string(),
            name: "Example".into(),
            description: "Example server.".into(),
            server_url: None,
            repo_url: Some(format!("https://github.com/acme/{slug}")),
            category: "Other Tools and Integrations".into(),
            auth_type: AuthType::None,
            tags: vec!["mcp-registry".into()],
            maintainer: Maintainer {
                name: "Acme".into(),
                email: None,
            },
            status: ServerStatus::Active,
            verification_level: VerificationLevel::Community,
        })
    }

    #[tokio::test]
    async fn batch_upsert_is_all_or_nothing() {
        let store = MemoryCatalogStore::new();
        store.fail_writes_for("bad");
        let rows = vec![record("good"), record("bad")];
        assert!(store.upsert_batch(&rows).await.is_err());
        assert_eq!(store.record_count(), 0);
        assert!(store.upsert_row(&record("good")).await.is_ok());
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn lock_contention_and_expiry() {
        let store = MemoryCatalogStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = store
            .acquire_lock("catalog:sync:registry", a, Duration::from_secs(60))
            .await;
        assert!(first.acquired);
        assert!(!first.degraded);

        let contended = store
            .acquire_lock("catalog:sync:registry", b, Duration::from_secs(60))
            .await;
        assert!(!contended.acquired);
        assert_eq!(contended.locked_until, first.locked_until);

        // Re-entry by the same holder extends rather than conflicts.
        let reentrant = store
            .acquire_lock("catalog:sync:registry", a, Duration::from_secs(60))
            .await;
        assert!(reentrant.acquired);

        store.release_lock("catalog:sync:registry", a).await;
        let after_release = store
            .acquire_lock("catalog:sync:registry", b, Duration::from_secs(60))
            .await;
        assert!(after_release.acquired);
    }

    #[tokio::test]
    async fn unavailable_ledger_fails_open() {
        let store = MemoryCatalogStore::new();
        store.set_ledger_unavailable(true);
        let result = store
            .acquire_lock("catalog:sync:registry", Uuid::new_v4(), Duration::from_secs(60))
            .await;
        assert!(result.acquired);
        assert!(result.degraded);
        assert!(store.start_run("manual", &["registry".into()]).await.is_none());
    }

    #[tokio::test]
    async fn failure_recording_is_truncated() {
        let store = MemoryCatalogStore::new();
        let run_id = store.start_run("manual", &[]).await.unwrap();
        let failures = (0..10)
            .map(|i| SyncFailure {
                source: "registry".into(),
                entity_key: format!("slug-{i}"),
                stage: "upsert".into(),
                reason: "boom".into(),
            })
            .collect::<Vec<_>>();
        store.record_failures(run_id, &failures, 3).await;
        assert_eq!(store.recorded_failures().len(), 3);
    }

    #[tokio::test]
    async fn baseline_only_counts_auto_rows_in_window() {
        let store = MemoryCatalogStore::new();
        let mut manual = record("manual-row");
        manual.ownership = Ownership::Manual;
        let mut rejected = record("rejected-row");
        rejected.lifecycle = Lifecycle::Rejected;
        store.insert_record(manual);
        store.insert_record(rejected);
        store.insert_record(record("active-row"));
        let mut grace = record("grace-row");
        grace.lifecycle = Lifecycle::StaleCandidate;
        store.insert_record(grace);

        let rows = store.auto_managed_rows().await.unwrap();
        let slugs = rows.iter().map(|r| r.slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, vec!["active-row", "grace-row"]);
    }
}
