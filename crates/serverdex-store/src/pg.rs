//! Postgres-backed catalog store and run ledger.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serverdex_core::{
    Lifecycle, Ownership, ServerRecord, ServerStatus, SyncFailure, SyncLockRow, SyncRunRow,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::{
    AcquireLockResult, CatalogStore, ExistingRow, FinishRun, LedgerRead, LifecycleRow, StoreError,
    SyncLedger, MAX_RECORDED_FAILURES,
};

const SLUG_QUERY_CHUNK: usize = 250;
const BASELINE_PAGE_SIZE: i64 = 1000;

const UPSERT_SQL: &str = r#"
INSERT INTO servers (
    slug, name, description, server_url, repo_url, category, auth_type,
    tags, maintainer_name, maintainer_email, status, verification_level,
    ownership, lifecycle, content_hash, updated_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
ON CONFLICT (slug) DO UPDATE SET
    name = EXCLUDED.name,
    description = EXCLUDED.description,
    server_url = EXCLUDED.server_url,
    repo_url = EXCLUDED.repo_url,
    category = EXCLUDED.category,
    auth_type = EXCLUDED.auth_type,
    tags = EXCLUDED.tags,
    maintainer_name = EXCLUDED.maintainer_name,
    maintainer_email = EXCLUDED.maintainer_email,
    status = EXCLUDED.status,
    verification_level = EXCLUDED.verification_level,
    ownership = EXCLUDED.ownership,
    lifecycle = EXCLUDED.lifecycle,
    content_hash = EXCLUDED.content_hash,
    updated_at = NOW()
"#;

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Message(format!("running migrations: {err}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    row: &'q ServerRecord,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&row.slug)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.server_url)
        .bind(&row.repo_url)
        .bind(&row.category)
        .bind(row.auth_type.as_str())
        .bind(&row.tags)
        .bind(&row.maintainer.name)
        .bind(&row.maintainer.email)
        .bind(row.status.as_str())
        .bind(row.verification_level.as_str())
        .bind(row.ownership.as_str())
        .bind(row.lifecycle.as_str())
        .bind(&row.content_hash)
}

fn parse_ownership(raw: &str) -> Result<Ownership, StoreError> {
    Ownership::parse(raw)
        .ok_or_else(|| StoreError::Message(format!("unknown ownership value: {raw}")))
}

fn parse_lifecycle(raw: &str) -> Result<Lifecycle, StoreError> {
    Lifecycle::parse(raw)
        .ok_or_else(|| StoreError::Message(format!("unknown lifecycle value: {raw}")))
}

fn existing_row_from_pg(row: &PgRow) -> Result<ExistingRow, StoreError> {
    let ownership: String = row.try_get("ownership")?;
    let lifecycle: String = row.try_get("lifecycle")?;
    Ok(ExistingRow {
        slug: row.try_get("slug")?,
        ownership: parse_ownership(&ownership)?,
        lifecycle: parse_lifecycle(&lifecycle)?,
        content_hash: row.try_get("content_hash")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn existing_by_slug(
        &self,
        slugs: &[String],
    ) -> Result<HashMap<String, ExistingRow>, StoreError> {
        let mut out = HashMap::with_capacity(slugs.len());
        for chunk in slugs.chunks(SLUG_QUERY_CHUNK) {
            let rows = sqlx::query(
                r#"
                SELECT slug, ownership, lifecycle, content_hash
                  FROM servers
                 WHERE slug = ANY($1)
                "#,
            )
            .bind(chunk.to_vec())
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                let existing = existing_row_from_pg(row)?;
                out.insert(existing.slug.clone(), existing);
            }
        }
        Ok(out)
    }

    async fn slug_by_repo_url(&self) -> Result<HashMap<String, String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT slug, repo_url
              FROM servers
             WHERE repo_url IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let slug: String = row.try_get("slug")?;
            let repo_url: String = row.try_get("repo_url")?;
            out.entry(repo_url.to_lowercase()).or_insert(slug);
        }
        Ok(out)
    }

    async fn auto_managed_rows(&self) -> Result<Vec<LifecycleRow>, StoreError> {
        let mut out = Vec::new();
        let mut offset = 0i64;
        loop {
            let rows = sqlx::query(
                r#"
                SELECT slug, lifecycle
                  FROM servers
                 WHERE ownership = 'auto'
                   AND lifecycle IN ('active', 'stale_candidate')
                 ORDER BY slug
                 LIMIT $1 OFFSET $2
                "#,
            )
            .bind(BASELINE_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            let page_len = rows.len();
            for row in &rows {
                let lifecycle: String = row.try_get("lifecycle")?;
                out.push(LifecycleRow {
                    slug: row.try_get("slug")?,
                    lifecycle: parse_lifecycle(&lifecycle)?,
                });
            }
            if (page_len as i64) < BASELINE_PAGE_SIZE {
                break;
            }
            offset += BASELINE_PAGE_SIZE;
        }
        Ok(out)
    }

    async fn upsert_batch(&self, rows: &[ServerRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            bind_record(sqlx::query(UPSERT_SQL), row)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_row(&self, row: &ServerRecord) -> Result<(), StoreError> {
        bind_record(sqlx::query(UPSERT_SQL), row)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_lifecycle(
        &self,
        slug: &str,
        lifecycle: Lifecycle,
        status: Option<ServerStatus>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE servers
               SET lifecycle = $2,
                   status = COALESCE($3, status),
                   updated_at = NOW()
             WHERE slug = $1
            "#,
        )
        .bind(slug)
        .bind(lifecycle.as_str())
        .bind(status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncLedger for PgCatalogStore {
    async fn acquire_lock(
        &self,
        lock_key: &str,
        holder_id: Uuid,
        ttl: Duration,
    ) -> AcquireLockResult {
        let now = Utc::now();
        let locked_until =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        let existing = sqlx::query(
            r#"
            SELECT holder_id, locked_until
              FROM catalog_sync_locks
             WHERE lock_key = $1
            "#,
        )
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await;

        let existing = match existing {
            Ok(existing) => existing,
            Err(err) => {
                warn!(lock_key, error = %err, "lock read failed; acquiring fail-open");
                return AcquireLockResult {
                    acquired: true,
                    locked_until: None,
                    degraded: true,
                };
            }
        };

        if let Some(row) = &existing {
            let held_by: Uuid = row.try_get("holder_id").unwrap_or_else(|_| Uuid::nil());
            let held_until: DateTime<Utc> = row.try_get("locked_until").unwrap_or(now);
            if held_until > now && held_by != holder_id {
                return AcquireLockResult {
                    acquired: false,
                    locked_until: Some(held_until),
                    degraded: false,
                };
            }
        }

        let upsert = sqlx::query(
            r#"
            INSERT INTO catalog_sync_locks (lock_key, holder_id, locked_until)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE SET
                holder_id = EXCLUDED.holder_id,
                locked_until = EXCLUDED.locked_until
            "#,
        )
        .bind(lock_key)
        .bind(holder_id)
        .bind(locked_until)
        .execute(&self.pool)
        .await;

        if let Err(err) = upsert {
            warn!(lock_key, error = %err, "lock upsert failed; acquiring fail-open");
            return AcquireLockResult {
                acquired: true,
                locked_until: None,
                degraded: true,
            };
        }

        // Re-read to verify holdership; another racer may have overwritten
        // the row between our read and our write.
        let verify = sqlx::query(
            r#"
            SELECT holder_id, locked_until
              FROM catalog_sync_locks
             WHERE lock_key = $1
            "#,
        )
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await;

        match verify {
            Ok(Some(row)) => {
                let held_by: Uuid = row.try_get("holder_id").unwrap_or_else(|_| Uuid::nil());
                let held_until: DateTime<Utc> = row.try_get("locked_until").unwrap_or(locked_until);
                AcquireLockResult {
                    acquired: held_by == holder_id && held_until > now,
                    locked_until: Some(held_until),
                    degraded: false,
                }
            }
            Ok(None) => AcquireLockResult {
                acquired: false,
                locked_until: None,
                degraded: false,
            },
            Err(err) => {
                warn!(lock_key, error = %err, "lock verify failed; acquiring fail-open");
                AcquireLockResult {
                    acquired: true,
                    locked_until: Some(locked_until),
                    degraded: true,
                }
            }
        }
    }

    async fn release_lock(&self, lock_key: &str, holder_id: Uuid) {
        let result = sqlx::query(
            r#"
            UPDATE catalog_sync_locks
               SET locked_until = NOW()
             WHERE lock_key = $1
               AND holder_id = $2
            "#,
        )
        .bind(lock_key)
        .bind(holder_id)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(lock_key, error = %err, "lock release failed");
        }
    }

    async fn start_run(&self, trigger: &str, source_scope: &[String]) -> Option<Uuid> {
        let run_id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO catalog_sync_runs (id, trigger, status, source_scope, started_at)
            VALUES ($1, $2, 'running', $3, NOW())
            "#,
        )
        .bind(run_id)
        .bind(trigger)
        .bind(source_scope.to_vec())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Some(run_id),
            Err(err) => {
                warn!(trigger, error = %err, "failed to start ledger run");
                None
            }
        }
    }

    async fn finish_run(&self, run_id: Uuid, finish: FinishRun) {
        let status = finish
            .status
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "error".to_string());
        let result = sqlx::query(
            r#"
            UPDATE catalog_sync_runs
               SET status = $2,
                   finished_at = NOW(),
                   duration_ms = $3,
                   fetched = $4,
                   upserted = $5,
                   failed = $6,
                   stale_marked = $7,
                   error_summary = $8
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status)
        .bind(finish.duration_ms.max(0))
        .bind(finish.fetched.max(0))
        .bind(finish.upserted.max(0))
        .bind(finish.failed.max(0))
        .bind(finish.stale_marked.max(0))
        .bind(finish.error_summary)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(%run_id, error = %err, "failed to finish ledger run");
        }
    }

    async fn record_failures(&self, run_id: Uuid, failures: &[SyncFailure], limit: usize) {
        if failures.is_empty() {
            return;
        }
        let bounded = limit.clamp(1, MAX_RECORDED_FAILURES);
        for failure in failures.iter().take(bounded) {
            let result = sqlx::query(
                r#"
                INSERT INTO catalog_sync_failures
                    (run_id, source, entity_key, stage, error_message_sanitized)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(run_id)
            .bind(&failure.source)
            .bind(&failure.entity_key)
            .bind(&failure.stage)
            .bind(&failure.reason)
            .execute(&self.pool)
            .await;

            if let Err(err) = result {
                warn!(%run_id, error = %err, "failed to record sync failures");
                return;
            }
        }
    }

    async fn recent_runs(&self, limit: usize) -> LedgerRead<Vec<SyncRunRow>> {
        let bounded = limit.clamp(1, 50) as i64;
        let rows = sqlx::query(
            r#"
            SELECT id, trigger, status, source_scope, started_at, finished_at,
                   fetched, upserted, failed, stale_marked, duration_ms, error_summary
              FROM catalog_sync_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(bounded)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => {
                let mut out = Vec::with_capacity(rows.len());
                for row in &rows {
                    let parsed = (|| -> Result<SyncRunRow, sqlx::Error> {
                        Ok(SyncRunRow {
                            id: row.try_get("id")?,
                            trigger: row.try_get("trigger")?,
                            status: row.try_get("status")?,
                            source_scope: row.try_get("source_scope")?,
                            started_at: row.try_get("started_at")?,
                            finished_at: row.try_get("finished_at")?,
                            fetched: row.try_get("fetched")?,
                            upserted: row.try_get("upserted")?,
                            failed: row.try_get("failed")?,
                            stale_marked: row.try_get("stale_marked")?,
                            duration_ms: row.try_get("duration_ms")?,
                            error_summary: row.try_get("error_summary")?,
                        })
                    })();
                    match parsed {
                        Ok(run) => out.push(run),
                        Err(err) => warn!(error = %err, "skipping malformed ledger row"),
                    }
                }
                LedgerRead {
                    degraded: false,
                    data: out,
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to read recent runs");
                LedgerRead {
                    degraded: true,
                    data: Vec::new(),
                }
            }
        }
    }

    async fn active_locks(&self) -> LedgerRead<Vec<SyncLockRow>> {
        let rows = sqlx::query(
            r#"
            SELECT lock_key, holder_id, locked_until
              FROM catalog_sync_locks
             WHERE locked_until > NOW()
             ORDER BY locked_until DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => {
                let mut out = Vec::with_capacity(rows.len());
                for row in &rows {
                    let parsed = (|| -> Result<SyncLockRow, sqlx::Error> {
                        Ok(SyncLockRow {
                            lock_key: row.try_get("lock_key")?,
                            holder_id: row.try_get("holder_id")?,
                            locked_until: row.try_get("locked_until")?,
                        })
                    })();
                    match parsed {
                        Ok(lock) => out.push(lock),
                        Err(err) => warn!(error = %err, "skipping malformed lock row"),
                    }
                }
                LedgerRead {
                    degraded: false,
                    data: out,
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to read active locks");
                LedgerRead {
                    degraded: true,
                    data: Vec::new(),
                }
            }
        }
    }
}
