//! Two-phase stale lifecycle: grace-mark rows that vanished upstream, then
//! reject them if still missing on the next healthy run.
//!
//! The manager never deletes anything, and it refuses to run at all unless
//! the fetch phase was fully healthy: pagination reached the upstream end,
//! zero failures were recorded, and the fetched candidate set covers enough
//! of the baseline to rule out a partial or throttled fetch.

use std::collections::HashSet;

use futures::future::join_all;
use serde::Serialize;
use serverdex_core::{Lifecycle, ServerStatus, SyncFailure};
use serverdex_store::{CatalogStore, LifecycleRow};
use tracing::info;

const STALE_UPDATE_CHUNK_SIZE: usize = 25;

#[derive(Debug, Clone, Copy)]
pub struct StaleSettings {
    pub enabled: bool,
    pub min_baseline_ratio: f64,
    pub max_mark_ratio: f64,
}

impl Default for StaleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_baseline_ratio: 0.7,
            max_mark_ratio: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleSummary {
    pub enabled: bool,
    pub applied: bool,
    pub reason: Option<String>,
    pub min_baseline_ratio: f64,
    pub max_mark_ratio: f64,
    pub baseline_count: usize,
    pub coverage_ratio: Option<f64>,
    pub stale_candidates: usize,
    pub capped_count: usize,
    pub grace_marked: usize,
    pub rejected_after_grace: usize,
    pub marked: usize,
    pub failed: usize,
}

impl StaleSummary {
    pub fn skipped(settings: &StaleSettings, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::base(settings)
        }
    }

    fn base(settings: &StaleSettings) -> Self {
        Self {
            enabled: settings.enabled,
            applied: false,
            reason: None,
            min_baseline_ratio: settings.min_baseline_ratio,
            max_mark_ratio: settings.max_mark_ratio,
            baseline_count: 0,
            coverage_ratio: None,
            stale_candidates: 0,
            capped_count: 0,
            grace_marked: 0,
            rejected_after_grace: 0,
            marked: 0,
            failed: 0,
        }
    }
}

/// Healthy-run facts the manager gates on.
#[derive(Debug, Clone, Copy)]
pub struct StaleContext<'a> {
    pub candidate_slugs: &'a HashSet<String>,
    pub reached_end: bool,
    pub prior_failures: usize,
}

/// Deterministic selection of the rows to process this run: baseline rows
/// absent from the candidate set, lexicographic slug order, capped at
/// `max(1, floor(baseline * max_mark_ratio))`. The remainder is deferred to
/// future runs.
pub fn select_stale_rows(
    baseline: &[LifecycleRow],
    candidate_slugs: &HashSet<String>,
    max_mark_ratio: f64,
) -> (Vec<LifecycleRow>, usize) {
    let mut stale: Vec<LifecycleRow> = baseline
        .iter()
        .filter(|row| !candidate_slugs.contains(&row.slug))
        .cloned()
        .collect();
    stale.sort_by(|a, b| a.slug.cmp(&b.slug));

    if max_mark_ratio <= 0.0 {
        let capped = stale.len();
        return (Vec::new(), capped);
    }

    let limit = ((baseline.len() as f64) * max_mark_ratio).floor() as usize;
    let limit = limit.max(1);
    if stale.len() > limit {
        let capped = stale.len() - limit;
        stale.truncate(limit);
        (stale, capped)
    } else {
        (stale, 0)
    }
}

fn percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Run the stale phase against the store. Returns the summary plus the
/// failures and changed slugs it produced; the caller folds those into the
/// run outcome.
pub async fn run_stale_phase(
    store: &dyn CatalogStore,
    source: &str,
    settings: &StaleSettings,
    ctx: StaleContext<'_>,
) -> (StaleSummary, Vec<SyncFailure>, Vec<String>) {
    let mut summary = StaleSummary::base(settings);
    let mut failures = Vec::new();
    let mut changed = Vec::new();

    if !settings.enabled {
        summary.reason = Some("Disabled by configuration.".to_string());
        return (summary, failures, changed);
    }
    if !ctx.reached_end {
        summary.reason = Some(
            "Skipped because upstream pagination did not reach the end. Increase max_pages."
                .to_string(),
        );
        return (summary, failures, changed);
    }
    if ctx.prior_failures > 0 {
        summary.reason = Some("Skipped because sync encountered failures.".to_string());
        return (summary, failures, changed);
    }

    let baseline = match store.auto_managed_rows().await {
        Ok(rows) => rows,
        Err(err) => {
            summary.failed += 1;
            summary.reason = Some("Skipped because the baseline read failed.".to_string());
            failures.push(SyncFailure {
                source: source.to_string(),
                entity_key: "servers".to_string(),
                stage: "stale_cleanup".to_string(),
                reason: err.to_string(),
            });
            return (summary, failures, changed);
        }
    };
    summary.baseline_count = baseline.len();

    if !baseline.is_empty() {
        let coverage = (ctx.candidate_slugs.len() as f64) / (baseline.len() as f64);
        summary.coverage_ratio = Some(coverage);
        if coverage < settings.min_baseline_ratio {
            summary.reason = Some(format!(
                "Skipped because fetched coverage ({}) is below safety threshold ({}).",
                percent(coverage),
                percent(settings.min_baseline_ratio)
            ));
            return (summary, failures, changed);
        }
    }

    summary.applied = true;
    let (rows_to_process, capped_count) =
        select_stale_rows(&baseline, ctx.candidate_slugs, settings.max_mark_ratio);
    summary.stale_candidates = rows_to_process.len() + capped_count;
    summary.capped_count = capped_count;

    if summary.stale_candidates == 0 {
        summary.reason = Some("No stale auto-managed rows found.".to_string());
        return (summary, failures, changed);
    }
    if rows_to_process.is_empty() {
        summary.reason = Some(
            "Skipped because max stale mark ratio is 0; stale candidates were detected but not processed."
                .to_string(),
        );
        return (summary, failures, changed);
    }

    for chunk in rows_to_process.chunks(STALE_UPDATE_CHUNK_SIZE) {
        let outcomes = join_all(chunk.iter().map(|row| async move {
            let reject_now = row.lifecycle == Lifecycle::StaleCandidate;
            let result = if reject_now {
                store
                    .apply_lifecycle(&row.slug, Lifecycle::Rejected, Some(ServerStatus::Rejected))
                    .await
            } else {
                store
                    .apply_lifecycle(&row.slug, Lifecycle::StaleCandidate, None)
                    .await
            };
            (row.slug.clone(), reject_now, result)
        }))
        .await;

        for (slug, rejected_now, result) in outcomes {
            match result {
                Ok(()) => {
                    if rejected_now {
                        summary.rejected_after_grace += 1;
                    } else {
                        summary.grace_marked += 1;
                    }
                    summary.marked += 1;
                    changed.push(slug);
                }
                Err(err) => {
                    summary.failed += 1;
                    failures.push(SyncFailure {
                        source: source.to_string(),
                        entity_key: slug,
                        stage: "stale_cleanup".to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    summary.reason = Some(if summary.failed > 0 {
        "Stale cleanup finished with partial failures. See failures for details.".to_string()
    } else {
        let mut reason = if summary.rejected_after_grace > 0 {
            "Stale cleanup applied with grace: previously marked rows were rejected, newly stale rows were marked as candidates.".to_string()
        } else {
            "Stale cleanup applied with grace: rows were marked as stale candidates and will be rejected only if still stale on the next healthy sync.".to_string()
        };
        if summary.capped_count > 0 {
            reason.push_str(&format!(
                " Processing was capped this run (deferred {} stale rows).",
                summary.capped_count
            ));
        }
        reason
    });

    info!(
        source,
        baseline = summary.baseline_count,
        grace_marked = summary.grace_marked,
        rejected = summary.rejected_after_grace,
        capped = summary.capped_count,
        "stale lifecycle pass finished"
    );

    (summary, failures, changed)
}
