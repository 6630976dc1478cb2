//! Apply engine.
//!
//! Every write is a compare-and-swap on the record's current owner, so a
//! plan can be re-run safely: records already moved come back as
//! `skipped_conflict`. Per-item failures are recorded and never abort the run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ApplyConfig;
use crate::error::StoreError;
use crate::evidence::summarize_apply;
use crate::model::{ApplyOutcome, ApplyReport, ItemResult, PlanItem, ReassignmentPlan};
use crate::store::LiveStore;

/// Shared cancellation flag. Checked before each batch.
pub type CancelToken = Arc<AtomicBool>;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): initial × 2^(attempt-1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub batch_size: usize,
    pub dry_run: bool,
    pub retry: RetryPolicy,
    pub cancel: Option<CancelToken>,
}

impl ApplyOptions {
    pub fn from_config(config: &ApplyConfig, dry_run: bool) -> Self {
        Self {
            batch_size: config.batch_size,
            dry_run,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            },
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst))
    }
}

/// Execute a plan against the store.
///
/// The caller is expected to have validated the plan against a fresh
/// snapshot; this function never rejects items itself.
pub fn apply_plan(plan: &ReassignmentPlan, store: &dyn LiveStore, options: &ApplyOptions) -> ApplyReport {
    let started_at = chrono::Utc::now();
    let batch_size = options.batch_size.max(1);

    let mut owners_created = Vec::new();
    let mut failed_owners: BTreeMap<&str, String> = BTreeMap::new();
    if !options.dry_run {
        for owner in &plan.owners_to_create {
            let (result, attempts) = with_retry(&options.retry, || store.create_owner(owner));
            match result {
                Ok(true) => {
                    info!(owner = owner.as_str(), plan_id = plan.plan_id.as_str(), "created target owner");
                    owners_created.push(owner.clone());
                }
                Ok(false) => debug!(owner = owner.as_str(), "target owner already present"),
                Err(e) => {
                    warn!(owner = owner.as_str(), attempts, error = %e, "could not create target owner");
                    failed_owners.insert(owner.as_str(), e.to_string());
                }
            }
        }
    }

    let mut items = Vec::with_capacity(plan.items.len());
    let mut cancelled = false;

    for (n, batch) in plan.items.chunks(batch_size).enumerate() {
        if options.is_cancelled() {
            cancelled = true;
            info!(
                plan_id = plan.plan_id.as_str(),
                remaining = plan.items.len() - items.len(),
                "cancellation requested; not issuing further writes"
            );
            break;
        }
        debug!(batch = n, size = batch.len(), "dispatching batch");

        let results: Vec<ItemResult> = thread::scope(|s| {
            let handles: Vec<_> = batch
                .iter()
                .map(|item| {
                    let blocked = failed_owners.get(item.to_owner_ref.as_str()).cloned();
                    s.spawn(move || match blocked {
                        Some(reason) => result(
                            item,
                            ApplyOutcome::Failed {
                                reason: format!("target owner creation failed: {reason}"),
                            },
                            0,
                        ),
                        None => execute(item, store, options),
                    })
                })
                .collect();

            batch
                .iter()
                .zip(handles)
                .map(|(item, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        result(
                            item,
                            ApplyOutcome::Failed {
                                reason: "worker panicked".into(),
                            },
                            0,
                        )
                    })
                })
                .collect()
        });
        items.extend(results);
    }

    if cancelled {
        for item in &plan.items[items.len()..] {
            items.push(result(item, ApplyOutcome::Cancelled, 0));
        }
    }

    let summary = summarize_apply(&items);
    info!(
        plan_id = plan.plan_id.as_str(),
        dry_run = options.dry_run,
        applied = summary.applied,
        skipped_conflict = summary.skipped_conflict,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "apply finished"
    );

    ApplyReport {
        plan_id: plan.plan_id.clone(),
        dry_run: options.dry_run,
        started_at,
        finished_at: chrono::Utc::now(),
        cancelled,
        owners_created,
        summary,
        items,
    }
}

fn execute(item: &PlanItem, store: &dyn LiveStore, options: &ApplyOptions) -> ItemResult {
    if options.dry_run {
        let (read, attempts) = with_retry(&options.retry, || store.get(&item.table_name, &item.record_id));
        let outcome = match read {
            Ok(Some(r)) if r.owner_ref == item.from_owner_ref => ApplyOutcome::WouldApply,
            Ok(_) => ApplyOutcome::WouldConflict,
            Err(e) => failure(&e, attempts),
        };
        return result(item, outcome, attempts);
    }

    let (write, attempts) = with_retry(&options.retry, || {
        store.conditional_update(&item.table_name, &item.record_id, &item.from_owner_ref, &item.to_owner_ref)
    });
    let outcome = match write {
        Ok(true) => {
            info!(
                table = item.table_name.as_str(),
                record_id = item.record_id.as_str(),
                from = item.from_owner_ref.as_str(),
                to = item.to_owner_ref.as_str(),
                rationale = item.rationale.as_str(),
                "reassigned"
            );
            ApplyOutcome::Applied
        }
        Ok(false) => {
            info!(
                table = item.table_name.as_str(),
                record_id = item.record_id.as_str(),
                expected = item.from_owner_ref.as_str(),
                "owner no longer matches; skipped"
            );
            ApplyOutcome::SkippedConflict
        }
        Err(e) => {
            warn!(
                table = item.table_name.as_str(),
                record_id = item.record_id.as_str(),
                attempts,
                error = %e,
                "reassignment failed"
            );
            failure(&e, attempts)
        }
    };
    result(item, outcome, attempts)
}

fn failure(err: &StoreError, attempts: u32) -> ApplyOutcome {
    let reason = if err.is_transient() {
        format!("retries exhausted after {attempts} attempt(s): {err}")
    } else {
        err.to_string()
    };
    ApplyOutcome::Failed { reason }
}

fn result(item: &PlanItem, outcome: ApplyOutcome, attempts: u32) -> ItemResult {
    ItemResult {
        record_id: item.record_id.clone(),
        table_name: item.table_name.clone(),
        from_owner_ref: item.from_owner_ref.clone(),
        to_owner_ref: item.to_owner_ref.clone(),
        rationale: item.rationale.clone(),
        outcome,
        attempts,
    }
}

/// Run `op`, retrying transient errors with exponential backoff.
/// Returns the final result and the number of attempts made.
fn with_retry<T>(policy: &RetryPolicy, mut op: impl FnMut() -> Result<T, StoreError>) -> (Result<T, StoreError>, u32) {
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < max => {
                let delay = policy.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient store error; retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            other => return (other, attempt),
        }
    }
}
