use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::apply::{apply_plan, ApplyOptions, CancelToken};
use crate::config::RelinkConfig;
use crate::error::ReconError;
use crate::fingerprint::{attach_identity, extract};
use crate::ids::OwnerIdPolicy;
use crate::loader::read_extract;
use crate::matcher::{match_owners, MatchInput};
use crate::model::{
    ApplyReport, CanonicalDataset, LiveSnapshot, QuarantinedRow, ReassignmentPlan, Source, VerificationReport,
};
use crate::planner::{build_plan, PlanOptions};
use crate::snapshot::take_snapshot;
use crate::store::LiveStore;
use crate::verify::verify;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub config_name: String,
    pub engine_version: String,
    pub run_at: String,
}

/// Per-table record totals around the apply step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conservation {
    pub before: BTreeMap<String, usize>,
    pub after: BTreeMap<String, usize>,
    pub conserved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub meta: RunMeta,
    pub quarantined: Vec<QuarantinedRow>,
    pub plan: ReassignmentPlan,
    pub apply: ApplyReport,
    pub verification: VerificationReport,
    pub conservation: Conservation,
}

impl RunReport {
    /// Verification passed and no apply item is left unresolved.
    pub fn succeeded(&self) -> bool {
        self.verification.passed() && !self.apply.has_unresolved() && self.conservation.conserved
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Overrides `apply.create_missing_owners` when set.
    pub create_missing_owners: bool,
    pub cancel: Option<CancelToken>,
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Load the canonical extract named by the config. Relative paths resolve
/// against `base_dir`.
pub fn load_canonical(config: &RelinkConfig, base_dir: &Path) -> Result<CanonicalDataset, ReconError> {
    let policy = OwnerIdPolicy::from_config(&config.owner_ids)?;
    let path = config.extract_path(base_dir);
    let canonical = read_extract(&path, &config.extract, &policy, &config.fingerprint.attributes)?;
    info!(
        path = %path.display(),
        records = canonical.records.len(),
        owners = canonical.owners.len(),
        quarantined = canonical.quarantined.len(),
        "canonical extract loaded"
    );
    Ok(canonical)
}

/// Tables to read from the live store: the configured layout, or every
/// table the store exposes when no layout is configured.
pub fn live_tables(config: &RelinkConfig) -> Vec<String> {
    config
        .store
        .as_ref()
        .map(|s| s.tables.keys().cloned().collect())
        .unwrap_or_default()
}

pub fn snapshot(config: &RelinkConfig, store: &dyn LiveStore) -> Result<LiveSnapshot, ReconError> {
    let policy = OwnerIdPolicy::from_config(&config.owner_ids)?;
    Ok(take_snapshot(store, &live_tables(config), &policy)?)
}

/// Fingerprint, match and plan. The returned plan has already passed
/// validation against `snapshot`.
pub fn plan(
    config: &RelinkConfig,
    canonical: &CanonicalDataset,
    snapshot: &LiveSnapshot,
    create_missing_owners: bool,
) -> Result<ReassignmentPlan, ReconError> {
    let attrs = &config.fingerprint.attributes;

    let mut canonical_prints = extract(canonical.records.values(), Source::Canonical, attrs);
    attach_identity(&mut canonical_prints, &canonical.owners);
    let mut live_prints = extract(snapshot.records.values(), Source::Live, attrs);
    attach_identity(&mut live_prints, &snapshot.owners);
    debug!(
        canonical = canonical_prints.len(),
        live = live_prints.len(),
        "fingerprints extracted"
    );

    let outcome = match_owners(
        &MatchInput {
            canonical: &canonical_prints,
            live: &live_prints,
            exclusions: &config.exclusions,
        },
        &config.matching,
    );

    let plan = build_plan(
        &outcome.accepted,
        outcome.review_queue,
        snapshot,
        &PlanOptions {
            threshold: config.matching.threshold,
            create_missing_owners: create_missing_owners || config.apply.create_missing_owners,
        },
    )?;
    info!(
        plan_id = plan.plan_id.as_str(),
        accepted = outcome.accepted.len(),
        items = plan.items.len(),
        review = plan.review_queue.len(),
        "plan generated"
    );
    Ok(plan)
}

/// Re-validate a persisted plan against a fresh snapshot, then apply it.
/// A plan that no longer validates aborts before any write.
pub fn apply_validated(
    config: &RelinkConfig,
    plan: &ReassignmentPlan,
    store: &dyn LiveStore,
    options: &RunOptions,
) -> Result<ApplyReport, ReconError> {
    let fresh = snapshot(config, store)?;
    plan.validate(&fresh, options.create_missing_owners || config.apply.create_missing_owners)?;
    Ok(apply_plan(plan, store, &apply_options(config, options)))
}

// ---------------------------------------------------------------------------
// Full run
// ---------------------------------------------------------------------------

/// Snapshot, plan, apply, re-snapshot, verify.
pub fn run(
    config: &RelinkConfig,
    canonical: &CanonicalDataset,
    store: &dyn LiveStore,
    options: &RunOptions,
) -> Result<RunReport, ReconError> {
    let before = snapshot(config, store)?;
    let plan = plan(config, canonical, &before, options.create_missing_owners)?;

    let apply = apply_plan(&plan, store, &apply_options(config, options));

    let after = snapshot(config, store)?;
    let conservation = Conservation {
        before: before.table_totals(),
        after: after.table_totals(),
        conserved: before.table_totals() == after.table_totals(),
    };
    if !conservation.conserved {
        warn!(before = ?conservation.before, after = ?conservation.after, "per-table record totals changed during run");
    }

    let verification = verify(canonical, &after, &config.exclusions);

    let mut quarantined = canonical.quarantined.clone();
    quarantined.extend(after.quarantined.iter().cloned());

    Ok(RunReport {
        meta: RunMeta {
            config_name: config.name.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
        },
        quarantined,
        plan,
        apply,
        verification,
        conservation,
    })
}

fn apply_options(config: &RelinkConfig, options: &RunOptions) -> ApplyOptions {
    let mut opts = ApplyOptions::from_config(&config.apply, options.dry_run);
    if let Some(ref token) = options.cancel {
        opts = opts.with_cancel(token.clone());
    }
    opts
}
