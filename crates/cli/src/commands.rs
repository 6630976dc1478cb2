//! `relink validate|plan|apply|verify|run`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use relink_recon::engine::{self, RunOptions};
use relink_recon::ids::OwnerIdPolicy;
use relink_recon::loader::read_extract;
use relink_recon::model::{ApplyReport, LiveRecord, OwnerStatus, VerificationReport};
use relink_recon::verify::{audit_owner, verify};
use relink_recon::{CancelToken, LiveStore, MemoryStore, ReassignmentPlan, RelinkConfig};
use relink_store::SqliteStore;

use crate::exit_codes::{
    EXIT_APPLY_FAILED, EXIT_CANCELLED, EXIT_CONFIG, EXIT_ERROR, EXIT_NOT_CONSERVED, EXIT_STORE, EXIT_USAGE,
    EXIT_VERIFY_MISMATCH,
};
use crate::CliError;

// ============================================================================
// validate
// ============================================================================

#[derive(Serialize)]
struct ValidateSummary<'a> {
    config_name: &'a str,
    records: usize,
    owners: usize,
    tables: Vec<String>,
    quarantined: usize,
}

pub fn cmd_validate(config_path: PathBuf, json: bool) -> Result<(), CliError> {
    let (config, base_dir) = load_config(&config_path)?;
    let canonical = engine::load_canonical(&config, &base_dir)?;

    let summary = ValidateSummary {
        config_name: &config.name,
        records: canonical.records.len(),
        owners: canonical.owners.len(),
        tables: canonical.tables().into_iter().collect(),
        quarantined: canonical.quarantined.len(),
    };
    emit(&summary, json, None)?;

    eprintln!(
        "config ok: {} records, {} owners across {} table(s), {} quarantined",
        summary.records,
        summary.owners,
        summary.tables.len(),
        summary.quarantined,
    );
    for q in &canonical.quarantined {
        eprintln!(
            "  quarantined line {}: {}",
            q.line.map_or_else(|| "?".to_string(), |l| l.to_string()),
            q.reason
        );
    }
    Ok(())
}

// ============================================================================
// plan
// ============================================================================

pub fn cmd_plan(
    config_path: PathBuf,
    output: Option<PathBuf>,
    json: bool,
    create_missing_owners: bool,
    live_export: Option<PathBuf>,
) -> Result<(), CliError> {
    let (config, base_dir) = load_config(&config_path)?;
    let canonical = engine::load_canonical(&config, &base_dir)?;
    let store = open_live(&config, &base_dir, live_export.as_deref())?;

    let snapshot = engine::snapshot(&config, store.as_ref())?;
    let plan = engine::plan(&config, &canonical, &snapshot, create_missing_owners)?;
    emit(&plan, json, output.as_deref())?;

    eprintln!(
        "plan {}: {} item(s), {} owner(s) to create, {} owner(s) for review",
        plan.plan_id,
        plan.items.len(),
        plan.owners_to_create.len(),
        plan.review_queue.len(),
    );
    for m in &plan.review_queue {
        let best = m
            .candidates
            .first()
            .map(|c| format!("{} ({:.3})", c.canonical_owner_key, c.score))
            .unwrap_or_else(|| "-".to_string());
        eprintln!(
            "  review {} [{}]: {} record(s), best {}",
            m.live_owner_ref, m.reason, m.record_count, best
        );
    }
    Ok(())
}

// ============================================================================
// apply
// ============================================================================

/// Apply report plus the verification taken right after a live apply.
#[derive(Serialize)]
struct ApplyResult {
    #[serde(flatten)]
    apply: ApplyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<VerificationReport>,
}

pub fn cmd_apply(
    config_path: PathBuf,
    plan_path: PathBuf,
    dry_run: bool,
    create_missing_owners: bool,
    cancel_file: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    let (config, base_dir) = load_config(&config_path)?;
    let text = std::fs::read_to_string(&plan_path)
        .map_err(|e| CliError::new(EXIT_USAGE, format!("cannot read plan {}: {e}", plan_path.display())))?;
    let plan = ReassignmentPlan::from_json(&text).map_err(|e| CliError::new(EXIT_USAGE, e.to_string()))?;
    let store = open_live(&config, &base_dir, None)?;

    let options = RunOptions {
        dry_run,
        create_missing_owners,
        cancel: cancel_file.map(watch_cancel_file),
    };
    let apply = engine::apply_validated(&config, &plan, store.as_ref(), &options)?;

    // Exit status comes from the post-apply verification.
    let verification = if dry_run {
        None
    } else {
        let canonical = engine::load_canonical(&config, &base_dir)?;
        let after = engine::snapshot(&config, store.as_ref())?;
        Some(verify(&canonical, &after, &config.exclusions))
    };
    let result = ApplyResult { apply, verification };
    emit(&result, json, output.as_deref())?;

    print_apply(&result.apply);
    if let Some(report) = &result.verification {
        print_verification(report);
    }
    apply_exit(&result.apply)?;
    match &result.verification {
        Some(report) => verification_exit(report),
        None => Ok(()),
    }
}

// ============================================================================
// verify
// ============================================================================

pub fn cmd_verify(
    config_path: PathBuf,
    owner: Option<String>,
    live_export: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    let (config, base_dir) = load_config(&config_path)?;
    let canonical = engine::load_canonical(&config, &base_dir)?;
    let store = open_live(&config, &base_dir, live_export.as_deref())?;

    if let Some(key) = owner {
        let audit = audit_owner(store.as_ref(), &canonical, &key, &engine::live_tables(&config))
            .map_err(relink_recon::ReconError::from)?;
        emit(&audit, json, output.as_deref())?;
        eprintln!(
            "{}: {} (expected {:?}, actual {:?})",
            audit.owner_key, audit.status, audit.expected_counts, audit.actual_counts
        );
        if audit.status != OwnerStatus::Match {
            return Err(CliError::new(EXIT_VERIFY_MISMATCH, format!("owner {key} does not verify")));
        }
        return Ok(());
    }

    let snapshot = engine::snapshot(&config, store.as_ref())?;
    let report = verify(&canonical, &snapshot, &config.exclusions);
    emit(&report, json, output.as_deref())?;

    print_verification(&report);
    verification_exit(&report)
}

// ============================================================================
// run
// ============================================================================

pub fn cmd_run(
    config_path: PathBuf,
    dry_run: bool,
    create_missing_owners: bool,
    cancel_file: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    let (config, base_dir) = load_config(&config_path)?;
    let canonical = engine::load_canonical(&config, &base_dir)?;
    let store = open_live(&config, &base_dir, None)?;

    let options = RunOptions {
        dry_run,
        create_missing_owners,
        cancel: cancel_file.map(watch_cancel_file),
    };
    let report = engine::run(&config, &canonical, store.as_ref(), &options)?;
    emit(&report, json, output.as_deref())?;

    if !report.quarantined.is_empty() {
        eprintln!("{} row(s) quarantined", report.quarantined.len());
    }
    eprintln!(
        "plan {}: {} item(s), {} owner(s) for review",
        report.plan.plan_id,
        report.plan.items.len(),
        report.plan.review_queue.len()
    );
    print_apply(&report.apply);
    print_verification(&report.verification);

    apply_exit(&report.apply)?;
    if !report.conservation.conserved {
        return Err(CliError::new(
            EXIT_NOT_CONSERVED,
            format!(
                "per-table record totals changed: before {:?}, after {:?}",
                report.conservation.before, report.conservation.after
            ),
        ));
    }
    verification_exit(&report.verification)
}

// ============================================================================
// Helpers
// ============================================================================

fn load_config(path: &Path) -> Result<(RelinkConfig, PathBuf), CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::new(EXIT_USAGE, format!("cannot read config {}: {e}", path.display())))?;
    let config = RelinkConfig::from_toml(&text)?;
    // Resolve file paths relative to the config file's directory
    let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    Ok((config, base_dir))
}

fn open_live(config: &RelinkConfig, base_dir: &Path, live_export: Option<&Path>) -> Result<Box<dyn LiveStore>, CliError> {
    if let Some(path) = live_export {
        return Ok(Box::new(load_live_export(config, &base_dir.join(path))?));
    }

    let (Some(layout), Some(path)) = (config.store.as_ref(), config.store_path(base_dir)) else {
        return Err(CliError::new(EXIT_CONFIG, "config has no [store] section")
            .with_hint("add [store] with a database path and table layout, or pass --live-export"));
    };
    if !path.exists() {
        return Err(CliError::new(EXIT_STORE, format!("live store {} not found", path.display())));
    }
    let store = SqliteStore::open(&path, layout).map_err(relink_recon::ReconError::from)?;
    Ok(Box::new(store))
}

/// Load an exported live table dump, laid out like the extract, into an
/// in-memory store.
fn load_live_export(config: &RelinkConfig, path: &Path) -> Result<MemoryStore, CliError> {
    let policy = OwnerIdPolicy::from_config(&config.owner_ids)?;
    let export = read_extract(path, &config.extract, &policy, &config.fingerprint.attributes)?;
    if !export.quarantined.is_empty() {
        warn!(rows = export.quarantined.len(), "rows skipped from live export");
    }

    let store = MemoryStore::new();
    for table in engine::live_tables(config) {
        store.add_table(&table);
    }
    for owner in export.owners.values() {
        store.insert_owner(owner.clone());
    }
    for r in export.records.into_values() {
        store.insert_record(LiveRecord {
            record_id: r.record_id,
            table_name: r.table_name,
            owner_ref: r.owner_key,
            attributes: r.attributes,
            timestamp: r.timestamp,
        });
    }
    info!(path = %path.display(), "loaded live export");
    Ok(store)
}

/// Returns a token that is set once `path` exists.
fn watch_cancel_file(path: PathBuf) -> CancelToken {
    let token: CancelToken = Arc::new(AtomicBool::new(path.exists()));
    let flag = Arc::clone(&token);
    std::thread::spawn(move || {
        while !flag.load(Ordering::SeqCst) {
            if path.exists() {
                warn!(path = %path.display(), "cancel file present; stopping after the current batch");
                flag.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    });
    token
}

/// Print JSON to stdout and/or write it to `output`.
fn emit<T: Serialize>(value: &T, json: bool, output: Option<&Path>) -> Result<(), CliError> {
    if !json && output.is_none() {
        return Ok(());
    }
    let json_str = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::new(EXIT_ERROR, format!("JSON serialization error: {e}")))?;

    if let Some(path) = output {
        std::fs::write(path, &json_str)
            .map_err(|e| CliError::new(EXIT_ERROR, format!("cannot write {}: {e}", path.display())))?;
        eprintln!("wrote {}", path.display());
    }
    if json {
        println!("{json_str}");
    }
    Ok(())
}

fn print_apply(report: &ApplyReport) {
    let s = &report.summary;
    if report.dry_run {
        eprintln!(
            "dry run: {} item(s): {} would apply, {} would conflict, {} failed",
            s.total, s.would_apply, s.would_conflict, s.failed
        );
    } else {
        eprintln!(
            "apply: {} item(s): {} applied, {} skipped (conflict), {} failed, {} cancelled",
            s.total, s.applied, s.skipped_conflict, s.failed, s.cancelled
        );
    }
    if !report.owners_created.is_empty() {
        eprintln!("created owner(s): {}", report.owners_created.join(", "));
    }
}

fn print_verification(report: &VerificationReport) {
    let s = &report.summary;
    eprintln!(
        "verify: {} owner(s): {} match, {} mismatch, {} orphaned; {} stray live owner(s), {} excluded",
        s.owners,
        s.matched,
        s.mismatched,
        s.orphaned,
        s.stray_owners,
        report.excluded.len()
    );
    for o in report.owners.iter().filter(|o| o.status != OwnerStatus::Match) {
        eprintln!(
            "  {} {}: expected {:?}, actual {:?}",
            o.status, o.owner_key, o.expected_counts, o.actual_counts
        );
    }
}

fn apply_exit(report: &ApplyReport) -> Result<(), CliError> {
    if report.cancelled {
        return Err(CliError::new(
            EXIT_CANCELLED,
            format!("cancelled: {} item(s) not issued", report.summary.cancelled),
        )
        .with_hint("re-run the same plan; applied items are skipped"));
    }
    if report.summary.failed > 0 {
        return Err(CliError::new(
            EXIT_APPLY_FAILED,
            format!("{} item(s) failed", report.summary.failed),
        ));
    }
    Ok(())
}

fn verification_exit(report: &VerificationReport) -> Result<(), CliError> {
    if report.passed() {
        return Ok(());
    }
    Err(CliError::new(
        EXIT_VERIFY_MISMATCH,
        format!(
            "{} mismatched, {} orphaned owner(s)",
            report.summary.mismatched, report.summary.orphaned
        ),
    ))
}
