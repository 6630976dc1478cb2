//! Verifier / reporter.
//!
//! Recomputes live fingerprints and diffs them against the canonical
//! extract. The resulting report is the only success signal a run produces;
//! apply outcomes alone never certify anything.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::config::Exclusions;
use crate::error::StoreError;
use crate::evidence::summarize_verification;
use crate::fingerprint;
use crate::model::{
    CanonicalDataset, LiveSnapshot, OwnerStatus, OwnerVerification, Source, StrayOwner, TableTotal,
    VerificationReport,
};
use crate::store::LiveStore;

pub fn verify(canonical: &CanonicalDataset, snapshot: &LiveSnapshot, exclusions: &Exclusions) -> VerificationReport {
    let expected = fingerprint::extract(canonical.records.values(), Source::Canonical, &[]);
    let actual = fingerprint::extract(snapshot.records.values(), Source::Live, &[]);

    let keys: BTreeSet<&String> = expected.keys().chain(canonical.owners.keys()).collect();

    let mut owners = Vec::new();
    let mut excluded = Vec::new();
    for key in keys {
        if !exclusions.permits_canonical(key) {
            excluded.push(key.clone());
            continue;
        }
        let expected_counts = expected.get(key).map(|fp| fp.counts.clone()).unwrap_or_default();
        let actual_counts = actual.get(key).map(|fp| fp.counts.clone()).unwrap_or_default();
        let status = status(&expected_counts, &actual_counts);
        if status != OwnerStatus::Match {
            warn!(owner = key.as_str(), %status, ?expected_counts, ?actual_counts, "owner does not verify");
        }
        owners.push(OwnerVerification {
            owner_key: key.clone(),
            expected_counts,
            actual_counts,
            status,
        });
    }

    let stray_owners: Vec<StrayOwner> = actual
        .values()
        .filter(|fp| !expected.contains_key(&fp.owner) && !canonical.has_owner(&fp.owner))
        .filter(|fp| exclusions.permits_live(&fp.owner))
        .map(|fp| StrayOwner {
            owner_ref: fp.owner.clone(),
            counts: fp.counts.clone(),
        })
        .collect();

    let summary = summarize_verification(&owners, stray_owners.len());
    debug!(
        owners = summary.owners,
        matched = summary.matched,
        mismatched = summary.mismatched,
        orphaned = summary.orphaned,
        stray = summary.stray_owners,
        "verification complete"
    );

    VerificationReport {
        verified_at: chrono::Utc::now(),
        summary,
        owners,
        excluded,
        stray_owners,
        table_totals: table_totals(&canonical.table_totals(), &snapshot.table_totals()),
    }
}

/// Audit one canonical owner directly against the store, without a full
/// snapshot. `tables` empty means every table the store exposes.
pub fn audit_owner(
    store: &dyn LiveStore,
    canonical: &CanonicalDataset,
    owner_key: &str,
    tables: &[String],
) -> Result<OwnerVerification, StoreError> {
    let tables = if tables.is_empty() { store.tables()? } else { tables.to_vec() };

    let mut expected_counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in canonical.records_of(owner_key) {
        *expected_counts.entry(record.table_name.clone()).or_insert(0) += 1;
    }

    let mut actual_counts = BTreeMap::new();
    for table in &tables {
        let n = store.list_by_owner(table, owner_key)?.len();
        if n > 0 {
            actual_counts.insert(table.clone(), n);
        }
    }

    Ok(OwnerVerification {
        owner_key: owner_key.to_string(),
        status: status(&expected_counts, &actual_counts),
        expected_counts,
        actual_counts,
    })
}

fn status(expected: &BTreeMap<String, usize>, actual: &BTreeMap<String, usize>) -> OwnerStatus {
    let expected_total: usize = expected.values().sum();
    let actual_total: usize = actual.values().sum();
    if expected_total > 0 && actual_total == 0 {
        OwnerStatus::Orphaned
    } else if expected == actual {
        OwnerStatus::Match
    } else {
        OwnerStatus::Mismatch
    }
}

fn table_totals(expected: &BTreeMap<String, usize>, actual: &BTreeMap<String, usize>) -> BTreeMap<String, TableTotal> {
    let mut totals: BTreeMap<String, TableTotal> = BTreeMap::new();
    for (table, &n) in expected {
        totals.entry(table.clone()).or_default().expected = n;
    }
    for (table, &n) in actual {
        totals.entry(table.clone()).or_default().actual = n;
    }
    totals
}
