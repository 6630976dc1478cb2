use crate::model::{ApplyOutcome, ApplySummary, ItemResult, OwnerStatus, OwnerVerification, VerificationSummary};

/// Tally item outcomes.
pub fn summarize_apply(items: &[ItemResult]) -> ApplySummary {
    let mut summary = ApplySummary {
        total: items.len(),
        ..ApplySummary::default()
    };

    for item in items {
        match item.outcome {
            ApplyOutcome::Applied => summary.applied += 1,
            ApplyOutcome::SkippedConflict => summary.skipped_conflict += 1,
            ApplyOutcome::Failed { .. } => summary.failed += 1,
            ApplyOutcome::Cancelled => summary.cancelled += 1,
            ApplyOutcome::WouldApply => summary.would_apply += 1,
            ApplyOutcome::WouldConflict => summary.would_conflict += 1,
        }
    }

    summary
}

/// Tally owner statuses.
pub fn summarize_verification(owners: &[OwnerVerification], stray_owners: usize) -> VerificationSummary {
    let mut summary = VerificationSummary {
        owners: owners.len(),
        stray_owners,
        ..VerificationSummary::default()
    };

    for o in owners {
        match o.status {
            OwnerStatus::Match => summary.matched += 1,
            OwnerStatus::Mismatch => summary.mismatched += 1,
            OwnerStatus::Orphaned => summary.orphaned += 1,
        }
    }

    summary
}
