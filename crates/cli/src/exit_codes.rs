//! CLI Exit Code Registry
//!
//! Single source of truth for `relink` exit codes. Scripts and CI gates rely
//! on them; do not renumber.
//!
//! | Range | Domain   | Description                                   |
//! |-------|----------|-----------------------------------------------|
//! | 0     | Universal| Success                                       |
//! | 1     | Universal| General error (unspecified)                   |
//! | 2     | Universal| Usage error (bad args, unreadable config)     |
//! | 3-9   | Fatal    | Aborted before any write                      |
//! | 10-19 | Outcome  | Run completed, but did not reconcile cleanly  |

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success. For `run` and `verify` this means zero mismatched or orphaned
/// owners and zero unresolved apply items.
pub const EXIT_SUCCESS: u8 = 0;

/// General error. Prefer a specific code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error: bad arguments, unreadable config or plan file.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Fatal (3-9)
// =============================================================================

/// Config failed to parse or validate.
pub const EXIT_CONFIG: u8 = 3;

/// Extract unreadable, undecodable, or missing a required column.
pub const EXIT_EXTRACT: u8 = 4;

/// Live store could not be opened or read.
pub const EXIT_STORE: u8 = 5;

/// Plan failed validation against the live state.
pub const EXIT_PLAN_REJECTED: u8 = 6;

// =============================================================================
// Outcome (10-19)
// =============================================================================

/// Verification found mismatched or orphaned owners.
pub const EXIT_VERIFY_MISMATCH: u8 = 10;

/// Apply left failed items.
pub const EXIT_APPLY_FAILED: u8 = 11;

/// Apply was cancelled before every item was issued.
pub const EXIT_CANCELLED: u8 = 12;

/// Per-table record totals differ before and after apply.
pub const EXIT_NOT_CONSERVED: u8 = 13;

use relink_recon::ReconError;

/// Map a fatal engine error to its exit code.
pub fn recon_exit_code(err: &ReconError) -> u8 {
    match err {
        ReconError::ConfigParse(_) | ReconError::ConfigValidation(_) | ReconError::Encoding(_) => EXIT_CONFIG,
        ReconError::MissingColumn { .. } | ReconError::Csv(_) | ReconError::Io(_) => EXIT_EXTRACT,
        ReconError::Store(_) => EXIT_STORE,
        ReconError::InvalidPlan(_) => EXIT_PLAN_REJECTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relink_recon::{PlanError, StoreError};

    #[test]
    fn codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_ERROR,
            EXIT_USAGE,
            EXIT_CONFIG,
            EXIT_EXTRACT,
            EXIT_STORE,
            EXIT_PLAN_REJECTED,
            EXIT_VERIFY_MISMATCH,
            EXIT_APPLY_FAILED,
            EXIT_CANCELLED,
            EXIT_NOT_CONSERVED,
        ];
        let unique: std::collections::BTreeSet<u8> = codes.iter().copied().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn error_mapping() {
        assert_eq!(recon_exit_code(&ReconError::ConfigParse("x".into())), EXIT_CONFIG);
        assert_eq!(
            recon_exit_code(&ReconError::MissingColumn { column: "id".into() }),
            EXIT_EXTRACT
        );
        assert_eq!(
            recon_exit_code(&ReconError::Store(StoreError::Transient("busy".into()))),
            EXIT_STORE
        );
        assert_eq!(
            recon_exit_code(&ReconError::InvalidPlan(PlanError::Rejected { diagnostics: vec![] })),
            EXIT_PLAN_REJECTED
        );
    }
}
