use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column name → raw value. Ordered so every derived value is deterministic.
pub type Attributes = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Record identity. Ids are only unique within a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table_name: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(table_name: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            record_id: record_id.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table_name, self.record_id)
    }
}

/// A row from the authoritative extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub record_id: String,
    pub table_name: String,
    pub owner_key: String,
    pub attributes: Attributes,
    pub timestamp: Option<DateTime<Utc>>,
}

impl CanonicalRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.table_name, &self.record_id)
    }
}

/// The same conceptual row as currently stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRecord {
    pub record_id: String,
    pub table_name: String,
    pub owner_ref: String,
    pub attributes: Attributes,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LiveRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.table_name, &self.record_id)
    }
}

/// An owner row. `label` is a login or email when the source has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl OwnerEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), label: None }
    }

    pub fn with_label(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: Some(label.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Canonical,
    Live,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Canonical => write!(f, "canonical"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// A row that failed structural validation. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRow {
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Loaded sources
// ---------------------------------------------------------------------------

/// Normalized ground truth.
#[derive(Debug, Clone, Default)]
pub struct CanonicalDataset {
    pub records: BTreeMap<RecordKey, CanonicalRecord>,
    pub owners: BTreeMap<String, OwnerEntry>,
    pub quarantined: Vec<QuarantinedRow>,
}

impl CanonicalDataset {
    pub fn has_owner(&self, owner_key: &str) -> bool {
        self.owners.contains_key(owner_key)
    }

    pub fn tables(&self) -> BTreeSet<String> {
        self.records.keys().map(|k| k.table_name.clone()).collect()
    }

    pub fn table_totals(&self) -> BTreeMap<String, usize> {
        table_totals(self.records.keys())
    }

    pub fn records_of<'a>(&'a self, owner_key: &'a str) -> impl Iterator<Item = &'a CanonicalRecord> + 'a {
        self.records.values().filter(move |r| r.owner_key == owner_key)
    }
}

/// Point-in-time read of the live store.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    pub taken_at: DateTime<Utc>,
    pub owners: BTreeMap<String, OwnerEntry>,
    pub records: BTreeMap<RecordKey, LiveRecord>,
    pub quarantined: Vec<QuarantinedRow>,
}

impl LiveSnapshot {
    pub fn has_owner(&self, owner_ref: &str) -> bool {
        self.owners.contains_key(owner_ref)
    }

    pub fn table_totals(&self) -> BTreeMap<String, usize> {
        table_totals(self.records.keys())
    }

    pub fn records_owned_by<'a>(&'a self, owner_ref: &'a str) -> impl Iterator<Item = &'a LiveRecord> + 'a {
        self.records.values().filter(move |r| r.owner_ref == owner_ref)
    }

    /// Owner refs that hold at least one record.
    pub fn referenced_owners(&self) -> BTreeSet<String> {
        self.records.values().map(|r| r.owner_ref.clone()).collect()
    }
}

fn table_totals<'a>(keys: impl Iterator<Item = &'a RecordKey>) -> BTreeMap<String, usize> {
    let mut totals = BTreeMap::new();
    for key in keys {
        *totals.entry(key.table_name.clone()).or_insert(0) += 1;
    }
    totals
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Comparable summary of one owner's records in one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub owner: String,
    pub source: Source,
    pub counts: BTreeMap<String, usize>,
    pub attributes: BTreeSet<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub identity_tokens: BTreeSet<String>,
}

impl Fingerprint {
    pub fn empty(owner: impl Into<String>, source: Source) -> Self {
        Self {
            owner: owner.into(),
            source,
            counts: BTreeMap::new(),
            attributes: BTreeSet::new(),
            first_seen: None,
            last_seen: None,
            identity_tokens: BTreeSet::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn count(&self, table_name: &str) -> usize {
        self.counts.get(table_name).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Weighted components behind a score, each in [0, 1].
/// `identity` is `None` when either side had no identifier tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub counts: f64,
    pub attributes: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub live_owner_ref: String,
    pub canonical_owner_key: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityReason {
    /// No canonical owner to compare against.
    NoCandidate,
    /// Best score below the confidence threshold.
    LowConfidence,
    /// Runner-up within epsilon of the best score.
    Tie,
    /// Another live owner claimed the same canonical owner.
    Contested,
}

impl std::fmt::Display for AmbiguityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCandidate => write!(f, "no_candidate"),
            Self::LowConfidence => write!(f, "low_confidence"),
            Self::Tie => write!(f, "tie"),
            Self::Contested => write!(f, "contested"),
        }
    }
}

/// A live owner routed to manual review instead of auto-matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousMatch {
    pub live_owner_ref: String,
    pub reason: AmbiguityReason,
    pub record_count: usize,
    pub candidates: Vec<MatchCandidate>,
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub accepted: Vec<MatchCandidate>,
    pub review_queue: Vec<AmbiguousMatch>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub record_id: String,
    pub table_name: String,
    pub from_owner_ref: String,
    pub to_owner_ref: String,
    pub score: f64,
    pub rationale: String,
}

impl PlanItem {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.table_name, &self.record_id)
    }
}

/// Validated, ordered set of foreign-key rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReassignmentPlan {
    pub plan_id: String,
    pub generated_at: DateTime<Utc>,
    pub threshold: f64,
    /// Targets the apply engine may create. Empty unless creation was authorized.
    #[serde(default)]
    pub owners_to_create: Vec<String>,
    pub items: Vec<PlanItem>,
    #[serde(default)]
    pub review_queue: Vec<AmbiguousMatch>,
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    SkippedConflict,
    Failed { reason: String },
    /// Never issued because the run was cancelled first.
    Cancelled,
    WouldApply,
    WouldConflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub record_id: String,
    pub table_name: String,
    pub from_owner_ref: String,
    pub to_owner_ref: String,
    pub rationale: String,
    pub outcome: ApplyOutcome,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub total: usize,
    pub applied: usize,
    pub skipped_conflict: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub would_apply: usize,
    pub would_conflict: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub plan_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    #[serde(default)]
    pub owners_created: Vec<String>,
    pub summary: ApplySummary,
    pub items: Vec<ItemResult>,
}

impl ApplyReport {
    /// Failed or never-issued items remain to be resolved.
    pub fn has_unresolved(&self) -> bool {
        self.summary.failed > 0 || self.summary.cancelled > 0
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerStatus {
    Match,
    Mismatch,
    Orphaned,
}

impl std::fmt::Display for OwnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Match => write!(f, "match"),
            Self::Mismatch => write!(f, "mismatch"),
            Self::Orphaned => write!(f, "orphaned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerVerification {
    pub owner_key: String,
    pub expected_counts: BTreeMap<String, usize>,
    pub actual_counts: BTreeMap<String, usize>,
    pub status: OwnerStatus,
}

/// Live owner holding records under a ref that no canonical owner has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrayOwner {
    pub owner_ref: String,
    pub counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTotal {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub owners: usize,
    pub matched: usize,
    pub mismatched: usize,
    pub orphaned: usize,
    pub stray_owners: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub verified_at: DateTime<Utc>,
    pub summary: VerificationSummary,
    pub owners: Vec<OwnerVerification>,
    pub excluded: Vec<String>,
    pub stray_owners: Vec<StrayOwner>,
    pub table_totals: BTreeMap<String, TableTotal>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.summary.mismatched == 0 && self.summary.orphaned == 0
    }

    pub fn status_of(&self, owner_key: &str) -> Option<OwnerStatus> {
        self.owners
            .iter()
            .find(|o| o.owner_key == owner_key)
            .map(|o| o.status)
    }
}
