use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::error::ReconError;

/// Largest number of writes the apply engine keeps in flight.
pub const MAX_BATCH_SIZE: usize = 25;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RelinkConfig {
    pub name: String,
    pub extract: ExtractConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub owner_ids: OwnerIdConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
    #[serde(default)]
    pub exclusions: Exclusions,
}

// ---------------------------------------------------------------------------
// Extract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    pub file: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    pub columns: ExtractColumns,
}

fn default_delimiter() -> String {
    ",".into()
}

fn default_encoding() -> String {
    "utf-8".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractColumns {
    pub record_id: String,
    pub owner_key: String,
    pub table_name: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub owner_label: Option<String>,
}

impl ExtractConfig {
    /// The configured delimiter as a byte. Validated to be one ASCII char.
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.as_bytes().first().copied().unwrap_or(b',')
    }
}

// ---------------------------------------------------------------------------
// Live store layout
// ---------------------------------------------------------------------------

/// Where the live store lives and how its tables are shaped.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    pub owners: OwnerTableLayout,
    pub tables: BTreeMap<String, TableLayout>,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerTableLayout {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default)]
    pub label_column: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableLayout {
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub owner_column: String,
    #[serde(default)]
    pub timestamp_column: Option<String>,
}

fn default_id_column() -> String {
    "id".into()
}

// ---------------------------------------------------------------------------
// Owner identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerIdConfig {
    /// Optional regex every owner identifier must match.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Values that mean "no owner" (compared case-insensitively).
    #[serde(default = "default_placeholders")]
    pub placeholders: Vec<String>,
}

fn default_placeholders() -> Vec<String> {
    ["null", "undefined", "none", "nan"].iter().map(|s| s.to_string()).collect()
}

impl Default for OwnerIdConfig {
    fn default() -> Self {
        Self {
            pattern: None,
            placeholders: default_placeholders(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprint + Matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FingerprintConfig {
    /// Attribute columns compared across sources.
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f64,
    #[serde(default = "default_review_candidates")]
    pub review_candidates: usize,
    #[serde(default)]
    pub weights: ScoreWeights,
}

fn default_threshold() -> f64 {
    0.85
}

fn default_tie_epsilon() -> f64 {
    0.01
}

fn default_review_candidates() -> usize {
    3
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            tie_epsilon: default_tie_epsilon(),
            review_candidates: default_review_candidates(),
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScoreWeights {
    pub counts: f64,
    pub attributes: f64,
    pub identity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            counts: 0.6,
            attributes: 0.3,
            identity: 0.1,
        }
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Authorizes the planner to schedule creation of missing target owners.
    #[serde(default)]
    pub create_missing_owners: bool,
}

fn default_batch_size() -> usize {
    16
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            create_missing_owners: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Exclusions
// ---------------------------------------------------------------------------

/// Explicit allow/deny lists of owner identifiers.
///
/// Live refs and canonical keys live in separate namespaces: a non-empty
/// `allow_live` restricts which live owners are reconciled, a non-empty
/// `allow_canonical` restricts which canonical owners may receive records
/// and are verified. `deny` applies to both sides and always wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Exclusions {
    #[serde(default)]
    pub allow_live: BTreeSet<String>,
    #[serde(default)]
    pub allow_canonical: BTreeSet<String>,
    #[serde(default)]
    pub deny: BTreeSet<String>,
}

impl Exclusions {
    pub fn permits_live(&self, owner_ref: &str) -> bool {
        !self.deny.contains(owner_ref) && (self.allow_live.is_empty() || self.allow_live.contains(owner_ref))
    }

    pub fn permits_canonical(&self, owner_key: &str) -> bool {
        !self.deny.contains(owner_key)
            && (self.allow_canonical.is_empty() || self.allow_canonical.contains(owner_key))
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl RelinkConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let config: RelinkConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        let invalid = |msg: String| Err(ReconError::ConfigValidation(msg));

        if self.extract.delimiter.len() != 1 || !self.extract.delimiter.is_ascii() {
            return invalid(format!(
                "extract.delimiter must be a single ASCII character, got {:?}",
                self.extract.delimiter
            ));
        }
        if encoding_rs::Encoding::for_label(self.extract.encoding.as_bytes()).is_none() {
            return Err(ReconError::Encoding(self.extract.encoding.clone()));
        }

        if let Some(ref pattern) = self.owner_ids.pattern {
            if let Err(e) = Regex::new(pattern) {
                return invalid(format!("owner_ids.pattern: {e}"));
            }
        }

        let m = &self.matching;
        if !(m.threshold > 0.0 && m.threshold <= 1.0) {
            return invalid(format!("matching.threshold must be in (0, 1], got {}", m.threshold));
        }
        if !(0.0..0.5).contains(&m.tie_epsilon) {
            return invalid(format!("matching.tie_epsilon must be in [0, 0.5), got {}", m.tie_epsilon));
        }
        let w = m.weights;
        if w.counts < 0.0 || w.attributes < 0.0 || w.identity < 0.0 {
            return invalid("matching.weights must be non-negative".into());
        }
        let sum = w.counts + w.attributes + w.identity;
        if (sum - 1.0).abs() > 1e-6 {
            return invalid(format!("matching.weights must sum to 1.0, got {sum}"));
        }

        let a = &self.apply;
        if a.batch_size == 0 || a.batch_size > MAX_BATCH_SIZE {
            return invalid(format!(
                "apply.batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                a.batch_size
            ));
        }
        if a.max_attempts == 0 {
            return invalid("apply.max_attempts must be at least 1".into());
        }

        let mut allowed = self.exclusions.allow_live.iter().chain(&self.exclusions.allow_canonical);
        if let Some(both) = allowed.find(|o| self.exclusions.deny.contains(*o)) {
            return invalid(format!("exclusions: '{both}' is both allowed and denied"));
        }

        if let Some(ref store) = self.store {
            if store.tables.is_empty() {
                return invalid("store.tables must list at least one table".into());
            }
        }

        Ok(())
    }

    pub fn extract_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.extract.file)
    }

    pub fn store_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.store.as_ref().map(|s| base_dir.join(&s.path))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
