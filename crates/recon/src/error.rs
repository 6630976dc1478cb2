use thiserror::Error;

/// Fatal errors. Anything that reaches the caller as a `ReconError` aborts
/// the run before writes are issued; per-record problems are collected in
/// reports instead.
#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Config validation error (bad weight, bad threshold, unknown table, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),
    /// Required column absent from the extract header.
    #[error("extract: missing required column '{column}'")]
    MissingColumn { column: String },
    /// Unknown encoding label.
    #[error("extract: unknown encoding '{0}'")]
    Encoding(String),
    #[error("extract: {0}")]
    Csv(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("live store: {0}")]
    Store(#[from] StoreError),
    /// Plan failed validation and was rejected wholesale.
    #[error(transparent)]
    InvalidPlan(#[from] PlanError),
}

/// Errors surfaced by a [`crate::store::LiveStore`] implementation.
///
/// `Transient` is the only variant the apply engine retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan rejected ({} problem(s)): {}", diagnostics.len(), diagnostics.join("; "))]
    Rejected { diagnostics: Vec<String> },
}

impl PlanError {
    pub fn diagnostics(&self) -> &[String] {
        match self {
            Self::Rejected { diagnostics } => diagnostics,
        }
    }
}
