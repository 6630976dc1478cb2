//! `relink-recon` — identity and record reconciliation engine.
//!
//! Loads an authoritative extract, snapshots the live store through the
//! [`LiveStore`] capability, matches live owners to canonical owners by
//! fingerprint, plans owner-reference rewrites, applies them with
//! conditional updates and verifies the result. No CLI dependencies; the
//! live store is always passed in.

pub mod apply;
pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod ids;
pub mod loader;
pub mod matcher;
pub mod model;
pub mod planner;
pub mod snapshot;
pub mod store;
pub mod verify;

pub use apply::{apply_plan, ApplyOptions, CancelToken};
pub use config::RelinkConfig;
pub use engine::{run, RunOptions, RunReport};
pub use error::{PlanError, ReconError, StoreError};
pub use model::{ApplyReport, CanonicalDataset, LiveSnapshot, ReassignmentPlan, VerificationReport};
pub use store::{LiveStore, MemoryStore};
