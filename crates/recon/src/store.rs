//! Live store capability.
//!
//! Every stage that touches the live store receives it as `&dyn LiveStore`;
//! nothing opens a connection on its own.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::model::{LiveRecord, OwnerEntry, RecordKey};

pub trait LiveStore: Send + Sync {
    /// Record tables this store exposes.
    fn tables(&self) -> Result<Vec<String>, StoreError>;

    fn owners(&self) -> Result<Vec<OwnerEntry>, StoreError>;

    fn list_table(&self, table: &str) -> Result<Vec<LiveRecord>, StoreError>;

    fn list_by_owner(&self, table: &str, owner_ref: &str) -> Result<Vec<LiveRecord>, StoreError>;

    fn get(&self, table: &str, record_id: &str) -> Result<Option<LiveRecord>, StoreError>;

    /// `set owner = new where id = record_id and owner = expected`.
    /// Returns `false` when the condition did not hold.
    fn conditional_update(
        &self,
        table: &str,
        record_id: &str,
        expected_owner_ref: &str,
        new_owner_ref: &str,
    ) -> Result<bool, StoreError>;

    /// Returns `false` when the owner already existed.
    fn create_owner(&self, owner_ref: &str) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Fault {
    transient_remaining: u32,
    reject: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    owners: BTreeMap<String, OwnerEntry>,
    tables: BTreeMap<String, BTreeMap<String, LiveRecord>>,
    faults: HashMap<RecordKey, Fault>,
}

/// In-memory [`LiveStore`] with fault injection. Used for audits of
/// exported snapshots and as the stand-in store in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    update_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a table so it is listed even while empty.
    pub fn add_table(&self, table: &str) {
        self.lock().tables.entry(table.to_string()).or_default();
    }

    pub fn insert_owner(&self, owner: OwnerEntry) {
        self.lock().owners.insert(owner.id.clone(), owner);
    }

    pub fn insert_record(&self, record: LiveRecord) {
        self.lock()
            .tables
            .entry(record.table_name.clone())
            .or_default()
            .insert(record.record_id.clone(), record);
    }

    /// Next `times` updates of this record fail with a transient error.
    pub fn fail_transiently(&self, table: &str, record_id: &str, times: u32) {
        self.lock()
            .faults
            .entry(RecordKey::new(table, record_id))
            .or_default()
            .transient_remaining = times;
    }

    /// Every update of this record is rejected.
    pub fn reject_updates(&self, table: &str, record_id: &str, reason: &str) {
        self.lock()
            .faults
            .entry(RecordKey::new(table, record_id))
            .or_default()
            .reject = Some(reason.to_string());
    }

    /// Number of `conditional_update` calls received, including failed ones.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Current owner of a record, if it exists.
    pub fn owner_of(&self, table: &str, record_id: &str) -> Option<String> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.get(record_id))
            .map(|r| r.owner_ref.clone())
    }
}

impl LiveStore for MemoryStore {
    fn tables(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().tables.keys().cloned().collect())
    }

    fn owners(&self) -> Result<Vec<OwnerEntry>, StoreError> {
        Ok(self.lock().owners.values().cloned().collect())
    }

    fn list_table(&self, table: &str) -> Result<Vec<LiveRecord>, StoreError> {
        let inner = self.lock();
        let rows = inner
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(rows.values().cloned().collect())
    }

    fn list_by_owner(&self, table: &str, owner_ref: &str) -> Result<Vec<LiveRecord>, StoreError> {
        let inner = self.lock();
        let rows = inner
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(rows.values().filter(|r| r.owner_ref == owner_ref).cloned().collect())
    }

    fn get(&self, table: &str, record_id: &str) -> Result<Option<LiveRecord>, StoreError> {
        let inner = self.lock();
        let rows = inner
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(rows.get(record_id).cloned())
    }

    fn conditional_update(
        &self,
        table: &str,
        record_id: &str,
        expected_owner_ref: &str,
        new_owner_ref: &str,
    ) -> Result<bool, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();

        if let Some(fault) = inner.faults.get_mut(&RecordKey::new(table, record_id)) {
            if let Some(ref reason) = fault.reject {
                return Err(StoreError::Rejected(reason.clone()));
            }
            if fault.transient_remaining > 0 {
                fault.transient_remaining -= 1;
                return Err(StoreError::Transient(format!("simulated outage on {table}/{record_id}")));
            }
        }

        let rows = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        match rows.get_mut(record_id) {
            Some(record) if record.owner_ref == expected_owner_ref => {
                record.owner_ref = new_owner_ref.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn create_owner(&self, owner_ref: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.owners.contains_key(owner_ref) {
            return Ok(false);
        }
        inner.owners.insert(owner_ref.to_string(), OwnerEntry::new(owner_ref));
        Ok(true)
    }
}
