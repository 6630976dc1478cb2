use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::ids::OwnerIdPolicy;
use crate::model::{LiveSnapshot, QuarantinedRow, Source};
use crate::store::LiveStore;

/// Read owners and records from the live store.
///
/// `tables` limits the read; empty means every table the store exposes.
/// Rows with malformed owner refs or duplicate ids are quarantined.
pub fn take_snapshot(
    store: &dyn LiveStore,
    tables: &[String],
    policy: &OwnerIdPolicy,
) -> Result<LiveSnapshot, StoreError> {
    let taken_at = chrono::Utc::now();
    let tables = if tables.is_empty() { store.tables()? } else { tables.to_vec() };

    let mut quarantined = Vec::new();

    let mut owners = BTreeMap::new();
    for owner in store.owners()? {
        if let Err(reason) = policy.check(&owner.id) {
            warn!(owner = owner.id.as_str(), reason = reason.as_str(), "quarantined live owner row");
            quarantined.push(QuarantinedRow {
                source: Source::Live,
                table_name: None,
                line: None,
                record_id: Some(owner.id),
                reason,
            });
            continue;
        }
        owners.insert(owner.id.clone(), owner);
    }

    let mut records = BTreeMap::new();
    for table in &tables {
        for record in store.list_table(table)? {
            let reason = match policy.check(&record.owner_ref) {
                Err(reason) => Some(reason),
                Ok(()) if records.contains_key(&record.key()) => Some("duplicate record id".to_string()),
                Ok(()) => None,
            };
            if let Some(reason) = reason {
                warn!(
                    table = table.as_str(),
                    record_id = record.record_id.as_str(),
                    reason = reason.as_str(),
                    "quarantined live record"
                );
                quarantined.push(QuarantinedRow {
                    source: Source::Live,
                    table_name: Some(table.clone()),
                    line: None,
                    record_id: Some(record.record_id),
                    reason,
                });
                continue;
            }
            if let Entry::Vacant(slot) = records.entry(record.key()) {
                slot.insert(record);
            }
        }
    }

    debug!(
        tables = tables.len(),
        owners = owners.len(),
        records = records.len(),
        quarantined = quarantined.len(),
        "live snapshot taken"
    );

    Ok(LiveSnapshot {
        taken_at,
        owners,
        records,
        quarantined,
    })
}
