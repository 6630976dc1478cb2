//! Ground-truth loader: authoritative extract → [`CanonicalDataset`].
//!
//! Structural failures are quarantined per row; only an unreadable file,
//! an unknown encoding, or a missing required column abort the load.

use std::collections::btree_map::Entry;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::config::ExtractConfig;
use crate::error::ReconError;
use crate::ids::OwnerIdPolicy;
use crate::model::{Attributes, CanonicalDataset, CanonicalRecord, OwnerEntry, QuarantinedRow, Source};

/// Read and decode the extract file, then parse it.
pub fn read_extract(
    path: &Path,
    config: &ExtractConfig,
    policy: &OwnerIdPolicy,
    attribute_columns: &[String],
) -> Result<CanonicalDataset, ReconError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ReconError::Io(format!("cannot read {}: {e}", path.display())))?;
    let text = decode(&bytes, &config.encoding)?;
    load_extract(&text, config, policy, attribute_columns)
}

/// Decode raw bytes with an `encoding_rs` label. A BOM overrides the label.
pub fn decode(bytes: &[u8], label: &str) -> Result<String, ReconError> {
    let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
        .ok_or_else(|| ReconError::Encoding(label.to_string()))?;
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        warn!(encoding = used.name(), "extract contained undecodable bytes; replaced with U+FFFD");
    }
    Ok(text.into_owned())
}

/// Parse already-decoded extract text.
pub fn load_extract(
    text: &str,
    config: &ExtractConfig,
    policy: &OwnerIdPolicy,
    attribute_columns: &[String],
) -> Result<CanonicalDataset, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(config.delimiter_byte())
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ReconError::Csv(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let cols = &config.columns;
    let idx = |name: &str| -> Result<usize, ReconError> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ReconError::MissingColumn { column: name.into() })
    };
    let optional_idx = |name: &Option<String>| -> Option<usize> {
        let name = name.as_deref()?;
        let found = headers.iter().position(|h| h == name);
        if found.is_none() {
            warn!(column = name, "optional extract column not present; ignoring");
        }
        found
    };

    let record_id_idx = idx(&cols.record_id)?;
    let owner_key_idx = idx(&cols.owner_key)?;
    let table_idx = idx(&cols.table_name)?;
    let timestamp_idx = optional_idx(&cols.timestamp);
    let label_idx = optional_idx(&cols.owner_label);

    for attr in attribute_columns {
        if !headers.iter().any(|h| h == attr) {
            warn!(column = attr.as_str(), "fingerprint attribute not present in extract");
        }
    }

    let mut dataset = CanonicalDataset::default();

    for (n, result) in reader.records().enumerate() {
        // Header is line 1.
        let fallback_line = n as u64 + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(fallback_line);
                quarantine(&mut dataset, None, Some(line), None, format!("malformed row: {e}"));
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);
        let field = |i: usize| record.get(i).unwrap_or("").trim();

        let record_id = field(record_id_idx);
        let owner_key = field(owner_key_idx);
        let table_name = field(table_idx);

        let table = (!table_name.is_empty()).then(|| table_name.to_string());
        let id = (!record_id.is_empty()).then(|| record_id.to_string());

        if record_id.is_empty() {
            quarantine(&mut dataset, table, Some(line), None, format!("missing {}", cols.record_id));
            continue;
        }
        if table_name.is_empty() {
            quarantine(&mut dataset, None, Some(line), id, format!("missing {}", cols.table_name));
            continue;
        }
        // Raw value, untrimmed, so surrounding whitespace is caught.
        if let Err(reason) = policy.check(record.get(owner_key_idx).unwrap_or("")) {
            quarantine(&mut dataset, table, Some(line), id, reason);
            continue;
        }

        let mut attributes = Attributes::new();
        for (i, h) in headers.iter().enumerate() {
            if i == record_id_idx || i == owner_key_idx || i == table_idx {
                continue;
            }
            if let Some(val) = record.get(i) {
                attributes.insert(h.clone(), val.to_string());
            }
        }

        let timestamp = timestamp_idx.and_then(|i| {
            let raw = field(i);
            let parsed = parse_timestamp(raw);
            if parsed.is_none() && !raw.is_empty() {
                debug!(line, value = raw, "unparseable timestamp; leaving unset");
            }
            parsed
        });

        let canonical = CanonicalRecord {
            record_id: record_id.to_string(),
            table_name: table_name.to_string(),
            owner_key: owner_key.to_string(),
            attributes,
            timestamp,
        };

        match dataset.records.entry(canonical.key()) {
            Entry::Occupied(_) => {
                quarantine(&mut dataset, table, Some(line), id, "duplicate record id".into());
                continue;
            }
            Entry::Vacant(slot) => {
                slot.insert(canonical);
            }
        }

        let label = label_idx.map(field).filter(|l| !l.is_empty());
        let owner = dataset
            .owners
            .entry(owner_key.to_string())
            .or_insert_with(|| OwnerEntry::new(owner_key));
        if owner.label.is_none() {
            owner.label = label.map(str::to_string);
        }
    }

    debug!(
        records = dataset.records.len(),
        owners = dataset.owners.len(),
        quarantined = dataset.quarantined.len(),
        "extract loaded"
    );
    Ok(dataset)
}

fn quarantine(
    dataset: &mut CanonicalDataset,
    table_name: Option<String>,
    line: Option<u64>,
    record_id: Option<String>,
    reason: String,
) {
    warn!(line, record_id = record_id.as_deref(), reason = reason.as_str(), "quarantined extract row");
    dataset.quarantined.push(QuarantinedRow {
        source: Source::Canonical,
        table_name,
        line,
        record_id,
        reason,
    });
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (UTC) and `YYYY-MM-DD`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
