use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::model::{Attributes, CanonicalRecord, Fingerprint, LiveRecord, OwnerEntry, Source};

/// Shortest token kept for identifier overlap.
const MIN_TOKEN_LEN: usize = 3;

/// Common view over canonical and live rows.
pub trait OwnedRecord {
    fn owner(&self) -> &str;
    fn table(&self) -> &str;
    fn attributes(&self) -> &Attributes;
    fn timestamp(&self) -> Option<DateTime<Utc>>;
}

impl OwnedRecord for CanonicalRecord {
    fn owner(&self) -> &str {
        &self.owner_key
    }
    fn table(&self) -> &str {
        &self.table_name
    }
    fn attributes(&self) -> &Attributes {
        &self.attributes
    }
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

impl OwnedRecord for LiveRecord {
    fn owner(&self) -> &str {
        &self.owner_ref
    }
    fn table(&self) -> &str {
        &self.table_name
    }
    fn attributes(&self) -> &Attributes {
        &self.attributes
    }
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// Group records by owner and summarize each group.
///
/// Pure: the same records always produce the same fingerprints.
pub fn extract<'a, R, I>(records: I, source: Source, attribute_columns: &[String]) -> BTreeMap<String, Fingerprint>
where
    R: OwnedRecord + 'a,
    I: IntoIterator<Item = &'a R>,
{
    let mut prints: BTreeMap<String, Fingerprint> = BTreeMap::new();

    for record in records {
        let fp = prints
            .entry(record.owner().to_string())
            .or_insert_with(|| Fingerprint::empty(record.owner(), source));

        *fp.counts.entry(record.table().to_string()).or_insert(0) += 1;

        for column in attribute_columns {
            if let Some(value) = record.attributes().get(column) {
                let norm = normalize_text(value);
                if !norm.is_empty() {
                    fp.attributes.insert(format!("{column}:{norm}"));
                }
            }
        }

        if let Some(ts) = record.timestamp() {
            fp.first_seen = Some(fp.first_seen.map_or(ts, |cur| cur.min(ts)));
            fp.last_seen = Some(fp.last_seen.map_or(ts, |cur| cur.max(ts)));
        }
    }

    prints
}

/// Fill `identity_tokens` from owner labels.
///
/// Owner ids are opaque and never tokenized. A token carried by more than
/// one owner on the same side (a shared prefix, a team name) is dropped, so
/// only distinctive tokens count as evidence.
pub fn attach_identity(prints: &mut BTreeMap<String, Fingerprint>, owners: &BTreeMap<String, OwnerEntry>) {
    let mut per_owner: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for owner in prints.keys() {
        let label = owners.get(owner).and_then(|o| o.label.as_deref());
        let tokens = label.map(label_tokens).unwrap_or_default();
        for tok in &tokens {
            *seen.entry(tok.clone()).or_insert(0) += 1;
        }
        per_owner.insert(owner.as_str(), tokens);
    }

    let distinctive: BTreeMap<String, BTreeSet<String>> = per_owner
        .into_iter()
        .map(|(owner, tokens)| {
            let kept = tokens.into_iter().filter(|t| seen.get(t).copied() == Some(1)).collect();
            (owner.to_string(), kept)
        })
        .collect();
    for (owner, fp) in prints.iter_mut() {
        fp.identity_tokens = distinctive.get(owner).cloned().unwrap_or_default();
    }
}

/// Lower-case, strip punctuation, collapse whitespace.
pub fn normalize_text(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tokens of a login or email label. Emails contribute their local part only,
/// so shared mail domains are not evidence.
pub fn label_tokens(label: &str) -> BTreeSet<String> {
    let local = label.split('@').next().unwrap_or(label);
    normalize_text(local)
        .split(' ')
        .filter(|tok| tok.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn live(owner: &str, table: &str, name: &str, day: u32) -> LiveRecord {
        let mut attributes = Attributes::new();
        attributes.insert("name".into(), name.into());
        attributes.insert("note".into(), "ignored".into());
        LiveRecord {
            record_id: format!("{owner}-{table}-{day}"),
            table_name: table.into(),
            owner_ref: owner.into(),
            attributes,
            timestamp: Some(Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn counts_attributes_and_range() {
        let records = vec![
            live("y", "events", "Morning  Scan!", 3),
            live("y", "events", "morning scan", 1),
            live("y", "routines", "Vitamin-C Serum", 2),
            live("z", "events", "other", 5),
        ];
        let prints = extract(&records, Source::Live, &["name".to_string()]);
        assert_eq!(prints.len(), 2);
        let y = &prints["y"];
        assert_eq!(y.count("events"), 2);
        assert_eq!(y.count("routines"), 1);
        assert_eq!(y.total(), 3);
        let attrs: Vec<&str> = y.attributes.iter().map(String::as_str).collect();
        assert_eq!(attrs, vec!["name:morning scan", "name:vitamin c serum"]);
        assert_eq!(y.first_seen.unwrap().format("%d").to_string(), "01");
        assert_eq!(y.last_seen.unwrap().format("%d").to_string(), "03");
    }

    #[test]
    fn deterministic_regardless_of_order() {
        let mut records = vec![
            live("y", "events", "a", 1),
            live("y", "routines", "b", 2),
            live("z", "events", "c", 3),
        ];
        let first = extract(&records, Source::Live, &["name".to_string()]);
        records.reverse();
        let second = extract(&records, Source::Live, &["name".to_string()]);
        assert_eq!(first, second);
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_text("  Hello,   WORLD!! "), "hello world");
        assert_eq!(normalize_text("--"), "");
    }

    #[test]
    fn label_tokens_drop_mail_domain() {
        let tokens = label_tokens("ana.silva@gmail.com");
        assert!(tokens.contains("ana"));
        assert!(tokens.contains("silva"));
        assert!(!tokens.contains("gmail"));
        assert!(!tokens.contains("com"));
    }

    #[test]
    fn identity_ignores_ids_and_shared_tokens() {
        let records = vec![
            live("user_999", "events", "a", 1),
            live("user_123", "events", "b", 1),
            live("legacy_7731", "events", "c", 1),
        ];
        let mut prints = extract(&records, Source::Live, &[]);
        let owners: BTreeMap<String, OwnerEntry> = [
            OwnerEntry::with_label("user_999", "ana.silva@corp.example"),
            OwnerEntry::with_label("user_123", "bruno.silva@corp.example"),
            OwnerEntry::new("legacy_7731"),
        ]
        .into_iter()
        .map(|o| (o.id.clone(), o))
        .collect();
        attach_identity(&mut prints, &owners);

        let ana: Vec<&str> = prints["user_999"].identity_tokens.iter().map(String::as_str).collect();
        assert_eq!(ana, vec!["ana"]);
        let bruno: Vec<&str> = prints["user_123"].identity_tokens.iter().map(String::as_str).collect();
        assert_eq!(bruno, vec!["bruno"]);
        assert!(prints["legacy_7731"].identity_tokens.is_empty());
    }
}
