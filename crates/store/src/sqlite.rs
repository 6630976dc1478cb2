use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;

use relink_recon::config::{StoreConfig, TableLayout};
use relink_recon::loader::parse_timestamp;
use relink_recon::model::{Attributes, LiveRecord, OwnerEntry};
use relink_recon::store::LiveStore;
use relink_recon::StoreError;

/// SQLite implementation of [`LiveStore`].
///
/// One connection, serialized behind a mutex. Apply batches still run
/// concurrently from the engine's point of view; SQLite sees them one at a
/// time, and `busy_timeout` covers other writers on the same file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    layout: StoreConfig,
}

impl SqliteStore {
    pub fn open(path: &Path, layout: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(store_err)?;
        debug!(path = %path.display(), "opened live store");
        Self::from_connection(conn, layout)
    }

    pub fn from_connection(conn: Connection, layout: &StoreConfig) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_millis(layout.busy_timeout_ms))
            .map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            layout: layout.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn table(&self, table: &str) -> Result<&TableLayout, StoreError> {
        self.layout
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn select(&self, table: &str, filter_column: Option<&str>, value: &str) -> Result<Vec<LiveRecord>, StoreError> {
        let layout = self.table(table)?;
        let mut sql = format!("SELECT * FROM {}", quote(table)?);
        if let Some(column) = filter_column {
            sql.push_str(&format!(" WHERE {} = ?1", as_text(column)?));
        }
        sql.push_str(&format!(" ORDER BY {}", quote(&layout.id_column)?));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let id_idx = position(&columns, &layout.id_column, table)?;
        let owner_idx = position(&columns, &layout.owner_column, table)?;
        let ts_idx = match layout.timestamp_column {
            Some(ref c) => Some(position(&columns, c, table)?),
            None => None,
        };

        let map = |row: &Row<'_>| -> rusqlite::Result<LiveRecord> {
            let mut attributes = Attributes::new();
            for (i, name) in columns.iter().enumerate() {
                if i == id_idx || i == owner_idx {
                    continue;
                }
                if let Some(text) = text_of(row.get_ref(i)?) {
                    attributes.insert(name.clone(), text);
                }
            }
            Ok(LiveRecord {
                record_id: text_of(row.get_ref(id_idx)?).unwrap_or_default(),
                table_name: table.to_string(),
                owner_ref: text_of(row.get_ref(owner_idx)?).unwrap_or_default(),
                timestamp: match ts_idx {
                    Some(i) => timestamp_of(row.get_ref(i)?),
                    None => None,
                },
                attributes,
            })
        };

        let rows = match filter_column {
            Some(_) => stmt.query_map(params![value], map),
            None => stmt.query_map([], map),
        }
        .map_err(store_err)?;
        let records = rows.collect::<Result<Vec<_>, _>>().map_err(store_err)?;
        Ok(records)
    }
}

impl LiveStore for SqliteStore {
    fn tables(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.layout.tables.keys().cloned().collect())
    }

    fn owners(&self) -> Result<Vec<OwnerEntry>, StoreError> {
        let owners = &self.layout.owners;
        let label = match owners.label_column {
            Some(ref c) => quote(c)?,
            None => "NULL".to_string(),
        };
        let sql = format!(
            "SELECT {}, {label} FROM {}",
            quote(&owners.id_column)?,
            quote(&owners.table)?
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OwnerEntry {
                    id: text_of(row.get_ref(0)?).unwrap_or_default(),
                    label: text_of(row.get_ref(1)?).filter(|l| !l.is_empty()),
                })
            })
            .map_err(store_err)?;
        let owners = rows.collect::<Result<Vec<_>, _>>().map_err(store_err)?;
        Ok(owners)
    }

    fn list_table(&self, table: &str) -> Result<Vec<LiveRecord>, StoreError> {
        self.select(table, None, "")
    }

    fn list_by_owner(&self, table: &str, owner_ref: &str) -> Result<Vec<LiveRecord>, StoreError> {
        let column = self.table(table)?.owner_column.clone();
        self.select(table, Some(&column), owner_ref)
    }

    fn get(&self, table: &str, record_id: &str) -> Result<Option<LiveRecord>, StoreError> {
        let column = self.table(table)?.id_column.clone();
        Ok(self.select(table, Some(&column), record_id)?.into_iter().next())
    }

    fn conditional_update(
        &self,
        table: &str,
        record_id: &str,
        expected_owner_ref: &str,
        new_owner_ref: &str,
    ) -> Result<bool, StoreError> {
        let layout = self.table(table)?;
        let owner = quote(&layout.owner_column)?;
        let sql = format!(
            "UPDATE {} SET {owner} = ?1 WHERE {} = ?2 AND {} = ?3",
            quote(table)?,
            as_text(&layout.id_column)?,
            as_text(&layout.owner_column)?,
        );
        let changed = self
            .lock()
            .execute(&sql, params![bind_value(new_owner_ref), record_id, expected_owner_ref])
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    fn create_owner(&self, owner_ref: &str) -> Result<bool, StoreError> {
        let owners = &self.layout.owners;
        let table = quote(&owners.table)?;
        let id = quote(&owners.id_column)?;
        let id_text = as_text(&owners.id_column)?;

        let conn = self.lock();
        let exists: Option<i64> = conn
            .query_row(&format!("SELECT 1 FROM {table} WHERE {id_text} = ?1"), params![owner_ref], |row| {
                row.get(0)
            })
            .optional()
            .map_err(store_err)?;
        if exists.is_some() {
            return Ok(false);
        }
        conn.execute(&format!("INSERT INTO {table} ({id}) VALUES (?1)"), params![bind_value(owner_ref)])
            .map_err(store_err)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Quote an identifier for interpolation into SQL.
fn quote(ident: &str) -> Result<String, StoreError> {
    if ident.is_empty() || ident.contains('\0') {
        return Err(StoreError::Backend(format!("invalid identifier {ident:?}")));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

/// Column compared by its text form. Records surface ids and owner refs as
/// text, and a column without declared affinity may hold them as integers.
fn as_text(column: &str) -> Result<String, StoreError> {
    Ok(format!("CAST({} AS TEXT)", quote(column)?))
}

/// Written refs keep the integer storage class when they are canonical integers.
fn bind_value(text: &str) -> Value {
    match text.parse::<i64>() {
        Ok(i) if i.to_string() == text => Value::Integer(i),
        _ => Value::Text(text.to_string()),
    }
}

fn position(columns: &[String], name: &str, table: &str) -> Result<usize, StoreError> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| StoreError::Backend(format!("table '{table}' has no column '{name}'")))
}

fn text_of(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

/// Text columns go through the extract's timestamp parser; integers are
/// Unix seconds.
fn timestamp_of(value: ValueRef<'_>) -> Option<DateTime<Utc>> {
    match value {
        ValueRef::Integer(secs) => DateTime::from_timestamp(secs, 0),
        other => text_of(other).and_then(|t| parse_timestamp(&t)),
    }
}

fn store_err(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => StoreError::Transient(e.to_string()),
        Some(ErrorCode::ConstraintViolation | ErrorCode::ReadOnly) => StoreError::Rejected(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relink_recon::config::OwnerTableLayout;
    use std::collections::BTreeMap;

    fn layout() -> StoreConfig {
        let mut tables = BTreeMap::new();
        tables.insert(
            "events".to_string(),
            TableLayout {
                id_column: "id".into(),
                owner_column: "user_id".into(),
                timestamp_column: Some("created_at".into()),
            },
        );
        StoreConfig {
            path: "live.db".into(),
            busy_timeout_ms: 100,
            owners: OwnerTableLayout {
                table: "users".into(),
                id_column: "id".into(),
                label_column: Some("email".into()),
            },
            tables,
        }
    }

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE users (id TEXT PRIMARY KEY, email TEXT);
            CREATE TABLE events (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                name TEXT,
                created_at TEXT,
                score INTEGER
            );
            INSERT INTO users VALUES ('alice', 'alice@example.com');
            INSERT INTO events VALUES ('e1', 'u-77', 'Morning scan', '2025-01-02 08:00:00', 3);
            INSERT INTO events VALUES ('e2', 'u-77', 'Evening scan', 'garbage', NULL);
            INSERT INTO events VALUES ('e3', NULL, 'Orphan', NULL, NULL);
            "#,
        )
        .unwrap();
        drop(conn);
        let store = SqliteStore::open(&path, &layout()).unwrap();
        (dir, store)
    }

    #[test]
    fn reads_records_and_owners() {
        let (_dir, store) = store();
        let records = store.list_table("events").unwrap();
        assert_eq!(records.len(), 3);
        let e1 = &records[0];
        assert_eq!(e1.owner_ref, "u-77");
        assert_eq!(e1.attributes["name"], "Morning scan");
        assert_eq!(e1.attributes["score"], "3");
        assert!(!e1.attributes.contains_key("user_id"));
        assert!(e1.timestamp.is_some());
        assert!(records[1].timestamp.is_none());
        assert_eq!(records[2].owner_ref, "");

        let owners = store.owners().unwrap();
        assert_eq!(owners, vec![OwnerEntry::with_label("alice", "alice@example.com")]);
        assert_eq!(store.tables().unwrap(), vec!["events".to_string()]);
    }

    #[test]
    fn conditional_update_only_when_owner_matches() {
        let (_dir, store) = store();
        assert!(store.conditional_update("events", "e1", "u-77", "alice").unwrap());
        assert!(!store.conditional_update("events", "e1", "u-77", "alice").unwrap());
        assert!(!store.conditional_update("events", "missing", "u-77", "alice").unwrap());

        assert_eq!(store.list_by_owner("events", "alice").unwrap().len(), 1);
        assert_eq!(store.get("events", "e1").unwrap().unwrap().owner_ref, "alice");
        assert!(store.get("events", "nope").unwrap().is_none());
    }

    #[test]
    fn create_owner_once() {
        let (_dir, store) = store();
        assert!(store.create_owner("bob").unwrap());
        assert!(!store.create_owner("bob").unwrap());
        assert!(!store.create_owner("alice").unwrap());
        assert_eq!(store.owners().unwrap().len(), 2);
    }

    #[test]
    fn unknown_table_and_column() {
        let (_dir, store) = store();
        assert_eq!(
            store.list_table("routines").unwrap_err(),
            StoreError::UnknownTable("routines".into())
        );

        let mut bad = layout();
        if let Some(t) = bad.tables.get_mut("events") {
            t.owner_column = "owner".into();
        }
        let conn = store.conn.into_inner().unwrap();
        let store = SqliteStore::from_connection(conn, &bad).unwrap();
        assert!(matches!(store.list_table("events"), Err(StoreError::Backend(_))));
    }

    #[test]
    fn untyped_columns_holding_integers() {
        let (_dir, store) = store();
        store
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE loose (id, user_id, name);
                INSERT INTO loose VALUES (1, 7, 'Serum');
                INSERT INTO loose VALUES (2, 7, 'Toner');
                "#,
            )
            .unwrap();
        let mut wide = layout();
        wide.tables.insert(
            "loose".to_string(),
            TableLayout {
                id_column: "id".into(),
                owner_column: "user_id".into(),
                timestamp_column: None,
            },
        );
        let conn = store.conn.into_inner().unwrap();
        let store = SqliteStore::from_connection(conn, &wide).unwrap();

        assert_eq!(store.list_by_owner("loose", "7").unwrap().len(), 2);
        assert_eq!(store.get("loose", "1").unwrap().unwrap().owner_ref, "7");
        assert!(store.conditional_update("loose", "1", "7", "42").unwrap());
        assert!(!store.conditional_update("loose", "1", "7", "42").unwrap());

        let kind: String = store
            .lock()
            .query_row("SELECT typeof(user_id) FROM loose WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kind, "integer");
        assert_eq!(bind_value("007"), Value::Text("007".into()));
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("events").unwrap(), "\"events\"");
        assert_eq!(quote("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote("").is_err());
    }
}
