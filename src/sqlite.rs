//! SQLite-backed durable stores.
//!
//! One database holds the `plugin_state` rows, the `plugin_version` records
//! and the legacy `property_entry` table that state is migrated out of.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{LifecycleError, Result};
use crate::state_store::{LegacyStateSource, StateRowStore, LEGACY_KEY_PREFIX};
use crate::version_store::{PluginVersionRecord, PluginVersionStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS plugin_state (
    key TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS plugin_version (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    created TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS property_entry (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// SQLite database shared by the durable stores.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

// ---------------------------------------------------------------------------
// Row scanners
// ---------------------------------------------------------------------------

fn scan_version(row: &rusqlite::Row) -> rusqlite::Result<PluginVersionRecord> {
    let created: String = row.get(4)?;
    let created = DateTime::parse_from_rfc3339(&created)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(PluginVersionRecord {
        id: row.get(0)?,
        key: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        created,
    })
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LifecycleError::LockPoisoned("sqlite connection"))
    }

    /// Write a legacy property row.
    pub fn put_property(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO property_entry (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

impl StateRowStore for SqliteStore {
    fn load_all(&self) -> Result<HashMap<String, bool>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, enabled FROM plugin_state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)))?;
        let mut state = HashMap::new();
        for row in rows {
            let (key, enabled) = row?;
            state.insert(key, enabled);
        }
        Ok(state)
    }

    fn insert(&self, rows: &[(String, bool)]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO plugin_state (key, enabled) VALUES (?1, ?2)")?;
            for (key, enabled) in rows {
                stmt.execute(params![key, enabled])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn update(&self, rows: &[(String, bool)]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE plugin_state SET enabled = ?2 WHERE key = ?1")?;
            for (key, enabled) in rows {
                if stmt.execute(params![key, enabled])? == 0 {
                    return Err(LifecycleError::Storage(format!("Unknown state key {key}")));
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM plugin_state WHERE key = ?1")?;
            for key in keys {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl PluginVersionStore for SqliteStore {
    fn create(&self, key: &str, name: &str, version: &str) -> Result<PluginVersionRecord> {
        let created = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO plugin_version (key, name, version, created) VALUES (?1, ?2, ?3, ?4)",
            params![key, name, version, created.to_rfc3339()],
        )?;

        Ok(PluginVersionRecord {
            id: conn.last_insert_rowid(),
            key: key.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            created,
        })
    }

    fn update(&self, record: &PluginVersionRecord) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE plugin_version SET name = ?2, version = ?3 WHERE id = ?1",
            params![record.id, record.name, record.version],
        )?;
        if changed == 0 {
            return Err(LifecycleError::Storage(format!(
                "No version record with id {}",
                record.id
            )));
        }
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM plugin_version WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn get_by_key(&self, key: &str) -> Result<Option<PluginVersionRecord>> {
        let record = self
            .conn()?
            .query_row(
                "SELECT id, key, name, version, created FROM plugin_version WHERE key = ?1",
                params![key],
                scan_version,
            )
            .optional()?;
        Ok(record)
    }

    fn get_all(&self) -> Result<Vec<PluginVersionRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, key, name, version, created FROM plugin_version ORDER BY id")?;
        let rows = stmt.query_map([], scan_version)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

impl LegacyStateSource for SqliteStore {
    fn entries(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM property_entry WHERE instr(key, ?1) > 0 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![LEGACY_KEY_PREFIX], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn rename(&self, old_key: &str, new_key: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE property_entry SET key = ?2 WHERE key = ?1",
            params![old_key, new_key],
        )?;
        Ok(())
    }

    fn remove(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM property_entry WHERE key = ?1")?;
            for key in keys {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{LocalLockService, StaticNode};
    use crate::state_store::ClusterStateStore;
    use std::sync::Arc;

    #[test]
    fn test_state_rows_round_trip_through_store() {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = ClusterStateStore::new(
            db.clone(),
            Arc::new(LocalLockService::new()),
            Arc::new(StaticNode::active("n1")),
        )
        .unwrap();

        store.set("com.acme", true).unwrap();
        store.set("com.acme:panel", false).unwrap();
        store.set("com.acme", false).unwrap();
        store.remove_plugin_state("com.acme").unwrap();
        store.set("com.other", true).unwrap();

        let rows = StateRowStore::load_all(db.as_ref()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get("com.other"), Some(&true));
    }

    #[test]
    fn test_update_unknown_state_key_fails() {
        let db = SqliteStore::open_in_memory().unwrap();
        let result = StateRowStore::update(&db, &[("missing".to_string(), true)]);
        assert!(matches!(result, Err(LifecycleError::Storage(_))));
    }

    #[test]
    fn test_version_records() {
        let db = SqliteStore::open_in_memory().unwrap();
        let mut record = db.create("com.acme", "Acme", "1.0").unwrap();
        assert!(db.create("com.acme", "Acme", "1.0").is_err());

        record.version = "1.1".into();
        PluginVersionStore::update(&db, &record).unwrap();

        let stored = db.get_by_key("com.acme").unwrap().unwrap();
        assert_eq!(stored.version, "1.1");
        assert_eq!(stored.id, record.id);
        assert_eq!(stored.created.timestamp(), record.created.timestamp());

        PluginVersionStore::delete(&db, record.id).unwrap();
        assert!(db.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_legacy_migration_from_property_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SqliteStore::open(&dir.path().join("plugins.db")).unwrap());
        db.put_property("plugin.state-com.acme", "false").unwrap();
        db.put_property(".plugin.state-com.acme:panel", "true").unwrap();
        db.put_property("site.title", "Tracker").unwrap();

        let store = ClusterStateStore::new(
            db.clone(),
            Arc::new(LocalLockService::new()),
            Arc::new(StaticNode::active("n1")),
        )
        .unwrap();

        assert_eq!(store.migrate_legacy(db.as_ref()).unwrap(), 2);
        assert_eq!(store.get("com.acme"), Some(false));
        assert_eq!(store.get("com.acme:panel"), Some(true));
        assert!(db.entries().unwrap().is_empty());
    }
}
