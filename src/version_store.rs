//! Installed plugin version records.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

/// Version of an installed plugin, one record per plugin key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginVersionRecord {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub version: String,
    pub created: DateTime<Utc>,
}

/// Durable storage of version records, unique on key.
pub trait PluginVersionStore: Send + Sync {
    /// Create a record; the store assigns the id and creation time.
    fn create(&self, key: &str, name: &str, version: &str) -> Result<PluginVersionRecord>;

    /// Update name and version of an existing record.
    fn update(&self, record: &PluginVersionRecord) -> Result<()>;

    /// Delete a record by id.
    fn delete(&self, id: i64) -> Result<()>;

    fn get_by_key(&self, key: &str) -> Result<Option<PluginVersionRecord>>;

    fn get_all(&self) -> Result<Vec<PluginVersionRecord>>;
}

/// Version records kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryVersionStore {
    inner: Mutex<VersionTable>,
}

#[derive(Debug, Default)]
struct VersionTable {
    next_id: i64,
    by_id: BTreeMap<i64, PluginVersionRecord>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, VersionTable>> {
        self.inner
            .lock()
            .map_err(|_| LifecycleError::LockPoisoned("version records"))
    }
}

impl PluginVersionStore for InMemoryVersionStore {
    fn create(&self, key: &str, name: &str, version: &str) -> Result<PluginVersionRecord> {
        let mut table = self.table()?;
        if table.by_id.values().any(|r| r.key == key) {
            return Err(LifecycleError::Storage(format!(
                "Version record already exists for {key}"
            )));
        }

        table.next_id += 1;
        let record = PluginVersionRecord {
            id: table.next_id,
            key: key.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            created: Utc::now(),
        };
        table.by_id.insert(record.id, record.clone());
        Ok(record)
    }

    fn update(&self, record: &PluginVersionRecord) -> Result<()> {
        let mut table = self.table()?;
        match table.by_id.get_mut(&record.id) {
            Some(stored) => {
                stored.name = record.name.clone();
                stored.version = record.version.clone();
                Ok(())
            }
            None => Err(LifecycleError::Storage(format!(
                "No version record with id {}",
                record.id
            ))),
        }
    }

    fn delete(&self, id: i64) -> Result<()> {
        self.table()?.by_id.remove(&id);
        Ok(())
    }

    fn get_by_key(&self, key: &str) -> Result<Option<PluginVersionRecord>> {
        Ok(self.table()?.by_id.values().find(|r| r.key == key).cloned())
    }

    fn get_all(&self) -> Result<Vec<PluginVersionRecord>> {
        Ok(self.table()?.by_id.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_unique_on_key() {
        let store = InMemoryVersionStore::new();
        let first = store.create("com.acme", "Acme", "1.0").unwrap();
        assert_eq!(first.id, 1);
        assert!(store.create("com.acme", "Acme", "1.1").is_err());
        assert_eq!(store.create("com.other", "Other", "3").unwrap().id, 2);
    }

    #[test]
    fn test_update_and_delete() {
        let store = InMemoryVersionStore::new();
        let mut record = store.create("com.acme", "Acme", "1.0").unwrap();
        record.version = "2.0".into();
        store.update(&record).unwrap();
        assert_eq!(
            store.get_by_key("com.acme").unwrap().unwrap().version,
            "2.0"
        );

        store.delete(record.id).unwrap();
        assert!(store.get_by_key("com.acme").unwrap().is_none());
        assert!(store.update(&record).is_err());
    }
}
