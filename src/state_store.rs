//! Cluster-consistent enabled/disabled state of plugins and modules.
//!
//! The in-memory cache answers every read. Writes compute the net change
//! against the cache and, on the cluster-active node, apply exactly that
//! change to the durable row store under a cluster-wide lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::cluster::{ClusterLockService, ClusterNode};
use crate::error::{LifecycleError, Result};
use crate::events::{LifecycleEvent, LifecycleListener};
use crate::plugin::belongs_to_plugin;

/// Name of the cluster lock guarding durable state writes.
pub const STATE_LOCK_NAME: &str = "plugin-state-store";

/// Prefix of state keys in the legacy flat property table.
pub const LEGACY_KEY_PREFIX: &str = "plugin.state-";

/// Separator that was erroneously prepended to some legacy keys.
const LEGACY_SEPARATOR: char = '.';

/// Durable storage of state rows.
pub trait StateRowStore: Send + Sync {
    fn load_all(&self) -> Result<HashMap<String, bool>>;
    fn insert(&self, rows: &[(String, bool)]) -> Result<()>;
    fn update(&self, rows: &[(String, bool)]) -> Result<()>;
    fn delete(&self, keys: &[String]) -> Result<()>;
}

/// Legacy flat key/value table that stored one row per state flag.
pub trait LegacyStateSource: Send + Sync {
    /// All entries whose key contains [`LEGACY_KEY_PREFIX`].
    fn entries(&self) -> Result<Vec<(String, String)>>;
    fn rename(&self, old_key: &str, new_key: &str) -> Result<()>;
    fn remove(&self, keys: &[String]) -> Result<()>;
}

/// Net change between two state maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub inserts: Vec<(String, bool)>,
    pub updates: Vec<(String, bool)>,
    pub deletes: Vec<String>,
}

impl StateDiff {
    /// Compute the change that turns `old` into `new`.
    pub fn between(old: &HashMap<String, bool>, new: &HashMap<String, bool>) -> Self {
        let mut diff = StateDiff::default();
        for (key, &enabled) in new {
            match old.get(key) {
                None => diff.inserts.push((key.clone(), enabled)),
                Some(&previous) if previous != enabled => diff.updates.push((key.clone(), enabled)),
                Some(_) => {}
            }
        }
        for key in old.keys() {
            if !new.contains_key(key) {
                diff.deletes.push(key.clone());
            }
        }
        diff.inserts.sort();
        diff.updates.sort();
        diff.deletes.sort();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    fn apply_to(&self, cache: &DashMap<String, bool>) {
        for key in &self.deletes {
            cache.remove(key);
        }
        for (key, enabled) in self.inserts.iter().chain(self.updates.iter()) {
            cache.insert(key.clone(), *enabled);
        }
    }

    fn apply_to_store(&self, store: &dyn StateRowStore) -> Result<()> {
        if !self.inserts.is_empty() {
            store.insert(&self.inserts)?;
        }
        if !self.deletes.is_empty() {
            store.delete(&self.deletes)?;
        }
        if !self.updates.is_empty() {
            store.update(&self.updates)?;
        }
        Ok(())
    }
}

/// Cluster-consistent key → enabled map.
pub struct ClusterStateStore {
    cache: DashMap<String, bool>,
    rows: Arc<dyn StateRowStore>,
    locks: Arc<dyn ClusterLockService>,
    node: Arc<dyn ClusterNode>,
}

impl ClusterStateStore {
    /// Create the store and prime the cache from the row store.
    pub fn new(
        rows: Arc<dyn StateRowStore>,
        locks: Arc<dyn ClusterLockService>,
        node: Arc<dyn ClusterNode>,
    ) -> Result<Self> {
        let store = Self {
            cache: DashMap::new(),
            rows,
            locks,
            node,
        };
        store.reload()?;
        Ok(store)
    }

    /// Current state, from memory.
    pub fn load(&self) -> HashMap<String, bool> {
        self.cache
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// State of a single key, from memory.
    pub fn get(&self, key: &str) -> Option<bool> {
        self.cache.get(key).map(|v| *v)
    }

    /// Replace the whole state with `new_state`, writing only the net change.
    pub fn save(&self, new_state: &HashMap<String, bool>) -> Result<()> {
        let diff = StateDiff::between(&self.load(), new_state);
        if diff.is_empty() {
            return Ok(());
        }

        if !self.node.is_cluster_active() {
            tracing::debug!(
                "Passive node {}: applying state change in memory only",
                self.node.node_id()
            );
            diff.apply_to(&self.cache);
            return Ok(());
        }

        self.locks.run_locked(STATE_LOCK_NAME, &mut || {
            // Another node may have written since our cache was loaded
            let durable = self.rows.load_all()?;
            let diff = StateDiff::between(&durable, new_state);
            if !diff.is_empty() {
                tracing::debug!(
                    "Persisting plugin state: {} inserts, {} updates, {} deletes",
                    diff.inserts.len(),
                    diff.updates.len(),
                    diff.deletes.len()
                );
                diff.apply_to_store(self.rows.as_ref())?;
            }
            self.reload()
        })
    }

    /// Set one key, keeping the rest of the state.
    pub fn set(&self, key: &str, enabled: bool) -> Result<()> {
        self.modify(&|state| {
            state.insert(key.to_string(), enabled);
        })
    }

    /// Remove every key belonging to a plugin (its own key and its modules).
    pub fn remove_plugin_state(&self, plugin_key: &str) -> Result<()> {
        self.modify(&|state| state.retain(|key, _| !belongs_to_plugin(key, plugin_key)))
    }

    /// Apply a keyed change to the current state.
    ///
    /// The active node applies `change` to the durable rows read under the
    /// lock, never to a cached copy, so concurrent changes to other keys
    /// survive.
    fn modify(&self, change: &dyn Fn(&mut HashMap<String, bool>)) -> Result<()> {
        if !self.node.is_cluster_active() {
            let old = self.load();
            let mut new = old.clone();
            change(&mut new);
            let diff = StateDiff::between(&old, &new);
            if !diff.is_empty() {
                tracing::debug!(
                    "Passive node {}: applying state change in memory only",
                    self.node.node_id()
                );
                diff.apply_to(&self.cache);
            }
            return Ok(());
        }

        self.locks.run_locked(STATE_LOCK_NAME, &mut || {
            let durable = self.rows.load_all()?;
            let mut new = durable.clone();
            change(&mut new);
            let diff = StateDiff::between(&durable, &new);
            if !diff.is_empty() {
                tracing::debug!(
                    "Persisting plugin state: {} inserts, {} updates, {} deletes",
                    diff.inserts.len(),
                    diff.updates.len(),
                    diff.deletes.len()
                );
                diff.apply_to_store(self.rows.as_ref())?;
            }
            self.reload()
        })
    }

    /// Cluster-wide cache clear: the active node reloads from durable storage.
    pub fn on_clear_cache(&self) -> Result<()> {
        if self.node.is_cluster_active() {
            tracing::debug!("Reloading plugin state after cluster cache clear");
            self.reload()?;
        }
        Ok(())
    }

    /// One-off import of state held in the legacy flat property table.
    ///
    /// Keys with a stray leading separator are corrected in place first.
    /// Entries are copied only if the row store is still empty, then removed
    /// from the legacy table. Returns the number of migrated entries.
    pub fn migrate_legacy(&self, legacy: &dyn LegacyStateSource) -> Result<usize> {
        let mut entries = legacy.entries()?;

        for (key, _) in entries.iter_mut() {
            let corrected = match key.strip_prefix(LEGACY_SEPARATOR) {
                Some(rest) if rest.starts_with(LEGACY_KEY_PREFIX) => rest.to_string(),
                _ => continue,
            };
            tracing::info!("Correcting legacy plugin state key {}", key);
            legacy.rename(key, &corrected)?;
            *key = corrected;
        }

        let migratable: Vec<(String, String)> = entries
            .into_iter()
            .filter(|(key, _)| key.starts_with(LEGACY_KEY_PREFIX))
            .collect();
        if migratable.is_empty() {
            return Ok(0);
        }

        let mut migrated = 0;
        self.locks.run_locked(STATE_LOCK_NAME, &mut || {
            if !self.rows.load_all()?.is_empty() {
                tracing::debug!("Plugin state already migrated; leaving legacy rows untouched");
                return Ok(());
            }

            let rows: Vec<(String, bool)> = migratable
                .iter()
                .filter_map(|(key, value)| {
                    let state_key = key.strip_prefix(LEGACY_KEY_PREFIX)?;
                    Some((state_key.to_string(), value.trim().eq_ignore_ascii_case("true")))
                })
                .filter(|(key, _)| !key.is_empty())
                .collect();

            self.rows.insert(&rows)?;
            let legacy_keys: Vec<String> = migratable.iter().map(|(k, _)| k.clone()).collect();
            legacy.remove(&legacy_keys)?;
            migrated = rows.len();
            tracing::info!("Migrated {} legacy plugin state entries", migrated);
            self.reload()
        })?;

        Ok(migrated)
    }

    fn reload(&self) -> Result<()> {
        let durable = self.rows.load_all()?;
        self.cache.retain(|key, _| durable.contains_key(key));
        for (key, enabled) in durable {
            self.cache.insert(key, enabled);
        }
        Ok(())
    }
}

impl LifecycleListener for ClusterStateStore {
    fn on_event(&self, event: &LifecycleEvent) {
        if let LifecycleEvent::ClusterCacheClear = event {
            if let Err(e) = self.on_clear_cache() {
                tracing::error!("Failed to reload plugin state: {}", e);
            }
        }
    }
}

/// Row store kept in memory, for single-node use and tests.
#[derive(Debug, Default)]
pub struct InMemoryStateRows {
    rows: Mutex<HashMap<String, bool>>,
}

impl InMemoryStateRows {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, bool>>> {
        self.rows
            .lock()
            .map_err(|_| LifecycleError::LockPoisoned("state rows"))
    }
}

impl StateRowStore for InMemoryStateRows {
    fn load_all(&self) -> Result<HashMap<String, bool>> {
        Ok(self.rows()?.clone())
    }

    fn insert(&self, rows: &[(String, bool)]) -> Result<()> {
        let mut stored = self.rows()?;
        for (key, enabled) in rows {
            if stored.contains_key(key) {
                return Err(LifecycleError::Storage(format!("Duplicate state key {key}")));
            }
            stored.insert(key.clone(), *enabled);
        }
        Ok(())
    }

    fn update(&self, rows: &[(String, bool)]) -> Result<()> {
        let mut stored = self.rows()?;
        for (key, enabled) in rows {
            match stored.get_mut(key) {
                Some(value) => *value = *enabled,
                None => return Err(LifecycleError::Storage(format!("Unknown state key {key}"))),
            }
        }
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        let mut stored = self.rows()?;
        for key in keys {
            stored.remove(key);
        }
        Ok(())
    }
}
