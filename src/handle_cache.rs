//! Time-bounded cache of runtime service handles.
//!
//! Handles are expensive to build and hold native resources, so every entry
//! removed from the cache (idle expiry or explicit invalidation) is closed
//! exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::plugin::COMPLETE_KEY_SEPARATOR;

/// A runtime handle that owns resources needing explicit release.
pub trait ServiceHandle: Send + Sync {
    fn close(&self);
}

/// Builds the handle for an identifier; `None` means nothing is available.
pub type HandleLoader<H> = Box<dyn Fn(&str) -> Option<H> + Send + Sync>;

/// Cache entry. Returned even when the loader produced nothing, so callers
/// can tell "tried and empty" apart from "not tried".
pub struct CachedServiceHandle<H> {
    identifier: String,
    handle: OnceLock<Option<H>>,
    last_access: AtomicU64,
}

impl<H: ServiceHandle> CachedServiceHandle<H> {
    fn new(identifier: &str, now: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            handle: OnceLock::new(),
            last_access: AtomicU64::new(now),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The loaded handle, if the loader produced one.
    pub fn handle(&self) -> Option<&H> {
        self.handle.get().and_then(Option::as_ref)
    }

    fn is_loaded(&self) -> bool {
        self.handle.get().is_some()
    }

    fn close(&self) {
        if let Some(handle) = self.handle() {
            tracing::debug!("Closing service handle {}", self.identifier);
            handle.close();
        }
    }
}

impl<H> std::fmt::Debug for CachedServiceHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedServiceHandle")
            .field("identifier", &self.identifier)
            .field("loaded", &self.handle.get().is_some())
            .finish()
    }
}

/// Drops cached handles when plugin state changes.
pub trait HandleInvalidator: Send + Sync {
    /// Remove every handle belonging to a plugin or one of its modules.
    fn invalidate_plugin(&self, plugin_key: &str);

    /// Remove every handle.
    fn invalidate_all(&self);
}

/// Cache of service handles keyed by identifier.
pub struct ServiceHandleCache<H> {
    entries: DashMap<String, Arc<CachedServiceHandle<H>>>,
    loader: HandleLoader<H>,
    ttl: Duration,
    epoch: Instant,
    container_active: AtomicBool,
}

impl<H: ServiceHandle> ServiceHandleCache<H> {
    /// Create a cache whose entries expire after `ttl` without access.
    pub fn new(ttl: Duration, loader: HandleLoader<H>) -> Self {
        Self {
            entries: DashMap::new(),
            loader,
            ttl,
            epoch: Instant::now(),
            container_active: AtomicBool::new(true),
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn is_expired(&self, entry: &CachedServiceHandle<H>, now: u64) -> bool {
        let idle = now.saturating_sub(entry.last_access.load(Ordering::Acquire));
        entry.is_loaded() && Duration::from_nanos(idle) >= self.ttl
    }

    /// Mark the owning container as running or stopped.
    pub fn set_container_active(&self, active: bool) {
        self.container_active.store(active, Ordering::SeqCst);
    }

    pub fn is_container_active(&self) -> bool {
        self.container_active.load(Ordering::SeqCst)
    }

    /// Look up a handle, building it on a miss.
    ///
    /// Concurrent misses for one identifier run the loader once. Returns
    /// `None` without touching the cache while the container is inactive.
    pub fn get(&self, identifier: &str) -> Option<Arc<CachedServiceHandle<H>>> {
        if !self.is_container_active() {
            tracing::trace!("Container inactive, skipping handle lookup for {}", identifier);
            return None;
        }

        self.evict_expired();

        let now = self.now();
        // Touch under the shard lock so a concurrent sweep sees the entry as
        // fresh, then clone out so the loader runs without holding it
        let entry = self
            .entries
            .entry(identifier.to_string())
            .and_modify(|e| e.last_access.store(now, Ordering::Release))
            .or_insert_with(|| Arc::new(CachedServiceHandle::new(identifier, now)))
            .clone();

        entry.handle.get_or_init(|| {
            tracing::debug!("Loading service handle {}", identifier);
            (self.loader)(identifier)
        });
        entry.last_access.store(self.now(), Ordering::Release);
        Some(entry)
    }

    /// Remove and close every entry idle for at least the TTL.
    ///
    /// Returns the number of entries evicted by this call.
    pub fn evict_expired(&self) -> usize {
        let now = self.now();
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|e| self.is_expired(e.value(), now))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for identifier in candidates {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&identifier, |_, e| self.is_expired(e, now))
            {
                entry.close();
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!("Evicted {} idle service handles", evicted);
        }
        evicted
    }

    /// Remove and close one entry.
    pub fn invalidate(&self, identifier: &str) -> bool {
        match self.entries.remove(identifier) {
            Some((_, entry)) => {
                entry.close();
                true
            }
            None => false,
        }
    }

    fn invalidate_matching(&self, matches: impl Fn(&str) -> bool) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        keys.iter().filter(|k| self.invalidate(k)).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: ServiceHandle> HandleInvalidator for ServiceHandleCache<H> {
    fn invalidate_plugin(&self, plugin_key: &str) {
        let removed = self.invalidate_matching(|id| {
            id == plugin_key
                || id
                    .strip_prefix(plugin_key)
                    .is_some_and(|rest| rest.starts_with(COMPLETE_KEY_SEPARATOR))
        });
        if removed > 0 {
            tracing::debug!("Invalidated {} service handles of {}", removed, plugin_key);
        }
    }

    fn invalidate_all(&self) {
        let removed = self.invalidate_matching(|_| true);
        tracing::info!("Invalidated all {} service handles", removed);
    }
}
