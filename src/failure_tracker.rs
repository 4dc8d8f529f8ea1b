//! Tracking of plugins from construction to a terminal state.
//!
//! A plugin is tracked from the moment its artifact has been constructed
//! until it is either confirmed enabled (tracking removed) or recorded as
//! failed (cause list retained). Entries are immutable values; every update
//! builds a new value and replaces the map entry.

use std::error::Error;

use dashmap::DashMap;

use crate::artifact::PluginArtifact;
use crate::events::{LifecycleEvent, LifecycleListener};

/// Cause recorded when a loading plugin is disabled without ever enabling.
pub const INFERRED_TIMEOUT_CAUSE: &str =
    "The plugin has been disabled. A likely cause is that it timed out during initialisation";

/// Indentation added per nested cause.
const CAUSE_INDENT: &str = "  ";

/// A service a tracked plugin is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDependency {
    pub service_name: String,
    pub service_class: String,
}

impl ServiceDependency {
    /// Build a dependency from a wait filter such as
    /// `(&(objectClass=com.acme.SearchService)(name=primary))`.
    pub fn from_filter(service_name: &str, filter: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            service_class: object_class(filter).unwrap_or(filter).to_string(),
        }
    }
}

fn object_class(filter: &str) -> Option<&str> {
    let start = filter.find("objectClass=")? + "objectClass=".len();
    let rest = &filter[start..];
    let end = rest.find(')').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Snapshot of a tracked plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPluginInfo {
    pub plugin_key: String,
    pub plugin_name: String,
    pub artifact: Option<PluginArtifact>,
    pub failure_causes: Option<Vec<String>>,
    pub dependencies: Vec<ServiceDependency>,
}

impl TrackedPluginInfo {
    pub fn new(
        plugin_key: impl Into<String>,
        plugin_name: impl Into<String>,
        artifact: Option<PluginArtifact>,
    ) -> Self {
        Self {
            plugin_key: plugin_key.into(),
            plugin_name: plugin_name.into(),
            artifact,
            failure_causes: None,
            dependencies: Vec::new(),
        }
    }

    /// Copy with additional failure causes appended.
    pub fn with_failure(&self, causes: impl IntoIterator<Item = String>) -> Self {
        let mut next = self.clone();
        next.failure_causes
            .get_or_insert_with(Vec::new)
            .extend(causes);
        next
    }

    /// Copy with a dependency added; adding an existing dependency is a no-op.
    pub fn with_dependency(&self, dependency: ServiceDependency) -> Self {
        let mut next = self.clone();
        if !next.dependencies.contains(&dependency) {
            next.dependencies.push(dependency);
        }
        next
    }

    /// Copy without any dependency on the named service.
    pub fn without_dependency(&self, service_name: &str) -> Self {
        let mut next = self.clone();
        next.dependencies.retain(|d| d.service_name != service_name);
        next
    }

    /// Check if any failure cause was recorded.
    pub fn has_failed(&self) -> bool {
        self.failure_causes
            .as_ref()
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }
}

/// Render an error and its sources, one line per level, indented by nesting depth.
pub fn cause_chain(error: &(dyn Error + 'static)) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current: Option<&(dyn Error + 'static)> = Some(error);
    let mut depth = 0;
    while let Some(err) = current {
        causes.push(format!("{}{}", CAUSE_INDENT.repeat(depth), err));
        current = err.source();
        depth += 1;
    }
    causes
}

/// Concurrent tracker of loading and failed plugins.
#[derive(Debug, Default)]
pub struct FailureTracker {
    loading: DashMap<String, TrackedPluginInfo>,
    failed: DashMap<String, TrackedPluginInfo>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a constructed plugin that is not yet enabled.
    pub fn track_loading(
        &self,
        plugin_key: &str,
        plugin_name: &str,
        artifact: Option<PluginArtifact>,
    ) {
        tracing::debug!("Tracking loading plugin {}", plugin_key);
        self.loading.insert(
            plugin_key.to_string(),
            TrackedPluginInfo::new(plugin_key, plugin_name, artifact),
        );
    }

    /// Stop tracking a key without recording an outcome.
    pub fn untrack(&self, plugin_key: &str) {
        self.loading.remove(plugin_key);
        self.failed.remove(plugin_key);
    }

    /// The plugin enabled; it is no longer loading nor failed.
    pub fn on_plugin_enabled(&self, plugin_key: &str) {
        let was_failed = self.failed.remove(plugin_key).is_some();
        self.loading.remove(plugin_key);
        if was_failed {
            tracing::info!("Plugin {} recovered from an earlier failure", plugin_key);
        }
    }

    /// The plugin was disabled; if it never enabled, record an inferred timeout.
    pub fn on_plugin_disabled(&self, plugin_key: &str) {
        if self.failed.contains_key(plugin_key) {
            return;
        }
        let Some(info) = self.loading.get(plugin_key).map(|i| i.clone()) else {
            return;
        };

        tracing::warn!(
            "Plugin {} was disabled before it enabled; assuming an initialisation timeout",
            plugin_key
        );
        self.record_failure(info, vec![INFERRED_TIMEOUT_CAUSE.to_string()]);
    }

    /// The container failed to start the plugin.
    pub fn on_container_failed(&self, plugin_key: &str, error: &(dyn Error + 'static)) {
        let causes = cause_chain(error);
        tracing::error!("Plugin {} failed: {}", plugin_key, causes.join("; "));

        let info = self
            .failed
            .get(plugin_key)
            .map(|i| i.clone())
            .or_else(|| self.loading.get(plugin_key).map(|i| i.clone()))
            .unwrap_or_else(|| TrackedPluginInfo::new(plugin_key, plugin_key, None));
        self.record_failure(info, causes);
    }

    /// Observe an enable failure. Always returns `false` (not handled) so the
    /// caller continues with its own fallback handling.
    pub fn intercept_enable_failure(&self, plugin_key: &str, error: &(dyn Error + 'static)) -> bool {
        self.on_container_failed(plugin_key, error);
        false
    }

    /// A tracked plugin started waiting for a service.
    pub fn dependency_wait_starting(&self, plugin_key: &str, service_name: &str, filter: &str) {
        let dependency = ServiceDependency::from_filter(service_name, filter);
        self.update_tracked(plugin_key, |info| info.with_dependency(dependency.clone()));
    }

    /// A tracked plugin stopped waiting for a service.
    pub fn dependency_wait_ended(&self, plugin_key: &str, service_name: &str) {
        self.update_tracked(plugin_key, |info| info.without_dependency(service_name));
    }

    /// All plugins with at least one failure cause.
    pub fn failed_plugins(&self) -> Vec<TrackedPluginInfo> {
        let mut failed: Vec<TrackedPluginInfo> = self
            .failed
            .iter()
            .filter(|e| e.value().has_failed())
            .map(|e| e.value().clone())
            .collect();
        failed.sort_by(|a, b| a.plugin_key.cmp(&b.plugin_key));
        failed
    }

    /// Plugins that were constructed but never reached a terminal state.
    pub fn unaccounted_for_plugins(&self) -> Vec<TrackedPluginInfo> {
        let mut pending: Vec<TrackedPluginInfo> = self
            .loading
            .iter()
            .filter(|e| !self.failed.contains_key(e.key()))
            .map(|e| e.value().clone())
            .collect();
        pending.sort_by(|a, b| a.plugin_key.cmp(&b.plugin_key));
        pending
    }

    /// Check if a plugin is in the failed set.
    pub fn is_failed(&self, plugin_key: &str) -> bool {
        self.failed
            .get(plugin_key)
            .map(|i| i.has_failed())
            .unwrap_or(false)
    }

    /// Current tracking info for a key, preferring the failed entry.
    pub fn tracked(&self, plugin_key: &str) -> Option<TrackedPluginInfo> {
        self.failed
            .get(plugin_key)
            .map(|i| i.clone())
            .or_else(|| self.loading.get(plugin_key).map(|i| i.clone()))
    }

    fn record_failure(&self, info: TrackedPluginInfo, causes: Vec<String>) {
        let key = info.plugin_key.clone();
        let updated = info.with_failure(causes);
        if self.loading.contains_key(&key) {
            self.loading.insert(key.clone(), updated.clone());
        }
        self.failed.insert(key, updated);
    }

    fn update_tracked(
        &self,
        plugin_key: &str,
        transform: impl Fn(&TrackedPluginInfo) -> TrackedPluginInfo,
    ) {
        if let Some(mut entry) = self.loading.get_mut(plugin_key) {
            let next = transform(entry.value());
            *entry = next;
        }
        if let Some(mut entry) = self.failed.get_mut(plugin_key) {
            let next = transform(entry.value());
            *entry = next;
        }
    }
}

impl LifecycleListener for FailureTracker {
    fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::PluginEnabled { plugin_key } => self.on_plugin_enabled(plugin_key),
            LifecycleEvent::PluginDisabled { plugin_key } => self.on_plugin_disabled(plugin_key),
            LifecycleEvent::ContainerFailed { plugin_key, error } => {
                self.on_container_failed(plugin_key, error.as_ref())
            }
            LifecycleEvent::ServiceDependencyWaitStarting {
                plugin_key,
                service_name,
                filter,
            } => self.dependency_wait_starting(plugin_key, service_name, filter),
            LifecycleEvent::ServiceDependencyWaitEnded {
                plugin_key,
                service_name,
            } => self.dependency_wait_ended(plugin_key, service_name),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Failure {
        message: &'static str,
        source: Option<Box<Failure>>,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl Error for Failure {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.source.as_deref().map(|s| s as &(dyn Error + 'static))
        }
    }

    fn nested_failure() -> Failure {
        Failure {
            message: "Unable to start bundle",
            source: Some(Box::new(Failure {
                message: "Missing service com.acme.SearchService",
                source: Some(Box::new(Failure {
                    message: "Timed out",
                    source: None,
                })),
            })),
        }
    }

    #[test]
    fn test_disabled_before_enabled_is_inferred_failure() {
        let tracker = FailureTracker::new();
        tracker.track_loading("p1", "Plugin One", Some(PluginArtifact::named("p1.jar")));
        tracker.on_plugin_disabled("p1");

        let failed = tracker.failed_plugins();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].plugin_key, "p1");
        assert_eq!(
            failed[0].failure_causes.as_deref(),
            Some(&[INFERRED_TIMEOUT_CAUSE.to_string()][..])
        );
        assert!(tracker.unaccounted_for_plugins().is_empty());
    }

    #[test]
    fn test_enabled_clears_failure() {
        let tracker = FailureTracker::new();
        tracker.track_loading("p1", "Plugin One", None);
        tracker.on_container_failed("p1", &nested_failure());
        assert!(tracker.is_failed("p1"));

        tracker.on_plugin_enabled("p1");
        assert!(!tracker.is_failed("p1"));
        assert!(tracker.failed_plugins().is_empty());
        assert!(tracker.unaccounted_for_plugins().is_empty());
        assert!(tracker.tracked("p1").is_none());
    }

    #[test]
    fn test_disabled_after_enabled_is_not_a_failure() {
        let tracker = FailureTracker::new();
        tracker.track_loading("p1", "Plugin One", None);
        tracker.on_plugin_enabled("p1");
        tracker.on_plugin_disabled("p1");
        assert!(tracker.failed_plugins().is_empty());
    }

    #[test]
    fn test_cause_chain_is_indented_and_appended() {
        let tracker = FailureTracker::new();
        tracker.track_loading("p1", "Plugin One", None);
        tracker.on_container_failed("p1", &nested_failure());
        let handled = tracker.intercept_enable_failure(
            "p1",
            &Failure {
                message: "Enable failed",
                source: None,
            },
        );
        assert!(!handled);

        let info = tracker.tracked("p1").unwrap();
        assert_eq!(
            info.failure_causes.unwrap(),
            vec![
                "Unable to start bundle".to_string(),
                "  Missing service com.acme.SearchService".to_string(),
                "    Timed out".to_string(),
                "Enable failed".to_string(),
            ]
        );
    }

    #[test]
    fn test_dependency_wait_lifecycle() {
        let tracker = FailureTracker::new();
        tracker.track_loading("pluginA", "Plugin A", None);

        tracker.dependency_wait_starting("pluginA", "svcX", "filter1");
        let info = tracker.tracked("pluginA").unwrap();
        assert_eq!(
            info.dependencies,
            vec![ServiceDependency {
                service_name: "svcX".into(),
                service_class: "filter1".into(),
            }]
        );

        tracker.dependency_wait_ended("pluginA", "svcX");
        assert!(tracker.tracked("pluginA").unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_dependency_class_from_filter() {
        let dependency = ServiceDependency::from_filter(
            "search",
            "(&(objectClass=com.acme.SearchService)(name=primary))",
        );
        assert_eq!(dependency.service_class, "com.acme.SearchService");
    }

    #[test]
    fn test_unaccounted_for_plugins() {
        let tracker = FailureTracker::new();
        tracker.track_loading("a", "A", None);
        tracker.track_loading("b", "B", None);
        tracker.track_loading("c", "C", None);
        tracker.on_plugin_enabled("a");
        tracker.on_plugin_disabled("b");

        let pending: Vec<String> = tracker
            .unaccounted_for_plugins()
            .into_iter()
            .map(|i| i.plugin_key)
            .collect();
        assert_eq!(pending, vec!["c"]);
    }

    #[test]
    fn test_events_drive_tracker() {
        let tracker = FailureTracker::new();
        tracker.track_loading("p1", "Plugin One", None);

        tracker.on_event(&LifecycleEvent::ServiceDependencyWaitStarting {
            plugin_key: "p1".into(),
            service_name: "svc".into(),
            filter: "(objectClass=com.acme.Svc)".into(),
        });
        tracker.on_event(&LifecycleEvent::ContainerFailed {
            plugin_key: "p1".into(),
            error: Arc::new(nested_failure()),
        });

        let info = tracker.tracked("p1").unwrap();
        assert!(info.has_failed());
        assert_eq!(info.dependencies.len(), 1);

        tracker.on_event(&LifecycleEvent::PluginEnabled {
            plugin_key: "p1".into(),
        });
        assert!(!tracker.is_failed("p1"));
    }

    #[test]
    fn test_concurrent_failures_converge() {
        let tracker = Arc::new(FailureTracker::new());
        let keys: Vec<String> = (0..8).map(|i| format!("plugin-{i}")).collect();
        for key in &keys {
            tracker.track_loading(key, key, None);
        }

        let handles: Vec<_> = keys
            .iter()
            .cloned()
            .map(|key| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    tracker.dependency_wait_starting(&key, "svc", "filter");
                    tracker.on_plugin_disabled(&key);
                    tracker.dependency_wait_ended(&key, "svc");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let failed = tracker.failed_plugins();
        assert_eq!(failed.len(), keys.len());
        assert!(failed.iter().all(|i| i.dependencies.is_empty()));
    }
}
