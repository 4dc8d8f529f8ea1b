//! Plugin lifecycle coordinator.
//!
//! Drives plugins through install, enable, disable, upgrade and uninstall.
//! Every operation has a local-only variant, which changes this node, and a
//! cluster-wide variant, which does the same and then tells the peers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::artifact::{ArtifactSource, PluginArtifact};
use crate::cluster::{
    BroadcastMessenger, ClusterEnvelope, ClusterMessage, ClusterMessenger, ClusterNode,
};
use crate::components::{ComponentContainer, ComponentDescriptor, ComponentRegistry};
use crate::config::PluginConfig;
use crate::error::{EnableFailure, LifecycleError, Result};
use crate::events::{EventBus, LifecycleEvent, LifecycleListener};
use crate::factory::{DescriptorFactory, PluginFactory};
use crate::failure_tracker::FailureTracker;
use crate::handle_cache::HandleInvalidator;
use crate::load_gate::PluginLoadGate;
use crate::loader::NativeLibraryFactory;
use crate::plugin::{
    split_complete_key, ModuleContext, ModuleDescriptor, Plugin, PluginModule, PluginState,
};
use crate::resolver::{ResolveScope, ResolverChain};
use crate::state_store::ClusterStateStore;
use crate::version_store::{InMemoryVersionStore, PluginVersionStore};

#[derive(Clone)]
struct ManagedPlugin {
    plugin: Plugin,
    state: PluginState,
}

/// Assembles a [`PluginLifecycleCoordinator`].
pub struct CoordinatorBuilder {
    node: Arc<dyn ClusterNode>,
    state: Arc<ClusterStateStore>,
    factories: Vec<Arc<dyn PluginFactory>>,
    allow_patterns: Option<Vec<String>>,
    tracker: Arc<FailureTracker>,
    versions: Arc<dyn PluginVersionStore>,
    components: Arc<dyn ComponentContainer>,
    handles: Option<Arc<dyn HandleInvalidator>>,
    messenger: Arc<dyn ClusterMessenger>,
    events: Arc<EventBus>,
    source: Option<ArtifactSource>,
}

impl CoordinatorBuilder {
    /// Take the allow-list and scan directories from configuration.
    pub fn configure(mut self, config: &PluginConfig) -> Self {
        if config.restricted_startup {
            self.allow_patterns = Some(config.startup_allow_patterns.clone());
        }
        self.source = Some(ArtifactSource::new(config));
        self
    }

    /// Replace the factories, asked in order.
    pub fn with_factories(mut self, factories: Vec<Arc<dyn PluginFactory>>) -> Self {
        self.factories = factories;
        self
    }

    /// Only admit artifacts matching one of `patterns`.
    pub fn with_allow_patterns(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.allow_patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_failure_tracker(mut self, tracker: Arc<FailureTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_version_store(mut self, versions: Arc<dyn PluginVersionStore>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_component_container(mut self, components: Arc<dyn ComponentContainer>) -> Self {
        self.components = components;
        self
    }

    pub fn with_handle_invalidator(mut self, handles: Arc<dyn HandleInvalidator>) -> Self {
        self.handles = Some(handles);
        self
    }

    pub fn with_messenger(mut self, messenger: Arc<dyn ClusterMessenger>) -> Self {
        self.messenger = messenger;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_artifact_source(mut self, source: ArtifactSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Build the coordinator and register it, the tracker and the state
    /// store with the event bus.
    pub fn build(self) -> Result<Arc<PluginLifecycleCoordinator>> {
        let gate = match &self.allow_patterns {
            Some(patterns) => PluginLoadGate::restricted(
                patterns.as_slice(),
                self.factories,
                self.tracker.clone(),
            )?,
            None => PluginLoadGate::unrestricted(self.factories, self.tracker.clone()),
        };

        let coordinator = Arc::new(PluginLifecycleCoordinator {
            node: self.node,
            gate,
            tracker: self.tracker,
            state: self.state,
            versions: self.versions,
            resolvers: ResolverChain::standard(self.components.clone()),
            components: self.components,
            handles: self.handles,
            messenger: self.messenger,
            events: self.events,
            source: self.source,
            plugins: DashMap::new(),
            versions_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });

        // Listeners only become visible once fully built
        coordinator.events.subscribe(&coordinator.tracker);
        coordinator.events.subscribe(&coordinator.state);
        coordinator.events.subscribe(&coordinator);
        Ok(coordinator)
    }
}

/// Top-level plugin lifecycle orchestrator for one node.
pub struct PluginLifecycleCoordinator {
    node: Arc<dyn ClusterNode>,
    gate: PluginLoadGate,
    tracker: Arc<FailureTracker>,
    state: Arc<ClusterStateStore>,
    versions: Arc<dyn PluginVersionStore>,
    components: Arc<dyn ComponentContainer>,
    resolvers: ResolverChain,
    handles: Option<Arc<dyn HandleInvalidator>>,
    messenger: Arc<dyn ClusterMessenger>,
    events: Arc<EventBus>,
    source: Option<ArtifactSource>,
    plugins: DashMap<String, ManagedPlugin>,
    // Serializes read-then-write passes over the version records
    versions_lock: Mutex<()>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

impl PluginLifecycleCoordinator {
    /// Start building a coordinator for `node` backed by `state`.
    pub fn builder(node: Arc<dyn ClusterNode>, state: Arc<ClusterStateStore>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            node,
            state,
            factories: vec![
                Arc::new(DescriptorFactory::new()),
                Arc::new(NativeLibraryFactory::new()),
            ],
            allow_patterns: None,
            tracker: Arc::new(FailureTracker::new()),
            versions: Arc::new(InMemoryVersionStore::new()),
            components: Arc::new(ComponentRegistry::new()),
            handles: None,
            messenger: Arc::new(BroadcastMessenger::default()),
            events: Arc::new(EventBus::new()),
            source: None,
        }
    }

    // === Startup ===

    /// Install every admitted artifact from the artifact source, then enable
    /// the plugins whose persisted state (enabled by default) says so.
    pub fn start(&self) -> Result<()> {
        tracing::info!(
            "Starting plugin lifecycle on node {}",
            self.node.node_id()
        );

        if let Some(source) = &self.source {
            for artifact in source.scan()? {
                match self.install_local_only(&artifact) {
                    Ok(_) => {}
                    Err(LifecycleError::AdmissionRejected { reason, .. }) => {
                        tracing::debug!("Skipping artifact {}: {}", artifact.name, reason)
                    }
                    Err(e) => tracing::warn!("Failed to install {}: {}", artifact.name, e),
                }
            }
        }

        let mut installed: Vec<String> = self
            .plugins
            .iter()
            .filter(|p| p.state == PluginState::Installed)
            .map(|p| p.key().clone())
            .collect();
        installed.sort();

        for key in self.load_order(&installed) {
            if self.plugin_state(&key) != Some(PluginState::Installed) {
                continue;
            }
            if self.state.get(&key).unwrap_or(true) {
                if let Err(e) = self.enable_local_only(&key) {
                    tracing::error!("Failed to enable plugin {}: {}", key, e);
                }
            } else {
                tracing::debug!("Plugin {} is disabled; not enabling", key);
                self.tracker.untrack(&key);
                self.set_state(&key, PluginState::Disabled);
            }
        }

        self.started.store(true, Ordering::SeqCst);

        let unaccounted = self.tracker.unaccounted_for_plugins();
        if !unaccounted.is_empty() {
            let keys: Vec<&str> = unaccounted.iter().map(|p| p.plugin_key.as_str()).collect();
            tracing::warn!(
                "{} plugins were loaded but never enabled or failed: {}",
                keys.len(),
                keys.join(", ")
            );
        }
        let failed = self.tracker.failed_plugins();
        if !failed.is_empty() {
            tracing::warn!("{} plugins failed to enable", failed.len());
        }

        tracing::info!(
            "Plugin lifecycle started: {} plugins, {} enabled",
            self.plugins.len(),
            self.enabled_plugins().len()
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // === Install / Uninstall ===

    /// Install an artifact on every node.
    pub fn install(&self, artifact: &PluginArtifact) -> Result<String> {
        let key = self.install_local_only(artifact)?;
        self.broadcast(ClusterMessage::PluginInstalled(key.clone()))?;
        Ok(key)
    }

    /// Install an artifact on this node. Returns the plugin key.
    pub fn install_local_only(&self, artifact: &PluginArtifact) -> Result<String> {
        self.gate.admit(artifact)?;
        let plugin = self.gate.construct(artifact)?;
        let key = plugin.key.clone();

        match self.plugins.entry(key.clone()) {
            Entry::Occupied(existing) => {
                // construct() restarted tracking; only a plugin that never
                // enabled should stay tracked
                if existing.get().state != PluginState::Installed {
                    drop(existing);
                    self.tracker.untrack(&key);
                }
                return Err(LifecycleError::AlreadyInstalled(key));
            }
            Entry::Vacant(slot) => {
                slot.insert(ManagedPlugin {
                    plugin: plugin.clone(),
                    state: PluginState::Installed,
                });
            }
        }

        if let Err(e) = self.record_version(&plugin) {
            self.plugins.remove(&key);
            self.tracker.untrack(&key);
            return Err(e);
        }

        tracing::info!("Installed plugin {} from {}", key, artifact.name);
        self.publish(LifecycleEvent::PluginInstalled {
            plugin_key: key.clone(),
        });
        Ok(key)
    }

    /// Uninstall a plugin on every node.
    pub fn uninstall(&self, plugin_key: &str) -> Result<()> {
        self.uninstall_local_only(plugin_key)?;
        self.broadcast(ClusterMessage::PluginUninstalled(plugin_key.to_string()))
    }

    /// Remove a plugin from this node together with its state, version
    /// record and admission decision.
    pub fn uninstall_local_only(&self, plugin_key: &str) -> Result<()> {
        let managed = self.managed(plugin_key)?;
        if managed.state == PluginState::Enabled {
            self.deactivate(plugin_key, false)?;
        } else {
            self.components.unregister_provider(plugin_key);
        }

        self.plugins.remove(plugin_key);
        self.state.remove_plugin_state(plugin_key)?;
        {
            let _versions = self.lock_versions()?;
            if let Some(record) = self.versions.get_by_key(plugin_key)? {
                self.versions.delete(record.id)?;
            }
        }
        self.gate.forget(&managed.plugin.artifact_name);
        self.tracker.untrack(plugin_key);

        tracing::info!("Uninstalled plugin {}", plugin_key);
        self.publish(LifecycleEvent::PluginUninstalled {
            plugin_key: plugin_key.to_string(),
        });
        Ok(())
    }

    // === Upgrade ===

    /// Replace an installed plugin with a new version on every node.
    pub fn upgrade(&self, artifact: &PluginArtifact) -> Result<String> {
        let key = self.upgrade_local_only(artifact)?;
        self.broadcast(ClusterMessage::PluginUpgraded(key.clone()))?;
        Ok(key)
    }

    /// Replace an installed plugin with a new version on this node.
    ///
    /// Enabled dependents are taken down without persisting, the plugin is
    /// swapped, its previous state restored and the dependents re-enabled.
    pub fn upgrade_local_only(&self, artifact: &PluginArtifact) -> Result<String> {
        self.gate.admit(artifact)?;
        let plugin = self.gate.construct(artifact)?;
        let key = plugin.key.clone();
        // Tracking restarts once the old version is down
        self.tracker.untrack(&key);

        let previous = self.managed(&key)?;
        let dependents: Vec<String> = self
            .find_dependents(&key)
            .into_iter()
            .filter(|d| self.is_plugin_enabled(d))
            .collect();

        for dependent in dependents.iter().rev() {
            self.deactivate(dependent, false)?;
        }
        if previous.state == PluginState::Enabled {
            self.deactivate(&key, false)?;
        }

        if previous.plugin.artifact_name != plugin.artifact_name {
            self.gate.forget(&previous.plugin.artifact_name);
        }

        self.record_version(&plugin)?;
        let version = plugin.version.clone();
        self.tracker
            .track_loading(&key, &plugin.name, Some(artifact.clone()));
        self.plugins.insert(
            key.clone(),
            ManagedPlugin {
                plugin,
                state: PluginState::Installed,
            },
        );

        tracing::info!(
            "Upgraded plugin {} from {} to {}",
            key,
            previous.plugin.version,
            version
        );
        self.publish(LifecycleEvent::PluginUpgraded {
            plugin_key: key.clone(),
        });

        match previous.state {
            PluginState::Enabled => {
                self.enable_local_only(&key)?;
            }
            PluginState::Disabled => {
                self.tracker.untrack(&key);
                self.set_state(&key, PluginState::Disabled);
            }
            PluginState::Installed => {}
        }
        for dependent in &dependents {
            self.enable_local_only(dependent)?;
        }

        Ok(key)
    }

    // === Enable / Disable ===

    /// Enable a plugin on every node. Peers are only told if it enabled here.
    pub fn enable(&self, plugin_key: &str) -> Result<bool> {
        let enabled = self.enable_local_only(plugin_key)?;
        if enabled {
            self.broadcast(ClusterMessage::PluginEnabled(plugin_key.to_string()))?;
        }
        Ok(enabled)
    }

    /// Enable a plugin on this node.
    ///
    /// Returns `false` if the plugin could not be enabled; the reason is
    /// recorded by the failure tracker rather than returned.
    pub fn enable_local_only(&self, plugin_key: &str) -> Result<bool> {
        let managed = self.managed(plugin_key)?;
        if managed.state == PluginState::Enabled {
            return Ok(true);
        }

        if let Err(failure) = self.activate(&managed.plugin) {
            tracing::error!("Plugin {} could not be enabled: {}", plugin_key, failure);
            self.tracker.intercept_enable_failure(plugin_key, &failure);
            return Ok(false);
        }

        if let Err(e) = self.state.set(plugin_key, true) {
            self.components.unregister_provider(plugin_key);
            return Err(e);
        }
        self.set_state(plugin_key, PluginState::Enabled);

        tracing::info!(
            "Enabled plugin {} v{}",
            plugin_key,
            managed.plugin.version
        );
        self.publish(LifecycleEvent::PluginEnabled {
            plugin_key: plugin_key.to_string(),
        });
        Ok(true)
    }

    /// Disable a plugin on every node.
    pub fn disable(&self, plugin_key: &str) -> Result<()> {
        self.disable_local_only(plugin_key)?;
        self.broadcast(ClusterMessage::PluginDisabled(plugin_key.to_string()))
    }

    /// Disable a plugin on this node and persist the disabled state.
    pub fn disable_local_only(&self, plugin_key: &str) -> Result<()> {
        self.deactivate(plugin_key, true)
    }

    /// Disable a plugin on this node without persisting the change.
    ///
    /// Used when a plugin goes down only as a side effect of another
    /// operation and will come back when it completes.
    pub fn disable_without_persisting(&self, plugin_key: &str) -> Result<()> {
        self.deactivate(plugin_key, false)
    }

    fn activate(&self, plugin: &Plugin) -> std::result::Result<(), EnableFailure> {
        for required in &plugin.dependencies {
            if !self.is_plugin_enabled(required) {
                return Err(EnableFailure::MissingDependency {
                    required: required.clone(),
                });
            }
        }

        let modules: Vec<&ModuleDescriptor> = plugin
            .modules
            .iter()
            .filter(|m| self.module_flag(plugin, m))
            .collect();

        for module in &modules {
            let Some(implementation) = &module.implementation else {
                continue;
            };
            if let Some(initializable) = implementation.as_initializable() {
                let context = ModuleContext {
                    plugin_key: plugin.key.clone(),
                    complete_key: plugin.complete_key(&module.key),
                };
                tracing::debug!("Initialising module {}", context.complete_key);
                initializable
                    .init(&context)
                    .map_err(|source| EnableFailure::Initialization {
                        complete_key: context.complete_key.clone(),
                        source,
                    })?;
            }
        }

        for module in modules {
            if let Err(source) = self.register_component(plugin, module) {
                self.components.unregister_provider(&plugin.key);
                return Err(EnableFailure::Registration {
                    complete_key: plugin.complete_key(&module.key),
                    source,
                });
            }
        }
        Ok(())
    }

    fn register_component(
        &self,
        plugin: &Plugin,
        module: &ModuleDescriptor,
    ) -> Result<()> {
        if !module.is_component() {
            return Ok(());
        }
        let Some(implementation) = &module.implementation else {
            return Ok(());
        };

        self.components.register(
            ComponentDescriptor {
                complete_key: plugin.complete_key(&module.key),
                provider: plugin.key.clone(),
            },
            implementation.clone(),
        )
    }

    fn deactivate(&self, plugin_key: &str, persist: bool) -> Result<()> {
        if !self.is_started() {
            tracing::warn!(
                "Plugin {} is being disabled before the lifecycle coordinator has started; \
                 this is probably a sequencing bug",
                plugin_key
            );
        }

        let managed = self.managed(plugin_key)?;

        // Components go first: a persisted disabled state must never be
        // observable while the plugin still serves components
        let removed = self.components.unregister_provider(plugin_key);
        if persist {
            self.state.set(plugin_key, false)?;
        }

        if managed.state == PluginState::Installed {
            // deliberately disabled before it ever enabled; nothing to wait for
            self.tracker.untrack(plugin_key);
        }
        self.set_state(plugin_key, PluginState::Disabled);

        if managed.state != PluginState::Disabled {
            tracing::info!(
                "Disabled plugin {} ({} components unregistered)",
                plugin_key,
                removed
            );
            self.publish(LifecycleEvent::PluginDisabled {
                plugin_key: plugin_key.to_string(),
            });
        }
        Ok(())
    }

    // === Modules ===

    /// Enable a module on every node.
    pub fn enable_module(&self, complete_key: &str) -> Result<()> {
        self.enable_module_local_only(complete_key)?;
        self.broadcast(ClusterMessage::ModuleEnabled(complete_key.to_string()))
    }

    /// Enable a single module on this node.
    ///
    /// Only this module's component registration is touched.
    pub fn enable_module_local_only(&self, complete_key: &str) -> Result<()> {
        let (plugin_key, module_key) = split_complete_key(complete_key)?;
        let managed = self.managed(plugin_key)?;
        let module = managed
            .plugin
            .module(module_key)
            .ok_or_else(|| LifecycleError::ModuleNotFound(complete_key.to_string()))?;

        // The plugin stays enabled; a module that cannot register is reported
        // to the caller and its flag left untouched.
        if managed.state == PluginState::Enabled && self.components.lookup(complete_key).is_none()
        {
            if let Err(e) = self.register_component(&managed.plugin, module) {
                tracing::error!("Module {} could not be enabled: {}", complete_key, e);
                return Err(e);
            }
        }

        self.state.set(complete_key, true)?;

        tracing::info!("Enabled module {}", complete_key);
        self.publish(LifecycleEvent::ModuleEnabled {
            complete_key: complete_key.to_string(),
        });
        Ok(())
    }

    /// Disable a module on every node.
    pub fn disable_module(&self, complete_key: &str) -> Result<()> {
        self.disable_module_local_only(complete_key)?;
        self.broadcast(ClusterMessage::ModuleDisabled(complete_key.to_string()))
    }

    /// Disable a single module on this node.
    pub fn disable_module_local_only(&self, complete_key: &str) -> Result<()> {
        let (plugin_key, module_key) = split_complete_key(complete_key)?;
        let managed = self.managed(plugin_key)?;
        if managed.plugin.module(module_key).is_none() {
            return Err(LifecycleError::ModuleNotFound(complete_key.to_string()));
        }

        self.components.unregister(complete_key);
        self.state.set(complete_key, false)?;

        tracing::info!("Disabled module {}", complete_key);
        self.publish(LifecycleEvent::ModuleDisabled {
            complete_key: complete_key.to_string(),
        });
        Ok(())
    }

    // === Cluster ===

    /// Apply a lifecycle change made on a peer node.
    ///
    /// Messages this node sent itself are ignored.
    pub fn on_cluster_message(&self, envelope: &ClusterEnvelope) -> Result<()> {
        if envelope.origin == self.node.node_id() {
            tracing::trace!("Ignoring own cluster message {:?}", envelope.message);
            return Ok(());
        }

        tracing::debug!(
            "Applying {:?} from node {}",
            envelope.message,
            envelope.origin
        );
        match &envelope.message {
            ClusterMessage::PluginEnabled(key) => self.enable_local_only(key).map(|_| ()),
            ClusterMessage::PluginDisabled(key) => self.disable_local_only(key),
            ClusterMessage::PluginInstalled(key) => self.rescan(key, false),
            ClusterMessage::PluginUpgraded(key) => self.rescan(key, true),
            ClusterMessage::PluginUninstalled(key) => {
                if self.plugins.contains_key(key) {
                    self.uninstall_local_only(key)
                } else {
                    Ok(())
                }
            }
            ClusterMessage::ModuleEnabled(key) => self.enable_module_local_only(key),
            ClusterMessage::ModuleDisabled(key) => self.disable_module_local_only(key),
        }
    }

    fn rescan(&self, plugin_key: &str, upgrade: bool) -> Result<()> {
        let Some(source) = &self.source else {
            tracing::debug!("No artifact source; ignoring peer change to {}", plugin_key);
            return Ok(());
        };

        let known: HashSet<String> = self
            .plugins
            .iter()
            .map(|p| p.plugin.artifact_name.clone())
            .collect();
        // listing only; bundled plugins were unpacked once at start
        let on_disk = source.list()?;
        let mut fresh: Vec<PluginArtifact> = on_disk
            .iter()
            .filter(|a| !known.contains(&a.name))
            .cloned()
            .collect();

        // an upgrade may have replaced the artifact file in place
        if upgrade && fresh.is_empty() {
            let current = self
                .plugins
                .get(plugin_key)
                .map(|p| p.plugin.artifact_name.clone());
            if let Some(name) = current {
                fresh.extend(on_disk.into_iter().find(|a| a.name == name));
            }
        }

        for artifact in fresh {
            let result = if upgrade {
                self.upgrade_local_only(&artifact)
            } else {
                self.install_local_only(&artifact)
            };
            if let Err(e) = result {
                tracing::warn!(
                    "Could not apply peer change to {} from {}: {}",
                    plugin_key,
                    artifact.name,
                    e
                );
            }
        }
        Ok(())
    }

    fn broadcast(&self, message: ClusterMessage) -> Result<()> {
        tracing::debug!("Broadcasting {:?}", message);
        self.messenger.broadcast(ClusterEnvelope {
            origin: self.node.node_id().to_string(),
            message,
        })
    }

    // === Version records ===

    /// Bring version records in line with the installed plugins.
    ///
    /// Creates records for enabled plugins that lack one, updates changed
    /// versions and deletes records of plugins that are gone. Skipped while
    /// the node is shutting down.
    pub fn reconcile_plugin_versions(&self) -> Result<()> {
        if self.is_shutting_down() {
            tracing::debug!("Shutting down; skipping plugin version reconciliation");
            return Ok(());
        }

        let _versions = self.lock_versions()?;
        let installed: Vec<ManagedPlugin> = self.plugins.iter().map(|p| p.clone()).collect();
        let mut recorded = HashSet::new();

        for mut record in self.versions.get_all()? {
            match installed.iter().find(|m| m.plugin.key == record.key) {
                None => {
                    tracing::debug!("Removing version record of {}", record.key);
                    self.versions.delete(record.id)?;
                }
                Some(managed) => {
                    if record.version != managed.plugin.version
                        || record.name != managed.plugin.name
                    {
                        record.name = managed.plugin.name.clone();
                        record.version = managed.plugin.version.clone();
                        self.versions.update(&record)?;
                    }
                    recorded.insert(record.key);
                }
            }
        }

        for managed in installed {
            if managed.state == PluginState::Enabled && !recorded.contains(&managed.plugin.key) {
                self.versions.create(
                    &managed.plugin.key,
                    &managed.plugin.name,
                    &managed.plugin.version,
                )?;
            }
        }
        Ok(())
    }

    /// Create the version record of a plugin, or bring it up to date.
    fn record_version(&self, plugin: &Plugin) -> Result<()> {
        let _versions = self.lock_versions()?;
        match self.versions.get_by_key(&plugin.key)? {
            None => {
                self.versions
                    .create(&plugin.key, &plugin.name, &plugin.version)?;
            }
            Some(mut record) => {
                if record.version != plugin.version || record.name != plugin.name {
                    tracing::debug!(
                        "Updating version record of {}: {} -> {}",
                        plugin.key,
                        record.version,
                        plugin.version
                    );
                    record.name = plugin.name.clone();
                    record.version = plugin.version.clone();
                    self.versions.update(&record)?;
                }
            }
        }
        Ok(())
    }

    fn lock_versions(&self) -> Result<MutexGuard<'_, ()>> {
        self.versions_lock
            .lock()
            .map_err(|_| LifecycleError::LockPoisoned("version records"))
    }

    // === Queries ===

    pub fn plugin_state(&self, plugin_key: &str) -> Option<PluginState> {
        self.plugins.get(plugin_key).map(|p| p.state)
    }

    pub fn is_plugin_enabled(&self, plugin_key: &str) -> bool {
        self.plugin_state(plugin_key) == Some(PluginState::Enabled)
    }

    /// A module is enabled when its plugin is and its own flag (persisted or
    /// default) is set.
    pub fn is_module_enabled(&self, complete_key: &str) -> bool {
        let Ok((plugin_key, module_key)) = split_complete_key(complete_key) else {
            return false;
        };
        let Some(managed) = self.plugins.get(plugin_key).map(|p| p.clone()) else {
            return false;
        };
        managed.state == PluginState::Enabled
            && managed
                .plugin
                .module(module_key)
                .is_some_and(|m| self.module_flag(&managed.plugin, m))
    }

    pub fn plugin(&self, plugin_key: &str) -> Option<Plugin> {
        self.plugins.get(plugin_key).map(|p| p.plugin.clone())
    }

    /// All installed plugins, sorted by key.
    pub fn plugins(&self) -> Vec<Plugin> {
        let mut plugins: Vec<Plugin> = self.plugins.iter().map(|p| p.plugin.clone()).collect();
        plugins.sort_by(|a, b| a.key.cmp(&b.key));
        plugins
    }

    /// Enabled plugins, sorted by key.
    pub fn enabled_plugins(&self) -> Vec<Plugin> {
        let mut plugins: Vec<Plugin> = self
            .plugins
            .iter()
            .filter(|p| p.state == PluginState::Enabled)
            .map(|p| p.plugin.clone())
            .collect();
        plugins.sort_by(|a, b| a.key.cmp(&b.key));
        plugins
    }

    /// Find a component by complete key or module key.
    pub fn resolve_component(&self, name: &str) -> Option<Arc<dyn PluginModule>> {
        let plugins = self.plugins();
        let is_enabled = |key: &str| self.is_plugin_enabled(key);
        self.resolvers.resolve(
            name,
            &ResolveScope {
                plugins: &plugins,
                is_enabled: &is_enabled,
            },
        )
    }

    pub fn failure_tracker(&self) -> &Arc<FailureTracker> {
        &self.tracker
    }

    pub fn state_store(&self) -> &Arc<ClusterStateStore> {
        &self.state
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn component_container(&self) -> &Arc<dyn ComponentContainer> {
        &self.components
    }

    // === Internals ===

    fn managed(&self, plugin_key: &str) -> Result<ManagedPlugin> {
        self.plugins
            .get(plugin_key)
            .map(|p| p.clone())
            .ok_or_else(|| LifecycleError::PluginNotFound(plugin_key.to_string()))
    }

    fn set_state(&self, plugin_key: &str, state: PluginState) {
        if let Some(mut managed) = self.plugins.get_mut(plugin_key) {
            managed.state = state;
        }
    }

    fn module_flag(&self, plugin: &Plugin, module: &ModuleDescriptor) -> bool {
        self.state
            .get(&plugin.complete_key(&module.key))
            .unwrap_or(module.enabled_by_default)
    }

    fn publish(&self, event: LifecycleEvent) {
        self.events.publish(&event);
    }

    /// Order `keys` so that required plugins come before their dependents.
    fn load_order(&self, keys: &[String]) -> Vec<String> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();
        for key in keys {
            self.visit_deps(key, &mut visited, &mut in_progress, &mut order);
        }
        order
    }

    fn visit_deps(
        &self,
        key: &str,
        visited: &mut HashSet<String>,
        in_progress: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) {
        if visited.contains(key) {
            return;
        }
        if !in_progress.insert(key.to_string()) {
            tracing::warn!("Circular plugin dependency involving {}", key);
            return;
        }

        let dependencies = self
            .plugins
            .get(key)
            .map(|p| p.plugin.dependencies.clone())
            .unwrap_or_default();
        for dep in &dependencies {
            if self.plugins.contains_key(dep) {
                self.visit_deps(dep, visited, in_progress, order);
            }
        }

        in_progress.remove(key);
        visited.insert(key.to_string());
        order.push(key.to_string());
    }

    /// Find all plugins that depend on the given plugin, directly or not.
    fn find_dependents(&self, plugin_key: &str) -> Vec<String> {
        let mut dependents = Vec::new();
        let mut to_check = vec![plugin_key.to_string()];
        let mut checked = HashSet::new();

        while let Some(key) = to_check.pop() {
            if !checked.insert(key.clone()) {
                continue;
            }

            let direct: Vec<String> = self
                .plugins
                .iter()
                .filter(|p| p.plugin.dependencies.contains(&key) && !checked.contains(p.key()))
                .map(|p| p.key().clone())
                .collect();
            for other in direct {
                if !dependents.contains(&other) {
                    dependents.push(other.clone());
                }
                to_check.push(other);
            }
        }

        dependents
    }

    fn invalidate_handles(&self, plugin_key: &str) {
        if let Some(handles) = &self.handles {
            handles.invalidate_plugin(plugin_key);
        }
    }
}

impl LifecycleListener for PluginLifecycleCoordinator {
    fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::PluginEnabled { plugin_key } => {
                self.invalidate_handles(plugin_key);
                if let Err(e) = self.reconcile_plugin_versions() {
                    tracing::error!("Failed to reconcile plugin versions: {}", e);
                }
            }
            LifecycleEvent::PluginDisabled { .. }
            | LifecycleEvent::PluginUninstalled { .. }
            | LifecycleEvent::PluginUpgraded { .. }
            | LifecycleEvent::ModuleEnabled { .. }
            | LifecycleEvent::ModuleDisabled { .. } => {
                if let Some(plugin_key) = event.plugin_key() {
                    self.invalidate_handles(plugin_key);
                }
            }
            LifecycleEvent::ClusterShuttingDown => {
                tracing::info!("Cluster shutting down; releasing service handles");
                self.shutting_down.store(true, Ordering::SeqCst);
                if let Some(handles) = &self.handles {
                    handles.invalidate_all();
                }
            }
            _ => {}
        }
    }
}
