//! Lifecycle events and in-process delivery.

use std::error::Error;
use std::sync::{Arc, RwLock, Weak};

/// Events consumed by the lifecycle layer.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    PluginInstalled { plugin_key: String },
    PluginEnabled { plugin_key: String },
    PluginDisabled { plugin_key: String },
    PluginUninstalled { plugin_key: String },
    PluginUpgraded { plugin_key: String },
    ModuleEnabled { complete_key: String },
    ModuleDisabled { complete_key: String },
    ContainerFailed {
        plugin_key: String,
        error: Arc<dyn Error + Send + Sync>,
    },
    ServiceDependencyWaitStarting {
        plugin_key: String,
        service_name: String,
        filter: String,
    },
    ServiceDependencyWaitEnded {
        plugin_key: String,
        service_name: String,
    },
    ClusterCacheClear,
    ClusterShuttingDown,
}

impl LifecycleEvent {
    /// Plugin key the event is about, if any.
    pub fn plugin_key(&self) -> Option<&str> {
        match self {
            LifecycleEvent::PluginInstalled { plugin_key }
            | LifecycleEvent::PluginEnabled { plugin_key }
            | LifecycleEvent::PluginDisabled { plugin_key }
            | LifecycleEvent::PluginUninstalled { plugin_key }
            | LifecycleEvent::PluginUpgraded { plugin_key }
            | LifecycleEvent::ContainerFailed { plugin_key, .. }
            | LifecycleEvent::ServiceDependencyWaitStarting { plugin_key, .. }
            | LifecycleEvent::ServiceDependencyWaitEnded { plugin_key, .. } => Some(plugin_key),
            LifecycleEvent::ModuleEnabled { complete_key }
            | LifecycleEvent::ModuleDisabled { complete_key } => complete_key
                .split_once(crate::plugin::COMPLETE_KEY_SEPARATOR)
                .map(|(plugin, _)| plugin),
            LifecycleEvent::ClusterCacheClear | LifecycleEvent::ClusterShuttingDown => None,
        }
    }
}

/// Receives lifecycle events.
pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

/// Listener that only logs events.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl LifecycleListener for LoggingListener {
    fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::ContainerFailed { plugin_key, error } => {
                tracing::warn!("[lifecycle] container failed for {}: {}", plugin_key, error)
            }
            LifecycleEvent::ServiceDependencyWaitStarting { .. }
            | LifecycleEvent::ServiceDependencyWaitEnded { .. } => {
                tracing::trace!("[lifecycle] {:?}", event)
            }
            _ => tracing::debug!("[lifecycle] {:?}", event),
        }
    }
}

/// Synchronous in-process event bus.
///
/// Listeners are held weakly: a listener is registered only after it is
/// fully built, and the bus never keeps it alive. Dispatch runs on the
/// publishing thread over a snapshot, so listeners may publish re-entrantly.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Weak<dyn LifecycleListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn subscribe<L: LifecycleListener + 'static>(&self, listener: &Arc<L>) {
        let listener: Arc<dyn LifecycleListener> = listener.clone();
        let weak = Arc::downgrade(&listener);
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(weak),
            Err(_) => tracing::error!("Event bus lock poisoned; listener not registered"),
        }
    }

    /// Deliver an event to every live listener.
    pub fn publish(&self, event: &LifecycleEvent) {
        let snapshot: Vec<Arc<dyn LifecycleListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().filter_map(Weak::upgrade).collect(),
            Err(_) => {
                tracing::error!("Event bus lock poisoned; dropping {:?}", event);
                return;
            }
        };

        for listener in snapshot {
            listener.on_event(event);
        }
    }

    /// Number of live listeners; dead registrations are pruned.
    pub fn listener_count(&self) -> usize {
        match self.listeners.write() {
            Ok(mut listeners) => {
                listeners.retain(|l| l.strong_count() > 0);
                listeners.len()
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl LifecycleListener for Recorder {
        fn on_event(&self, event: &LifecycleEvent) {
            self.seen
                .lock()
                .unwrap()
                .push(event.plugin_key().unwrap_or("-").to_string());
        }
    }

    struct Republisher {
        bus: Arc<EventBus>,
    }

    impl LifecycleListener for Republisher {
        fn on_event(&self, event: &LifecycleEvent) {
            if let LifecycleEvent::PluginInstalled { plugin_key } = event {
                self.bus.publish(&LifecycleEvent::PluginEnabled {
                    plugin_key: plugin_key.clone(),
                });
            }
        }
    }

    #[test]
    fn test_publish_reaches_listeners() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(&recorder);

        bus.publish(&LifecycleEvent::PluginEnabled {
            plugin_key: "p1".into(),
        });
        bus.publish(&LifecycleEvent::ModuleDisabled {
            complete_key: "p2:panel".into(),
        });
        bus.publish(&LifecycleEvent::ClusterCacheClear);

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["p1", "p2", "-"]);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(&recorder);
        bus.subscribe(&Arc::new(LoggingListener));

        assert_eq!(bus.listener_count(), 1);
        drop(recorder);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_reentrant_publish() {
        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder::default());
        let republisher = Arc::new(Republisher { bus: bus.clone() });
        bus.subscribe(&republisher);
        bus.subscribe(&recorder);

        bus.publish(&LifecycleEvent::PluginInstalled {
            plugin_key: "p1".into(),
        });

        // the nested PluginEnabled is delivered before the outer event reaches the recorder
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["p1", "p1"]);
    }
}
