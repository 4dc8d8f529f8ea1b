//! Cluster membership, named locks and lifecycle messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{LifecycleError, Result};

/// Identity and role of the local node.
pub trait ClusterNode: Send + Sync {
    /// Stable node identifier.
    fn node_id(&self) -> &str;

    /// Whether this node performs durable writes of shared state.
    fn is_cluster_active(&self) -> bool;
}

/// Node whose role is set explicitly.
#[derive(Debug)]
pub struct StaticNode {
    id: String,
    active: AtomicBool,
}

impl StaticNode {
    /// A node that is the active node from the start.
    pub fn active(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active: AtomicBool::new(true),
        }
    }

    /// A passive node.
    pub fn passive(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active: AtomicBool::new(false),
        }
    }

    /// Promote or demote this node.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl ClusterNode for StaticNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn is_cluster_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Cluster-wide mutual exclusion by name.
pub trait ClusterLockService: Send + Sync {
    /// Run `action` while holding the named lock.
    fn run_locked(&self, lock_name: &str, action: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Named locks for nodes sharing one process.
#[derive(Debug, Default)]
pub struct LocalLockService {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterLockService for LocalLockService {
    fn run_locked(&self, lock_name: &str, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let lock = self
            .locks
            .entry(lock_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _guard = lock
            .lock()
            .map_err(|_| LifecycleError::LockPoisoned("cluster lock"))?;
        tracing::trace!("Acquired cluster lock {}", lock_name);
        action()
    }
}

/// Lifecycle messages sent to peer nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "key")]
pub enum ClusterMessage {
    PluginEnabled(String),
    PluginDisabled(String),
    PluginInstalled(String),
    PluginUninstalled(String),
    PluginUpgraded(String),
    ModuleEnabled(String),
    ModuleDisabled(String),
}

impl ClusterMessage {
    /// The plugin key or complete key the message refers to.
    pub fn key(&self) -> &str {
        match self {
            ClusterMessage::PluginEnabled(key)
            | ClusterMessage::PluginDisabled(key)
            | ClusterMessage::PluginInstalled(key)
            | ClusterMessage::PluginUninstalled(key)
            | ClusterMessage::PluginUpgraded(key)
            | ClusterMessage::ModuleEnabled(key)
            | ClusterMessage::ModuleDisabled(key) => key,
        }
    }
}

/// A message together with the node that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEnvelope {
    pub origin: String,
    pub message: ClusterMessage,
}

impl ClusterEnvelope {
    /// Encode for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Sends lifecycle messages to peer nodes.
pub trait ClusterMessenger: Send + Sync {
    fn broadcast(&self, envelope: ClusterEnvelope) -> Result<()>;
}

/// Messenger for nodes sharing one process, backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastMessenger {
    sender: broadcast::Sender<ClusterEnvelope>,
}

impl BroadcastMessenger {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every message sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastMessenger {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ClusterMessenger for BroadcastMessenger {
    fn broadcast(&self, envelope: ClusterEnvelope) -> Result<()> {
        match self.sender.send(envelope) {
            Ok(receivers) => {
                tracing::trace!("Cluster message delivered to {} receivers", receivers);
                Ok(())
            }
            // No peers listening is not an error for a single-node deployment
            Err(broadcast::error::SendError(envelope)) => {
                tracing::debug!("No peers for cluster message {:?}", envelope.message);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = ClusterEnvelope {
            origin: "node-1".into(),
            message: ClusterMessage::ModuleEnabled("com.acme:panel".into()),
        };
        let bytes = envelope.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["message"]["type"], "ModuleEnabled");
        assert_eq!(json["message"]["key"], "com.acme:panel");

        assert_eq!(ClusterEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_static_node_role() {
        let node = StaticNode::passive("node-2");
        assert!(!node.is_cluster_active());
        node.set_active(true);
        assert!(node.is_cluster_active());
        assert_eq!(node.node_id(), "node-2");
    }

    #[test]
    fn test_named_lock_is_exclusive() {
        let locks = Arc::new(LocalLockService::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        locks
                            .run_locked("state", &mut || {
                                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                                max_seen.fetch_max(now, Ordering::SeqCst);
                                inside.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_without_peers_is_ok() {
        let messenger = BroadcastMessenger::default();
        let envelope = ClusterEnvelope {
            origin: "node-1".into(),
            message: ClusterMessage::PluginEnabled("p1".into()),
        };
        assert!(messenger.broadcast(envelope).is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let messenger = BroadcastMessenger::new(8);
        let mut peer = messenger.subscribe();

        messenger
            .broadcast(ClusterEnvelope {
                origin: "node-1".into(),
                message: ClusterMessage::PluginDisabled("p1".into()),
            })
            .unwrap();

        let received = peer.recv().await.unwrap();
        assert_eq!(received.origin, "node-1");
        assert_eq!(received.message, ClusterMessage::PluginDisabled("p1".into()));
        assert_eq!(received.message.key(), "p1");
    }
}
