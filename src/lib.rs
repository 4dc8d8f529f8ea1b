//! Plugin lifecycle and cluster-state coordination.
//!
//! This crate drives installed plugins through install, enable, disable,
//! upgrade and uninstall on every node of a cluster, keeps the enabled state
//! of plugins and modules consistent across nodes, and records why plugins
//! failed to come up.
//!
//! # Example
//!
//! ```rust,ignore
//! use lib_plugin_lifecycle::{
//!     ClusterStateStore, LocalLockService, PluginConfig, PluginLifecycleCoordinator,
//!     SqliteStore, StaticNode,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PluginConfig::from_json_file(Path::new("plugins.json"))?;
//!     let db = Arc::new(SqliteStore::open(Path::new("plugins.db"))?);
//!     let node = Arc::new(StaticNode::active("node-1"));
//!
//!     let state = Arc::new(ClusterStateStore::new(
//!         db.clone(),
//!         Arc::new(LocalLockService::new()),
//!         node.clone(),
//!     )?);
//!     state.migrate_legacy(db.as_ref())?;
//!
//!     let coordinator = PluginLifecycleCoordinator::builder(node, state)
//!         .configure(&config)
//!         .with_version_store(db)
//!         .build()?;
//!     coordinator.start()?;
//!
//!     // Enable on every node
//!     coordinator.enable("com.acme.reports")?;
//!
//!     for failed in coordinator.failure_tracker().failed_plugins() {
//!         eprintln!("{}: {:?}", failed.plugin_key, failed.failure_causes);
//!     }
//!     Ok(())
//! }
//! ```

mod artifact;
mod cluster;
mod components;
mod config;
mod coordinator;
mod error;
mod events;
mod factory;
mod failure_tracker;
mod handle_cache;
mod load_gate;
mod loader;
mod plugin;
mod resolver;
mod sqlite;
mod state_store;
mod version_store;

pub use artifact::*;
pub use cluster::*;
pub use components::*;
pub use config::*;
pub use coordinator::*;
pub use error::*;
pub use events::*;
pub use factory::*;
pub use failure_tracker::*;
pub use handle_cache::*;
pub use load_gate::*;
pub use loader::*;
pub use plugin::*;
pub use resolver::*;
pub use sqlite::*;
pub use state_store::*;
pub use version_store::*;
