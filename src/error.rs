//! Error types for plugin lifecycle operations.

use thiserror::Error;

/// Boxed error raised by factories and module initialization.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during plugin lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Artifact matched no allow-pattern, or no factory claimed it
    #[error("Artifact rejected: {artifact} ({reason})")]
    AdmissionRejected { artifact: String, reason: String },

    /// The chosen factory failed to build the plugin
    #[error("Failed to construct plugin from {artifact}: {source}")]
    ConstructionFailed {
        artifact: String,
        #[source]
        source: BoxError,
    },

    /// `construct` was called for an artifact that was never admitted
    #[error("Artifact was never admitted: {0}")]
    NotAdmitted(String),

    /// Plugin not found
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Module not found
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// Plugin already installed
    #[error("Plugin already installed: {0}")]
    AlreadyInstalled(String),

    /// A component is already registered under the complete key
    #[error("Component already registered: {0}")]
    ComponentAlreadyRegistered(String),

    /// Complete key without a module part
    #[error("Invalid complete key: {0}")]
    InvalidCompleteKey(String),

    /// Allow-pattern failed to compile
    #[error("Invalid allow-pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Row store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cluster message could not be delivered
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// A shared lock was poisoned by a panicking holder
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl LifecycleError {
    pub(crate) fn rejected(artifact: &str, reason: impl Into<String>) -> Self {
        Self::AdmissionRejected {
            artifact: artifact.to_string(),
            reason: reason.into(),
        }
    }
}

/// Why a plugin could not be enabled.
///
/// Never returned to callers; recorded against the plugin key by the
/// failure tracker.
#[derive(Debug, Error)]
pub enum EnableFailure {
    #[error("Required plugin {required} is not enabled")]
    MissingDependency { required: String },

    #[error("Module {complete_key} failed to initialise")]
    Initialization {
        complete_key: String,
        #[source]
        source: BoxError,
    },

    #[error("Component {complete_key} could not be registered")]
    Registration {
        complete_key: String,
        #[source]
        source: LifecycleError,
    },
}

/// Result type for plugin lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
