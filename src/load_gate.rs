//! Artifact admission and factory dispatch.
//!
//! An artifact must pass two checks before it can be built: in restricted
//! startup it has to match one of the allow-patterns, and one of the
//! registered factories has to claim it. The claiming factory is remembered
//! per artifact name and used by [`PluginLoadGate::construct`].

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

use crate::artifact::PluginArtifact;
use crate::error::{LifecycleError, Result};
use crate::factory::PluginFactory;
use crate::failure_tracker::FailureTracker;
use crate::plugin::Plugin;

/// Screens artifacts and builds the admitted ones.
pub struct PluginLoadGate {
    allow: Option<Vec<Regex>>,
    factories: Vec<Arc<dyn PluginFactory>>,
    decisions: DashMap<String, Arc<dyn PluginFactory>>,
    tracker: Arc<FailureTracker>,
}

impl PluginLoadGate {
    /// A gate that admits every artifact some factory accepts.
    pub fn unrestricted(
        factories: Vec<Arc<dyn PluginFactory>>,
        tracker: Arc<FailureTracker>,
    ) -> Self {
        Self {
            allow: None,
            factories,
            decisions: DashMap::new(),
            tracker,
        }
    }

    /// A gate that only admits artifact names matching one of `patterns`.
    ///
    /// Each pattern must match the whole name.
    pub fn restricted<S: AsRef<str>>(
        patterns: &[S],
        factories: Vec<Arc<dyn PluginFactory>>,
        tracker: Arc<FailureTracker>,
    ) -> Result<Self> {
        let allow = patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:{})$", p.as_ref())))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            allow: Some(allow),
            factories,
            decisions: DashMap::new(),
            tracker,
        })
    }

    pub fn is_restricted(&self) -> bool {
        self.allow.is_some()
    }

    fn is_allowed(&self, name: &str) -> bool {
        match &self.allow {
            None => true,
            Some(patterns) => match patterns.iter().find(|p| p.is_match(name)) {
                Some(pattern) => {
                    tracing::debug!("Artifact {} allowed by {}", name, pattern.as_str());
                    true
                }
                None => false,
            },
        }
    }

    /// Screen an artifact and remember which factory will build it.
    ///
    /// Returns the id of the chosen factory.
    pub fn admit(&self, artifact: &PluginArtifact) -> Result<String> {
        if !self.is_allowed(&artifact.name) {
            tracing::info!(
                "Artifact {} is not on the startup allow-list; skipping",
                artifact.name
            );
            return Err(LifecycleError::rejected(
                &artifact.name,
                "not on the startup allow-list",
            ));
        }

        let Some(factory) = self.factories.iter().find(|f| f.can_create(artifact)) else {
            tracing::debug!("No factory accepts artifact {}", artifact.name);
            return Err(LifecycleError::rejected(
                &artifact.name,
                "no factory accepts it",
            ));
        };

        let id = factory.id().to_string();
        tracing::debug!("Artifact {} admitted for factory {}", artifact.name, id);
        self.decisions.insert(artifact.name.clone(), factory.clone());
        Ok(id)
    }

    /// Build a previously admitted artifact and start tracking it.
    pub fn construct(&self, artifact: &PluginArtifact) -> Result<Plugin> {
        let factory = self
            .decisions
            .get(&artifact.name)
            .map(|f| f.value().clone())
            .ok_or_else(|| LifecycleError::NotAdmitted(artifact.name.clone()))?;

        let plugin = factory
            .create(artifact)
            .map_err(|source| LifecycleError::ConstructionFailed {
                artifact: artifact.name.clone(),
                source,
            })?;

        self.tracker
            .track_loading(&plugin.key, &plugin.name, Some(artifact.clone()));
        Ok(plugin)
    }

    /// Drop the remembered decision for an artifact.
    pub fn forget(&self, artifact_name: &str) {
        self.decisions.remove(artifact_name);
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.len()
    }
}
