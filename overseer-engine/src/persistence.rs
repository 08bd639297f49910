//! Durable copies of the engine state
//!
//! The shared store is exported to a [`StateBlobs`] document and handed to a
//! [`StateStore`]. Restoring replaces the whole in-memory state with the
//! loaded copy.

use crate::store::SharedStore;
use crate::{Error, Result};
use async_trait::async_trait;
use overseer_core::agent::AgentRecord;
use overseer_core::blocker::Blocker;
use overseer_core::health::HealthHistory;
use overseer_core::weights::{StrategyStats, WeightKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One row of the pattern weight table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WeightEntry {
    pub key: WeightKey,
    pub stats: StrategyStats,
}

type Blobs = BTreeMap<String, Value>;

/// Everything the engine learns, as four maps of JSON blobs keyed by id
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateBlobs {
    pub agents: Blobs,
    pub blockers: Blobs,
    /// Keyed by `type:strategy`
    pub weights: Blobs,
    /// Keyed by project id
    pub health: Blobs,
}

impl StateBlobs {
    /// Copy the current contents of `store`
    pub fn export(store: &SharedStore) -> Result<Self> {
        let mut blobs = Self::default();
        for agent in store.agents() {
            blobs
                .agents
                .insert(agent.agent_id.to_string(), serde_json::to_value(&agent)?);
        }
        for blocker in store.blockers() {
            blobs
                .blockers
                .insert(blocker.blocker_id.to_string(), serde_json::to_value(&blocker)?);
        }
        for (key, stats) in store.weights() {
            blobs
                .weights
                .insert(key.to_string(), serde_json::to_value(WeightEntry { key, stats })?);
        }
        for (project, history) in store.health_histories() {
            blobs.health.insert(project, serde_json::to_value(&history)?);
        }
        Ok(blobs)
    }

    /// Replace the contents of `store` with this copy.
    ///
    /// Every blob is decoded before anything is replaced, so a corrupt copy
    /// leaves the store untouched.
    pub fn import(self, store: &SharedStore) -> Result<()> {
        let agents = decode::<AgentRecord>(self.agents)?;
        let blockers = decode::<Blocker>(self.blockers)?;
        let weights = decode::<WeightEntry>(self.weights)?
            .into_iter()
            .map(|w| (w.key, w.stats))
            .collect();
        let health = self
            .health
            .into_iter()
            .map(|(project, blob)| -> Result<(String, HealthHistory)> {
                Ok((project, serde_json::from_value(blob)?))
            })
            .collect::<Result<Vec<_>>>()?;
        store.replace_all(agents, blockers, weights, health);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
            && self.blockers.is_empty()
            && self.weights.is_empty()
            && self.health.is_empty()
    }
}

fn decode<T: DeserializeOwned>(blobs: Blobs) -> Result<Vec<T>> {
    blobs
        .into_values()
        .map(|blob| serde_json::from_value(blob).map_err(Error::from))
        .collect()
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &StateBlobs) -> Result<()>;

    /// The last saved state, `None` if nothing was saved yet
    async fn load(&self) -> Result<Option<StateBlobs>>;
}

/// Keeps the last saved state in memory
#[derive(Default)]
pub struct InMemoryStateStore {
    state: RwLock<Option<StateBlobs>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, state: &StateBlobs) -> Result<()> {
        *self.state.write().await = Some(state.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<StateBlobs>> {
        Ok(self.state.read().await.clone())
    }
}

/// Stores the state as a single JSON document
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn save(&self, state: &StateBlobs) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(state)?;
        // Staged write, renamed into place
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        info!(
            "Saved state to {} ({} agents, {} blockers)",
            self.path.display(),
            state.agents.len(),
            state.blockers.len()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<StateBlobs>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved state at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
