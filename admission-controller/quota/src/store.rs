use openshift_admission_core::{resources, ResourceList};
use std::collections::BTreeMap;
use thiserror::Error;

/// The authoritative state of a cluster quota, as read from the store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuotaDocument {
    pub name: String,
    pub hard: ResourceList,
    pub used: ResourceList,
    pub namespace_used: BTreeMap<String, ResourceList>,

    /// Opaque token compared on write.
    pub version: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("clusterresourcequota {0:?} not found")]
    NotFound(String),

    #[error("clusterresourcequota {0:?} was modified concurrently")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Strongly consistent storage for quota documents.
#[async_trait::async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<QuotaDocument, StoreError>;

    /// Persists the document's usage if its version is still current,
    /// returning the new version.
    async fn update(&self, document: &QuotaDocument) -> Result<String, StoreError>;
}

/// Maps a namespace to the quotas whose selectors cover it.
///
/// Backed by a watch cache: answers may lag the store and may name quotas
/// that no longer exist.
pub trait ScopeIndex: Send + Sync {
    fn documents_for(&self, namespace: &str) -> Vec<String>;

    fn has_synced(&self) -> bool;
}

// === impl QuotaDocument ===

impl QuotaDocument {
    pub fn new(name: impl Into<String>, hard: ResourceList) -> Self {
        Self {
            name: name.into(),
            hard,
            ..Default::default()
        }
    }

    pub fn with_used(mut self, used: ResourceList) -> Self {
        self.used = used;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Charges `delta` to the total and to the namespace's share.
    pub fn charge(&mut self, namespace: &str, delta: &ResourceList) {
        self.used = resources::add(&self.used, delta);
        let ns = self.namespace_used.entry(namespace.to_string()).or_default();
        *ns = resources::add(ns, delta);
    }

    /// Reverses a prior `charge`.
    pub fn refund(&mut self, namespace: &str, delta: &ResourceList) {
        self.used = resources::subtract(&self.used, delta);
        if let Some(ns) = self.namespace_used.get_mut(namespace) {
            *ns = resources::subtract(ns, delta);
        }
    }
}
