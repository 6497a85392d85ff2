use ahash::AHashMap as HashMap;
use kube::ResourceExt;
use kubert::index::{ClusterRemoved, IndexClusterResource};
use openshift_admission_k8s_api::{
    labels::Map, quota::ClusterResourceQuotaSelector, ClusterResourceQuota, Namespace,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug, Default)]
pub struct Index {
    namespaces: HashMap<String, NamespaceMeta>,
    quotas: HashMap<String, ClusterResourceQuotaSelector>,
    namespaces_synced: bool,
    quotas_synced: bool,
}

#[derive(Debug, Default, PartialEq)]
struct NamespaceMeta {
    labels: Map,
    annotations: Map,
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Names of the quotas selecting `namespace`, sorted. Unknown namespaces
    /// are covered by no quota.
    pub fn quotas_for(&self, namespace: &str) -> Vec<String> {
        let Some(ns) = self.namespaces.get(namespace) else {
            return Vec::new();
        };
        let mut names = self
            .quotas
            .iter()
            .filter(|(_, selector)| selector.matches(&ns.labels, &ns.annotations))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Whether the initial list of both namespaces and quotas has been
    /// observed.
    pub fn has_synced(&self) -> bool {
        self.namespaces_synced && self.quotas_synced
    }

    pub fn namespace_annotations(&self, namespace: &str) -> Option<Map> {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.annotations.clone())
    }

    pub fn namespaces_len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn quotas_len(&self) -> usize {
        self.quotas.len()
    }
}

impl IndexClusterResource<Namespace> for Index {
    fn apply(&mut self, ns: Namespace) {
        let name = ns.name_unchecked();
        let meta = NamespaceMeta {
            labels: ns.metadata.labels.unwrap_or_default(),
            annotations: ns.metadata.annotations.unwrap_or_default(),
        };
        debug!(namespace = %name, "Indexing");
        self.namespaces.insert(name, meta);
    }

    fn delete(&mut self, name: String) {
        debug!(namespace = %name, "Deleting");
        self.namespaces.remove(&name);
    }

    fn reset(&mut self, namespaces: Vec<Namespace>, removed: ClusterRemoved) {
        for name in removed {
            self.namespaces.remove(&name);
        }
        for ns in namespaces {
            <Self as IndexClusterResource<Namespace>>::apply(self, ns);
        }
        if !self.namespaces_synced {
            info!(namespaces = self.namespaces.len(), "Namespaces synced");
        }
        self.namespaces_synced = true;
    }
}

impl IndexClusterResource<ClusterResourceQuota> for Index {
    fn apply(&mut self, quota: ClusterResourceQuota) {
        let name = quota.name_unchecked();
        debug!(quota = %name, "Indexing");
        self.quotas.insert(name, quota.spec.selector);
    }

    fn delete(&mut self, name: String) {
        debug!(quota = %name, "Deleting");
        self.quotas.remove(&name);
    }

    fn reset(&mut self, quotas: Vec<ClusterResourceQuota>, removed: ClusterRemoved) {
        for name in removed {
            self.quotas.remove(&name);
        }
        for quota in quotas {
            <Self as IndexClusterResource<ClusterResourceQuota>>::apply(self, quota);
        }
        if !self.quotas_synced {
            info!(quotas = self.quotas.len(), "Cluster quotas synced");
        }
        self.quotas_synced = true;
    }
}
