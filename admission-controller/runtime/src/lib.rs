#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use openshift_admission_core as core;
pub use openshift_admission_imagepolicy as imagepolicy;
pub use openshift_admission_k8s_api as k8s;
pub use openshift_admission_k8s_index as index;
pub use openshift_admission_quota as quota;

mod admission;
mod args;
mod metrics;
mod store;

pub use self::{
    admission::Admission,
    args::Args,
    metrics::AdmissionMetrics,
    store::{KubeImageStore, KubeQuotaStore},
};

use std::collections::BTreeMap;

/// Answers quota scope lookups from the namespace/quota index.
#[derive(Clone, Debug)]
struct QuotaScopes(index::SharedIndex);

/// Answers namespace annotation lookups from the namespace/quota index.
#[derive(Clone, Debug)]
struct NamespaceAnnotations(index::SharedIndex);

// === impl QuotaScopes ===

impl quota::ScopeIndex for QuotaScopes {
    fn documents_for(&self, namespace: &str) -> Vec<String> {
        self.0.read().quotas_for(namespace)
    }

    fn has_synced(&self) -> bool {
        self.0.read().has_synced()
    }
}

// === impl NamespaceAnnotations ===

impl core::NamespaceLister for NamespaceAnnotations {
    fn annotations(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.0.read().namespace_annotations(namespace)
    }
}
