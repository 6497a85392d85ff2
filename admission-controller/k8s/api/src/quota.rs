use crate::labels::{Map, Selector};
use k8s_openapi::api::core::v1::{ResourceQuotaSpec, ResourceQuotaStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Mirrors a `ResourceQuota` across every namespace its selector covers.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "quota.openshift.io",
    version = "v1",
    kind = "ClusterResourceQuota",
    status = "ClusterResourceQuotaStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceQuotaSpec {
    pub selector: ClusterResourceQuotaSelector,
    pub quota: ResourceQuotaSpec,
}

/// Namespaces are selected when both the label and annotation selectors
/// match. A quota with neither selects nothing.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceQuotaSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Selector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Map>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceQuotaStatus {
    pub total: ResourceQuotaStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<ResourceQuotaStatusByNamespace>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuotaStatusByNamespace {
    pub namespace: String,
    pub status: ResourceQuotaStatus,
}

// === impl ClusterResourceQuotaSelector ===

impl ClusterResourceQuotaSelector {
    pub fn matches(&self, labels: &Map, annotations: &Map) -> bool {
        if self.labels.is_none() && self.annotations.is_none() {
            return false;
        }

        if let Some(selector) = &self.labels {
            if !selector.matches(labels) {
                return false;
            }
        }

        if let Some(required) = &self.annotations {
            for (k, v) in required {
                if annotations.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn empty_selector_selects_nothing() {
        let selector = ClusterResourceQuotaSelector::default();
        assert!(!selector.matches(&Map::new(), &Map::new()));
    }

    #[test]
    fn label_and_annotation_selectors_both_apply() {
        let selector = ClusterResourceQuotaSelector {
            labels: Some(Selector::from_iter(Some(("team", "a")))),
            annotations: Some(btreemap! { "openshift.io/requester".into() => "alice".into() }),
        };

        let labels = btreemap! { "team".to_string() => "a".to_string() };
        let annotations = btreemap! {
            "openshift.io/requester".to_string() => "alice".to_string(),
        };
        assert!(selector.matches(&labels, &annotations));
        assert!(!selector.matches(&labels, &Map::new()));
        assert!(!selector.matches(&Map::new(), &annotations));
    }

    #[test]
    fn annotation_only_selector() {
        let selector = ClusterResourceQuotaSelector {
            labels: None,
            annotations: Some(btreemap! { "openshift.io/requester".into() => "bob".into() }),
        };
        let annotations = btreemap! {
            "openshift.io/requester".to_string() => "bob".to_string(),
        };
        assert!(selector.matches(&Map::new(), &annotations));
    }
}
