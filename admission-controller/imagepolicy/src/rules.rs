use crate::{
    config::{ImageCondition, ImageExecutionPolicyRule, ValueCondition},
    reference::DockerImageReference,
};
use openshift_admission_core::GroupResource;
use openshift_admission_k8s_api::image::Image;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::trace;

/// Recognizes the hostnames of the cluster's integrated registry.
#[derive(Clone, Debug, Default)]
pub struct RegistryMatcher {
    hosts: Vec<String>,
}

/// What is known about a single image reference when rules are evaluated.
#[derive(Clone, Debug, Default)]
pub struct ImagePolicyAttributes {
    pub resource: GroupResource,
    pub name: DockerImageReference,
    pub image: Option<Arc<Image>>,
    pub excluded_rules: BTreeSet<String>,

    /// The reference points at the integrated registry.
    pub integrated: bool,

    /// The reference was resolved through an image stream's local lookup
    /// and may be rewritten even when the policy doesn't require it.
    pub local_rewrite: bool,
}

/// Applies execution rules, in order, to resolved image references.
#[derive(Clone, Debug)]
pub struct Accepter {
    rules: Vec<ImageExecutionPolicyRule>,
    integrated: RegistryMatcher,
}

// === impl RegistryMatcher ===

impl RegistryMatcher {
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(Into::into)
                .filter(|h: &String| !h.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, registry: &str) -> bool {
        !registry.is_empty() && self.hosts.iter().any(|h| h == registry)
    }
}

// === impl Accepter ===

impl Accepter {
    pub fn new(rules: Vec<ImageExecutionPolicyRule>, integrated: RegistryMatcher) -> Self {
        Self { rules, integrated }
    }

    pub fn covers(&self, gr: &GroupResource) -> bool {
        self.rules_for(gr).next().is_some()
    }

    pub fn accepts(&self, attrs: &ImagePolicyAttributes) -> bool {
        let mut default_reject = false;
        let mut any_matched = false;
        for rule in self.rules_for(&attrs.resource) {
            if !rule.reject {
                default_reject = true;
            }

            let cond = &rule.condition;
            if attrs.excluded_rules.contains(&cond.name) && !cond.ignore_namespace_override {
                continue;
            }
            if attrs.image.is_none() && cond.skip_on_resolution_failure {
                continue;
            }

            if self.matches(cond, attrs) {
                trace!(rule = %cond.name, image = %attrs.name, reject = rule.reject, "Matched");
                if rule.reject {
                    return false;
                }
                any_matched = true;
            }
        }

        !default_reject || any_matched
    }

    fn rules_for<'a>(
        &'a self,
        gr: &'a GroupResource,
    ) -> impl Iterator<Item = &'a ImageExecutionPolicyRule> + 'a {
        self.rules.iter().filter(move |rule| {
            rule.condition.on_resources.iter().any(|on| {
                on.group == gr.group && (on.resource == gr.resource || on.resource == "*")
            })
        })
    }

    fn matches(&self, cond: &ImageCondition, attrs: &ImagePolicyAttributes) -> bool {
        self.matches_values(cond, attrs) != cond.invert_match
    }

    fn matches_values(&self, cond: &ImageCondition, attrs: &ImagePolicyAttributes) -> bool {
        let registry = attrs.name.registry.as_str();
        if cond.match_integrated_registry && !(attrs.integrated || self.integrated.matches(registry))
        {
            return false;
        }
        if !cond.match_registries.is_empty() && !cond.match_registries.iter().any(|r| r == registry) {
            return false;
        }

        let Some(image) = attrs.image.as_deref() else {
            return cond.match_docker_image_labels.is_empty()
                && cond.match_image_labels.is_empty()
                && cond.match_image_annotations.is_empty();
        };

        if !cond.match_docker_image_labels.is_empty() {
            match image.docker_labels() {
                Some(labels) if any_value_matches(&cond.match_docker_image_labels, labels) => {}
                _ => return false,
            }
        }

        if !cond.match_image_labels.is_empty() {
            let empty = BTreeMap::new();
            let labels = image.metadata.labels.as_ref().unwrap_or(&empty);
            if !cond.match_image_labels.iter().all(|s| s.matches(labels)) {
                return false;
            }
        }

        if !cond.match_image_annotations.is_empty() {
            match image.metadata.annotations.as_ref() {
                Some(annotations)
                    if any_value_matches(&cond.match_image_annotations, annotations) => {}
                _ => return false,
            }
        }

        true
    }
}

fn any_value_matches(conditions: &[ValueCondition], values: &BTreeMap<String, String>) -> bool {
    conditions.iter().any(|c| match values.get(&c.key) {
        Some(v) => c.set || *v == c.value,
        None => false,
    })
}
