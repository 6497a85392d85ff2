//! The `ImagePolicyConfig` file format.

use openshift_admission_core::GroupResource;
use openshift_admission_k8s_api::labels::Selector;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub const API_VERSION: &str = "image.openshift.io/v1";
pub const KIND: &str = "ImagePolicyConfig";

/// Images carrying this annotation with the value `true` may not be run
/// under the default policy.
pub const DENY_EXECUTION_ANNOTATION: &str = "images.openshift.io/deny-execution";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePolicyConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default)]
    pub resolve_images: ImageResolutionType,

    #[serde(default)]
    pub resolution_rules: Vec<ImageResolutionPolicyRule>,

    #[serde(default)]
    pub execution_rules: Vec<ImageExecutionPolicyRule>,
}

/// How aggressively image references are resolved to digests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ImageResolutionType {
    /// Resolution is required and the pull spec is rewritten to the digest.
    RequiredRewrite,
    /// Resolution is required; the pull spec is left as is.
    Required,
    /// Resolution is attempted and the pull spec rewritten on success.
    AttemptRewrite,
    #[default]
    Attempt,
    DoNotAttempt,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResolutionPolicyRule {
    pub target_resource: GroupResource,

    /// Resolves single-segment names against image streams that have local
    /// lookup enabled.
    #[serde(default)]
    pub local_names: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ImageResolutionType>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageExecutionPolicyRule {
    #[serde(flatten)]
    pub condition: ImageCondition,

    /// A matching reject rule denies the image. When a resource has any
    /// non-reject rule, images must match one of them to be admitted.
    #[serde(default)]
    pub reject: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCondition {
    pub name: String,

    /// Applies the rule even when the namespace's ignore-rules annotation
    /// names it.
    #[serde(default)]
    pub ignore_namespace_override: bool,

    #[serde(default)]
    pub on_resources: Vec<GroupResource>,

    #[serde(default)]
    pub invert_match: bool,

    #[serde(default)]
    pub match_integrated_registry: bool,

    #[serde(default)]
    pub match_registries: Vec<String>,

    /// Skips the rule when the image could not be resolved, instead of
    /// treating unresolved images as non-matching.
    #[serde(default)]
    pub skip_on_resolution_failure: bool,

    #[serde(default)]
    pub match_docker_image_labels: Vec<ValueCondition>,

    #[serde(default)]
    pub match_image_labels: Vec<Selector>,

    #[serde(default)]
    pub match_image_annotations: Vec<ValueCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueCondition {
    pub key: String,

    /// When set, only the presence of the key is checked.
    #[serde(default)]
    pub set: bool,

    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse image policy config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unexpected kind {0:?}, expected {KIND}")]
    Kind(String),

    #[error("executionRules[{0}].name: Required value")]
    MissingName(usize),

    #[error("executionRules[{index}].name: Duplicate value: {name:?}")]
    DuplicateName { index: usize, name: String },

    #[error("executionRules[{0}].onResources: Required value")]
    MissingResources(usize),

    #[error("resolutionRules[{0}].targetResource.resource: Required value")]
    MissingTargetResource(usize),
}

// === impl ImagePolicyConfig ===

impl ImagePolicyConfig {
    /// Parses a YAML (or JSON) document, applies defaults, and validates the
    /// result.
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let mut config = serde_yaml::from_str::<Self>(data)?;
        config.set_defaults();
        config.validate()?;
        Ok(config)
    }

    /// The policy used when no configuration file is given: images annotated
    /// to deny execution may not be run by pods or builds.
    pub fn default_policy() -> Self {
        let mut config = Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            execution_rules: vec![ImageExecutionPolicyRule {
                reject: true,
                condition: ImageCondition {
                    name: "execution-denied".to_string(),
                    on_resources: vec![
                        GroupResource::core("pods"),
                        GroupResource::new("build.openshift.io", "builds"),
                    ],
                    match_image_annotations: vec![ValueCondition {
                        key: DENY_EXECUTION_ANNOTATION.to_string(),
                        set: false,
                        value: "true".to_string(),
                    }],
                    skip_on_resolution_failure: true,
                    ..Default::default()
                },
            }],
            ..Default::default()
        };
        config.set_defaults();
        config
    }

    pub fn set_defaults(&mut self) {
        if self.resolution_rules.is_empty() {
            self.resolution_rules = [
                GroupResource::core("pods"),
                GroupResource::new("build.openshift.io", "builds"),
                GroupResource::core("replicationcontrollers"),
                GroupResource::new("apps", "replicasets"),
                GroupResource::new("extensions", "replicasets"),
                GroupResource::new("batch", "jobs"),
            ]
            .into_iter()
            .map(|target_resource| ImageResolutionPolicyRule {
                target_resource,
                local_names: true,
                policy: None,
            })
            .collect();
        }
        for rule in &mut self.resolution_rules {
            rule.policy.get_or_insert(self.resolve_images);
        }

        for rule in &mut self.execution_rules {
            if rule.condition.on_resources.is_empty() {
                rule.condition.on_resources = vec![GroupResource::core("pods")];
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.kind.is_empty() && self.kind != KIND {
            return Err(ConfigError::Kind(self.kind.clone()));
        }

        let mut names = HashSet::new();
        for (index, rule) in self.execution_rules.iter().enumerate() {
            let name = &rule.condition.name;
            if name.is_empty() {
                return Err(ConfigError::MissingName(index));
            }
            if !names.insert(name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    index,
                    name: name.clone(),
                });
            }
            if rule.condition.on_resources.is_empty() {
                return Err(ConfigError::MissingResources(index));
            }
        }

        for (index, rule) in self.resolution_rules.iter().enumerate() {
            if rule.target_resource.resource.is_empty() {
                return Err(ConfigError::MissingTargetResource(index));
            }
        }

        Ok(())
    }
}

// === impl ImageResolutionType ===

impl ImageResolutionType {
    pub fn requests_resolution(self) -> bool {
        self != Self::DoNotAttempt
    }

    pub fn fail_on_resolution_failure(self) -> bool {
        matches!(self, Self::Required | Self::RequiredRewrite)
    }

    pub fn rewrite_image_pull_spec(self) -> bool {
        matches!(self, Self::RequiredRewrite | Self::AttemptRewrite)
    }
}
