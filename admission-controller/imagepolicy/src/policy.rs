use crate::{config::ImagePolicyConfig, rules::ImagePolicyAttributes};
use openshift_admission_core::GroupResource;

/// Decides when references are resolved and rewritten for a resource.
#[derive(Clone, Debug)]
pub struct ResolutionConfig {
    config: ImagePolicyConfig,
}

/// Pod templates of these resources can't be changed once created.
fn skip_rewrite_on_update(gr: &GroupResource) -> bool {
    matches!(
        (gr.group.as_str(), gr.resource.as_str()),
        ("batch", "jobs") | ("build.openshift.io", "builds") | ("apps", "statefulsets")
    )
}

fn rule_covers(target: &GroupResource, gr: &GroupResource) -> bool {
    target.group == gr.group && (target.resource == gr.resource || target.resource == "*")
}

// === impl ResolutionConfig ===

impl ResolutionConfig {
    pub fn new(config: ImagePolicyConfig) -> Self {
        Self { config }
    }

    /// Whether any resolution rule names the resource.
    pub fn covers(&self, gr: &GroupResource) -> bool {
        self.config
            .resolution_rules
            .iter()
            .any(|rule| rule_covers(&rule.target_resource, gr))
    }

    pub fn requests_resolution(&self, gr: &GroupResource) -> bool {
        self.config.resolve_images.requests_resolution() || self.covers(gr)
    }

    pub fn fail_on_resolution_failure(&self, _gr: &GroupResource) -> bool {
        self.config.resolve_images.fail_on_resolution_failure()
    }

    /// A covering rule decides whether the resolved reference is written back;
    /// the global policy applies only to resources no rule covers.
    pub fn rewrite_image_pull_spec(
        &self,
        attrs: &ImagePolicyAttributes,
        is_update: bool,
        gr: &GroupResource,
    ) -> bool {
        if is_update && skip_rewrite_on_update(gr) {
            return false;
        }

        let mut covered = false;
        for rule in &self.config.resolution_rules {
            if !rule_covers(&rule.target_resource, gr) {
                continue;
            }
            if rule.local_names && attrs.local_rewrite {
                return true;
            }
            if rule
                .policy
                .unwrap_or(self.config.resolve_images)
                .rewrite_image_pull_spec()
            {
                return true;
            }
            covered = true;
        }
        if covered {
            return false;
        }

        self.config.resolve_images.rewrite_image_pull_spec()
    }
}
