use crate::{
    config::ImagePolicyConfig,
    mutator::Mutator,
    policy::ResolutionConfig,
    reference::DockerImageReference,
    resolver::{ImageResolver, ObjectReference, DOCKER_IMAGE},
    rules::{Accepter, ImagePolicyAttributes, RegistryMatcher},
};
use ahash::AHashMap;
use openshift_admission_core::{
    AdmissionError, AdmissionResult, Attributes, FieldError, GroupResource, Interface,
    MutationInterface, NamespaceLister, Operation, ValidationInterface,
};
use serde_json::Value;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info};

pub const PLUGIN_NAME: &str = "image.openshift.io/ImagePolicy";

/// Namespace annotation listing execution rules, comma separated, that don't
/// apply to the namespace.
pub const IGNORE_RULES_ANNOTATION: &str = "alpha.image.policy.openshift.io/ignore-rules";

/// Object or pod template annotation that requests every image reference be
/// resolved as a local image stream name, when set to `*`.
pub const RESOLVE_NAMES_ANNOTATION: &str = "alpha.image.policy.openshift.io/resolve-names";

const PROHIBITED: &str = "this image is prohibited by policy";

/// Controls which images may be run and rewrites references to the images
/// they resolve to.
pub struct ImagePolicyPlugin {
    accepter: Accepter,
    resolution: ResolutionConfig,
    resolver: ImageResolver,
    namespaces: Arc<dyn NamespaceLister>,
}

/// State shared by every reference in one request.
struct Request<'a> {
    resource: GroupResource,
    namespace: &'a str,
    is_update: bool,
    resolve_all: bool,
    excluded: BTreeSet<String>,
}

// === impl ImagePolicyPlugin ===

impl ImagePolicyPlugin {
    pub fn new(
        config: ImagePolicyConfig,
        integrated: RegistryMatcher,
        resolver: ImageResolver,
        namespaces: Arc<dyn NamespaceLister>,
    ) -> Self {
        Self {
            accepter: Accepter::new(config.execution_rules.clone(), integrated),
            resolution: ResolutionConfig::new(config),
            resolver,
            namespaces,
        }
    }

    /// Applies the policy to `data`, the body of the admitted object.
    ///
    /// When mutation isn't allowed, any reference the policy would rewrite is
    /// reported as an error instead.
    async fn apply(
        &self,
        attrs: &Attributes,
        data: &mut Value,
        mutation_allowed: bool,
    ) -> AdmissionResult {
        if attrs.subresource().is_some()
            || !matches!(attrs.operation, Operation::Create | Operation::Update)
        {
            return Ok(());
        }

        let resource = attrs.group_resource();
        if !self.accepter.covers(&resource) && !self.resolution.covers(&resource) {
            return Ok(());
        }

        let Some(mutator) = Mutator::for_resource(&resource) else {
            return Err(AdmissionError::forbidden(
                resource,
                &attrs.name,
                format!(
                    "unable to apply image policy against objects of type {}: No list of images available for this object",
                    attrs.kind.kind
                ),
            ));
        };

        debug!(kind = %attrs.kind.kind, namespace = ?attrs.namespace(), name = %attrs.name, "Applying image policy");

        let resolve_all = attrs
            .object
            .as_ref()
            .and_then(|o| o.metadata.annotations.as_ref())
            .and_then(|a| a.get(RESOLVE_NAMES_ANNOTATION))
            .map(String::as_str)
            .or_else(|| mutator.template_annotation(&*data, RESOLVE_NAMES_ANNOTATION))
            == Some("*");

        let namespace = attrs.namespace().unwrap_or_default();
        let req = Request {
            resource,
            namespace,
            is_update: attrs.operation == Operation::Update,
            resolve_all,
            excluded: self.excluded_rules(namespace),
        };

        let mut decisions = AHashMap::<ObjectReference, Result<ObjectReference, String>>::new();
        let mut errors = Vec::new();
        for (slot, reference) in mutator.references(data) {
            let decision = match decisions.get(&reference).cloned() {
                Some(decision) => decision,
                None => {
                    let decision = self.decide(&req, &reference).await;
                    decisions.insert(reference.clone(), decision.clone());
                    decision
                }
            };

            match decision {
                Err(error) if mutation_allowed => {
                    errors.push(FieldError::forbidden(slot.field, error));
                }
                Err(error) => {
                    errors.push(FieldError::forbidden(
                        slot.field,
                        format!("error in image policy validation: {error}"),
                    ));
                }
                Ok(updated) if updated == reference => {}
                Ok(updated) if mutation_allowed => {
                    debug!(field = %slot.field, from = %reference.name, to = %updated.name, "Rewriting image reference");
                    if let Err(error) = Mutator::write(data, &slot, &updated) {
                        errors.push(error);
                    }
                }
                Ok(updated) => {
                    info!(field = %slot.field, from = %reference.name, to = %updated.name, "Disallowed mutation in image policy validation");
                    errors.push(FieldError::forbidden(
                        slot.field,
                        format!("{PROHIBITED} (changed after admission)"),
                    ));
                }
            }
        }

        if errors.is_empty() {
            return Ok(());
        }
        Err(AdmissionError::invalid(
            kind_name(attrs),
            &attrs.name,
            errors,
        ))
    }

    /// Resolves a reference, decides whether to rewrite it, and checks the
    /// result against the execution rules.
    async fn decide(
        &self,
        req: &Request<'_>,
        reference: &ObjectReference,
    ) -> Result<ObjectReference, String> {
        let mut reference = reference.clone();
        let mut resolved = None;
        let mut unresolved = None;

        if self.resolution.requests_resolution(&req.resource) {
            match self
                .resolver
                .resolve(&reference, req.namespace, req.resolve_all)
                .await
            {
                Ok(attrs) => {
                    if self
                        .resolution
                        .rewrite_image_pull_spec(&attrs, req.is_update, &req.resource)
                    {
                        reference = ObjectReference::docker_image(attrs.name.exact());
                    }
                    resolved = Some(attrs);
                }
                Err(error) if self.resolution.fail_on_resolution_failure(&req.resource) => {
                    return Err(error.to_string());
                }
                Err(error) => {
                    debug!(image = %reference.name, %error, "Could not resolve image reference");
                    unresolved = Some(error);
                }
            }
        }

        let mut attrs = resolved.unwrap_or_else(|| {
            let mut attrs = ImagePolicyAttributes::default();
            if reference.kind == DOCKER_IMAGE {
                if let Ok(name) = DockerImageReference::parse(&reference.name) {
                    attrs.name = name;
                }
            }
            attrs
        });
        attrs.resource = req.resource.clone();
        attrs.excluded_rules = req.excluded.clone();

        if !self.accepter.accepts(&attrs) {
            info!(image = %reference.name, resource = %req.resource, "Image prohibited by policy");
            return Err(match unresolved {
                Some(error) => format!("{PROHIBITED}: {error}"),
                None => PROHIBITED.to_string(),
            });
        }

        Ok(reference)
    }

    fn excluded_rules(&self, namespace: &str) -> BTreeSet<String> {
        if namespace.is_empty() {
            return BTreeSet::new();
        }
        self.namespaces
            .annotations(namespace)
            .and_then(|mut a| a.remove(IGNORE_RULES_ANNOTATION))
            .filter(|v| !v.is_empty())
            .map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// The kind reported in validation errors, qualified by its group.
fn kind_name(attrs: &Attributes) -> String {
    if attrs.kind.group.is_empty() {
        attrs.kind.kind.clone()
    } else {
        format!("{}.{}", attrs.kind.kind, attrs.kind.group)
    }
}

impl Interface for ImagePolicyPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn handles(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Create | Operation::Update)
    }
}

#[async_trait::async_trait]
impl MutationInterface for ImagePolicyPlugin {
    async fn admit(&self, attributes: &mut Attributes) -> AdmissionResult {
        let Some(mut data) = attributes.object.as_ref().map(|o| o.data.clone()) else {
            return Ok(());
        };
        self.apply(attributes, &mut data, true).await?;
        if let Some(object) = attributes.object.as_mut() {
            object.data = data;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ValidationInterface for ImagePolicyPlugin {
    async fn validate(&self, attributes: &Attributes) -> AdmissionResult {
        let Some(mut data) = attributes.object.as_ref().map(|o| o.data.clone()) else {
            return Ok(());
        };
        self.apply(attributes, &mut data, false).await
    }
}
