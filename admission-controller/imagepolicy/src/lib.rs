//! The `image.openshift.io/ImagePolicy` admission plugin.
//!
//! Image references in pods, workload templates and builds are resolved to
//! immutable images, checked against ordered execution rules, and (when the
//! resolution policy asks for it) rewritten to the exact image they resolved
//! to.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
mod mutator;
mod plugin;
mod policy;
pub mod reference;
mod resolver;
mod rules;

#[cfg(test)]
mod tests;

pub use self::{
    config::{ConfigError, ImagePolicyConfig, ImageResolutionType},
    mutator::Mutator,
    plugin::{ImagePolicyPlugin, IGNORE_RULES_ANNOTATION, PLUGIN_NAME, RESOLVE_NAMES_ANNOTATION},
    policy::ResolutionConfig,
    reference::{DockerImageReference, ReferenceError},
    resolver::{
        ImageCacheMetrics, ImageResolver, ImageStore, ObjectReference, ResolveError,
        ResolverConfig, DOCKER_IMAGE, IMAGE_STREAM_IMAGE, IMAGE_STREAM_TAG,
    },
    rules::{Accepter, ImagePolicyAttributes, RegistryMatcher},
};
