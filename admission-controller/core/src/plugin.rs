use crate::{AdmissionResult, Attributes, Operation};
use std::sync::Arc;
use tracing::debug;

/// A pluggable admission decision.
pub trait Interface: Send + Sync {
    /// Names the plugin in logs and metrics.
    fn name(&self) -> &'static str;

    /// Indicates whether the plugin acts on the given operation.
    fn handles(&self, operation: Operation) -> bool;
}

/// A plugin that may modify the admitted object.
#[async_trait::async_trait]
pub trait MutationInterface: Interface {
    async fn admit(&self, attributes: &mut Attributes) -> AdmissionResult;
}

/// A plugin that validates the admitted object without modifying it.
#[async_trait::async_trait]
pub trait ValidationInterface: Interface {
    async fn validate(&self, attributes: &Attributes) -> AdmissionResult;
}

/// The set of enabled admission plugins, built once at startup.
///
/// Mutating and validating plugins run in separate phases, each served by its
/// own webhook, so validators see the object only after every mutating webhook
/// has run. The first error ends a phase.
#[derive(Clone, Default)]
pub struct Plugins {
    mutators: Vec<Arc<dyn MutationInterface>>,
    validators: Vec<Arc<dyn ValidationInterface>>,
}

// === impl Plugins ===

impl Plugins {
    pub fn with_mutator(mut self, plugin: Arc<dyn MutationInterface>) -> Self {
        self.mutators.push(plugin);
        self
    }

    pub fn with_validator(mut self, plugin: Arc<dyn ValidationInterface>) -> Self {
        self.validators.push(plugin);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty() && self.validators.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mutators
            .iter()
            .map(|p| p.name())
            .chain(self.validators.iter().map(|p| p.name()))
    }

    /// Runs the mutating plugins that handle the operation, in order.
    pub async fn mutate(&self, attributes: &mut Attributes) -> AdmissionResult {
        let op = attributes.operation;
        for plugin in self.mutators.iter().filter(|p| p.handles(op)) {
            debug!(plugin = plugin.name(), %op, "Admitting");
            plugin.admit(attributes).await?;
        }
        Ok(())
    }

    /// Runs the validating plugins that handle the operation, in order.
    pub async fn validate(&self, attributes: &Attributes) -> AdmissionResult {
        let op = attributes.operation;
        for plugin in self.validators.iter().filter(|p| p.handles(op)) {
            debug!(plugin = plugin.name(), %op, "Validating");
            plugin.validate(attributes).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Plugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugins")
            .field(
                "mutators",
                &self.mutators.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "validators",
                &self.validators.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
