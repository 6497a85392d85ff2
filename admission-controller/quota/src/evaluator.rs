use crate::{
    lock::LockFactory,
    metrics::QuotaMetrics,
    store::{QuotaDocument, QuotaStore, ScopeIndex, StoreError},
    usage::{Registry, UsageError},
};
use openshift_admission_core::{
    resources::{self, Display},
    AdmissionError, AdmissionResult, Attributes, GroupResource, Operation, ResourceList,
};
use std::{sync::Arc, time::Duration};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

const MIN_SYNC_BACKOFF: Duration = Duration::from_millis(10);
const MAX_SYNC_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct Config {
    /// How long a request waits for the index to observe its initial state.
    pub sync_timeout: Duration,

    /// Writes retried per quota after a version conflict.
    pub conflict_retries: usize,
}

/// Enforces cluster quotas on namespaced writes.
pub struct Evaluator {
    index: Arc<dyn ScopeIndex>,
    store: Arc<dyn QuotaStore>,
    registry: Registry,
    locks: LockFactory,
    config: Config,
    metrics: QuotaMetrics,
}

/// A quota that must be charged for the current request.
#[derive(Debug)]
struct Charge {
    document: QuotaDocument,
    delta: ResourceList,
}

enum Write {
    /// The quota was charged the given resources.
    Written(ResourceList),
    Vanished,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(10),
            conflict_retries: 3,
        }
    }
}

// === impl Evaluator ===

impl Evaluator {
    pub fn new(
        index: Arc<dyn ScopeIndex>,
        store: Arc<dyn QuotaStore>,
        registry: Registry,
        config: Config,
        metrics: QuotaMetrics,
    ) -> Self {
        Self {
            index,
            store,
            registry,
            locks: LockFactory::default(),
            config,
            metrics,
        }
    }

    pub async fn evaluate(&self, attrs: &Attributes) -> AdmissionResult {
        if attrs.subresource().is_some() {
            return Ok(());
        }
        let Some(namespace) = attrs.namespace() else {
            return Ok(());
        };
        if !matches!(attrs.operation, Operation::Create | Operation::Update) {
            return Ok(());
        }
        let resource = attrs.group_resource();
        if is_ignored(&resource) {
            return Ok(());
        }

        if !self.wait_for_sync().await {
            self.metrics.sync_timeout();
            return Err(AdmissionError::forbidden(
                resource,
                &attrs.name,
                "caches not synchronized",
            ));
        }

        let delta = match self.usage_delta(&resource, attrs) {
            Ok(delta) => delta,
            Err(UsageError::UnsupportedKind(_)) => return Ok(()),
            Err(error) => return Err(AdmissionError::forbidden(resource, &attrs.name, error)),
        };
        if delta.is_empty() {
            return Ok(());
        }

        let names = self.index.documents_for(namespace);
        if names.is_empty() {
            return Ok(());
        }

        let locks = self.locks.lock_all(names).await;
        debug!(quotas = ?locks.names(), %namespace, %resource, "Evaluating");

        let mut charges = Vec::with_capacity(locks.names().len());
        for name in locks.names() {
            let Some(document) = self.fetch(name).await? else {
                continue;
            };
            if let Some(charge) = self.check(&resource, &attrs.name, document, &delta)? {
                charges.push(charge);
            }
        }

        if attrs.dry_run {
            return Ok(());
        }

        let mut written = Vec::with_capacity(charges.len());
        for charge in &charges {
            match self.write(&resource, &attrs.name, namespace, charge).await {
                Ok(Write::Written(delta)) => written.push((charge.document.name.as_str(), delta)),
                Ok(Write::Vanished) => {}
                Err(error) => {
                    self.rollback(namespace, &written).await;
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    async fn wait_for_sync(&self) -> bool {
        let deadline = Instant::now() + self.config.sync_timeout;
        let mut backoff = MIN_SYNC_BACKOFF;
        loop {
            if self.index.has_synced() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_SYNC_BACKOFF);
        }
    }

    fn usage_delta(
        &self,
        resource: &GroupResource,
        attrs: &Attributes,
    ) -> Result<ResourceList, UsageError> {
        let Some(obj) = attrs.object.as_ref() else {
            return Ok(ResourceList::new());
        };
        let new = self.registry.usage_for(resource, obj)?;
        let delta = match (attrs.operation, attrs.old_object.as_ref()) {
            (Operation::Update, Some(old)) => {
                let old = self.registry.usage_for(resource, old)?;
                resources::subtract(&new, &old)
            }
            _ => new,
        };
        Ok(resources::remove_non_positive(delta))
    }

    async fn fetch(&self, name: &str) -> AdmissionResult<Option<QuotaDocument>> {
        match self.store.get(name).await {
            Ok(document) => Ok(Some(document)),
            Err(StoreError::NotFound(_)) => {
                debug!(quota = %name, "Skipping missing quota");
                Ok(None)
            }
            Err(error) => Err(AdmissionError::Internal(error.into())),
        }
    }

    /// Returns the charge for `document`, or `None` when the quota constrains
    /// none of the requested resources.
    fn check(
        &self,
        resource: &GroupResource,
        name: &str,
        document: QuotaDocument,
        delta: &ResourceList,
    ) -> AdmissionResult<Option<Charge>> {
        let delta = resources::mask(delta, document.hard.keys());
        if delta.is_empty() {
            return Ok(None);
        }

        let requested = resources::add(&document.used, &delta);
        let exceeded = resources::exceeded(&requested, &document.hard);
        if !exceeded.is_empty() {
            info!(quota = %document.name, ?exceeded, "Denied");
            return Err(AdmissionError::forbidden(
                resource.clone(),
                name,
                format!(
                    "exceeded quota: {}, requested: {}, used: {}, limited: {}",
                    document.name,
                    Display(&resources::mask(&delta, &exceeded)),
                    Display(&resources::mask(&document.used, &exceeded)),
                    Display(&resources::mask(&document.hard, &exceeded)),
                ),
            ));
        }

        Ok(Some(Charge { document, delta }))
    }

    async fn write(
        &self,
        resource: &GroupResource,
        name: &str,
        namespace: &str,
        charge: &Charge,
    ) -> AdmissionResult<Write> {
        let mut document = charge.document.clone();
        let mut delta = charge.delta.clone();
        let mut attempt = 0;
        loop {
            document.charge(namespace, &delta);
            match self.store.update(&document).await {
                Ok(version) => {
                    debug!(quota = %document.name, %version, "Charged");
                    return Ok(Write::Written(delta));
                }
                Err(StoreError::NotFound(_)) => return Ok(Write::Vanished),
                Err(StoreError::Conflict(_)) if attempt < self.config.conflict_retries => {
                    attempt += 1;
                    self.metrics.conflict_retry();
                    debug!(quota = %document.name, attempt, "Retrying after conflict");
                    let Some(fresh) = self.fetch(&document.name).await? else {
                        return Ok(Write::Vanished);
                    };
                    match self.check(resource, name, fresh, &charge.delta)? {
                        Some(recheck) => {
                            document = recheck.document;
                            delta = recheck.delta;
                        }
                        None => return Ok(Write::Vanished),
                    }
                }
                Err(StoreError::Conflict(_)) => {
                    return Err(AdmissionError::server_timeout(format!(
                        "too many conflicts updating clusterresourcequota {}",
                        document.name
                    )))
                }
                Err(StoreError::Other(error)) => return Err(AdmissionError::Internal(error)),
            }
        }
    }

    /// Reverses charges already written for a request that was ultimately
    /// denied. Failures are logged and otherwise ignored.
    async fn rollback(&self, namespace: &str, written: &[(&str, ResourceList)]) {
        for (name, delta) in written.iter().rev() {
            self.metrics.rollback();
            let mut attempt = 0;
            loop {
                let mut document = match self.store.get(name).await {
                    Ok(document) => document,
                    Err(error) => {
                        warn!(quota = %name, %error, "Failed to roll back quota charge");
                        break;
                    }
                };
                document.refund(namespace, delta);
                match self.store.update(&document).await {
                    Ok(_) => break,
                    Err(StoreError::Conflict(_)) if attempt < self.config.conflict_retries => {
                        attempt += 1;
                    }
                    Err(error) => {
                        warn!(quota = %name, %error, "Failed to roll back quota charge");
                        break;
                    }
                }
            }
        }
    }
}

/// Requests for these resources are admitted without consulting quotas.
fn is_ignored(resource: &GroupResource) -> bool {
    matches!(
        (resource.group.as_str(), resource.resource.as_str()),
        ("", "events")
            | ("events.k8s.io", "events")
            | ("", "namespaces")
            | ("authentication.k8s.io", "tokenreviews")
            | ("authorization.k8s.io", "subjectaccessreviews")
            | ("authorization.k8s.io", "selfsubjectaccessreviews")
            | ("authorization.k8s.io", "localsubjectaccessreviews")
            | ("authorization.k8s.io", "selfsubjectrulesreviews")
            | ("authorization.openshift.io", "subjectaccessreviews")
            | ("authorization.openshift.io", "localsubjectaccessreviews")
            | ("authorization.openshift.io", "resourceaccessreviews")
            | ("authorization.openshift.io", "localresourceaccessreviews")
            | ("authorization.openshift.io", "selfsubjectrulesreviews")
            | ("authorization.openshift.io", "subjectrulesreviews")
    )
}
