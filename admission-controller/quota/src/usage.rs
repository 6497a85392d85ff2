//! Computes the resources an object consumes against a quota.

use ahash::AHashMap as HashMap;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as ApiQuantity;
use openshift_admission_core::{
    resources, GroupResource, Quantity, QuantityError, ResourceList,
};
use openshift_admission_k8s_api::{
    Container, DynamicObject, PersistentVolumeClaimSpec, PodSpec, ServiceSpec,
};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

const STORAGE_CLASS_SUFFIX: &str = ".storageclass.storage.k8s.io/";
const BETA_STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

/// Resources whose usage is measured per object.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    evaluators: HashMap<GroupResource, UsageEvaluator>,
}

/// How usage is computed for one kind of object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageEvaluator {
    Pods,
    Services,
    PersistentVolumeClaims,

    /// Charges `count/<resource>[.<group>]`, and the bare resource name when
    /// `legacy` is set.
    ObjectCount { legacy: bool },
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("no usage evaluator is registered for {0}")]
    UnsupportedKind(GroupResource),

    #[error("failed to decode {resource}: {error}")]
    Decode {
        resource: GroupResource,
        #[source]
        error: serde_json::Error,
    },

    #[error("invalid quantity in {resource}: {error}")]
    Quantity {
        resource: GroupResource,
        #[source]
        error: QuantityError,
    },
}

// === impl Registry ===

impl Registry {
    /// A registry with no evaluators; every kind is unsupported.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The evaluators for core, apps, batch and OpenShift workload kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty()
            .register(GroupResource::core("pods"), UsageEvaluator::Pods)
            .register(GroupResource::core("services"), UsageEvaluator::Services)
            .register(
                GroupResource::core("persistentvolumeclaims"),
                UsageEvaluator::PersistentVolumeClaims,
            );

        for resource in ["configmaps", "secrets", "replicationcontrollers", "resourcequotas"] {
            registry = registry.register(
                GroupResource::core(resource),
                UsageEvaluator::ObjectCount { legacy: true },
            );
        }

        for (group, resource) in [
            ("apps", "deployments"),
            ("apps", "replicasets"),
            ("apps", "statefulsets"),
            ("apps", "daemonsets"),
            ("batch", "jobs"),
            ("batch", "cronjobs"),
            ("apps.openshift.io", "deploymentconfigs"),
            ("build.openshift.io", "buildconfigs"),
            ("image.openshift.io", "imagestreams"),
            ("route.openshift.io", "routes"),
            ("template.openshift.io", "templates"),
        ] {
            registry = registry.register(
                GroupResource::new(group, resource),
                UsageEvaluator::ObjectCount { legacy: false },
            );
        }

        registry
    }

    pub fn register(mut self, resource: GroupResource, evaluator: UsageEvaluator) -> Self {
        self.evaluators.insert(resource, evaluator);
        self
    }

    pub fn handles(&self, resource: &GroupResource) -> bool {
        self.evaluators.contains_key(resource)
    }

    pub fn usage_for(
        &self,
        resource: &GroupResource,
        obj: &DynamicObject,
    ) -> Result<ResourceList, UsageError> {
        let evaluator = self
            .evaluators
            .get(resource)
            .ok_or_else(|| UsageError::UnsupportedKind(resource.clone()))?;
        evaluator.usage(resource, obj)
    }
}

// === impl UsageEvaluator ===

impl UsageEvaluator {
    pub fn usage(
        &self,
        resource: &GroupResource,
        obj: &DynamicObject,
    ) -> Result<ResourceList, UsageError> {
        match self {
            Self::Pods => pod_usage(resource, obj),
            Self::Services => service_usage(resource, obj),
            Self::PersistentVolumeClaims => pvc_usage(resource, obj),
            Self::ObjectCount { legacy } => Ok(object_count(resource, *legacy)),
        }
    }
}

fn count_name(resource: &GroupResource) -> String {
    if resource.group.is_empty() {
        format!("count/{}", resource.resource)
    } else {
        format!("count/{}.{}", resource.resource, resource.group)
    }
}

fn object_count(resource: &GroupResource, legacy: bool) -> ResourceList {
    let mut usage = ResourceList::new();
    usage.insert(count_name(resource), Quantity::from_units(1));
    if legacy {
        usage.insert(resource.resource.clone(), Quantity::from_units(1));
    }
    usage
}

fn decode_spec<T>(resource: &GroupResource, obj: &DynamicObject) -> Result<T, UsageError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match obj.data.get("spec") {
        None | Some(Value::Null) => Ok(T::default()),
        Some(spec) => serde_json::from_value(spec.clone()).map_err(|error| UsageError::Decode {
            resource: resource.clone(),
            error,
        }),
    }
}

fn parse_list(
    resource: &GroupResource,
    list: Option<&BTreeMap<String, ApiQuantity>>,
) -> Result<ResourceList, UsageError> {
    match list {
        None => Ok(ResourceList::new()),
        Some(list) => resources::parse(list).map_err(|error| UsageError::Quantity {
            resource: resource.clone(),
            error,
        }),
    }
}

fn pod_usage(resource: &GroupResource, obj: &DynamicObject) -> Result<ResourceList, UsageError> {
    let mut usage = ResourceList::new();
    usage.insert("count/pods".to_string(), Quantity::from_units(1));

    let phase = obj.data.pointer("/status/phase").and_then(Value::as_str);
    if matches!(phase, Some("Succeeded") | Some("Failed")) {
        return Ok(usage);
    }
    usage.insert("pods".to_string(), Quantity::from_units(1));

    let spec = decode_spec::<PodSpec>(resource, obj)?;
    let overhead = parse_list(resource, spec.overhead.as_ref())?;

    // Overhead is always requested, but only raises limits that are set.
    let requests = pod_total(resource, &spec, |c| {
        c.resources.as_ref().and_then(|r| r.requests.as_ref())
    })?;
    let requests = resources::add(&requests, &overhead);
    let limits = pod_total(resource, &spec, |c| {
        c.resources.as_ref().and_then(|r| r.limits.as_ref())
    })?;
    let limits = resources::add(&limits, &resources::mask(&overhead, limits.keys()));

    for (name, q) in requests {
        match name.as_str() {
            "cpu" | "memory" | "ephemeral-storage" => {
                usage.insert(format!("requests.{name}"), q);
                usage.insert(name, q);
            }
            _ => {
                usage.insert(format!("requests.{name}"), q);
            }
        }
    }
    for (name, q) in limits {
        if matches!(name.as_str(), "cpu" | "memory" | "ephemeral-storage") {
            usage.insert(format!("limits.{name}"), q);
        }
    }

    Ok(usage)
}

/// `max(sum(containers), max(init containers))`, per resource.
fn pod_total<'a>(
    resource: &GroupResource,
    spec: &'a PodSpec,
    get: impl Fn(&'a Container) -> Option<&'a BTreeMap<String, ApiQuantity>>,
) -> Result<ResourceList, UsageError> {
    let mut total = ResourceList::new();
    for c in &spec.containers {
        total = resources::add(&total, &parse_list(resource, get(c))?);
    }

    for c in spec.init_containers.iter().flatten() {
        for (name, q) in parse_list(resource, get(c))? {
            let entry = total.entry(name).or_default();
            *entry = (*entry).max(q);
        }
    }

    Ok(total)
}

fn service_usage(
    resource: &GroupResource,
    obj: &DynamicObject,
) -> Result<ResourceList, UsageError> {
    let spec = decode_spec::<ServiceSpec>(resource, obj)?;
    let ports = spec.ports.as_deref().unwrap_or_default();

    let mut usage = ResourceList::new();
    usage.insert("services".to_string(), Quantity::from_units(1));
    usage.insert("count/services".to_string(), Quantity::from_units(1));

    match spec.type_.as_deref() {
        Some("NodePort") => {
            usage.insert(
                "services.nodeports".to_string(),
                Quantity::from_units(ports.len() as i64),
            );
        }
        Some("LoadBalancer") => {
            usage.insert("services.loadbalancers".to_string(), Quantity::from_units(1));
            let node_ports = if spec.allocate_load_balancer_node_ports == Some(false) {
                ports.iter().filter(|p| p.node_port.is_some()).count()
            } else {
                ports.len()
            };
            usage.insert(
                "services.nodeports".to_string(),
                Quantity::from_units(node_ports as i64),
            );
        }
        _ => {}
    }

    Ok(usage)
}

fn pvc_usage(resource: &GroupResource, obj: &DynamicObject) -> Result<ResourceList, UsageError> {
    let spec = decode_spec::<PersistentVolumeClaimSpec>(resource, obj)?;

    let mut usage = ResourceList::new();
    usage.insert("persistentvolumeclaims".to_string(), Quantity::from_units(1));
    usage.insert(
        "count/persistentvolumeclaims".to_string(),
        Quantity::from_units(1),
    );

    let requests = parse_list(
        resource,
        spec.resources.as_ref().and_then(|r| r.requests.as_ref()),
    )?;
    let storage = requests.get("storage").copied();
    if let Some(storage) = storage {
        usage.insert("requests.storage".to_string(), storage);
    }

    let class = spec.storage_class_name.clone().or_else(|| {
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BETA_STORAGE_CLASS_ANNOTATION).cloned())
    });
    if let Some(class) = class.filter(|c| !c.is_empty()) {
        usage.insert(
            format!("{class}{STORAGE_CLASS_SUFFIX}persistentvolumeclaims"),
            Quantity::from_units(1),
        );
        if let Some(storage) = storage {
            usage.insert(format!("{class}{STORAGE_CLASS_SUFFIX}requests.storage"), storage);
        }
    }

    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openshift_admission_k8s_api::ObjectMeta;
    use serde_json::json;

    fn obj(data: Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("obj".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data,
        }
    }

    fn list(entries: &[(&str, &str)]) -> ResourceList {
        entries
            .iter()
            .map(|(n, q)| (n.to_string(), q.parse::<Quantity>().unwrap()))
            .collect()
    }

    #[test]
    fn unsupported_kind() {
        let registry = Registry::with_defaults();
        let err = registry
            .usage_for(&GroupResource::new("example.com", "widgets"), &obj(json!({})))
            .unwrap_err();
        assert!(matches!(err, UsageError::UnsupportedKind(_)));
    }

    #[test]
    fn pod_requests_and_limits() {
        let registry = Registry::with_defaults();
        let pod = obj(json!({
            "spec": {
                "containers": [
                    {
                        "name": "a",
                        "resources": {
                            "requests": { "cpu": "100m", "memory": "64Mi" },
                            "limits": { "cpu": "200m" },
                        },
                    },
                    {
                        "name": "b",
                        "resources": {
                            "requests": { "cpu": "150m", "example.com/gpu": "1" },
                        },
                    },
                ],
                "initContainers": [
                    {
                        "name": "init",
                        "resources": { "requests": { "cpu": "1" } },
                    },
                ],
                "overhead": { "cpu": "10m" },
            },
        }));

        let usage = registry
            .usage_for(&GroupResource::core("pods"), &pod)
            .unwrap();
        assert_eq!(
            usage,
            list(&[
                ("count/pods", "1"),
                ("cpu", "1010m"),
                ("limits.cpu", "210m"),
                ("memory", "64Mi"),
                ("pods", "1"),
                ("requests.cpu", "1010m"),
                ("requests.example.com/gpu", "1"),
                ("requests.memory", "64Mi"),
            ])
        );
    }

    #[test]
    fn pod_overhead_is_requested_without_container_requests() {
        let pod = obj(json!({
            "spec": {
                "containers": [
                    {
                        "name": "a",
                        "resources": {
                            "requests": { "cpu": "100m" },
                            "limits": { "cpu": "100m" },
                        },
                    },
                ],
                "overhead": { "cpu": "10m", "memory": "120Mi" },
            },
        }));

        let usage = UsageEvaluator::Pods
            .usage(&GroupResource::core("pods"), &pod)
            .unwrap();
        assert_eq!(
            usage,
            list(&[
                ("count/pods", "1"),
                ("cpu", "110m"),
                ("limits.cpu", "110m"),
                ("memory", "120Mi"),
                ("pods", "1"),
                ("requests.cpu", "110m"),
                ("requests.memory", "120Mi"),
            ])
        );
    }

    #[test]
    fn terminal_pods_only_count() {
        let pod = obj(json!({
            "spec": { "containers": [{ "name": "a" }] },
            "status": { "phase": "Succeeded" },
        }));
        let usage = UsageEvaluator::Pods
            .usage(&GroupResource::core("pods"), &pod)
            .unwrap();
        assert_eq!(usage, list(&[("count/pods", "1")]));
    }

    #[test]
    fn invalid_quantity() {
        let pod = obj(json!({
            "spec": {
                "containers": [{
                    "name": "a",
                    "resources": { "requests": { "cpu": "lots" } },
                }],
            },
        }));
        let err = UsageEvaluator::Pods
            .usage(&GroupResource::core("pods"), &pod)
            .unwrap_err();
        assert!(matches!(err, UsageError::Quantity { .. }));
    }

    #[test]
    fn service_node_ports() {
        let svc = obj(json!({
            "spec": {
                "type": "LoadBalancer",
                "ports": [{ "port": 80 }, { "port": 443 }],
            },
        }));
        let usage = UsageEvaluator::Services
            .usage(&GroupResource::core("services"), &svc)
            .unwrap();
        assert_eq!(
            usage,
            list(&[
                ("count/services", "1"),
                ("services", "1"),
                ("services.loadbalancers", "1"),
                ("services.nodeports", "2"),
            ])
        );

        let svc = obj(json!({ "spec": { "type": "ClusterIP", "ports": [{ "port": 80 }] } }));
        let usage = UsageEvaluator::Services
            .usage(&GroupResource::core("services"), &svc)
            .unwrap();
        assert_eq!(usage, list(&[("count/services", "1"), ("services", "1")]));
    }

    #[test]
    fn pvc_storage_class() {
        let pvc = obj(json!({
            "spec": {
                "storageClassName": "gold",
                "resources": { "requests": { "storage": "10Gi" } },
            },
        }));
        let usage = UsageEvaluator::PersistentVolumeClaims
            .usage(&GroupResource::core("persistentvolumeclaims"), &pvc)
            .unwrap();
        assert_eq!(
            usage,
            list(&[
                ("count/persistentvolumeclaims", "1"),
                ("gold.storageclass.storage.k8s.io/persistentvolumeclaims", "1"),
                ("gold.storageclass.storage.k8s.io/requests.storage", "10Gi"),
                ("persistentvolumeclaims", "1"),
                ("requests.storage", "10Gi"),
            ])
        );
    }

    #[test]
    fn object_counts() {
        let registry = Registry::with_defaults();
        assert_eq!(
            registry
                .usage_for(&GroupResource::core("secrets"), &obj(json!({})))
                .unwrap(),
            list(&[("count/secrets", "1"), ("secrets", "1")])
        );
        assert_eq!(
            registry
                .usage_for(&GroupResource::new("apps", "deployments"), &obj(json!({})))
                .unwrap(),
            list(&[("count/deployments.apps", "1")])
        );
    }
}
