#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod image;
pub mod labels;
pub mod quota;

pub use self::quota::{ClusterResourceQuota, ClusterResourceQuotaSpec, ClusterResourceQuotaStatus};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Container, Namespace, PersistentVolumeClaimSpec, Pod, PodSpec, ResourceQuotaSpec,
            ResourceQuotaStatus, ServiceSpec,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
};
pub use kube::{
    api::{Api, ObjectMeta, PostParams, ResourceExt},
    core::{ApiResource, DynamicObject, GroupVersionKind, GroupVersionResource},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource,
};
