use crate::{
    imagepolicy::ImageStore,
    k8s::{
        self,
        image::{self, Image, ImageStream, ImageStreamImage, ImageStreamTag},
        quota::ResourceQuotaStatusByNamespace,
        Api, ApiResource, Client, ClusterResourceQuota, ClusterResourceQuotaStatus, DynamicObject,
        ResourceQuotaStatus,
    },
    quota::{QuotaDocument, QuotaStore, StoreError},
};
use anyhow::Context;
use kube::api::{Patch, PatchParams};
use openshift_admission_core::resources;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Reads and charges `ClusterResourceQuota`s through the API server.
///
/// Writes carry the document's `resourceVersion` as a precondition, so a
/// quota modified since it was read fails with `Conflict`.
#[derive(Clone)]
pub struct KubeQuotaStore {
    api: Api<ClusterResourceQuota>,
}

/// Fetches images and image streams through the API server.
#[derive(Clone)]
pub struct KubeImageStore {
    client: Client,
}

// === impl KubeQuotaStore ===

impl KubeQuotaStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait::async_trait]
impl QuotaStore for KubeQuotaStore {
    async fn get(&self, name: &str) -> Result<QuotaDocument, StoreError> {
        let quota = self
            .api
            .get(name)
            .await
            .map_err(|error| store_error(name, error))?;
        to_document(quota)
    }

    async fn update(&self, document: &QuotaDocument) -> Result<String, StoreError> {
        let status = to_status(document);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": document.version },
            "status": status,
        });

        let updated = self
            .api
            .patch_status(&document.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|error| store_error(&document.name, error))?;
        let version = updated.metadata.resource_version.unwrap_or_default();
        debug!(quota = %document.name, %version, "Updated status");
        Ok(version)
    }
}

fn to_document(quota: ClusterResourceQuota) -> Result<QuotaDocument, StoreError> {
    let name = quota.metadata.name.clone().unwrap_or_default();
    let hard = quota.spec.quota.hard.unwrap_or_default();
    let hard = resources::parse(&hard).with_context(|| format!("quota {name:?} hard limits"))?;

    let mut document = QuotaDocument::new(name, hard)
        .with_version(quota.metadata.resource_version.unwrap_or_default());

    if let Some(status) = quota.status {
        document.used = resources::parse(&status.total.used.unwrap_or_default())
            .with_context(|| format!("quota {:?} usage", document.name))?;
        for ns in status.namespaces {
            let used = resources::parse(&ns.status.used.unwrap_or_default())
                .with_context(|| format!("quota {:?} usage in {}", document.name, ns.namespace))?;
            document.namespace_used.insert(ns.namespace, used);
        }
    }

    Ok(document)
}

fn to_status(document: &QuotaDocument) -> ClusterResourceQuotaStatus {
    let hard = resources::to_k8s(&document.hard);
    ClusterResourceQuotaStatus {
        total: ResourceQuotaStatus {
            hard: Some(hard.clone()),
            used: Some(resources::to_k8s(&document.used)),
        },
        namespaces: document
            .namespace_used
            .iter()
            .map(|(namespace, used)| ResourceQuotaStatusByNamespace {
                namespace: namespace.clone(),
                status: ResourceQuotaStatus {
                    hard: Some(hard.clone()),
                    used: Some(resources::to_k8s(used)),
                },
            })
            .collect(),
    }
}

fn store_error(name: &str, error: k8s::Error) -> StoreError {
    match error {
        k8s::Error::Api(rsp) if rsp.code == 404 => StoreError::NotFound(name.to_string()),
        k8s::Error::Api(rsp) if rsp.code == 409 => StoreError::Conflict(name.to_string()),
        error => StoreError::Other(error.into()),
    }
}

// === impl KubeImageStore ===

impl KubeImageStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        resource: ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> anyhow::Result<Option<T>> {
        let api = match namespace {
            Some(ns) => Api::<DynamicObject>::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::<DynamicObject>::all_with(self.client.clone(), &resource),
        };
        let Some(obj) = api
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get {} {name:?}", resource.plural))?
        else {
            return Ok(None);
        };
        let decoded = image::decode(obj)
            .with_context(|| format!("failed to decode {} {name:?}", resource.plural))?;
        Ok(Some(decoded))
    }
}

#[async_trait::async_trait]
impl ImageStore for KubeImageStore {
    async fn image(&self, name: &str) -> anyhow::Result<Option<Image>> {
        self.get(image::images(), None, name).await
    }

    async fn image_stream(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<ImageStream>> {
        self.get(image::image_streams(), Some(namespace), name)
            .await
    }

    async fn image_stream_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> anyhow::Result<Option<ImageStreamTag>> {
        let name = format!("{stream}:{tag}");
        self.get(image::image_stream_tags(), Some(namespace), &name)
            .await
    }

    async fn image_stream_image(
        &self,
        namespace: &str,
        stream: &str,
        digest: &str,
    ) -> anyhow::Result<Option<ImageStreamImage>> {
        let name = format!("{stream}@{digest}");
        self.get(image::image_stream_images(), Some(namespace), &name)
            .await
    }
}
