//! Read-only views of the `image.openshift.io/v1` API.
//!
//! These resources are served by the OpenShift API server rather than as
//! custom resources, so they are fetched as `DynamicObject`s and decoded into
//! the fields the image policy needs.

use kube::{
    api::ObjectMeta,
    core::{ApiResource, DynamicObject},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const GROUP: &str = "image.openshift.io";
pub const VERSION: &str = "v1";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub docker_image_reference: String,
    #[serde(default)]
    pub docker_image_metadata: Option<DockerImageMetadata>,
    #[serde(default)]
    pub docker_image_layers: Vec<ImageLayer>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DockerImageMetadata {
    #[serde(rename = "Config", default)]
    pub config: Option<DockerConfig>,
    #[serde(rename = "Size", default)]
    pub size: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DockerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLayer {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub media_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamTag {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub lookup_policy: LookupPolicy,
    pub image: Image,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamImage {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub image: Image,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStream {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ImageStreamSpec,
    #[serde(default)]
    pub status: ImageStreamStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamSpec {
    #[serde(default)]
    pub lookup_policy: LookupPolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamStatus {
    #[serde(default)]
    pub docker_image_repository: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct LookupPolicy {
    #[serde(default)]
    pub local: bool,
}

pub fn images() -> ApiResource {
    api_resource("Image", "images")
}

pub fn image_streams() -> ApiResource {
    api_resource("ImageStream", "imagestreams")
}

pub fn image_stream_tags() -> ApiResource {
    api_resource("ImageStreamTag", "imagestreamtags")
}

pub fn image_stream_images() -> ApiResource {
    api_resource("ImageStreamImage", "imagestreamimages")
}

fn api_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        api_version: format!("{GROUP}/{VERSION}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Decodes a dynamic object into one of the typed views above.
pub fn decode<T: serde::de::DeserializeOwned>(obj: DynamicObject) -> serde_json::Result<T> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

// === impl Image ===

impl Image {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn docker_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.docker_image_metadata
            .as_ref()?
            .config
            .as_ref()?
            .labels
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_image_stream_tag() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "ImageStreamTag",
            "metadata": { "name": "mysql:latest", "namespace": "repo" },
            "lookupPolicy": { "local": true },
            "image": {
                "metadata": {
                    "name": "sha256:0001",
                    "annotations": { "images.openshift.io/deny-execution": "true" },
                },
                "dockerImageReference": "registry.local/repo/mysql@sha256:0001",
                "dockerImageMetadata": {
                    "Config": { "Labels": { "vendor": "acme" } },
                    "Size": 1024,
                },
                "dockerImageLayers": [
                    { "name": "sha256:layer", "size": 512, "mediaType": "application/x" },
                ],
            },
        }))
        .unwrap();

        let tag: ImageStreamTag = decode(obj).unwrap();
        assert!(tag.lookup_policy.local);
        assert_eq!(tag.image.name(), "sha256:0001");
        assert_eq!(
            tag.image.docker_labels().and_then(|l| l.get("vendor")),
            Some(&"acme".to_string())
        );
        assert_eq!(tag.image.docker_image_layers.len(), 1);
    }
}
