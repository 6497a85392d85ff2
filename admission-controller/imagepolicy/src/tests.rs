use super::*;
use maplit::btreemap;
use openshift_admission_core::{
    AdmissionError, Attributes, MutationInterface, NamespaceLister, Operation,
    ValidationInterface,
};
use openshift_admission_k8s_api::{
    image::{Image, ImageStream, ImageStreamImage, ImageStreamTag, LookupPolicy},
    DynamicObject, GroupVersionKind, GroupVersionResource, ObjectMeta,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

const DIGEST: &str = "sha256:4bbf4b2a4a6e4f8b0d6b3c1f5e7a9c2d8e0f1a3b5c7d9e1f2a4b6c8d0e2f4a6b";
const REGISTRY: &str = "registry.local:5000";

#[derive(Default)]
struct FakeImages {
    images: Mutex<HashMap<String, Image>>,
    streams: Mutex<HashMap<(String, String), ImageStream>>,
    tags: Mutex<HashMap<(String, String, String), ImageStreamTag>>,
    image_fetches: AtomicUsize,
}

#[derive(Default)]
struct FakeNamespaces(Mutex<HashMap<String, BTreeMap<String, String>>>);

#[async_trait::async_trait]
impl ImageStore for FakeImages {
    async fn image(&self, name: &str) -> anyhow::Result<Option<Image>> {
        self.image_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.images.lock().get(name).cloned())
    }

    async fn image_stream(&self, namespace: &str, name: &str) -> anyhow::Result<Option<ImageStream>> {
        Ok(self
            .streams
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn image_stream_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> anyhow::Result<Option<ImageStreamTag>> {
        Ok(self
            .tags
            .lock()
            .get(&(namespace.to_string(), stream.to_string(), tag.to_string()))
            .cloned())
    }

    async fn image_stream_image(
        &self,
        _namespace: &str,
        _stream: &str,
        digest: &str,
    ) -> anyhow::Result<Option<ImageStreamImage>> {
        Ok(self.images.lock().get(digest).cloned().map(|image| ImageStreamImage {
            metadata: ObjectMeta::default(),
            image,
        }))
    }
}

impl NamespaceLister for FakeNamespaces {
    fn annotations(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.0.lock().get(namespace).cloned()
    }
}

struct Fixture {
    images: Arc<FakeImages>,
    namespaces: Arc<FakeNamespaces>,
    metrics: ImageCacheMetrics,
    plugin: ImagePolicyPlugin,
}

impl Fixture {
    fn new(config: ImagePolicyConfig) -> Self {
        let images = Arc::new(FakeImages::default());
        let namespaces = Arc::new(FakeNamespaces::default());
        let metrics = ImageCacheMetrics::default();
        let resolver = ImageResolver::new(
            images.clone(),
            RegistryMatcher::new([REGISTRY]),
            ResolverConfig::default(),
            metrics.clone(),
        );
        let plugin = ImagePolicyPlugin::new(
            config,
            RegistryMatcher::new([REGISTRY]),
            resolver,
            namespaces.clone(),
        );
        Self {
            images,
            namespaces,
            metrics,
            plugin,
        }
    }

    fn image(&self, digest: &str, reference: &str, annotations: BTreeMap<String, String>) {
        let image = Image {
            metadata: ObjectMeta {
                name: Some(digest.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            docker_image_reference: reference.to_string(),
            ..Default::default()
        };
        self.images.images.lock().insert(digest.to_string(), image);
    }

    fn tag(&self, namespace: &str, stream: &str, tag: &str, digest: &str, local: bool) {
        let image = self.images.images.lock().get(digest).cloned().unwrap();
        self.images.tags.lock().insert(
            (namespace.to_string(), stream.to_string(), tag.to_string()),
            ImageStreamTag {
                metadata: ObjectMeta::default(),
                lookup_policy: LookupPolicy { local },
                image,
            },
        );
    }

    fn stream(&self, namespace: &str, name: &str, repository: &str, local: bool) {
        let mut stream = ImageStream::default();
        stream.spec.lookup_policy.local = local;
        stream.status.docker_image_repository = repository.to_string();
        self.images
            .streams
            .lock()
            .insert((namespace.to_string(), name.to_string()), stream);
    }
}

fn pod(images: &[&str]) -> Attributes {
    let containers = images
        .iter()
        .enumerate()
        .map(|(i, image)| json!({ "name": format!("c{i}"), "image": image }))
        .collect::<Vec<_>>();
    let obj: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": "pod", "namespace": "ns" },
        "spec": { "containers": containers },
    }))
    .unwrap();
    Attributes::new(
        GroupVersionResource::gvr("", "v1", "pods"),
        GroupVersionKind::gvk("", "v1", "Pod"),
        Operation::Create,
    )
    .with_name("pod")
    .with_namespace("ns")
    .with_object(obj)
}

fn image_of(attrs: &Attributes, i: usize) -> &Value {
    &attrs.object.as_ref().unwrap().data["spec"]["containers"][i]["image"]
}

fn deny_execution() -> BTreeMap<String, String> {
    btreemap! { config::DENY_EXECUTION_ANNOTATION.to_string() => "true".to_string() }
}

fn required() -> ImagePolicyConfig {
    ImagePolicyConfig::from_yaml("resolveImages: Required").unwrap()
}

#[tokio::test(start_paused = true)]
async fn cached_images_expire_after_ttl() {
    let fx = Fixture::new(ImagePolicyConfig::default_policy());
    let spec = format!("quay.io/ns/app@{DIGEST}");
    fx.image(DIGEST, &spec, btreemap! {});

    let mut attrs = pod(&[&spec]);
    fx.plugin.admit(&mut attrs).await.expect("t=0 must admit");
    assert_eq!(fx.metrics.misses(), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    fx.image(DIGEST, &spec, deny_execution());
    let mut attrs = pod(&[&spec]);
    fx.plugin
        .admit(&mut attrs)
        .await
        .expect("a live entry must be served from the cache");
    assert_eq!(fx.metrics.hits(), 1);
    assert_eq!(fx.images.image_fetches.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let mut attrs = pod(&[&spec]);
    let err = fx
        .plugin
        .admit(&mut attrs)
        .await
        .expect_err("an expired entry must be refetched");
    assert_eq!(fx.metrics.misses(), 2);
    assert!(err.is_invalid());
    assert_eq!(
        err.to_string(),
        "Pod \"pod\" is invalid: spec.containers[0].image: Forbidden: this image is prohibited by policy"
    );
}

#[tokio::test]
async fn references_are_resolved_once_per_request() {
    let fx = Fixture::new(ImagePolicyConfig::default_policy());
    let spec = format!("quay.io/ns/app@{DIGEST}");
    fx.image(DIGEST, &spec, deny_execution());

    let mut attrs = pod(&[&spec, &spec]);
    let err = fx.plugin.admit(&mut attrs).await.unwrap_err();
    assert_eq!(fx.images.image_fetches.load(Ordering::SeqCst), 1);
    let AdmissionError::Invalid { errors, .. } = err else {
        panic!("expected an invalid error");
    };
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[1].field, "spec.containers[1].image");
}

#[tokio::test]
async fn local_names_are_rewritten_on_admit() {
    let fx = Fixture::new(ImagePolicyConfig::default_policy());
    let pinned = format!("{REGISTRY}/ns/mysql@{DIGEST}");
    fx.image(DIGEST, &pinned, btreemap! {});
    fx.tag("ns", "mysql", "latest", DIGEST, true);

    let mut attrs = pod(&["mysql", "quay.io/other/app:v1"]);
    fx.plugin.admit(&mut attrs).await.expect("must admit");
    assert_eq!(*image_of(&attrs, 0), json!(pinned));
    assert_eq!(*image_of(&attrs, 1), json!("quay.io/other/app:v1"));

    // The admitted object no longer changes under the policy.
    fx.plugin.validate(&attrs).await.expect("must validate");
}

#[tokio::test]
async fn validation_rejects_changes_after_admission() {
    let fx = Fixture::new(ImagePolicyConfig::default_policy());
    fx.image(DIGEST, &format!("{REGISTRY}/ns/mysql@{DIGEST}"), btreemap! {});
    fx.tag("ns", "mysql", "latest", DIGEST, true);

    let attrs = pod(&["mysql"]);
    let err = fx.plugin.validate(&attrs).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Pod \"pod\" is invalid: spec.containers[0].image: Forbidden: this image is prohibited by policy (changed after admission)"
    );
    assert_eq!(*image_of(&attrs, 0), json!("mysql"));
}

#[tokio::test]
async fn missing_tag_in_local_stream_uses_stream_repository() {
    let fx = Fixture::new(required());
    fx.stream("ns", "ruby", &format!("{REGISTRY}/ns/ruby"), true);

    let mut attrs = pod(&["ruby:2.7"]);
    fx.plugin.admit(&mut attrs).await.expect("must admit");
    assert_eq!(*image_of(&attrs, 0), json!(format!("{REGISTRY}/ns/ruby:2.7")));
}

#[tokio::test]
async fn missing_tag_in_remote_stream_fails() {
    let fx = Fixture::new(required());
    fx.stream("ns", "python", &format!("{REGISTRY}/ns/python"), false);

    let mut attrs = pod(&["python:3"]);
    let err = fx.plugin.admit(&mut attrs).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Pod \"pod\" is invalid: spec.containers[0].image: Forbidden: imagestreamtags \"python:3\" not found"
    );
    assert_eq!(*image_of(&attrs, 0), json!("python:3"));
}

#[tokio::test]
async fn remote_tags_are_not_resolved_as_local_names() {
    let fx = Fixture::new(required());
    fx.image(DIGEST, &format!("{REGISTRY}/ns/mysql@{DIGEST}"), btreemap! {});
    fx.tag("ns", "mysql", "latest", DIGEST, false);

    let mut attrs = pod(&["mysql"]);
    let err = fx.plugin.admit(&mut attrs).await.unwrap_err();
    assert!(err
        .to_string()
        .ends_with("ImageStreamTag does not allow local references and the resource did not request image stream resolution"));

    // Unless the pod asks for every name to be resolved locally.
    let mut attrs = pod(&["mysql"]);
    attrs
        .object
        .as_mut()
        .unwrap()
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(RESOLVE_NAMES_ANNOTATION.to_string(), "*".to_string());
    fx.plugin.admit(&mut attrs).await.expect("must admit");
    assert_eq!(
        *image_of(&attrs, 0),
        json!(format!("{REGISTRY}/ns/mysql@{DIGEST}"))
    );
}

#[tokio::test]
async fn unresolvable_references_fall_through_unless_required() {
    let fx = Fixture::new(ImagePolicyConfig::default_policy());
    let mut attrs = pod(&["quay.io/ns/app:v1"]);
    fx.plugin.admit(&mut attrs).await.expect("must admit");

    let fx = Fixture::new(required());
    let mut attrs = pod(&["quay.io/ns/app:v1"]);
    let err = fx.plugin.admit(&mut attrs).await.unwrap_err();
    assert!(err
        .to_string()
        .ends_with("(quay.io/ns/app:v1) could not be resolved to an exact image reference"));
}

#[tokio::test]
async fn rejects_registries() {
    let fx = Fixture::new(
        ImagePolicyConfig::from_yaml(
            r#"
executionRules:
- name: reject-hub
  reject: true
  matchRegistries: ["docker.io"]
"#,
        )
        .unwrap(),
    );

    let mut attrs = pod(&["quay.io/ns/app:v1", "docker.io/library/nginx:1"]);
    let err = fx.plugin.admit(&mut attrs).await.unwrap_err();
    let AdmissionError::Invalid { errors, .. } = &err else {
        panic!("expected an invalid error");
    };
    assert_eq!(errors.len(), 1);
    assert!(err.to_string().starts_with(
        "Pod \"pod\" is invalid: spec.containers[1].image: Forbidden: this image is prohibited by policy"
    ));

    // The namespace may opt out of the rule.
    fx.namespaces.0.lock().insert(
        "ns".to_string(),
        btreemap! { IGNORE_RULES_ANNOTATION.to_string() => "other,reject-hub".to_string() },
    );
    let mut attrs = pod(&["quay.io/ns/app:v1", "docker.io/library/nginx:1"]);
    fx.plugin.admit(&mut attrs).await.expect("must admit");
}

#[tokio::test]
async fn rejections_after_failed_resolution_carry_the_cause() {
    let fx = Fixture::new(
        ImagePolicyConfig::from_yaml(
            r#"
resolveImages: Attempt
executionRules:
- name: reject-hub
  reject: true
  matchRegistries: ["docker.io"]
"#,
        )
        .unwrap(),
    );

    let mut attrs = pod(&["docker.io/library/nginx:1"]);
    let err = fx.plugin.admit(&mut attrs).await.unwrap_err();
    let AdmissionError::Invalid { errors, .. } = err else {
        panic!("expected an invalid error");
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field, "spec.containers[0].image");
    let detail = &errors[0].detail;
    assert!(
        detail.contains("this image is prohibited by policy: ("),
        "unexpected detail: {detail}"
    );
    assert!(detail.ends_with("could not be resolved to an exact image reference"));

    // A resolved image that is rejected reports the policy alone.
    let spec = format!("docker.io/library/nginx@{DIGEST}");
    fx.image(DIGEST, &spec, btreemap! {});
    let mut attrs = pod(&[&spec]);
    let err = fx.plugin.admit(&mut attrs).await.unwrap_err();
    assert!(err
        .to_string()
        .ends_with("Forbidden: this image is prohibited by policy"));
}

#[tokio::test]
async fn covered_kinds_without_images_are_forbidden() {
    let fx = Fixture::new(
        ImagePolicyConfig::from_yaml(
            r#"
executionRules:
- name: services
  reject: true
  onResources: [{resource: services}]
"#,
        )
        .unwrap(),
    );

    let obj: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "svc", "namespace": "ns" },
        "spec": {},
    }))
    .unwrap();
    let mut attrs = Attributes::new(
        GroupVersionResource::gvr("", "v1", "services"),
        GroupVersionKind::gvk("", "v1", "Service"),
        Operation::Create,
    )
    .with_name("svc")
    .with_namespace("ns")
    .with_object(obj);

    let err = fx.plugin.admit(&mut attrs).await.unwrap_err();
    assert!(err.is_forbidden());
    assert_eq!(
        err.to_string(),
        "services \"svc\" is forbidden: unable to apply image policy against objects of type Service: No list of images available for this object"
    );
}

#[tokio::test]
async fn uncovered_kinds_and_subresources_are_ignored() {
    let fx = Fixture::new(required());

    let obj: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "cm", "namespace": "ns" },
    }))
    .unwrap();
    let mut attrs = Attributes::new(
        GroupVersionResource::gvr("", "v1", "configmaps"),
        GroupVersionKind::gvk("", "v1", "ConfigMap"),
        Operation::Create,
    )
    .with_object(obj);
    fx.plugin.admit(&mut attrs).await.expect("must admit");

    let mut attrs = pod(&["quay.io/ns/app:v1"]).with_subresource("status");
    fx.plugin.admit(&mut attrs).await.expect("must admit");
}

#[tokio::test]
async fn rewrites_build_references() {
    let fx = Fixture::new(ImagePolicyConfig::from_yaml("resolveImages: AttemptRewrite").unwrap());
    let pinned = format!("{REGISTRY}/openshift/ruby@{DIGEST}");
    fx.image(DIGEST, &pinned, btreemap! {});
    fx.tag("openshift", "ruby", "2.7", DIGEST, false);

    let obj: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "build.openshift.io/v1",
        "kind": "Build",
        "metadata": { "name": "build-1", "namespace": "ns" },
        "spec": { "strategy": { "sourceStrategy": { "from": {
            "kind": "ImageStreamTag", "namespace": "openshift", "name": "ruby:2.7",
        }}}},
    }))
    .unwrap();
    let mut attrs = Attributes::new(
        GroupVersionResource::gvr("build.openshift.io", "v1", "builds"),
        GroupVersionKind::gvk("build.openshift.io", "v1", "Build"),
        Operation::Create,
    )
    .with_name("build-1")
    .with_namespace("ns")
    .with_object(obj);

    fx.plugin.admit(&mut attrs).await.expect("must admit");
    assert_eq!(
        attrs.object.as_ref().unwrap().data["spec"]["strategy"]["sourceStrategy"]["from"],
        json!({ "kind": "DockerImage", "name": pinned })
    );

    let mut attrs = attrs.clone();
    attrs.operation = Operation::Update;
    fx.plugin.validate(&attrs).await.expect("pinned references are stable");
}
