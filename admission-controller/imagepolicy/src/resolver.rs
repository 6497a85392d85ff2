//! Resolves image references to immutable image records.

use crate::{
    reference::{DockerImageReference, ReferenceError},
    rules::{ImagePolicyAttributes, RegistryMatcher},
};
use lru::LruCache;
use openshift_admission_k8s_api::image::{Image, ImageStream, ImageStreamImage, ImageStreamTag};
use parking_lot::Mutex;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{num::NonZeroUsize, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const DOCKER_IMAGE: &str = "DockerImage";
pub const IMAGE_STREAM_TAG: &str = "ImageStreamTag";
pub const IMAGE_STREAM_IMAGE: &str = "ImageStreamImage";

const DEFAULT_TAG: &str = "latest";

/// Read access to the image API. Lookups return `Ok(None)` when the object
/// does not exist.
#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    async fn image(&self, name: &str) -> anyhow::Result<Option<Image>>;

    async fn image_stream(&self, namespace: &str, name: &str)
        -> anyhow::Result<Option<ImageStream>>;

    async fn image_stream_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> anyhow::Result<Option<ImageStreamTag>>;

    async fn image_stream_image(
        &self,
        namespace: &str,
        stream: &str,
        digest: &str,
    ) -> anyhow::Result<Option<ImageStreamImage>>;
}

/// A reference to an image as it appears in an object, e.g. a container's
/// `image` field or a build's `from`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error("({0}) could not be resolved to an exact image reference")]
    NotResolvable(String),

    #[error("references of kind ImageStreamTag must be of the form NAME:TAG")]
    InvalidImageStreamTag,

    #[error("references of kind ImageStreamImage must be of the form NAME@DIGEST")]
    InvalidImageStreamImage,

    #[error("image policy does not allow image references of kind {0:?}")]
    UnsupportedKind(String),

    #[error("ImageStreamTag does not allow local references and the resource did not request image stream resolution")]
    LocalReferencesNotAllowed,

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("image reference {reference} could not be parsed: {source}")]
    InvalidImage {
        reference: String,
        source: ReferenceError,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct ResolverConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct ImageCacheMetrics {
    hits: Counter,
    misses: Counter,
}

/// Resolves references, caching images by digest.
///
/// Entries are replaced wholesale and expire lazily. Concurrent misses for the
/// same digest may both fetch; the last write wins.
pub struct ImageResolver {
    store: Arc<dyn ImageStore>,
    integrated: RegistryMatcher,
    ttl: Duration,
    cache: Mutex<LruCache<String, CacheEntry>>,
    metrics: ImageCacheMetrics,
}

struct CacheEntry {
    expires: Instant,
    image: Arc<Image>,
}

// === impl ObjectReference ===

impl ObjectReference {
    pub fn docker_image(name: impl Into<String>) -> Self {
        Self {
            kind: DOCKER_IMAGE.to_string(),
            namespace: String::new(),
            name: name.into(),
        }
    }
}

// === impl ResolverConfig ===

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            ttl: Duration::from_secs(60),
        }
    }
}

// === impl ImageCacheMetrics ===

impl ImageCacheMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "hits",
            "Image lookups answered from the resolver cache",
            metrics.hits.clone(),
        );
        reg.register(
            "misses",
            "Image lookups that required a fetch from the API",
            metrics.misses.clone(),
        );
        metrics
    }

    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    pub fn misses(&self) -> u64 {
        self.misses.get()
    }
}

// === impl ImageResolver ===

impl ImageResolver {
    pub fn new(
        store: Arc<dyn ImageStore>,
        integrated: RegistryMatcher,
        config: ResolverConfig,
        metrics: ImageCacheMetrics,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            integrated,
            ttl: config.ttl,
            cache: Mutex::new(LruCache::new(capacity)),
            metrics,
        }
    }

    /// Resolves a reference found in an object.
    ///
    /// Any kind other than `DockerImage`, `ImageStreamTag` and
    /// `ImageStreamImage` fails, so that unrecognized references can't bypass
    /// the policy.
    pub async fn resolve(
        &self,
        reference: &ObjectReference,
        default_namespace: &str,
        force_local: bool,
    ) -> Result<ImagePolicyAttributes, ResolveError> {
        let namespace = if reference.namespace.is_empty() {
            default_namespace
        } else {
            reference.namespace.as_str()
        };

        match reference.kind.as_str() {
            IMAGE_STREAM_TAG => {
                let (stream, tag) = reference
                    .name
                    .split_once(':')
                    .ok_or(ResolveError::InvalidImageStreamTag)?;
                let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };
                self.resolve_image_stream_tag(namespace, stream, tag, false, false)
                    .await
            }

            IMAGE_STREAM_IMAGE => {
                let (stream, digest) = reference
                    .name
                    .split_once('@')
                    .ok_or(ResolveError::InvalidImageStreamImage)?;
                self.resolve_image_stream_image(namespace, stream, digest)
                    .await
            }

            DOCKER_IMAGE => {
                let name = DockerImageReference::parse(&reference.name)?;
                self.resolve_docker_image(name, default_namespace, force_local)
                    .await
            }

            kind => Err(ResolveError::UnsupportedKind(kind.to_string())),
        }
    }

    async fn resolve_docker_image(
        &self,
        mut name: DockerImageReference,
        default_namespace: &str,
        force_local: bool,
    ) -> Result<ImagePolicyAttributes, ResolveError> {
        if !name.id.is_empty() {
            let image = self.image(&name.id).await?;
            let integrated = self.integrated.matches(&name.registry);
            return Ok(ImagePolicyAttributes {
                name,
                image: Some(image),
                integrated,
                ..Default::default()
            });
        }

        // A pull spec for the integrated registry names an image stream tag.
        // Single-segment names may refer to a local stream.
        let full = self.integrated.matches(&name.registry);
        let partial = force_local
            || (name.registry.is_empty() && name.namespace.is_empty() && !name.name.is_empty());
        if !full && !partial {
            return Err(ResolveError::NotResolvable(name.exact()));
        }

        let tag = if name.tag.is_empty() {
            DEFAULT_TAG.to_string()
        } else {
            std::mem::take(&mut name.tag)
        };
        if name.namespace.is_empty() || force_local {
            name.namespace = default_namespace.to_string();
        }

        self.resolve_image_stream_tag(&name.namespace, &name.name, &tag, partial, force_local)
            .await
    }

    async fn resolve_image_stream_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
        partial: bool,
        force_local: bool,
    ) -> Result<ImagePolicyAttributes, ResolveError> {
        let mut attrs = ImagePolicyAttributes {
            integrated: true,
            ..Default::default()
        };

        let Some(resolved) = self.store.image_stream_tag(namespace, stream, tag).await? else {
            // A stream that resolves local names still points the reference
            // at its repository, even before the tag exists.
            if let Some(name) = self.local_stream_reference(namespace, stream, tag, force_local).await? {
                debug!(%namespace, %stream, %tag, "Tag does not exist in a local name resolving stream");
                attrs.name = name;
                attrs.local_rewrite = true;
                return Ok(attrs);
            }
            return Err(ResolveError::NotFound {
                kind: "imagestreamtags",
                name: format!("{stream}:{tag}"),
            });
        };

        if partial {
            if !force_local && !resolved.lookup_policy.local {
                return Err(ResolveError::LocalReferencesNotAllowed);
            }
            attrs.local_rewrite = true;
        }

        let image = resolved.image;
        let mut name = parse_image_reference(&image)?;
        name.tag.clear();
        name.id = image.name().to_string();

        attrs.name = name;
        attrs.image = Some(self.insert(image));
        Ok(attrs)
    }

    async fn local_stream_reference(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
        force_local: bool,
    ) -> Result<Option<DockerImageReference>, ResolveError> {
        let Some(stream) = self.store.image_stream(namespace, stream).await? else {
            return Ok(None);
        };
        let repository = stream.status.docker_image_repository.as_str();
        if !(force_local || stream.spec.lookup_policy.local) || repository.is_empty() {
            return Ok(None);
        }
        Ok(DockerImageReference::parse(repository).ok().map(|mut name| {
            name.tag = tag.to_string();
            name
        }))
    }

    async fn resolve_image_stream_image(
        &self,
        namespace: &str,
        stream: &str,
        digest: &str,
    ) -> Result<ImagePolicyAttributes, ResolveError> {
        let resolved = self
            .store
            .image_stream_image(namespace, stream, digest)
            .await?
            .ok_or_else(|| ResolveError::NotFound {
                kind: "imagestreamimages",
                name: format!("{stream}@{digest}"),
            })?;

        let image = resolved.image;
        let name = parse_image_reference(&image)?;
        Ok(ImagePolicyAttributes {
            name,
            image: Some(self.insert(image)),
            integrated: true,
            ..Default::default()
        })
    }

    /// Returns the image with the given digest, from the cache if a live entry
    /// exists.
    async fn image(&self, id: &str) -> Result<Arc<Image>, ResolveError> {
        if let Some(image) = self.cached(id) {
            self.metrics.hits.inc();
            trace!(%id, "Cache hit");
            return Ok(image);
        }

        self.metrics.misses.inc();
        trace!(%id, "Cache miss");
        let image = self
            .store
            .image(id)
            .await?
            .ok_or_else(|| ResolveError::NotFound {
                kind: "images",
                name: id.to_string(),
            })?;
        Ok(self.insert_as(id, image))
    }

    fn cached(&self, id: &str) -> Option<Arc<Image>> {
        let mut cache = self.cache.lock();
        match cache.get(id) {
            Some(entry) if Instant::now() < entry.expires => Some(entry.image.clone()),
            Some(_) => {
                cache.pop(id);
                None
            }
            None => None,
        }
    }

    fn insert(&self, image: Image) -> Arc<Image> {
        let id = image.name().to_string();
        self.insert_as(&id, image)
    }

    fn insert_as(&self, id: &str, image: Image) -> Arc<Image> {
        let image = Arc::new(image);
        let entry = CacheEntry {
            expires: Instant::now() + self.ttl,
            image: image.clone(),
        };
        self.cache.lock().put(id.to_string(), entry);
        image
    }
}

fn parse_image_reference(image: &Image) -> Result<DockerImageReference, ResolveError> {
    DockerImageReference::parse(&image.docker_image_reference).map_err(|source| {
        ResolveError::InvalidImage {
            reference: image.docker_image_reference.clone(),
            source,
        }
    })
}
