use crate::{
    admission::Admission,
    core::Plugins,
    imagepolicy::{
        ImageCacheMetrics, ImagePolicyConfig, ImagePolicyPlugin, ImageResolver, RegistryMatcher,
        ResolverConfig,
    },
    index, k8s,
    metrics::AdmissionMetrics,
    quota::{self, ClusterQuotaAdmission, QuotaMetrics},
    store::{KubeImageStore, KubeQuotaStore},
    NamespaceAnnotations, QuotaScopes,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{path::Path, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "admission",
    about = "Cluster resource quota and image policy admission webhook"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "openshift=info,warn",
        env = "OPENSHIFT_ADMISSION_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables enforcement of cluster resource quotas.
    #[clap(long)]
    cluster_quota_disabled: bool,

    /// Disables image resolution and execution policy.
    #[clap(long)]
    image_policy_disabled: bool,

    /// An `ImagePolicyConfig` YAML document.
    ///
    /// When unset, images annotated to deny execution are rejected and
    /// nothing else is enforced.
    #[clap(long)]
    image_policy_config: Option<PathBuf>,

    /// Hostnames under which the integrated registry is reachable.
    #[clap(long)]
    integrated_registry: Option<Hosts>,

    #[clap(long, default_value = "10")]
    cache_sync_timeout_secs: u64,

    #[clap(long, default_value = "3")]
    quota_conflict_retries: usize,

    #[clap(long, default_value = "128")]
    image_cache_size: usize,

    #[clap(long, default_value = "60")]
    image_cache_ttl_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            cluster_quota_disabled,
            image_policy_disabled,
            image_policy_config,
            integrated_registry,
            cache_sync_timeout_secs,
            quota_conflict_retries,
            image_cache_size,
            image_cache_ttl_secs,
        } = self;

        let image_policy = if image_policy_disabled {
            None
        } else {
            Some(load_image_policy(image_policy_config.as_deref())?)
        };

        let server = if cluster_quota_disabled && image_policy_disabled {
            None
        } else {
            Some(server)
        };

        // Namespaces and the cluster quotas that select them.
        let index = index::Index::shared();

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("index"), index.clone());
        let quota_metrics = QuotaMetrics::register(prom.sub_registry_with_prefix("cluster_quota"));
        let image_metrics =
            ImageCacheMetrics::register(prom.sub_registry_with_prefix("image_cache"));
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // Spawn resource watches.

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        let mut plugins = Plugins::default();

        if let Some(config) = image_policy {
            let integrated = RegistryMatcher::new(
                integrated_registry
                    .map(|Hosts(hosts)| hosts)
                    .unwrap_or_default(),
            );
            let resolver = ImageResolver::new(
                Arc::new(KubeImageStore::new(runtime.client())),
                integrated.clone(),
                ResolverConfig {
                    capacity: image_cache_size,
                    ttl: Duration::from_secs(image_cache_ttl_secs),
                },
                image_metrics,
            );
            let plugin = Arc::new(ImagePolicyPlugin::new(
                config,
                integrated,
                resolver,
                Arc::new(NamespaceAnnotations(index.clone())),
            ));
            plugins = plugins.with_mutator(plugin.clone()).with_validator(plugin);
        }

        if !cluster_quota_disabled {
            let quotas =
                runtime.watch_all::<k8s::ClusterResourceQuota>(watcher::Config::default());
            tokio::spawn(
                kubert::index::cluster(index.clone(), quotas)
                    .instrument(info_span!("clusterresourcequotas")),
            );

            let evaluator = quota::Evaluator::new(
                Arc::new(QuotaScopes(index)),
                Arc::new(KubeQuotaStore::new(runtime.client())),
                quota::Registry::with_defaults(),
                quota::Config {
                    sync_timeout: Duration::from_secs(cache_sync_timeout_secs),
                    conflict_retries: quota_conflict_retries,
                },
                quota_metrics,
            );
            plugins = plugins.with_validator(Arc::new(ClusterQuotaAdmission::new(evaluator)));
        }

        if plugins.is_empty() {
            warn!("All admission plugins are disabled; not serving admission reviews");
        } else {
            info!(plugins = ?plugins.names().collect::<Vec<_>>(), "Admission plugins enabled");
        }

        let runtime =
            runtime.spawn_server(move || Admission::new(plugins.clone(), admission_metrics.clone()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn load_image_policy(path: Option<&Path>) -> Result<ImagePolicyConfig> {
    let Some(path) = path else {
        info!("No image policy configured; denying images annotated against execution");
        return Ok(ImagePolicyConfig::default_policy());
    };

    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read image policy {}", path.display()))?;
    let config = ImagePolicyConfig::from_yaml(&data)
        .with_context(|| format!("invalid image policy {}", path.display()))?;
    info!(
        path = %path.display(),
        execution_rules = config.execution_rules.len(),
        resolution_rules = config.resolution_rules.len(),
        "Loaded image policy"
    );
    Ok(config)
}

#[derive(Clone, Debug, Default)]
struct Hosts(Vec<String>);

impl std::str::FromStr for Hosts {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let hosts = s
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| {
                if h.contains('/') || h.contains(char::is_whitespace) {
                    bail!("invalid registry host: {h:?}");
                }
                Ok(h.to_string())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(hosts))
    }
}
