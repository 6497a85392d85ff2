use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let namespaces_encoder = encoder.encode_descriptor(
            "namespace_index_size",
            "The number of namespaces in index",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.namespaces_len() as u32).encode(namespaces_encoder)?;

        let quotas_encoder = encoder.encode_descriptor(
            "cluster_resource_quota_index_size",
            "The number of cluster resource quotas in index",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.quotas_len() as u32).encode(quotas_encoder)?;

        let synced_encoder = encoder.encode_descriptor(
            "synced",
            "Whether the initial state of all watched resources has been observed",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(u32::from(this.has_synced())).encode(synced_encoder)?;

        Ok(())
    }
}
