use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    reviews: Family<Labels, Counter>,
    handling: Histogram,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    phase: &'static str,
    resource: String,
    operation: String,
    outcome: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Mutated,
    Denied,
    Invalid,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reviews = Family::<Labels, Counter>::default();
        reg.register(
            "reviews",
            "Total number of admission reviews by phase, resource, operation and outcome",
            reviews.clone(),
        );

        let handling = Histogram::new([0.001, 0.01, 0.1, 1.0, 10.0]);
        reg.register_with_unit(
            "handling",
            "Histogram of time spent deciding admission reviews",
            Unit::Seconds,
            handling.clone(),
        );

        Self { reviews, handling }
    }

    pub(crate) fn observe(
        &self,
        phase: &'static str,
        resource: String,
        operation: String,
        outcome: Outcome,
        start: time::Instant,
    ) {
        self.reviews
            .get_or_create(&Labels {
                phase,
                resource,
                operation,
                outcome: outcome.as_str(),
            })
            .inc();
        self.handling.observe(start.elapsed().as_secs_f64());
    }

    #[cfg(test)]
    pub(crate) fn reviews(
        &self,
        phase: &'static str,
        resource: &str,
        operation: &str,
        outcome: Outcome,
    ) -> u64 {
        self.reviews
            .get_or_create(&Labels {
                phase,
                resource: resource.to_string(),
                operation: operation.to_string(),
                outcome: outcome.as_str(),
            })
            .get()
    }
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Mutated => "mutated",
            Self::Denied => "denied",
            Self::Invalid => "invalid",
        }
    }
}
