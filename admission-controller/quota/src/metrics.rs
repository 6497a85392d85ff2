use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct QuotaMetrics {
    conflict_retries: Counter,
    sync_timeouts: Counter,
    rollbacks: Counter,
}

// === impl QuotaMetrics ===

impl QuotaMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let conflict_retries = Counter::default();
        reg.register(
            "conflict_retries",
            "Count of quota writes retried after a version conflict",
            conflict_retries.clone(),
        );

        let sync_timeouts = Counter::default();
        reg.register(
            "sync_timeouts",
            "Count of requests denied because caches were not synchronized",
            sync_timeouts.clone(),
        );

        let rollbacks = Counter::default();
        reg.register(
            "rollbacks",
            "Count of quota charges reversed after a later quota failed",
            rollbacks.clone(),
        );

        Self {
            conflict_retries,
            sync_timeouts,
            rollbacks,
        }
    }

    pub(crate) fn conflict_retry(&self) {
        self.conflict_retries.inc();
    }

    pub(crate) fn sync_timeout(&self) {
        self.sync_timeouts.inc();
    }

    pub(crate) fn rollback(&self) {
        self.rollbacks.inc();
    }

    pub fn conflict_retries(&self) -> u64 {
        self.conflict_retries.get()
    }
}
