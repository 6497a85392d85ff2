//! Enforcement of `ClusterResourceQuota`s at admission time.
//!
//! Each namespaced write is mapped to the cluster quotas covering its
//! namespace. Those quotas are locked in name order, re-read from the store,
//! checked against the write's usage, and charged with compare-and-swap
//! writes.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod evaluator;
pub mod lock;
mod metrics;
mod store;
pub mod usage;


pub use self::{
    admission::{ClusterQuotaAdmission, PLUGIN_NAME},
    evaluator::{Config, Evaluator},
    metrics::QuotaMetrics,
    store::{QuotaDocument, QuotaStore, ScopeIndex, StoreError},
    usage::{Registry, UsageError, UsageEvaluator},
};
