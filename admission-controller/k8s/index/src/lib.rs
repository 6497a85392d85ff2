//! Maintains the mapping from namespaces to the cluster quotas that select
//! them, from `Namespace` and `ClusterResourceQuota` watches.
//!
//! The index may lag the API server. Consumers tolerate stale entries by
//! re-reading each quota before charging it.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod metrics;


pub use self::index::{Index, SharedIndex};
