use crate::quantity::{Quantity, QuantityError};
use openshift_admission_k8s_api as k8s;
use std::{collections::BTreeMap, fmt};

/// Resource name -> quantity.
pub type ResourceList = BTreeMap<String, Quantity>;

/// Formats a resource list as `name=quantity` pairs, ordered by name.
pub struct Display<'a>(pub &'a ResourceList);

pub fn parse(list: &BTreeMap<String, k8s::Quantity>) -> Result<ResourceList, QuantityError> {
    list.iter()
        .map(|(name, q)| Ok((name.clone(), Quantity::try_from(q)?)))
        .collect()
}

pub fn to_k8s(list: &ResourceList) -> BTreeMap<String, k8s::Quantity> {
    list.iter()
        .map(|(name, q)| (name.clone(), k8s::Quantity::from(*q)))
        .collect()
}

pub fn add(a: &ResourceList, b: &ResourceList) -> ResourceList {
    let mut sum = a.clone();
    for (name, q) in b {
        *sum.entry(name.clone()).or_default() += *q;
    }
    sum
}

pub fn subtract(a: &ResourceList, b: &ResourceList) -> ResourceList {
    let mut diff = a.clone();
    for (name, q) in b {
        *diff.entry(name.clone()).or_default() -= *q;
    }
    diff
}

/// Retains only the named resources.
pub fn mask<'a>(list: &ResourceList, names: impl IntoIterator<Item = &'a String>) -> ResourceList {
    names
        .into_iter()
        .filter_map(|name| list.get(name).map(|q| (name.clone(), *q)))
        .collect()
}

/// Drops resources whose quantity is zero or negative.
pub fn remove_non_positive(mut list: ResourceList) -> ResourceList {
    list.retain(|_, q| !q.is_zero() && !q.is_negative());
    list
}

/// Returns the names of resources in `a` that exceed their limit in `b`.
///
/// Resources missing from `b` are unconstrained.
pub fn exceeded(a: &ResourceList, b: &ResourceList) -> Vec<String> {
    a.iter()
        .filter(|(name, q)| matches!(b.get(*name), Some(limit) if *q > limit))
        .map(|(name, _)| name.clone())
        .collect()
}

pub fn less_than_or_equal(a: &ResourceList, b: &ResourceList) -> bool {
    exceeded(a, b).is_empty()
}

impl fmt::Display for Display<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, q)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{name}={q}")?;
        }
        Ok(())
    }
}
