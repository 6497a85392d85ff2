use std::collections::BTreeMap;

/// Read-only access to namespace metadata from a watch cache.
pub trait NamespaceLister: Send + Sync {
    /// Returns the annotations of a namespace, or `None` if it is not known.
    fn annotations(&self, namespace: &str) -> Option<BTreeMap<String, String>>;
}

impl<L: NamespaceLister + ?Sized> NamespaceLister for std::sync::Arc<L> {
    fn annotations(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        (**self).annotations(namespace)
    }
}
