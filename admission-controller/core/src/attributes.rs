use k8s_openapi::api::authentication::v1::UserInfo;
use openshift_admission_k8s_api::{DynamicObject, GroupVersionKind, GroupVersionResource};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The kind of write being admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

/// Identifies a resource type independent of its API version.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize,
)]
pub struct GroupResource {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub resource: String,
}

/// Describes a single admission request.
///
/// The object (and old object, for updates) are carried as dynamic objects;
/// plugins decode only the fields they need.
#[derive(Clone, Debug)]
pub struct Attributes {
    pub name: String,
    pub namespace: Option<String>,
    pub resource: GroupVersionResource,
    pub subresource: Option<String>,
    pub kind: GroupVersionKind,
    pub operation: Operation,
    pub object: Option<DynamicObject>,
    pub old_object: Option<DynamicObject>,
    pub user_info: Option<UserInfo>,
    pub dry_run: bool,
}

// === impl Operation ===

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "CREATE"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Connect => write!(f, "CONNECT"),
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            "CONNECT" => Ok(Operation::Connect),
            _ => Err(format!("unknown operation: {s}")),
        }
    }
}

// === impl GroupResource ===

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    /// A resource in the legacy core API group.
    pub fn core(resource: impl Into<String>) -> Self {
        Self::new("", resource)
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

impl From<&GroupVersionResource> for GroupResource {
    fn from(gvr: &GroupVersionResource) -> Self {
        Self::new(gvr.group.clone(), gvr.resource.clone())
    }
}

// === impl Attributes ===

impl Attributes {
    pub fn new(
        resource: GroupVersionResource,
        kind: GroupVersionKind,
        operation: Operation,
    ) -> Self {
        Self {
            name: String::new(),
            namespace: None,
            resource,
            subresource: None,
            kind,
            operation,
            object: None,
            old_object: None,
            user_info: None,
            dry_run: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = Some(subresource.into());
        self
    }

    pub fn with_object(mut self, object: DynamicObject) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_old_object(mut self, object: DynamicObject) -> Self {
        self.old_object = Some(object);
        self
    }

    /// The request's namespace, if it targets a namespaced resource.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    /// The request's subresource, if any.
    pub fn subresource(&self) -> Option<&str> {
        self.subresource.as_deref().filter(|s| !s.is_empty())
    }

    pub fn group_resource(&self) -> GroupResource {
        GroupResource::from(&self.resource)
    }
}
