//! Locates and rewrites the image references held by an object.
//!
//! Objects are handled as raw JSON so that any version of a supported kind
//! can be inspected. References are located first and written back after all
//! decisions are made.

use crate::resolver::{ObjectReference, DOCKER_IMAGE};
use openshift_admission_core::{FieldError, GroupResource};
use serde_json::Value;

const CONTAINER_LISTS: [&str; 3] = ["initContainers", "containers", "ephemeralContainers"];
const BUILD_STRATEGIES: [&str; 3] = ["sourceStrategy", "dockerStrategy", "customStrategy"];

/// Selects where image references live for a kind of object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutator {
    /// A pod spec at the given JSON pointer.
    PodSpec(&'static str),

    /// A build or build config: strategy `from` and source images.
    Build,
}

/// The location of one image reference within an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    /// The field path reported in errors, e.g. `spec.containers[0].image`.
    pub field: String,
    pointer: String,
    shape: Shape,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    /// A pull spec string.
    Image,
    /// An object with `kind`, `namespace` and `name`.
    Reference,
}

// === impl Mutator ===

impl Mutator {
    pub fn for_resource(gr: &GroupResource) -> Option<Self> {
        let mutator = match (gr.group.as_str(), gr.resource.as_str()) {
            ("", "pods") => Self::PodSpec("/spec"),
            ("", "podtemplates") => Self::PodSpec("/template/spec"),
            ("", "replicationcontrollers")
            | ("apps" | "extensions", "deployments" | "replicasets" | "daemonsets")
            | ("apps", "statefulsets")
            | ("batch", "jobs")
            | ("apps.openshift.io", "deploymentconfigs") => Self::PodSpec("/spec/template/spec"),
            ("batch", "cronjobs") => Self::PodSpec("/spec/jobTemplate/spec/template/spec"),
            ("build.openshift.io", "builds" | "buildconfigs") => Self::Build,
            _ => return None,
        };
        Some(mutator)
    }

    /// Every non-empty image reference in the object, in document order.
    pub fn references(&self, data: &Value) -> Vec<(Slot, ObjectReference)> {
        match self {
            Self::PodSpec(spec) => container_images(data, spec),
            Self::Build => build_references(data),
        }
    }

    /// Reads an annotation from the pod template, if the object has one.
    pub fn template_annotation<'a>(&self, data: &'a Value, key: &str) -> Option<&'a str> {
        let Self::PodSpec(spec) = self else {
            return None;
        };
        let template = spec.strip_suffix("/spec")?;
        data.pointer(&format!("{template}/metadata/annotations"))?
            .get(key)?
            .as_str()
    }

    pub fn write(
        data: &mut Value,
        slot: &Slot,
        reference: &ObjectReference,
    ) -> Result<(), FieldError> {
        let target = data
            .pointer_mut(&slot.pointer)
            .ok_or_else(|| FieldError::required(slot.field.clone()))?;
        match slot.shape {
            Shape::Image => {
                if reference.kind != DOCKER_IMAGE {
                    return Err(FieldError::invalid(
                        slot.field.clone(),
                        format!(
                            "{}: pod specs may only contain references to docker images",
                            reference.name
                        ),
                    ));
                }
                *target = Value::String(reference.name.clone());
            }
            Shape::Reference => {
                let Some(obj) = target.as_object_mut() else {
                    return Err(FieldError::invalid(slot.field.clone(), "must be an object"));
                };
                obj.insert("kind".to_string(), Value::String(reference.kind.clone()));
                obj.insert("name".to_string(), Value::String(reference.name.clone()));
                if reference.namespace.is_empty() {
                    obj.remove("namespace");
                } else {
                    obj.insert(
                        "namespace".to_string(),
                        Value::String(reference.namespace.clone()),
                    );
                }
            }
        }
        Ok(())
    }
}

fn field_path(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}

fn container_images(data: &Value, spec: &str) -> Vec<(Slot, ObjectReference)> {
    let prefix = field_path(spec);
    let mut refs = Vec::new();
    for list in CONTAINER_LISTS {
        let Some(containers) = data.pointer(&format!("{spec}/{list}")).and_then(Value::as_array)
        else {
            continue;
        };
        for (i, container) in containers.iter().enumerate() {
            let image = container.get("image").and_then(Value::as_str).unwrap_or("");
            if image.is_empty() {
                continue;
            }
            let slot = Slot {
                field: format!("{prefix}.{list}[{i}].image"),
                pointer: format!("{spec}/{list}/{i}/image"),
                shape: Shape::Image,
            };
            refs.push((slot, ObjectReference::docker_image(image)));
        }
    }
    refs
}

fn build_references(data: &Value) -> Vec<(Slot, ObjectReference)> {
    let mut refs = Vec::new();
    for strategy in BUILD_STRATEGIES {
        let pointer = format!("/spec/strategy/{strategy}/from");
        push_reference(&mut refs, data, pointer, format!("spec.strategy.{strategy}.from"));
    }

    let count = data
        .pointer("/spec/source/images")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    for i in 0..count {
        let pointer = format!("/spec/source/images/{i}/from");
        push_reference(&mut refs, data, pointer, format!("spec.source.images[{i}].from"));
    }
    refs
}

fn push_reference(
    refs: &mut Vec<(Slot, ObjectReference)>,
    data: &Value,
    pointer: String,
    field: String,
) {
    let Some(from) = data.pointer(&pointer).and_then(Value::as_object) else {
        return;
    };
    let get = |key: &str| {
        from.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let reference = ObjectReference {
        kind: get("kind"),
        namespace: get("namespace"),
        name: get("name"),
    };
    if reference.name.is_empty() {
        return;
    }
    refs.push((
        Slot {
            field,
            pointer,
            shape: Shape::Reference,
        },
        reference,
    ));
}
