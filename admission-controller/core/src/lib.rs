//! Admission attributes, errors, quantities and the plugin chain shared by the
//! cluster quota and image policy plugins.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod attributes;
mod errors;
mod namespace;
mod plugin;
pub mod quantity;
pub mod resources;

pub use self::{
    attributes::{Attributes, GroupResource, Operation},
    errors::{AdmissionError, AdmissionResult, FieldError, FieldErrorType},
    namespace::NamespaceLister,
    plugin::{Interface, MutationInterface, Plugins, ValidationInterface},
    quantity::{Quantity, QuantityError},
    resources::ResourceList,
};
