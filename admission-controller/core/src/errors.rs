use crate::GroupResource;
use std::fmt;
use thiserror::Error;

pub type AdmissionResult<T = ()> = Result<T, AdmissionError>;

/// A rejected or failed admission decision.
///
/// `Forbidden` and `Invalid` are deliberate denials surfaced verbatim to the
/// client. `ServerTimeout` tells the client that retrying the identical
/// request may succeed.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{resource} \"{name}\" is forbidden: {reason}")]
    Forbidden {
        resource: GroupResource,
        name: String,
        reason: String,
    },

    #[error("{kind} \"{name}\" is invalid: {}", FieldErrors(.errors))]
    Invalid {
        kind: String,
        name: String,
        errors: Vec<FieldError>,
    },

    #[error("the server was unable to return a response in the time allotted, but may still be processing the request ({0})")]
    ServerTimeout(String),

    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub error_type: FieldErrorType,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldErrorType {
    Forbidden,
    Invalid,
    Required,
}

struct FieldErrors<'a>(&'a [FieldError]);

// === impl AdmissionError ===

impl AdmissionError {
    pub fn forbidden(
        resource: GroupResource,
        name: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        AdmissionError::Forbidden {
            resource,
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(kind: impl Into<String>, name: impl Into<String>, errors: Vec<FieldError>) -> Self {
        AdmissionError::Invalid {
            kind: kind.into(),
            name: name.into(),
            errors,
        }
    }

    pub fn server_timeout(reason: impl fmt::Display) -> Self {
        AdmissionError::ServerTimeout(reason.to_string())
    }

    /// The HTTP status code reported to the client.
    pub fn code(&self) -> u16 {
        match self {
            AdmissionError::BadRequest(_) => 400,
            AdmissionError::Forbidden { .. } => 403,
            AdmissionError::Invalid { .. } => 422,
            AdmissionError::ServerTimeout(_) => 504,
            AdmissionError::Internal(_) => 500,
        }
    }

    /// The machine-readable reason reported to the client.
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::BadRequest(_) => "BadRequest",
            AdmissionError::Forbidden { .. } => "Forbidden",
            AdmissionError::Invalid { .. } => "Invalid",
            AdmissionError::ServerTimeout(_) => "ServerTimeout",
            AdmissionError::Internal(_) => "InternalError",
        }
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, AdmissionError::Forbidden { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, AdmissionError::Invalid { .. })
    }

    pub fn is_server_timeout(&self) -> bool {
        matches!(self, AdmissionError::ServerTimeout(_))
    }
}

// === impl FieldError ===

impl FieldError {
    pub fn forbidden(field: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self {
            field: field.into(),
            error_type: FieldErrorType::Forbidden,
            detail: detail.to_string(),
        }
    }

    pub fn invalid(field: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self {
            field: field.into(),
            error_type: FieldErrorType::Invalid,
            detail: detail.to_string(),
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            error_type: FieldErrorType::Required,
            detail: String::new(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_type {
            FieldErrorType::Forbidden => write!(f, "{}: Forbidden: {}", self.field, self.detail),
            FieldErrorType::Invalid => write!(f, "{}: Invalid value: {}", self.field, self.detail),
            FieldErrorType::Required => write!(f, "{}: Required value", self.field),
        }
    }
}

impl fmt::Display for FieldErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            [] => Ok(()),
            [e] => write!(f, "{e}"),
            errors => {
                write!(f, "[")?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_display() {
        let err = AdmissionError::forbidden(
            GroupResource::core("pods"),
            "pod-1",
            "exceeded quota: q, requested: pods=1, used: pods=2, limited: pods=2",
        );
        assert_eq!(
            err.to_string(),
            "pods \"pod-1\" is forbidden: exceeded quota: q, requested: pods=1, used: pods=2, limited: pods=2"
        );
        assert_eq!(err.code(), 403);
        assert!(err.is_forbidden());
    }

    #[test]
    fn test_invalid_display() {
        let err = AdmissionError::invalid(
            "Pod",
            "pod-1",
            vec![
                FieldError::forbidden("spec.containers[0].image", "this image is prohibited by policy"),
                FieldError::required("spec.containers[1].image"),
            ],
        );
        let msg = err.to_string();
        assert!(msg.starts_with("Pod \"pod-1\" is invalid: ["));
        assert!(msg.contains("spec.containers[0].image: Forbidden: this image is prohibited by policy"));
        assert!(msg.contains("spec.containers[1].image: Required value"));
        assert_eq!(err.code(), 422);
    }

    #[test]
    fn test_server_timeout_is_distinct() {
        let err = AdmissionError::server_timeout("too many conflicts");
        assert!(err.is_server_timeout());
        assert!(!err.is_forbidden());
        assert_eq!(err.code(), 504);
    }
}
