//! Error types for the request lifecycle engine.

use thiserror::Error;

use crate::domain::file::FileId;
use crate::domain::principal::PrincipalId;
use crate::domain::request::{RequestId, RequestStatus, Trigger};

/// Result type alias using the brieflow error type.
pub type Result<T> = std::result::Result<T, BrieflowError>;

/// Main error type for the lifecycle engine.
///
/// Every variant names the constraint that was violated so a caller can correct
/// its input and retry. Only [`BrieflowError::DependencyFailure`] is worth retrying
/// unchanged.
#[derive(Error, Debug)]
pub enum BrieflowError {
    /// Malformed or out-of-range input on a named field.
    ///
    /// Forwarding an in-progress request to the division it is already
    /// assigned to is reported here with `field: "forward_to"`, not as
    /// `InvalidTransition`: the trigger is legal, its target is not.
    #[error("Validation error on '{field}': {message}")]
    Validation { field: &'static str, message: String },

    /// Division, request type, lead time or attachment policy rejected the input
    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// The principal may not perform this operation.
    ///
    /// Deliberately carries no detail about which operations would be allowed.
    #[error("Operation not permitted")]
    Forbidden,

    /// The trigger is not defined for the request's current status (including lost races)
    #[error("Invalid transition: '{trigger}' is not allowed from '{from}'")]
    InvalidTransition { from: RequestStatus, trigger: Trigger },

    /// A trigger was missing its required payload field
    #[error("Missing payload: '{trigger}' requires a non-empty '{field}'")]
    MissingPayload {
        trigger: Trigger,
        field: &'static str,
    },

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Attachment not found
    #[error("Attachment not found: {0}")]
    FileNotFound(FileId),

    /// Profile not found
    #[error("Profile not found: {0}")]
    ProfileNotFound(PrincipalId),

    /// Storage, database or mail gateway failure
    #[error("Dependency failure: {0}")]
    DependencyFailure(#[from] anyhow::Error),
}

impl BrieflowError {
    /// Whether the same call may succeed if repeated without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrieflowError::DependencyFailure(_))
    }

    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        BrieflowError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BrieflowError::Validation { .. } => "validation",
            BrieflowError::Policy(_) => "policy",
            BrieflowError::Forbidden => "forbidden",
            BrieflowError::InvalidTransition { .. } => "invalid_transition",
            BrieflowError::MissingPayload { .. } => "missing_payload",
            BrieflowError::RequestNotFound(_)
            | BrieflowError::FileNotFound(_)
            | BrieflowError::ProfileNotFound(_) => "not_found",
            BrieflowError::DependencyFailure(_) => "dependency_failure",
        }
    }
}

/// Submission and attachment policy failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("unknown division '{0}'")]
    UnknownDivision(String),

    #[error("request type '{request_type}' is not offered by division {division}")]
    InvalidRequestType {
        division: String,
        request_type: String,
    },

    #[error("usage date must be at least {required} days ahead, got {provided}")]
    InsufficientLeadTime { required: i64, provided: i64 },

    #[error("usage date must be after today, got {provided} days ahead")]
    UsageDateNotInFuture { provided: i64 },

    #[error("unsupported attachment type '{mime_type}' (allowed: PNG, JPEG, PDF)")]
    UnsupportedType { mime_type: String },

    #[error("attachment is {size_bytes} bytes, limit is {limit_bytes} bytes")]
    TooLarge { size_bytes: u64, limit_bytes: u64 },
}
