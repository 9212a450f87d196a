//! Error types and failure classification for the notebook validation operator
//!
//! Errors are structured with fields to aid debugging in production. Every
//! failure surfaced by a phase handler is routed through [`classify`], which
//! maps it onto one of three tiers:
//!
//! - [`ErrorClass::Transient`]: infrastructure races and timeouts. Free retry,
//!   the job's retry counter is left alone.
//! - [`ErrorClass::Retriable`]: failures that may resolve on their own. Counted
//!   against the job's retry budget.
//! - [`ErrorClass::Terminal`]: spec, permission and logic errors. The job fails
//!   immediately.

use thiserror::Error;

use crate::crd::reasons;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for notebook validation operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for job specs
    #[error("validation error for {job}: {message}")]
    Validation {
        /// Name of the job with invalid configuration
        job: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.podConfig.buildConfig.strategy")
        field: Option<String>,
    },

    /// Build backend reported or caused a failure
    #[error("build error [{strategy}]: {message}")]
    Build {
        /// Build strategy name (s2i, tekton)
        strategy: String,
        /// Description of what failed, verbatim from the backend when available
        message: String,
        /// Whether another attempt may succeed
        retryable: bool,
    },

    /// Source credential is missing or unusable
    #[error("credential error for secret {secret}: {message}")]
    Credentials {
        /// Name of the source secret
        secret: String,
        /// Description of what's wrong
        message: String,
        /// True when the secret does not exist at all
        missing: bool,
    },

    /// A pipeline task required for builds could not be found
    #[error("task {task} not found in namespace {namespace}")]
    TaskNotFound {
        /// Task name (e.g., "git-clone")
        task: String,
        /// Namespace the task was looked up in
        namespace: String,
    },

    /// The notebook runner could not be driven
    #[error("runner error: {message}")]
    Runner {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "registry")
        context: String,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            job: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with job context and field path
    pub fn validation_for_field(
        job: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            job: job.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable build error
    pub fn build(strategy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Build {
            strategy: strategy.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a build error that no retry can fix
    pub fn build_permanent(strategy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Build {
            strategy: strategy.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an error for a source secret that does not exist
    pub fn credentials_missing(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Self::Credentials {
            message: format!("secret {secret} not found"),
            secret,
            missing: true,
        }
    }

    /// Create an error for a source secret that exists but is malformed
    pub fn credentials_invalid(secret: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            secret: secret.into(),
            message: msg.into(),
            missing: false,
        }
    }

    /// Create a task-not-found error
    pub fn task_not_found(task: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task: task.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a runner error
    pub fn runner(msg: impl Into<String>) -> Self {
        Self::Runner {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for HTTP 404 responses from the API server
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// True for HTTP 409 responses caused by creating an object that exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) }
            if ae.code == 409 && ae.reason == "AlreadyExists")
    }

    /// True for optimistic-concurrency conflicts (stale resourceVersion)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) }
            if ae.code == 409 && ae.reason != "AlreadyExists")
    }

    /// True for HTTP 403 responses
    pub fn is_forbidden(&self) -> bool {
        self.api_code() == Some(403)
    }

    /// Check if this error is worth retrying at all
    pub fn is_retryable(&self) -> bool {
        classify(self).class != ErrorClass::Terminal
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }
}

/// Retry tier assigned to a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Requeue after a short fixed delay without touching the retry counter
    Transient,
    /// Increment the retry counter and requeue on the backoff schedule
    Retriable,
    /// Fail the job immediately
    Terminal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "Transient"),
            Self::Retriable => write!(f, "Retriable"),
            Self::Terminal => write!(f, "Terminal"),
        }
    }
}

/// A failure together with the tier and user-facing reason it maps to.
///
/// Produced by [`classify`] and consumed immediately; never persisted.
#[derive(Debug)]
pub struct ClassifiedError<'a> {
    /// Retry tier
    pub class: ErrorClass,
    /// Machine-readable reason, used as the condition reason on failure
    pub reason: &'static str,
    /// Human-readable message taken from the deepest available cause
    pub message: String,
    /// The originating error
    pub cause: &'a Error,
}

/// Classify a failure into Transient, Retriable or Terminal.
///
/// Rules are applied in priority order: resource-version conflicts, then
/// server timeouts and unavailability, then spec/permission/not-found
/// errors, then everything else.
pub fn classify(err: &Error) -> ClassifiedError<'_> {
    let (class, reason) = match err {
        Error::Kube { source } => classify_kube(source),
        Error::Validation { .. } => (ErrorClass::Terminal, reasons::CONFIGURATION_ERROR),
        Error::Build {
            retryable: true, ..
        } => (ErrorClass::Retriable, reasons::BUILD_FAILED),
        Error::Build {
            retryable: false, ..
        } => (ErrorClass::Terminal, reasons::BUILD_FAILED),
        Error::Credentials { missing: true, .. } => {
            (ErrorClass::Terminal, reasons::CREDENTIALS_NOT_FOUND)
        }
        Error::Credentials { missing: false, .. } => {
            (ErrorClass::Terminal, reasons::INVALID_CREDENTIALS)
        }
        Error::TaskNotFound { .. } => (ErrorClass::Terminal, reasons::TASK_NOT_FOUND),
        Error::Runner { .. } => (ErrorClass::Retriable, reasons::VALIDATION_ERROR),
        Error::Serialization { .. } => (ErrorClass::Terminal, reasons::CONFIGURATION_ERROR),
        Error::Internal { .. } => (ErrorClass::Retriable, reasons::RECONCILE_ERROR),
    };

    ClassifiedError {
        class,
        reason,
        message: deepest_message(err),
        cause: err,
    }
}

fn classify_kube(source: &kube::Error) -> (ErrorClass, &'static str) {
    match source {
        kube::Error::Api(ae) => match ae.code {
            409 if ae.reason == "AlreadyExists" => (ErrorClass::Retriable, reasons::RECONCILE_ERROR),
            409 => (ErrorClass::Transient, reasons::TRANSIENT_ERROR),
            429 | 503 | 504 => (ErrorClass::Transient, reasons::TRANSIENT_ERROR),
            500 if ae.reason == "ServerTimeout" || ae.reason == "Timeout" => {
                (ErrorClass::Transient, reasons::TRANSIENT_ERROR)
            }
            400 | 422 => (ErrorClass::Terminal, reasons::CONFIGURATION_ERROR),
            401 | 403 => (ErrorClass::Terminal, reasons::RBAC_PERMISSION_DENIED),
            404 => (ErrorClass::Terminal, reasons::RESOURCE_NOT_FOUND),
            _ => (ErrorClass::Retriable, reasons::RECONCILE_ERROR),
        },
        // Connection-level failures never reached the API server
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            (ErrorClass::Transient, reasons::TRANSIENT_ERROR)
        }
        _ => (ErrorClass::Retriable, reasons::RECONCILE_ERROR),
    }
}

/// The most specific message available, without wrapper prefixes
fn deepest_message(err: &Error) -> String {
    match err {
        Error::Kube {
            source: kube::Error::Api(ae),
        } => ae.message.clone(),
        Error::Kube { source } => source.to_string(),
        Error::Validation { message, .. }
        | Error::Build { message, .. }
        | Error::Credentials { message, .. }
        | Error::Runner { message }
        | Error::Serialization { message, .. }
        | Error::Internal { message, .. } => message.clone(),
        Error::TaskNotFound { .. } => err.to_string(),
    }
}
