//! Error types for the broker operator

use thiserror::Error;

/// Main error type for reconcile operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Management protocol transport error
    #[error("jolokia error: {0}")]
    Jolokia(#[from] kestrel_jolokia::JolokiaError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object is missing a name or namespace
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),

    /// A resource template could not be applied to a generated resource
    #[error("invalid resource template: {0}")]
    InvalidTemplate(String),

    /// Listener or socket failure in the operator process
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Finalizer bookkeeping failed
    #[error("finalizer error: {0}")]
    Finalizer(String),
}

impl Error {
    /// Create an invalid template error with the given message
    pub fn invalid_template(msg: impl Into<String>) -> Self {
        Self::InvalidTemplate(msg.into())
    }

    /// Optimistic concurrency failure on a write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(response)) if response.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(response)) if response.code == 404)
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    /// Keep the inner reconcile error so conflicts are still classified
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerError;
        match err {
            FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => inner,
            FinalizerError::AddFinalizer(inner) | FinalizerError::RemoveFinalizer(inner) => Error::Kube(inner),
            other => Error::Finalizer(other.to_string()),
        }
    }
}

/// Result alias used across the operator
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} for test"),
        reason: reason.to_string(),
        code,
    }))
}
