//! Errors returned by the storage engine.
//!
//! Errors keep enough structure to be classified (see [`ErrorKind`]) while
//! [`Error::Stage`] wraps them with a short description of the step that
//! failed.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while running a workflow.
#[derive(Error, Debug)]
pub enum Error {
    /// A required field is missing or mutually exclusive fields were set.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The referenced object does not exist.
    #[error("{kind} ({name}) not found")]
    NotFound {
        /// Kind of the object, e.g. `PersistentVolumeClaim`.
        kind: String,
        /// Name of the object.
        name: String,
    },
    /// The cluster is not in a state the workflow can run against.
    #[error("{0}")]
    Precondition(String),
    /// An object did not become ready in time.
    #[error("{0}")]
    ProvisionTimeout(String),
    /// The feature specific action failed.
    #[error("{0}")]
    Action(String),
    /// The request deadline passed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The request was cancelled, typically by SIGINT or SIGTERM.
    #[error("cancelled")]
    Cancelled,
    /// Wraps an error with the stage it occurred in.
    #[error("{stage}: {source}")]
    Stage {
        /// Short description of the failed step.
        stage: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// Error returned by the Kubernetes client.
    #[error(transparent)]
    Kube(#[from] kube::Error),
    /// Error (de)serializing a Kubernetes object.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    /// Local IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input from the caller.
    InvalidArgument,
    /// Missing or inconsistent cluster objects.
    Precondition,
    /// An object never became ready.
    ProvisionTimeout,
    /// The workflow action failed.
    Action,
    /// The deadline passed.
    DeadlineExceeded,
    /// The request was cancelled.
    Cancelled,
    /// Transport, API or local failures.
    Internal,
}

impl Error {
    /// Builds a [`Error::NotFound`].
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Wraps `self` with the name of a stage.
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        Error::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Returns true when this error, or the error it wraps, means the object
    /// does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            Error::Stage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Classifies the error, looking through stage wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound { .. } | Error::Precondition(_) => ErrorKind::Precondition,
            Error::ProvisionTimeout(_) => ErrorKind::ProvisionTimeout,
            Error::Action(_) => ErrorKind::Action,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Stage { source, .. } => source.kind(),
            Error::Kube(kube::Error::Api(response)) if response.code == 404 => {
                ErrorKind::Precondition
            }
            Error::Kube(_) | Error::Serialization(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Adds [`Error::in_stage`] to results.
pub trait StageExt<T> {
    /// Wraps the error, if any, with the name of the failed stage.
    fn stage(self, stage: impl Into<String>) -> Result<T>;

    /// Like [`StageExt::stage`] but only builds the description on failure.
    fn with_stage<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<Error>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().in_stage(stage))
    }

    fn with_stage<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().in_stage(f()))
    }
}
