use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};
use thiserror::Error;

use crate::management::OperationKind;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an lxcore-related operation.
pub type LxcoreResult<T> = Result<T, LxcoreError>;

/// An error that occurred while managing containers.
#[derive(pretty_error_debug::Debug, Error)]
pub enum LxcoreError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred while (de)serializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred while parsing a TOML settings file.
    #[error("settings parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// The container name does not satisfy the naming rules.
    #[error("invalid container name: {0}")]
    InvalidContainerName(String),

    /// The description is too long or contains disallowed characters.
    #[error("invalid description: {0}")]
    InvalidDescription(String),

    /// The container index is not a positive integer.
    #[error("invalid container index: {0}")]
    InvalidIndex(String),

    /// The snapshot name does not satisfy the naming rules.
    #[error("invalid snapshot name: {0}")]
    InvalidSnapshotName(String),

    /// The backup filename is malformed or points outside the backup directory.
    #[error("invalid backup filename: {0}")]
    InvalidBackupFilename(String),

    /// The compression level is outside `0..=9`.
    #[error("invalid compression level: {0} (expected 0-9)")]
    InvalidCompressionLevel(u32),

    /// An invalid argument was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The container does not exist.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The container already exists.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Another operation holds the tracker slot of the container.
    #[error("Cannot {verb} container: {kind} operation in progress")]
    OperationInProgress {
        /// The verb of the rejected request.
        verb: String,

        /// The kind of operation that is currently running.
        kind: OperationKind,
    },

    /// The same index was requested for more than one container.
    #[error("duplicate container index: {0}")]
    DuplicateIndex(u32),

    /// The target container of a clone already exists.
    #[error("target container already exists: {0}")]
    TargetExists(String),

    /// The snapshot does not exist.
    #[error("snapshot {snapshot} not found for container {container}")]
    SnapshotNotFound {
        /// The container the snapshot was looked up on.
        container: String,

        /// The snapshot name.
        snapshot: String,
    },

    /// The backup file does not exist.
    #[error("backup not found: {}", .0.display())]
    BackupNotFound(PathBuf),

    /// A container tool command exited unsuccessfully.
    #[error("Failed to {verb} container {name}: {message}")]
    CommandFailed {
        /// The verb describing the attempted action.
        verb: String,

        /// The container the command was run against.
        name: String,

        /// The underlying failure message.
        message: String,
    },

    /// A non-container host command exited unsuccessfully.
    #[error("{program} failed: {message}")]
    ToolFailed {
        /// The program that failed.
        program: String,

        /// The underlying failure message.
        message: String,
    },

    /// No backup root has been configured.
    #[error("no backup path configured")]
    BackupRootNotConfigured,

    /// The configured backing storage does not match the host filesystem.
    #[error("storage policy violation: {0}")]
    StoragePolicy(String),

    /// The job was aborted on request.
    #[error("operation aborted")]
    Aborted,
}

/// A coarse classification of [`LxcoreError`] used by outer layers to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input, detected before any side effect.
    Validation,

    /// The request conflicts with existing state.
    Conflict,

    /// The subject of the request does not exist.
    NotFound,

    /// An external tool failed.
    External,

    /// Anything else.
    Internal,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LxcoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> LxcoreError {
        LxcoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates a [`LxcoreError::CommandFailed`] for a container command.
    pub fn command_failed(
        verb: impl Into<String>,
        name: impl Into<String>,
        message: impl Display,
    ) -> LxcoreError {
        LxcoreError::CommandFailed {
            verb: verb.into(),
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            LxcoreError::InvalidContainerName(_)
            | LxcoreError::InvalidDescription(_)
            | LxcoreError::InvalidIndex(_)
            | LxcoreError::InvalidSnapshotName(_)
            | LxcoreError::InvalidBackupFilename(_)
            | LxcoreError::InvalidCompressionLevel(_)
            | LxcoreError::InvalidArgument(_) => ErrorCategory::Validation,
            LxcoreError::ContainerAlreadyExists(_)
            | LxcoreError::OperationInProgress { .. }
            | LxcoreError::DuplicateIndex(_)
            | LxcoreError::TargetExists(_) => ErrorCategory::Conflict,
            LxcoreError::ContainerNotFound(_)
            | LxcoreError::SnapshotNotFound { .. }
            | LxcoreError::BackupNotFound(_) => ErrorCategory::NotFound,
            LxcoreError::CommandFailed { .. } | LxcoreError::ToolFailed { .. } => {
                ErrorCategory::External
            }
            _ => ErrorCategory::Internal,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `LxcoreResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> LxcoreResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_operation_in_progress_message() {
        let err = LxcoreError::OperationInProgress {
            verb: "start".to_string(),
            kind: OperationKind::Backup,
        };
        assert_eq!(
            err.to_string(),
            "Cannot start container: backup operation in progress"
        );
        assert_eq!(err.category(), ErrorCategory::Conflict);
    }

    #[test]
    fn test_error_command_failed_message() {
        let err = LxcoreError::command_failed("stop", "web1", "exit status 1");
        assert_eq!(
            err.to_string(),
            "Failed to stop container web1: exit status 1"
        );
        assert_eq!(err.category(), ErrorCategory::External);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            LxcoreError::InvalidIndex("0".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            LxcoreError::ContainerNotFound("x".into()).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(LxcoreError::Aborted.category(), ErrorCategory::Internal);
    }
}
