//! Out-of-band reporting of job outcomes.
//!
//! Detached jobs never return anything to the caller that started them. Their outcome is pushed
//! to a [`Notifier`] (the host's notification sink) and published as a [`JobEvent`] on the
//! manager's broadcast channel.

use std::{fmt, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, net::UnixStream, time};

use crate::{config::NOTIFICATION_TIMEOUT, management::OperationKind, LxcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How urgently a notification should be surfaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Informational.
    Low,

    /// Worth a look.
    #[default]
    Normal,

    /// Something went wrong.
    High,
}

/// A message for the notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// A short headline.
    pub title: String,

    /// The body text.
    pub message: String,

    /// How urgent the message is.
    pub priority: Priority,
}

/// How a detached job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job finished; carries a human-readable summary.
    Completed(String),

    /// The job failed; carries the error text.
    Failed(String),
}

/// The terminal event of a detached job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    /// The container the job held the tracker slot of.
    pub container: String,

    /// The kind of job.
    pub kind: OperationKind,

    /// How the job ended.
    pub outcome: JobOutcome,
}

/// Delivers notifications as JSON over a Unix domain socket.
#[derive(Debug, Clone)]
pub struct UnixSocketNotifier {
    socket: PathBuf,
}

/// Discards every notification.
#[derive(Debug, Clone, Default)]
pub struct NullNotifier;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The notification sink collaborator.
///
/// Delivery is best-effort. Implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a notification.
    async fn notify(&self, notification: Notification);
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Notification {
    /// Creates a new notification.
    pub fn new(title: impl Into<String>, message: impl Into<String>, priority: Priority) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            priority,
        }
    }
}

impl JobOutcome {
    /// Returns `true` if the job finished successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

impl UnixSocketNotifier {
    /// Creates a notifier writing to `socket`.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn deliver(&self, notification: &Notification) -> LxcoreResult<()> {
        let payload = serde_json::to_vec(notification)?;
        let mut stream = UnixStream::connect(&self.socket).await?;
        stream.write_all(&payload).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Notifier for UnixSocketNotifier {
    async fn notify(&self, notification: Notification) {
        match time::timeout(NOTIFICATION_TIMEOUT, self.deliver(&notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(socket = %self.socket.display(), error = %e, "notification not delivered")
            }
            Err(_) => {
                tracing::debug!(socket = %self.socket.display(), "notification delivery timed out")
            }
        }
    }
}

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _notification: Notification) {}
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed(summary) => write!(f, "completed: {}", summary),
            JobOutcome::Failed(error) => write!(f, "failed: {}", error),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
