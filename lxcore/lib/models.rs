//! Data types returned by the container engine.
//!
//! None of these are persisted as rows. They are reconstructed on every query from the
//! container tool's output and the files under the LXC root.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{management::OperationKind, LxcoreError};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The run state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// The container is running.
    Running,

    /// The container is stopped.
    Stopped,

    /// The container's processes are frozen.
    Frozen,
}

/// How a container's root filesystem is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingStorage {
    /// A plain directory.
    #[default]
    Directory,

    /// A BTRFS subvolume.
    Btrfs,
}

/// A container as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// The container name.
    pub name: String,

    /// The current run state.
    pub state: ContainerState,

    /// Whether the container starts with the host.
    pub autostart: bool,

    /// The position in the boot/sort order.
    pub index: Option<u32>,

    /// A short free-form description.
    pub description: Option<String>,

    /// A hint where the container's web interface lives.
    pub webui: Option<String>,

    /// The distribution the container was created from.
    pub distribution: Option<String>,

    /// The architecture the container was created for.
    pub architecture: Option<String>,

    /// Whether the container runs with a remapped id range.
    pub unprivileged: bool,

    /// How the root filesystem is stored.
    pub backing_storage: BackingStorage,

    /// Whether a custom icon has been uploaded.
    pub custom_icon: bool,

    /// IPv4 addresses reported by the container tool.
    pub ipv4: Vec<String>,

    /// IPv6 addresses reported by the container tool.
    pub ipv6: Vec<String>,

    /// Container groups reported by the container tool.
    pub groups: Vec<String>,

    /// The long-running operation currently holding this container, if any.
    pub active_operation: Option<OperationKind>,
}

/// A container name and its order index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerIndex {
    /// The container name.
    pub name: String,

    /// The order index, if one is set.
    pub index: Option<u32>,
}

/// A snapshot of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// The tool-assigned snapshot name (`snapN`).
    pub name: String,

    /// When the snapshot was taken, as `YYYY-MM-DD HH:MM:SS`.
    pub created: Option<String>,

    /// The disk usage of the snapshot directory in bytes.
    pub size: u64,

    /// The disk usage rendered for humans.
    pub size_formatted: String,
}

/// A backup archive of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// The archive filename.
    pub filename: String,

    /// The archive size in bytes.
    pub size: u64,

    /// The archive size rendered for humans.
    pub size_formatted: String,

    /// When the backup was taken.
    pub created: DateTime<Utc>,
}

/// Memory held by a container, excluding page cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Bytes in use.
    pub bytes: u64,

    /// Bytes in use rendered for humans.
    pub formatted: String,
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsage {
    /// The container name.
    pub name: String,

    /// CPU utilisation over the sampling window, in percent of the container's CPUs.
    pub cpu_percent: f64,

    /// Memory usage.
    pub memory: MemoryUsage,
}

/// The result of a create request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOutcome {
    /// The name of the created container.
    pub name: String,

    /// The index assigned to the container.
    pub index: Option<u32>,

    /// Whether the container was started after creation.
    pub started: bool,

    /// Why starting failed, if it was requested and failed.
    pub start_error: Option<String>,
}

/// Acknowledgement of an accepted backup job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStarted {
    /// Always `true`; the outcome arrives through the notification sink.
    pub success: bool,

    /// The archive filename the job is writing.
    pub backup_file: String,

    /// The directory the archive is written to.
    pub backup_dir: String,

    /// Whether the backup reads from a temporary snapshot.
    pub use_snapshot: bool,

    /// Whether the container is BTRFS-backed.
    pub is_btrfs: bool,

    /// The effective compression level.
    pub compression: u32,

    /// The effective compressor thread count.
    pub threads: usize,

    /// Whether the container was running when the job was accepted.
    pub was_running: bool,
}

/// Acknowledgement of an accepted restore job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreStarted {
    /// Always `true`; the outcome arrives through the notification sink.
    pub success: bool,

    /// The name the backup is restored under.
    pub name: String,

    /// The archive being restored.
    pub backup_file: String,

    /// Whether a container with the target name existed and will be replaced.
    pub target_exists: bool,

    /// Whether that container was running.
    pub was_running: bool,
}

/// Acknowledgement of an accepted job without extra facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStarted {
    /// Always `true`; the outcome arrives through the notification sink.
    pub success: bool,

    /// The container the job runs against.
    pub name: String,

    /// The kind of job.
    pub operation: OperationKind,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerState {
    /// Returns `true` if the container has live processes.
    pub fn is_active(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Frozen)
    }
}

impl BackingStorage {
    /// Returns the rootfs path prefix LXC uses for this storage type.
    pub fn rootfs_prefix(&self) -> &'static str {
        match self {
            BackingStorage::Directory => "dir:",
            BackingStorage::Btrfs => "btrfs:",
        }
    }
}

impl JobStarted {
    /// Creates an acknowledgement for `name`.
    pub fn new(name: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            success: true,
            name: name.into(),
            operation,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for ContainerState {
    type Err = LxcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" | "STARTING" => Ok(ContainerState::Running),
            "STOPPED" | "STOPPING" | "ABORTING" => Ok(ContainerState::Stopped),
            "FROZEN" | "FREEZING" => Ok(ContainerState::Frozen),
            other => Err(LxcoreError::InvalidArgument(format!(
                "unknown container state: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Frozen => write!(f, "frozen"),
        }
    }
}

impl fmt::Display for BackingStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingStorage::Directory => write!(f, "directory"),
            BackingStorage::Btrfs => write!(f, "btrfs"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_from_str() {
        assert_eq!(
            "RUNNING".parse::<ContainerState>().unwrap(),
            ContainerState::Running
        );
        assert_eq!(
            "stopped".parse::<ContainerState>().unwrap(),
            ContainerState::Stopped
        );
        assert_eq!(
            " FROZEN ".parse::<ContainerState>().unwrap(),
            ContainerState::Frozen
        );
        assert!("EXPLODED".parse::<ContainerState>().is_err());
    }

    #[test]
    fn test_backing_storage_prefix() {
        assert_eq!(BackingStorage::Btrfs.rootfs_prefix(), "btrfs:");
        assert_eq!(BackingStorage::Directory.rootfs_prefix(), "dir:");
        assert_eq!(BackingStorage::default(), BackingStorage::Directory);
    }
}
