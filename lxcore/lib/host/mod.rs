//! External collaborators of the container engine.
//!
//! The engine never runs host commands directly. Everything it needs from the host goes
//! through one of the traits below, which keeps the orchestration logic testable against
//! in-memory fakes:
//!
//! - [`ContainerTool`] wraps the `lxc-*` command line tools.
//! - [`StorageTool`] wraps BTRFS subvolume handling and other filesystem chores.
//! - [`Archiver`] builds and extracts compressed backup archives.

mod archive;
mod lxc;
mod storage;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    models::{BackingStorage, ContainerState},
    LxcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use archive::*;
pub use lxc::*;
pub use storage::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The parameters of a template-based container creation.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct CreateTemplate {
    /// The container name.
    #[builder(setter(into))]
    pub name: String,

    /// The distribution, e.g. `ubuntu`.
    #[builder(setter(into))]
    pub distribution: String,

    /// The release, e.g. `noble`.
    #[builder(setter(into))]
    pub release: String,

    /// The architecture, e.g. `amd64`.
    #[builder(setter(into))]
    pub architecture: String,

    /// The backing storage of the new rootfs.
    #[builder(default)]
    pub backing_storage: BackingStorage,

    /// An image server mirror to download from instead of the default one.
    #[builder(default, setter(strip_option, into))]
    pub server: Option<String>,
}

/// A request to archive a directory tree.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct ArchiveJob {
    /// The directory whose contents are archived.
    #[builder(setter(into))]
    pub source: PathBuf,

    /// The archive file to write.
    #[builder(setter(into))]
    pub destination: PathBuf,

    /// The xz compression level.
    #[builder(default = 6)]
    pub compression: u32,

    /// The compressor thread count.
    #[builder(default = 1)]
    pub threads: usize,

    /// Top-level entries of `source` left out of the archive.
    #[builder(default)]
    pub excludes: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The container tool the engine drives.
///
/// Every call receives the LXC root so the tool never has to carry its own configuration.
#[async_trait]
pub trait ContainerTool: Send + Sync {
    /// Returns the fancy tabular listing of all containers.
    async fn list(&self, lxc_root: &Path) -> LxcoreResult<String>;

    /// Returns the run state of a container.
    async fn state(&self, lxc_root: &Path, name: &str) -> LxcoreResult<ContainerState>;

    /// Starts a container.
    async fn start(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()>;

    /// Stops a container gracefully.
    async fn stop(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()>;

    /// Stops a container forcibly.
    async fn kill(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()>;

    /// Freezes a running container.
    async fn freeze(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()>;

    /// Thaws a frozen container.
    async fn unfreeze(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()>;

    /// Creates a container from a downloaded image.
    async fn create(&self, lxc_root: &Path, template: &CreateTemplate) -> LxcoreResult<()>;

    /// Destroys a container, forcibly stopping it first.
    async fn destroy(&self, lxc_root: &Path, name: &str, with_snapshots: bool)
        -> LxcoreResult<()>;

    /// Takes an offline snapshot of a container.
    async fn snapshot_create(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()>;

    /// Returns the raw snapshot listing of a container.
    async fn snapshot_list(&self, lxc_root: &Path, name: &str) -> LxcoreResult<String>;

    /// Deletes a snapshot.
    async fn snapshot_delete(&self, lxc_root: &Path, name: &str, snapshot: &str)
        -> LxcoreResult<()>;
}

/// Filesystem operations that need more than `std::fs`.
#[async_trait]
pub trait StorageTool: Send + Sync {
    /// Returns `true` if `path` lives on a BTRFS filesystem.
    async fn is_btrfs(&self, path: &Path) -> LxcoreResult<bool>;

    /// Creates a subvolume at `path`.
    async fn create_subvolume(&self, path: &Path) -> LxcoreResult<()>;

    /// Creates a writable snapshot of the subvolume `source` at `destination`.
    async fn snapshot_subvolume(&self, source: &Path, destination: &Path) -> LxcoreResult<()>;

    /// Deletes the subvolume at `path`.
    async fn delete_subvolume(&self, path: &Path) -> LxcoreResult<()>;

    /// Lists the subvolumes at or below `dir`, deepest first.
    async fn list_subvolumes(&self, dir: &Path) -> LxcoreResult<Vec<PathBuf>>;

    /// Recursively clears the immutable attribute below `dir`.
    async fn clear_immutable(&self, dir: &Path) -> LxcoreResult<()>;

    /// Unmounts whatever is mounted at `path`.
    async fn unmount(&self, path: &Path) -> LxcoreResult<()>;

    /// Returns the disk usage of `path` in bytes.
    async fn disk_usage(&self, path: &Path) -> LxcoreResult<u64>;

    /// Copies the contents of `source` into `destination`, preserving ownership and modes.
    async fn copy_tree(&self, source: &Path, destination: &Path) -> LxcoreResult<()>;

    /// Adds `offset` to every uid and gid below `path` that is inside the unmapped range.
    async fn shift_ownership(&self, path: &Path, offset: u32, range: u32) -> LxcoreResult<()>;
}

/// Builds and unpacks backup archives.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archives `job.source` into `job.destination`.
    ///
    /// Implementations poll `abort` and return [`crate::LxcoreError::Aborted`] once it fires.
    async fn archive(&self, job: &ArchiveJob, abort: CancellationToken) -> LxcoreResult<()>;

    /// Unpacks `archive` into the existing directory `destination`.
    async fn extract(&self, archive: &Path, destination: &Path) -> LxcoreResult<()>;
}
