use std::{
    os::unix::fs::{lchown, MetadataExt},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use nix::sys::statfs::{statfs, BTRFS_SUPER_MAGIC};
use tokio::{fs, process::Command};
use walkdir::{DirEntry, WalkDir};

use crate::{utils::run_command, LxcoreError, LxcoreResult};

use super::StorageTool;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The inode number BTRFS gives the root directory of every subvolume.
const BTRFS_SUBVOLUME_INODE: u64 = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// [`StorageTool`] backed by `btrfs`, `chattr`, `umount`, `du` and `cp`.
#[derive(Debug, Clone, Default)]
pub struct HostStorage;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostStorage {
    /// Creates a new host storage tool.
    pub fn new() -> Self {
        Self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl StorageTool for HostStorage {
    async fn is_btrfs(&self, path: &Path) -> LxcoreResult<bool> {
        let path = path.to_path_buf();
        let stat = tokio::task::spawn_blocking(move || statfs(&path))
            .await?
            .map_err(|e| LxcoreError::Io(e.into()))?;

        Ok(stat.filesystem_type() == BTRFS_SUPER_MAGIC)
    }

    async fn create_subvolume(&self, path: &Path) -> LxcoreResult<()> {
        run_command(Command::new("btrfs").args(["subvolume", "create"]).arg(path))
            .await
            .map(drop)
    }

    async fn snapshot_subvolume(&self, source: &Path, destination: &Path) -> LxcoreResult<()> {
        run_command(
            Command::new("btrfs")
                .args(["subvolume", "snapshot"])
                .arg(source)
                .arg(destination),
        )
        .await
        .map(drop)
    }

    async fn delete_subvolume(&self, path: &Path) -> LxcoreResult<()> {
        run_command(Command::new("btrfs").args(["subvolume", "delete"]).arg(path))
            .await
            .map(drop)
    }

    async fn list_subvolumes(&self, dir: &Path) -> LxcoreResult<Vec<PathBuf>> {
        if !fs::try_exists(dir).await? || !self.is_btrfs(dir).await? {
            return Ok(Vec::new());
        }

        let dir = dir.to_path_buf();
        let subvolumes = tokio::task::spawn_blocking(move || -> LxcoreResult<Vec<PathBuf>> {
            let root_dev = std::fs::metadata(&dir)?.dev();
            Ok(collect_subvolumes(
                &dir,
                |entry| stays_on_btrfs(entry, root_dev),
                |entry| {
                    entry
                        .metadata()
                        .map(|m| m.ino() == BTRFS_SUBVOLUME_INODE)
                        .unwrap_or(false)
                },
            ))
        })
        .await??;

        Ok(subvolumes)
    }

    async fn clear_immutable(&self, dir: &Path) -> LxcoreResult<()> {
        run_command(Command::new("chattr").args(["-R", "-i"]).arg(dir))
            .await
            .map(drop)
    }

    async fn unmount(&self, path: &Path) -> LxcoreResult<()> {
        run_command(Command::new("umount").arg(path)).await.map(drop)
    }

    async fn disk_usage(&self, path: &Path) -> LxcoreResult<u64> {
        let output = run_command(Command::new("du").arg("-sb").arg(path)).await?;
        output
            .split_whitespace()
            .next()
            .and_then(|bytes| bytes.parse().ok())
            .ok_or_else(|| LxcoreError::ToolFailed {
                program: "du".to_string(),
                message: format!("unexpected output: {}", output.trim()),
            })
    }

    async fn copy_tree(&self, source: &Path, destination: &Path) -> LxcoreResult<()> {
        fs::create_dir_all(destination).await?;
        run_command(
            Command::new("cp")
                .args(["-a", "--reflink=auto"])
                .arg(source.join("."))
                .arg(destination),
        )
        .await
        .map(drop)
    }

    async fn shift_ownership(&self, path: &Path, offset: u32, range: u32) -> LxcoreResult<()> {
        let root = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> LxcoreResult<()> {
            for entry in WalkDir::new(&root).same_file_system(true) {
                let entry = entry.map_err(LxcoreError::custom)?;
                let metadata = entry.path().symlink_metadata()?;
                let shift = |id: u32| if id < range { Some(id + offset) } else { None };

                let uid = shift(metadata.uid());
                let gid = shift(metadata.gid());
                if uid.is_some() || gid.is_some() {
                    lchown(entry.path(), uid, gid)?;
                }
            }

            Ok(())
        })
        .await?
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Walks `dir` and returns the directories `is_subvolume` accepts, deepest first.
///
/// Nested subvolumes carry their own device number, so the walk crosses device boundaries and
/// relies on `descend` to prune directories it must not enter.
fn collect_subvolumes(
    dir: &Path,
    mut descend: impl FnMut(&DirEntry) -> bool,
    is_subvolume: impl Fn(&DirEntry) -> bool,
) -> Vec<PathBuf> {
    let mut subvolumes: Vec<PathBuf> = WalkDir::new(dir)
        .same_file_system(false)
        .into_iter()
        .filter_entry(|entry| !entry.file_type().is_dir() || descend(entry))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir() && is_subvolume(entry))
        .map(DirEntry::into_path)
        .collect();

    subvolumes.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
    subvolumes
}

/// Returns whether a directory is still on BTRFS, checking only where the device changes.
fn stays_on_btrfs(entry: &DirEntry, root_dev: u64) -> bool {
    match entry.metadata() {
        Ok(metadata) if metadata.dev() == root_dev => true,
        Ok(_) => statfs(entry.path())
            .map(|stat| stat.filesystem_type() == BTRFS_SUPER_MAGIC)
            .unwrap_or(false),
        Err(_) => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_storage_disk_usage_and_copy() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("etc")).await?;
        fs::write(source.join("etc/hostname"), b"web1\n").await?;

        let storage = HostStorage::new();
        let destination = dir.path().join("dst");
        storage.copy_tree(&source, &destination).await?;

        assert_eq!(
            fs::read_to_string(destination.join("etc/hostname")).await?,
            "web1\n"
        );
        assert!(storage.disk_usage(&destination).await? > 0);
        Ok(())
    }

    #[test]
    fn test_collect_subvolumes_finds_nested_deepest_first() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let container = dir.path().join("web1");
        let nested = container.join("rootfs/var/lib/docker/btrfs/subvolumes/abc");
        std::fs::create_dir_all(&nested)?;
        std::fs::create_dir_all(container.join("rootfs/proc/subvolume"))?;
        std::fs::create_dir_all(container.join("snaps/snap0/rootfs"))?;

        let found = collect_subvolumes(
            &container,
            |entry| entry.file_name() != "proc",
            |entry| {
                entry.path() == nested
                    || entry.file_name() == "rootfs"
                    || entry.file_name() == "subvolume"
            },
        );

        assert_eq!(
            found,
            vec![
                nested.clone(),
                container.join("snaps/snap0/rootfs"),
                container.join("rootfs"),
            ]
        );
        Ok(())
    }
}
