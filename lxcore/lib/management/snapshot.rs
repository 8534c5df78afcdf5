//! Point-in-time snapshots of containers.
//!
//! Listing, creation and deletion are synchronous. Restoring a snapshot over its container and
//! cloning a snapshot into a new container run as detached jobs under the tracker slot of the
//! source container.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use tokio::fs;

use crate::{
    config::LXC_HWADDR_PREFIX,
    models::{BackingStorage, JobStarted, SnapshotInfo},
    utils::{
        config_path, container_dir, format_bytes, rootfs_path, snapshot_dir,
        validate_container_name, validate_snapshot_name, CONFIG_FILENAME, ROOTFS_SUBDIR,
        SNAPSHOT_TIMESTAMP_FILENAME,
    },
    LxcoreError, LxcoreResult,
};

use super::{ContainerConfig, ContainerManager, OperationKind};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static SNAPSHOT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)(?:\s+\([^)]*\))?(?:\s+(\d{4}):(\d{2}):(\d{2})\s+(\d{2}:\d{2}:\d{2}))?")
        .unwrap()
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One line of the container tool's snapshot listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotListing {
    /// The snapshot name, e.g. `snap0`.
    pub name: String,

    /// The creation time as `YYYY-MM-DD HH:MM:SS`, if the tool reported one.
    pub created: Option<String>,
}

/// The identity fields carried over from the live config when a snapshot is restored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IdentityFields {
    autostart: bool,
    description: Option<String>,
    webui: Option<String>,
    index: Option<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerManager {
    /// Lists the snapshots of `name` that actually exist on disk.
    pub async fn list_snapshots(&self, name: &str) -> LxcoreResult<Vec<SnapshotInfo>> {
        validate_container_name(name)?;
        self.ensure_exists(name).await?;

        let root = self.lxc_root().await?;
        let listing = self.tool().snapshot_list(&root, name).await?;

        let mut snapshots = Vec::new();
        for entry in parse_snapshot_list(&listing) {
            let dir = snapshot_dir(&root, name, &entry.name);
            if !fs::try_exists(&dir).await.unwrap_or(false) {
                tracing::debug!(container = %name, snapshot = %entry.name, "listed snapshot has no directory");
                continue;
            }

            let size = match self.storage().disk_usage(&dir).await {
                Ok(size) => size,
                Err(e) => {
                    tracing::warn!(container = %name, snapshot = %entry.name, error = %e, "could not measure snapshot");
                    0
                }
            };

            snapshots.push(SnapshotInfo {
                name: entry.name,
                created: entry.created,
                size,
                size_formatted: format_bytes(size),
            });
        }

        Ok(snapshots)
    }

    /// Takes a snapshot of `name` and returns the new snapshot's name.
    ///
    /// Snapshots are taken offline: a running container is stopped first and started again
    /// afterwards, even if the snapshot fails.
    pub async fn create_snapshot(&self, name: &str) -> LxcoreResult<String> {
        validate_container_name(name)?;
        let _slot = self
            .tracker()
            .acquire(name, OperationKind::Snapshot, "snapshot")?;
        self.ensure_exists(name).await?;

        let root = self.lxc_root().await?;
        let was_running = self.tool().state(&root, name).await?.is_active();
        if was_running {
            self.tool().stop(&root, name).await?;
        }

        let created = self.take_snapshot(&root, name).await;

        if was_running {
            if let Err(e) = self.tool().start(&root, name).await {
                tracing::warn!(container = %name, error = %e, "could not restart container after snapshot");
            }
        }

        let snapshot = created?;
        tracing::info!(container = %name, %snapshot, "snapshot created");
        Ok(snapshot)
    }

    /// Deletes snapshot `snapshot` of `name`.
    pub async fn delete_snapshot(&self, name: &str, snapshot: &str) -> LxcoreResult<()> {
        validate_container_name(name)?;
        validate_snapshot_name(snapshot)?;
        self.tracker().ensure_idle(name, "delete snapshot of")?;

        let root = self.lxc_root().await?;
        let dir = snapshot_dir(&root, name, snapshot);
        if !fs::try_exists(&dir).await? {
            return Err(LxcoreError::SnapshotNotFound {
                container: name.to_string(),
                snapshot: snapshot.to_string(),
            });
        }

        if let Err(e) = self.storage().unmount(&dir.join(ROOTFS_SUBDIR)).await {
            tracing::debug!(container = %name, %snapshot, error = %e, "snapshot rootfs not unmounted");
        }

        self.tool().snapshot_delete(&root, name, snapshot).await?;
        tracing::info!(container = %name, %snapshot, "snapshot deleted");
        Ok(())
    }

    /// Starts replacing the rootfs of `name` with snapshot `snapshot`.
    ///
    /// Autostart, description, web UI hint and index keep their current values.
    pub async fn restore_snapshot(&self, name: &str, snapshot: &str) -> LxcoreResult<JobStarted> {
        validate_container_name(name)?;
        validate_snapshot_name(snapshot)?;
        let slot = self
            .tracker()
            .acquire(name, OperationKind::Snapshot, "restore snapshot of")?;
        self.ensure_exists(name).await?;

        let root = self.lxc_root().await?;
        if !fs::try_exists(snapshot_dir(&root, name, snapshot)).await? {
            return Err(LxcoreError::SnapshotNotFound {
                container: name.to_string(),
                snapshot: snapshot.to_string(),
            });
        }

        let manager = self.clone();
        let container = name.to_string();
        let snapshot = snapshot.to_string();
        self.spawn_job(slot, async move {
            manager
                .run_snapshot_restore(&root, &container, &snapshot)
                .await
        });

        Ok(JobStarted::new(name, OperationKind::Snapshot))
    }

    /// Starts creating container `new_name` from snapshot `snapshot` of `source`.
    ///
    /// The job holds the tracker slot of `source` so the snapshot cannot be deleted while it is
    /// being copied. The new name is only protected by the existence check made here.
    pub async fn clone_snapshot(
        &self,
        source: &str,
        snapshot: &str,
        new_name: &str,
    ) -> LxcoreResult<JobStarted> {
        validate_container_name(source)?;
        validate_snapshot_name(snapshot)?;
        validate_container_name(new_name)?;
        let slot = self
            .tracker()
            .acquire(source, OperationKind::Snapshot, "clone")?;
        self.ensure_exists(source).await?;

        if self.container_exists(new_name).await? {
            return Err(LxcoreError::TargetExists(new_name.to_string()));
        }

        let root = self.lxc_root().await?;
        if !fs::try_exists(snapshot_dir(&root, source, snapshot)).await? {
            return Err(LxcoreError::SnapshotNotFound {
                container: source.to_string(),
                snapshot: snapshot.to_string(),
            });
        }

        let manager = self.clone();
        let source = source.to_string();
        let snapshot = snapshot.to_string();
        let target = new_name.to_string();
        self.spawn_job(slot, async move {
            manager
                .run_snapshot_clone(&root, &source, &snapshot, &target)
                .await
        });

        Ok(JobStarted::new(new_name, OperationKind::Snapshot))
    }

    /// Returns the snapshot names the container tool reports for `name`.
    pub(crate) async fn snapshot_names(&self, root: &Path, name: &str) -> LxcoreResult<Vec<String>> {
        let listing = self.tool().snapshot_list(root, name).await?;
        Ok(parse_snapshot_list(&listing)
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// Snapshots `name` and identifies the new snapshot by diffing the listings around it.
    pub(crate) async fn take_snapshot(&self, root: &Path, name: &str) -> LxcoreResult<String> {
        let before: HashSet<String> = self.snapshot_names(root, name).await?.into_iter().collect();
        self.tool().snapshot_create(root, name).await?;
        let after = self.snapshot_names(root, name).await?;

        after
            .into_iter()
            .find(|snapshot| !before.contains(snapshot))
            .ok_or_else(|| {
                LxcoreError::command_failed("snapshot", name, "new snapshot not found in listing")
            })
    }

    async fn run_snapshot_restore(
        &self,
        root: &Path,
        name: &str,
        snapshot: &str,
    ) -> LxcoreResult<String> {
        let was_running = match self.tool().state(root, name).await {
            Ok(state) => state.is_active(),
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "could not read container state");
                false
            }
        };

        let result = self.replace_with_snapshot(root, name, snapshot, was_running).await;

        if was_running {
            if let Err(e) = self.tool().start(root, name).await {
                tracing::warn!(container = %name, error = %e, "could not restart container after snapshot restore");
            }
        }

        self.invalidate_metadata(name);
        self.invalidate_lxc_root();

        result?;
        Ok(format!("{} restored from snapshot {}", name, snapshot))
    }

    async fn replace_with_snapshot(
        &self,
        root: &Path,
        name: &str,
        snapshot: &str,
        was_running: bool,
    ) -> LxcoreResult<()> {
        if was_running {
            self.tool().stop(root, name).await?;
        }

        let live = ContainerConfig::load(config_path(root, name)).await?;
        let identity = IdentityFields {
            autostart: live.autostart(),
            description: live.description().map(str::to_string),
            webui: live.webui().map(str::to_string),
            index: live.index(),
        };
        let storage = live.backing_storage();

        let source = snapshot_dir(root, name, snapshot);
        let rootfs = rootfs_path(root, name);
        self.replace_rootfs(storage, &source.join(ROOTFS_SUBDIR), &rootfs)
            .await?;

        let snapshot_config = fs::read_to_string(source.join(CONFIG_FILENAME)).await?;
        let mut config = ContainerConfig::new(config_path(root, name), snapshot_config);
        config.set_rootfs(storage, &rootfs);
        config.set_uts_name(name);
        config.set_autostart(identity.autostart);
        config.set_description(identity.description.as_deref())?;
        config.set_webui(identity.webui.as_deref())?;
        config.set_index(identity.index)?;
        config.save().await?;

        tracing::info!(container = %name, %snapshot, %storage, "snapshot restored");
        Ok(())
    }

    async fn run_snapshot_clone(
        &self,
        root: &Path,
        source: &str,
        snapshot: &str,
        target: &str,
    ) -> LxcoreResult<String> {
        match self.copy_snapshot(root, source, snapshot, target).await {
            Ok(()) => {
                self.invalidate_lxc_root();
                Ok(format!(
                    "{} created from snapshot {} of {}",
                    target, snapshot, source
                ))
            }
            Err(e) => {
                if let Err(cleanup) = self.teardown(root, target).await {
                    tracing::warn!(container = %target, error = %cleanup, "could not remove partial clone");
                }
                Err(e)
            }
        }
    }

    async fn copy_snapshot(
        &self,
        root: &Path,
        source: &str,
        snapshot: &str,
        target: &str,
    ) -> LxcoreResult<()> {
        let snapshot_path = snapshot_dir(root, source, snapshot);
        let storage = ContainerConfig::load(config_path(root, source))
            .await?
            .backing_storage();

        let target_dir = container_dir(root, target);
        fs::create_dir_all(&target_dir).await?;

        let rootfs = rootfs_path(root, target);
        match storage {
            BackingStorage::Btrfs => {
                self.storage()
                    .snapshot_subvolume(&snapshot_path.join(ROOTFS_SUBDIR), &rootfs)
                    .await?
            }
            BackingStorage::Directory => {
                self.storage()
                    .copy_tree(&snapshot_path.join(ROOTFS_SUBDIR), &rootfs)
                    .await?
            }
        }

        let index = self.next_available_index(Some(target)).await?;
        let snapshot_config = fs::read_to_string(snapshot_path.join(CONFIG_FILENAME)).await?;
        let mut config = ContainerConfig::new(config_path(root, target), snapshot_config);
        config.set_rootfs(storage, &rootfs);
        config.set_uts_name(target);
        config.regenerate_hwaddrs(random_hwaddr);
        config.set_index(Some(index))?;
        config.save().await?;

        tracing::info!(container = %target, %source, %snapshot, %storage, index, "snapshot cloned");
        Ok(())
    }

    /// Replaces the tree at `rootfs` with a copy of `source`.
    pub(crate) async fn replace_rootfs(
        &self,
        storage: BackingStorage,
        source: &Path,
        rootfs: &Path,
    ) -> LxcoreResult<()> {
        match storage {
            BackingStorage::Btrfs => {
                if fs::try_exists(rootfs).await? {
                    self.storage().delete_subvolume(rootfs).await?;
                }
                self.storage().snapshot_subvolume(source, rootfs).await
            }
            BackingStorage::Directory => {
                if fs::try_exists(rootfs).await? {
                    fs::remove_dir_all(rootfs).await?;
                }
                self.storage().copy_tree(source, rootfs).await
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses the output of `lxc-snapshot -L`.
///
/// Lines look like `snap0 (/var/lib/lxc/web1/snaps) 2024:01:15 10:30:00`. The date separator
/// is normalized to dashes. `No snapshots` and blank lines yield nothing.
pub fn parse_snapshot_list(listing: &str) -> Vec<SnapshotListing> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("No snapshots"))
        .filter_map(|line| {
            let captures = SNAPSHOT_LINE_RE.captures(line)?;
            let name = captures.get(1)?.as_str().to_string();
            let created = match (
                captures.get(2),
                captures.get(3),
                captures.get(4),
                captures.get(5),
            ) {
                (Some(year), Some(month), Some(day), Some(time)) => Some(format!(
                    "{}-{}-{} {}",
                    year.as_str(),
                    month.as_str(),
                    day.as_str(),
                    time.as_str()
                )),
                _ => None,
            };
            Some(SnapshotListing { name, created })
        })
        .collect()
}

/// Returns the path of the timestamp marker inside a snapshot.
pub(crate) fn snapshot_timestamp_path(root: &Path, name: &str, snapshot: &str) -> PathBuf {
    snapshot_dir(root, name, snapshot).join(SNAPSHOT_TIMESTAMP_FILENAME)
}

fn random_hwaddr() -> String {
    let [a, b, c] = rand::random::<[u8; 3]>();
    format!("{}:{:02x}:{:02x}:{:02x}", LXC_HWADDR_PREFIX, a, b, c)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_list() {
        let listing = "snap0 (/var/lib/lxc/web1/snaps) 2024:01:15 10:30:00\n\
                       snap1 (/var/lib/lxc/web1/snaps) 2024:02:01 08:05:59\n";

        let parsed = parse_snapshot_list(listing);
        assert_eq!(
            parsed,
            vec![
                SnapshotListing {
                    name: "snap0".into(),
                    created: Some("2024-01-15 10:30:00".into()),
                },
                SnapshotListing {
                    name: "snap1".into(),
                    created: Some("2024-02-01 08:05:59".into()),
                },
            ]
        );
    }

    #[test]
    fn test_parse_snapshot_list_without_timestamp() {
        let parsed = parse_snapshot_list("snap3 (/var/lib/lxc/db/snaps)\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "snap3");
        assert_eq!(parsed[0].created, None);
    }

    #[test]
    fn test_parse_snapshot_list_empty() {
        assert!(parse_snapshot_list("").is_empty());
        assert!(parse_snapshot_list("No snapshots\n").is_empty());
    }

    #[test]
    fn test_random_hwaddr_format() {
        let hwaddr = random_hwaddr();
        assert!(hwaddr.starts_with("00:16:3e:"));
        assert_eq!(hwaddr.len(), 17);
        assert!(hwaddr
            .split(':')
            .all(|octet| octet.len() == 2 && u8::from_str_radix(octet, 16).is_ok()));
    }
}
