//! Moving directory-backed containers onto BTRFS subvolumes.

use std::path::Path;

use tokio::fs;

use crate::{
    models::{BackingStorage, JobStarted},
    utils::{
        config_path, container_dir, rootfs_path, validate_container_name, CONVERT_SUBVOLUME_NAME,
    },
    LxcoreError, LxcoreResult,
};

use super::{edit_config, ContainerManager, OperationKind};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Where the directory rootfs is parked until the subvolume has taken its place.
const RETIRED_ROOTFS_NAME: &str = "rootfs.old";

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerManager {
    /// Accepts converting the rootfs of `name` into a BTRFS subvolume.
    ///
    /// The LXC root must be on BTRFS and the container must currently be directory-backed.
    pub async fn convert_to_btrfs(&self, name: &str) -> LxcoreResult<JobStarted> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "convert")?;
        self.ensure_exists(name).await?;

        let root = self.lxc_root().await?;
        if !self.storage().is_btrfs(&root).await? {
            return Err(LxcoreError::StoragePolicy(format!(
                "{} is not on a btrfs filesystem",
                root.display()
            )));
        }

        let storage = match self.load_config(name).await? {
            Some(config) => config.backing_storage(),
            None => return Err(LxcoreError::ContainerNotFound(name.to_string())),
        };
        if storage == BackingStorage::Btrfs {
            return Err(LxcoreError::InvalidArgument(format!(
                "container {} is already btrfs-backed",
                name
            )));
        }

        let was_running = self.tool().state(&root, name).await?.is_active();
        let slot = self
            .tracker()
            .acquire(name, OperationKind::ConvertBtrfs, "convert")?;

        tracing::info!(container = %name, was_running, "btrfs conversion accepted");

        let manager = self.clone();
        let container = name.to_string();
        self.spawn_job(slot, async move {
            manager.run_convert(&root, &container, was_running).await
        });

        Ok(JobStarted::new(name, OperationKind::ConvertBtrfs))
    }

    async fn run_convert(&self, root: &Path, name: &str, was_running: bool) -> LxcoreResult<String> {
        let result = self.convert_steps(root, name, was_running).await;
        if result.is_err() {
            self.undo_convert(root, name).await;
        }

        if was_running {
            if let Err(e) = self.tool().start(root, name).await {
                tracing::warn!(container = %name, error = %e, "could not restart container after conversion");
            }
        }

        self.invalidate_metadata(name);
        result?;
        Ok(format!("{} now uses a btrfs subvolume", name))
    }

    async fn convert_steps(&self, root: &Path, name: &str, was_running: bool) -> LxcoreResult<()> {
        if was_running {
            self.tool().stop(root, name).await?;
        }

        let dir = container_dir(root, name);
        let rootfs = rootfs_path(root, name);
        let subvolume = dir.join(CONVERT_SUBVOLUME_NAME);
        let retired = dir.join(RETIRED_ROOTFS_NAME);

        self.storage().create_subvolume(&subvolume).await?;
        self.storage().copy_tree(&rootfs, &subvolume).await?;
        tracing::debug!(container = %name, "rootfs copied into subvolume");

        fs::rename(&rootfs, &retired).await?;
        fs::rename(&subvolume, &rootfs).await?;

        edit_config(config_path(root, name), |config| {
            config.set_rootfs(BackingStorage::Btrfs, &rootfs);
            Ok(())
        })
        .await?;

        if let Err(e) = fs::remove_dir_all(&retired).await {
            tracing::warn!(container = %name, path = %retired.display(), error = %e, "could not remove old rootfs");
        }
        tracing::info!(container = %name, "container converted to btrfs");
        Ok(())
    }

    async fn undo_convert(&self, root: &Path, name: &str) {
        let dir = container_dir(root, name);
        let rootfs = rootfs_path(root, name);
        let subvolume = dir.join(CONVERT_SUBVOLUME_NAME);
        let retired = dir.join(RETIRED_ROOTFS_NAME);

        if fs::try_exists(&subvolume).await.unwrap_or(false) {
            if let Err(e) = self.storage().delete_subvolume(&subvolume).await {
                tracing::warn!(container = %name, error = %e, "could not delete conversion subvolume");
            }
        }

        if !fs::try_exists(&retired).await.unwrap_or(false) {
            return;
        }

        // The config still points at the directory rootfs until the swap has fully succeeded.
        let config_is_btrfs = match super::ContainerConfig::read(config_path(root, name)).await {
            Ok(Some(config)) => config.backing_storage() == BackingStorage::Btrfs,
            _ => false,
        };
        if config_is_btrfs {
            return;
        }

        if fs::try_exists(&rootfs).await.unwrap_or(false) {
            if let Err(e) = self.storage().delete_subvolume(&rootfs).await {
                tracing::warn!(container = %name, error = %e, "could not delete swapped-in subvolume");
                return;
            }
        }

        match fs::rename(&retired, &rootfs).await {
            Ok(()) => tracing::info!(container = %name, "directory rootfs put back"),
            Err(e) => tracing::error!(container = %name, error = %e, "could not put directory rootfs back"),
        }
    }
}
