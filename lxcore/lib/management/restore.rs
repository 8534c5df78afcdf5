//! Restoring backup archives into containers.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::{
    models::{BackingStorage, RestoreStarted},
    utils::{
        config_path, container_dir, icon_path, rootfs_path, snapshots_dir,
        validate_backup_filename, validate_container_name, BUNDLED_ICON_FILENAME,
    },
    LxcoreError, LxcoreResult,
};

use super::{edit_config, ContainerManager, OperationKind};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RestorePlan {
    source: String,
    target: String,
    archive: PathBuf,
    lxc_root: PathBuf,
    icons_dir: PathBuf,
    storage: BackingStorage,
    target_exists: bool,
    was_running: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerManager {
    /// Accepts restoring backup `filename` of `source` as container `new_name`.
    ///
    /// An existing container named `new_name` is destroyed by the job, snapshots included.
    /// `backup_path` overrides the configured backup root for locating the archive.
    pub async fn restore_container(
        &self,
        source: &str,
        new_name: &str,
        filename: &str,
        backup_path: Option<&Path>,
    ) -> LxcoreResult<RestoreStarted> {
        validate_container_name(new_name)?;
        validate_container_name(source)?;
        validate_backup_filename(source, filename)?;
        self.tracker().ensure_idle(new_name, "restore")?;

        let backup_dir = match backup_path {
            Some(root) => root.join(source),
            None => self.backup_dir(source).await?,
        };
        let archive = backup_dir.join(filename);
        if !fs::try_exists(&archive).await? {
            return Err(LxcoreError::BackupNotFound(archive));
        }

        let settings = self.settings().await?;
        let root = self.lxc_root().await?;
        let target_exists = self.container_exists(new_name).await?;
        let was_running = target_exists && self.tool().state(&root, new_name).await?.is_active();

        let plan = RestorePlan {
            source: source.to_string(),
            target: new_name.to_string(),
            archive,
            lxc_root: root,
            icons_dir: settings.icons_dir(),
            storage: *settings.get_lxc().get_backing_storage(),
            target_exists,
            was_running,
        };

        let slot = self
            .tracker()
            .acquire(new_name, OperationKind::Restore, "restore")?;

        tracing::info!(
            container = %new_name,
            %source,
            %filename,
            target_exists,
            was_running,
            "restore accepted"
        );

        let manager = self.clone();
        self.spawn_job(slot, async move { manager.run_restore(plan).await });

        Ok(RestoreStarted {
            success: true,
            name: new_name.to_string(),
            backup_file: filename.to_string(),
            target_exists,
            was_running,
        })
    }

    async fn run_restore(&self, plan: RestorePlan) -> LxcoreResult<String> {
        let result = self.restore_steps(&plan).await;

        self.invalidate_metadata(&plan.source);
        self.invalidate_metadata(&plan.target);
        self.invalidate_lxc_root();

        let index = result?;
        Ok(format!(
            "{} restored from {} as index {}",
            plan.target,
            plan.archive
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            index
        ))
    }

    async fn restore_steps(&self, plan: &RestorePlan) -> LxcoreResult<u32> {
        let root = plan.lxc_root.as_path();
        let name = plan.target.as_str();

        if plan.target_exists {
            self.remove_restore_target(root, name).await?;
        }

        let on_btrfs = self.storage().is_btrfs(root).await?;
        if plan.storage == BackingStorage::Btrfs && !on_btrfs {
            return Err(LxcoreError::StoragePolicy(format!(
                "backing storage is btrfs but {} is not on a btrfs filesystem",
                root.display()
            )));
        }

        let dir = container_dir(root, name);
        let rootfs = rootfs_path(root, name);
        fs::create_dir_all(&dir).await?;
        if plan.storage == BackingStorage::Btrfs {
            self.storage().create_subvolume(&rootfs).await?;
        }

        self.archiver().extract(&plan.archive, &dir).await?;
        tracing::debug!(container = %name, archive = %plan.archive.display(), "archive extracted");

        edit_config(config_path(root, name), |config| {
            config.set_rootfs(plan.storage, &rootfs);
            config.set_uts_name(name);
            Ok(())
        })
        .await?;

        let bundled = dir.join(BUNDLED_ICON_FILENAME);
        if fs::try_exists(&bundled).await? {
            fs::create_dir_all(&plan.icons_dir).await?;
            fs::copy(&bundled, icon_path(&plan.icons_dir, name)).await?;
            fs::remove_file(&bundled).await?;
        }

        self.remove_restored_snapshots(root, name).await?;

        let index = self.next_available_index(Some(name)).await?;
        edit_config(config_path(root, name), |config| config.set_index(Some(index))).await?;

        if plan.was_running {
            self.tool().start(root, name).await?;
        }

        tracing::info!(container = %name, source = %plan.source, index, "container restored");
        Ok(index)
    }

    async fn remove_restore_target(&self, root: &Path, name: &str) -> LxcoreResult<()> {
        if let Err(e) = self.tool().stop(root, name).await {
            tracing::debug!(container = %name, error = %e, "could not stop restore target");
        }

        match self.snapshot_names(root, name).await {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    if let Err(e) = self.tool().snapshot_delete(root, name, &snapshot).await {
                        tracing::warn!(container = %name, %snapshot, error = %e, "could not delete snapshot of restore target");
                    }
                }
            }
            Err(e) => tracing::warn!(container = %name, error = %e, "could not list snapshots of restore target"),
        }

        if let Err(e) = self.tool().destroy(root, name, true).await {
            tracing::warn!(container = %name, error = %e, "container tool could not destroy restore target, tearing down manually");
            self.teardown(root, name).await?;
        }

        Ok(())
    }

    async fn remove_restored_snapshots(&self, root: &Path, name: &str) -> LxcoreResult<()> {
        let snaps = snapshots_dir(root, name);
        if !fs::try_exists(&snaps).await? {
            return Ok(());
        }

        if let Ok(subvolumes) = self.storage().list_subvolumes(&snaps).await {
            for subvolume in subvolumes {
                self.storage().delete_subvolume(&subvolume).await?;
            }
        }

        if fs::try_exists(&snaps).await? {
            fs::remove_dir_all(&snaps).await?;
        }

        tracing::debug!(container = %name, "snapshots from archive removed");
        Ok(())
    }
}
