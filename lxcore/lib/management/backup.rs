//! Compressed backups of containers.
//!
//! A backup is accepted synchronously, which fixes the archive filename, and then written by a
//! detached job. The job either leaves a complete archive behind or nothing at all: on failure
//! or abort the partial archive, the temporary snapshot and the bundled icon copy are removed and
//! a container that was running is brought back to the state it was found in.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    host::ArchiveJob,
    models::{BackingStorage, BackupEntry, BackupStarted, ContainerState},
    notify::Priority,
    utils::{
        compressor_threads, container_dir, format_bytes, host_cpu_count, icon_path, snapshot_dir,
        validate_backup_filename, validate_compression_level, validate_container_name,
        BACKUP_EXTENSION, BUNDLED_ICON_FILENAME, SNAPS_SUBDIR,
    },
    LxcoreError, LxcoreResult,
};

use super::{remove_if_exists, snapshot::snapshot_timestamp_path, ContainerManager, OperationKind};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The timestamp embedded in backup filenames. It sorts chronologically as plain text.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Per-request overrides of the backup settings.
///
/// Unset fields fall back to the `[backup]` settings section.
#[derive(Debug, Clone, Default, PartialEq, TypedBuilder)]
pub struct BackupOptions {
    /// The backup root to write below instead of the configured one.
    #[builder(default, setter(strip_option, into))]
    pub backup_path: Option<PathBuf>,

    /// The xz compression level (0-9).
    #[builder(default, setter(strip_option))]
    pub compression: Option<u32>,

    /// The compressor thread count, `0` for automatic.
    #[builder(default, setter(strip_option))]
    pub threads: Option<usize>,

    /// Whether to archive a temporary snapshot so the container only stops briefly.
    ///
    /// Ignored for containers that are not BTRFS-backed.
    #[builder(default, setter(strip_option))]
    pub use_snapshot: Option<bool>,

    /// How many backups of the container to keep. `0` keeps all of them.
    #[builder(default, setter(strip_option))]
    pub backups_to_keep: Option<usize>,
}

/// Everything a backup job needs, resolved before the job is accepted.
#[derive(Debug, Clone)]
struct BackupPlan {
    name: String,
    lxc_root: PathBuf,
    backup_dir: PathBuf,
    archive: PathBuf,
    icons_dir: PathBuf,
    compression: u32,
    threads: usize,
    use_snapshot: bool,
    was_running: bool,
    was_frozen: bool,
    backups_to_keep: usize,
}

/// What the job has changed so far and must undo or finish.
#[derive(Debug, Default)]
struct BackupProgress {
    snapshot: Option<String>,
    icon_copy: Option<PathBuf>,
    stopped: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerManager {
    /// Accepts a backup of `name` and starts writing it in the background.
    ///
    /// The returned acknowledgment already carries the archive filename and the effective
    /// settings. Completion is reported through the notifier and the job-event channel.
    pub async fn backup_container(
        &self,
        name: &str,
        options: &BackupOptions,
    ) -> LxcoreResult<BackupStarted> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "backup")?;
        self.ensure_exists(name).await?;

        let settings = self.settings().await?;
        let defaults = settings.get_backup();

        let compression = options.compression.unwrap_or(*defaults.get_compression());
        validate_compression_level(compression)?;

        let root = self.lxc_root().await?;
        let is_btrfs = match self.load_config(name).await? {
            Some(config) => config.backing_storage() == BackingStorage::Btrfs,
            None => false,
        };

        let requested_snapshot = options.use_snapshot.unwrap_or(*defaults.get_use_snapshot());
        let use_snapshot = requested_snapshot && is_btrfs;
        if requested_snapshot && !use_snapshot {
            tracing::info!(container = %name, "container is not BTRFS-backed, backing up without snapshot");
        }

        let backup_root = options
            .backup_path
            .clone()
            .or_else(|| defaults.get_path().clone())
            .ok_or(LxcoreError::BackupRootNotConfigured)?;
        let backup_dir = backup_root.join(name);
        fs::create_dir_all(&backup_dir).await?;

        let initial_state = self.tool().state(&root, name).await?;
        let was_running = initial_state.is_active();
        let threads = compressor_threads(
            options.threads.unwrap_or(*defaults.get_threads()),
            host_cpu_count(),
        );

        let filename = backup_filename(name, Utc::now());
        let plan = BackupPlan {
            name: name.to_string(),
            lxc_root: root,
            archive: backup_dir.join(&filename),
            backup_dir: backup_dir.clone(),
            icons_dir: settings.icons_dir(),
            compression,
            threads,
            use_snapshot,
            was_running,
            was_frozen: initial_state == ContainerState::Frozen,
            backups_to_keep: options
                .backups_to_keep
                .unwrap_or(*defaults.get_backups_to_keep()),
        };

        let slot = self.tracker().acquire(name, OperationKind::Backup, "backup")?;
        let abort = slot.abort_token();

        tracing::info!(
            container = %name,
            %filename,
            compression,
            threads,
            use_snapshot,
            was_running,
            "backup accepted"
        );

        let manager = self.clone();
        self.spawn_job(slot, async move { manager.run_backup(plan, abort).await });

        Ok(BackupStarted {
            success: true,
            backup_file: filename,
            backup_dir: backup_dir.display().to_string(),
            use_snapshot,
            is_btrfs,
            compression,
            threads,
            was_running,
        })
    }

    /// Lists the backups of `name`, newest first.
    pub async fn list_backups(&self, name: &str) -> LxcoreResult<Vec<BackupEntry>> {
        validate_container_name(name)?;
        let dir = self.backup_dir(name).await?;

        let mut backups = Vec::new();
        for filename in backup_filenames(&dir, name).await? {
            let metadata = fs::metadata(dir.join(&filename)).await?;
            let created = parse_backup_timestamp(name, &filename)
                .or_else(|| metadata.modified().ok().map(DateTime::<Utc>::from))
                .unwrap_or_else(Utc::now);

            backups.push(BackupEntry {
                size: metadata.len(),
                size_formatted: format_bytes(metadata.len()),
                created,
                filename,
            });
        }

        backups.sort_by(|a, b| b.filename.cmp(&a.filename));
        Ok(backups)
    }

    /// Deletes one backup of `name`.
    pub async fn delete_backup(&self, name: &str, filename: &str) -> LxcoreResult<()> {
        validate_container_name(name)?;
        validate_backup_filename(name, filename)?;

        let path = self.backup_dir(name).await?.join(filename);
        if !remove_if_exists(&path).await? {
            return Err(LxcoreError::BackupNotFound(path));
        }

        tracing::info!(container = %name, %filename, "backup deleted");
        Ok(())
    }

    /// Asks the running backup of `name` to stop.
    ///
    /// Returns `false` if no backup is running for `name`.
    pub fn abort_backup(&self, name: &str) -> bool {
        match self.tracker().peek(name) {
            Some(info) if info.kind == OperationKind::Backup => self.tracker().abort(name),
            _ => false,
        }
    }

    /// Returns the configured backup directory of `name`.
    pub(crate) async fn backup_dir(&self, name: &str) -> LxcoreResult<PathBuf> {
        let settings = self.settings().await?;
        let root = settings
            .get_backup()
            .get_path()
            .clone()
            .ok_or(LxcoreError::BackupRootNotConfigured)?;
        Ok(root.join(name))
    }

    async fn run_backup(&self, plan: BackupPlan, abort: CancellationToken) -> LxcoreResult<String> {
        let filename = plan
            .archive
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.notify(
            "Backup started",
            format!("{}: writing {}", plan.name, filename),
            Priority::Low,
        )
        .await;

        let mut progress = BackupProgress::default();
        match self.write_backup(&plan, &abort, &mut progress).await {
            Ok(()) => {
                self.finish_backup(&plan, &mut progress).await;
                let size = fs::metadata(&plan.archive)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                Ok(format!(
                    "{} backed up to {} ({})",
                    plan.name,
                    filename,
                    format_bytes(size)
                ))
            }
            Err(e) => {
                self.rollback_backup(&plan, &mut progress).await;
                Err(e)
            }
        }
    }

    async fn write_backup(
        &self,
        plan: &BackupPlan,
        abort: &CancellationToken,
        progress: &mut BackupProgress,
    ) -> LxcoreResult<()> {
        let root = plan.lxc_root.as_path();
        let name = plan.name.as_str();

        if plan.was_running {
            self.tool().stop(root, name).await?;
            progress.stopped = true;
        }

        let source = if plan.use_snapshot {
            let snapshot = self.take_snapshot(root, name).await?;
            progress.snapshot = Some(snapshot.clone());

            remove_if_exists(&snapshot_timestamp_path(root, name, &snapshot)).await?;

            if progress.stopped {
                self.resume_container(plan).await?;
                progress.stopped = false;
            }

            tracing::debug!(container = %name, %snapshot, "archiving from snapshot");
            snapshot_dir(root, name, &snapshot)
        } else {
            container_dir(root, name)
        };

        let icon = icon_path(&plan.icons_dir, name);
        if fs::try_exists(&icon).await? {
            let bundled = source.join(BUNDLED_ICON_FILENAME);
            fs::copy(&icon, &bundled).await?;
            progress.icon_copy = Some(bundled);
        }

        if abort.is_cancelled() {
            return Err(LxcoreError::Aborted);
        }

        let job = ArchiveJob::builder()
            .source(source)
            .destination(plan.archive.clone())
            .compression(plan.compression)
            .threads(plan.threads)
            .excludes(vec![SNAPS_SUBDIR.to_string()])
            .build();
        self.archiver().archive(&job, abort.clone()).await
    }

    async fn finish_backup(&self, plan: &BackupPlan, progress: &mut BackupProgress) {
        let name = plan.name.as_str();

        self.remove_icon_copy(progress).await;
        self.remove_backup_snapshot(plan, progress).await;

        if progress.stopped {
            match self.resume_container(plan).await {
                Ok(()) => progress.stopped = false,
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "could not restart container after backup")
                }
            }
        }

        if let Err(e) = prune_backups(&plan.backup_dir, name, plan.backups_to_keep).await {
            tracing::warn!(container = %name, error = %e, "could not prune old backups");
        }
    }

    async fn rollback_backup(&self, plan: &BackupPlan, progress: &mut BackupProgress) {
        let root = plan.lxc_root.as_path();
        let name = plan.name.as_str();

        match remove_if_exists(&plan.archive).await {
            Ok(true) => tracing::debug!(container = %name, archive = %plan.archive.display(), "partial archive removed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(container = %name, error = %e, "could not remove partial archive"),
        }

        self.remove_icon_copy(progress).await;
        self.remove_backup_snapshot(plan, progress).await;

        if plan.was_running {
            let running = self
                .tool()
                .state(root, name)
                .await
                .map(|state| state.is_active())
                .unwrap_or(false);
            if !running {
                if let Err(e) = self.resume_container(plan).await {
                    tracing::warn!(container = %name, error = %e, "could not restart container after failed backup");
                }
            }
        }
    }

    /// Brings a container stopped for the backup back to the state it was found in.
    async fn resume_container(&self, plan: &BackupPlan) -> LxcoreResult<()> {
        let root = plan.lxc_root.as_path();
        self.tool().start(root, &plan.name).await?;
        if plan.was_frozen {
            self.tool().freeze(root, &plan.name).await?;
        }
        Ok(())
    }

    async fn remove_icon_copy(&self, progress: &mut BackupProgress) {
        if let Some(copy) = progress.icon_copy.take() {
            if let Err(e) = remove_if_exists(&copy).await {
                tracing::warn!(path = %copy.display(), error = %e, "could not remove bundled icon");
            }
        }
    }

    async fn remove_backup_snapshot(&self, plan: &BackupPlan, progress: &mut BackupProgress) {
        if let Some(snapshot) = progress.snapshot.take() {
            if let Err(e) = self
                .tool()
                .snapshot_delete(&plan.lxc_root, &plan.name, &snapshot)
                .await
            {
                tracing::warn!(container = %plan.name, %snapshot, error = %e, "could not delete temporary snapshot");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the archive filename of a backup of `name` taken at `at`.
pub fn backup_filename(name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}{}",
        name,
        at.format(BACKUP_TIMESTAMP_FORMAT),
        BACKUP_EXTENSION
    )
}

/// Reads the timestamp back out of a backup filename of `name`.
pub fn parse_backup_timestamp(name: &str, filename: &str) -> Option<DateTime<Utc>> {
    let stamp = filename
        .strip_prefix(name)?
        .strip_prefix('_')?
        .strip_suffix(BACKUP_EXTENSION)?;

    NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Returns the backup filenames of `name` in `dir`, oldest first. A missing directory is empty.
async fn backup_filenames(dir: &Path, name: &str) -> LxcoreResult<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let prefix = format!("{}_", name);
    let mut filenames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let filename = entry.file_name().to_string_lossy().into_owned();
        if filename.starts_with(&prefix) && filename.ends_with(BACKUP_EXTENSION) {
            filenames.push(filename);
        }
    }

    filenames.sort();
    Ok(filenames)
}

/// Deletes the oldest backups of `name` until at most `keep` remain. `0` keeps everything.
pub async fn prune_backups(dir: &Path, name: &str, keep: usize) -> LxcoreResult<Vec<String>> {
    if keep == 0 {
        return Ok(Vec::new());
    }

    let filenames = backup_filenames(dir, name).await?;
    let excess = filenames.len().saturating_sub(keep);

    let mut pruned = Vec::with_capacity(excess);
    for filename in filenames.into_iter().take(excess) {
        fs::remove_file(dir.join(&filename)).await?;
        tracing::info!(container = %name, %filename, "old backup pruned");
        pruned.push(filename);
    }

    Ok(pruned)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_backup_filename_round_trips_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let filename = backup_filename("web1", at);
        assert_eq!(filename, "web1_2024-03-09T14-05-07.tar.xz");
        assert_eq!(parse_backup_timestamp("web1", &filename), Some(at));
    }

    #[test]
    fn test_parse_backup_timestamp_rejects_foreign_names() {
        assert_eq!(
            parse_backup_timestamp("web", "web1_2024-03-09T14-05-07.tar.xz"),
            None
        );
        assert_eq!(parse_backup_timestamp("web1", "web1_latest.tar.xz"), None);
    }

    #[tokio::test]
    async fn test_prune_backups_keeps_newest() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for day in 1..=5 {
            let name = format!("web1_2024-01-0{}T00-00-00.tar.xz", day);
            fs::write(dir.path().join(name), b"x").await?;
        }
        fs::write(dir.path().join("web10_2024-01-01T00-00-00.tar.xz"), b"x").await?;
        fs::write(dir.path().join("notes.txt"), b"x").await?;

        let pruned = prune_backups(dir.path(), "web1", 3).await?;
        assert_eq!(
            pruned,
            vec![
                "web1_2024-01-01T00-00-00.tar.xz",
                "web1_2024-01-02T00-00-00.tar.xz",
            ]
        );

        let remaining = backup_filenames(dir.path(), "web1").await?;
        assert_eq!(
            remaining,
            vec![
                "web1_2024-01-03T00-00-00.tar.xz",
                "web1_2024-01-04T00-00-00.tar.xz",
                "web1_2024-01-05T00-00-00.tar.xz",
            ]
        );
        assert!(fs::try_exists(dir.path().join("web10_2024-01-01T00-00-00.tar.xz")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_backups_zero_keeps_all() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("db_2024-01-01T00-00-00.tar.xz"), b"x").await?;

        assert!(prune_backups(dir.path(), "db", 0).await?.is_empty());
        assert_eq!(backup_filenames(dir.path(), "db").await?.len(), 1);
        Ok(())
    }
}
