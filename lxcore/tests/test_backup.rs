mod common;

use std::{fs, path::Path};

use common::{eventually, wait_for_job, TestHost};
use lxcore::{
    config::BackupSettings,
    management::{BackupOptions, CreateRequest, OperationKind},
    models::{BackingStorage, ContainerState},
    notify::JobOutcome,
    utils::{container_dir, snapshots_dir, BUNDLED_ICON_FILENAME, SNAPS_SUBDIR},
    LxcoreError,
};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_backup_running_container() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Running, BackingStorage::Directory, "")?;
    host.manager.set_custom_icon("web1", b"\x89PNG icon").await?;

    let mut events = host.manager.subscribe();
    let started = host
        .manager
        .backup_container("web1", &BackupOptions::default())
        .await?;
    assert!(started.success);
    assert!(started.was_running);
    assert!(!started.use_snapshot);
    assert!(!started.is_btrfs);
    assert!(started.backup_file.starts_with("web1_"));
    assert!(started.backup_file.ends_with(".tar.xz"));

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert!(outcome.is_completed(), "{:?}", outcome);

    let archive = host.backups.join("web1").join(&started.backup_file);
    let entries = archive_entries(&archive)?;
    assert!(entries.iter().any(|e| e == "config"));
    assert!(entries.iter().any(|e| e == "rootfs/etc/hostname"));
    assert!(entries.iter().any(|e| e == BUNDLED_ICON_FILENAME));

    assert!(!container_dir(&host.root, "web1")
        .join(BUNDLED_ICON_FILENAME)
        .exists());
    assert_eq!(host.lxc.state_of("web1"), Some(ContainerState::Running));
    assert_eq!(host.manager.tracker().peek("web1"), None);

    let titles = host.notifier.titles();
    assert!(titles.contains(&"Backup started".to_string()));
    assert!(titles.contains(&"Backup completed".to_string()));

    let backups = host.manager.list_backups("web1").await?;
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].filename, started.backup_file);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_blocks_other_operations() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Running, BackingStorage::Directory, "")?;
    host.archiver.hold();

    let mut events = host.manager.subscribe();
    host.manager
        .backup_container("web1", &BackupOptions::default())
        .await?;
    eventually(|| host.archiver.jobs().len() == 1).await?;
    host.lxc.clear_calls();

    let start = host.manager.start_container("web1").await;
    match start {
        Err(e @ LxcoreError::OperationInProgress { .. }) => {
            assert_eq!(
                e.to_string(),
                "Cannot start container: backup operation in progress"
            );
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    assert!(matches!(
        host.manager.stop_container("web1").await,
        Err(LxcoreError::OperationInProgress { .. })
    ));
    assert!(matches!(
        host.manager.destroy_container("web1", true).await,
        Err(LxcoreError::OperationInProgress { .. })
    ));
    assert!(matches!(
        host.manager.create_snapshot("web1").await,
        Err(LxcoreError::OperationInProgress { .. })
    ));
    assert!(matches!(
        host.manager.convert_to_btrfs("web1").await,
        Err(LxcoreError::OperationInProgress { .. })
    ));
    assert!(matches!(
        host.manager
            .backup_container("web1", &BackupOptions::default())
            .await,
        Err(LxcoreError::OperationInProgress { .. })
    ));
    assert!(host.lxc.calls().is_empty());

    let container = host.manager.get_container("web1").await?;
    assert_eq!(container.active_operation, Some(OperationKind::Backup));

    host.archiver.release();
    let outcome = wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert!(outcome.is_completed());

    host.manager.stop_container("web1").await?;
    assert_eq!(host.lxc.state_of("web1"), Some(ContainerState::Stopped));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_abort_leaves_nothing_behind() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Running, BackingStorage::Directory, "")?;
    host.manager.set_custom_icon("web1", b"\x89PNG icon").await?;
    host.archiver.hold();

    let mut events = host.manager.subscribe();
    let started = host
        .manager
        .backup_container("web1", &BackupOptions::default())
        .await?;
    eventually(|| host.archiver.jobs().len() == 1).await?;

    assert!(host.manager.abort_backup("web1"));

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert_eq!(outcome, JobOutcome::Failed("operation aborted".to_string()));

    assert!(!host.backups.join("web1").join(&started.backup_file).exists());
    assert!(!container_dir(&host.root, "web1")
        .join(BUNDLED_ICON_FILENAME)
        .exists());
    assert_eq!(host.lxc.state_of("web1"), Some(ContainerState::Running));
    assert_eq!(host.manager.tracker().peek("web1"), None);
    assert!(!host.manager.abort_backup("web1"));
    assert!(host
        .notifier
        .titles()
        .contains(&"Backup failed".to_string()));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_failure_restarts_container() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Running, BackingStorage::Directory, "")?;
    host.archiver.fail();

    let mut events = host.manager.subscribe();
    let started = host
        .manager
        .backup_container("web1", &BackupOptions::default())
        .await?;

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert!(!outcome.is_completed());

    assert!(!host.backups.join("web1").join(&started.backup_file).exists());
    assert_eq!(host.lxc.state_of("web1"), Some(ContainerState::Running));
    assert!(host.manager.list_backups("web1").await?.is_empty());
    assert_eq!(host.manager.tracker().peek("web1"), None);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_failure_removes_temporary_snapshot() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.storage.set_btrfs(true);
    host.add_container("web1", ContainerState::Running, BackingStorage::Btrfs, "")?;
    host.archiver.fail();

    let mut events = host.manager.subscribe();
    let options = BackupOptions::builder().use_snapshot(true).build();
    let started = host.manager.backup_container("web1", &options).await?;
    assert!(started.use_snapshot);

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert!(!outcome.is_completed());

    assert!(!snapshots_dir(&host.root, "web1").join("snap0").exists());
    assert!(host
        .lxc
        .calls()
        .iter()
        .any(|c| c == "snapshot-delete web1"));
    assert!(!host.backups.join("web1").join(&started.backup_file).exists());
    assert_eq!(host.manager.tracker().peek("web1"), None);
    assert_eq!(host.lxc.state_of("web1"), Some(ContainerState::Running));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_refreezes_frozen_container() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Frozen, BackingStorage::Directory, "")?;

    let mut events = host.manager.subscribe();
    let started = host
        .manager
        .backup_container("web1", &BackupOptions::default())
        .await?;
    assert!(started.was_running);

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert!(outcome.is_completed(), "{:?}", outcome);

    assert_eq!(
        host.lxc.calls(),
        vec!["state web1", "stop web1", "start web1", "freeze web1"]
    );
    assert_eq!(host.lxc.state_of("web1"), Some(ContainerState::Frozen));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_prunes_old_archives() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Stopped, BackingStorage::Directory, "")?;

    let dir = host.backups.join("web1");
    fs::create_dir_all(&dir)?;
    for day in 1..=3 {
        fs::write(
            dir.join(format!("web1_2024-01-0{}T00-00-00.tar.xz", day)),
            b"old",
        )?;
    }
    fs::write(dir.join("notes.txt"), b"keep me")?;

    let mut events = host.manager.subscribe();
    let options = BackupOptions::builder().backups_to_keep(2).build();
    let started = host.manager.backup_container("web1", &options).await?;
    assert!(!started.was_running);

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert!(outcome.is_completed());

    let names: Vec<String> = host
        .manager
        .list_backups("web1")
        .await?
        .into_iter()
        .map(|b| b.filename)
        .collect();
    assert_eq!(
        names,
        vec![
            started.backup_file.clone(),
            "web1_2024-01-03T00-00-00.tar.xz".to_string()
        ]
    );
    assert!(dir.join("notes.txt").exists());
    assert!(!host.lxc.calls().iter().any(|c| c == "stop web1"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_snapshot_downgraded_for_directory_storage() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Stopped, BackingStorage::Directory, "")?;

    let mut events = host.manager.subscribe();
    let options = BackupOptions::builder().use_snapshot(true).build();
    let started = host.manager.backup_container("web1", &options).await?;
    assert!(!started.use_snapshot);
    assert!(!started.is_btrfs);

    wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert!(!host
        .lxc
        .calls()
        .iter()
        .any(|c| c.starts_with("snapshot-create")));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_from_snapshot_keeps_downtime_short() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.storage.set_btrfs(true);
    host.add_container("web1", ContainerState::Running, BackingStorage::Btrfs, "")?;

    let mut events = host.manager.subscribe();
    let options = BackupOptions::builder()
        .use_snapshot(true)
        .compression(3)
        .build();
    let started = host.manager.backup_container("web1", &options).await?;
    assert!(started.use_snapshot);
    assert!(started.is_btrfs);
    assert_eq!(started.compression, 3);

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Backup).await?;
    assert!(outcome.is_completed(), "{:?}", outcome);

    assert_eq!(
        host.lxc.calls(),
        vec![
            "state web1",
            "stop web1",
            "snapshot-create web1",
            "start web1",
            "snapshot-delete web1"
        ]
    );

    let jobs = host.archiver.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].source, snapshots_dir(&host.root, "web1").join("snap0"));
    assert_eq!(jobs[0].compression, 3);
    assert_eq!(jobs[0].excludes, vec![SNAPS_SUBDIR.to_string()]);

    let entries = archive_entries(&host.backups.join("web1").join(&started.backup_file))?;
    assert!(!entries.iter().any(|e| e == "ts"));
    assert!(!snapshots_dir(&host.root, "web1").join("snap0").exists());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_requires_backup_root() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Running, BackingStorage::Directory, "")?;
    host.settings.update(|settings| {
        settings.set_backup(BackupSettings::default());
    });

    let result = host
        .manager
        .backup_container("web1", &BackupOptions::default())
        .await;
    assert!(matches!(result, Err(LxcoreError::BackupRootNotConfigured)));
    assert!(!host.lxc.calls().iter().any(|c| c == "stop web1"));
    assert_eq!(host.manager.tracker().peek("web1"), None);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_rejects_invalid_requests() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Stopped, BackingStorage::Directory, "")?;

    let options = BackupOptions::builder().compression(12).build();
    assert!(matches!(
        host.manager.backup_container("web1", &options).await,
        Err(LxcoreError::InvalidCompressionLevel(12))
    ));
    assert!(matches!(
        host.manager
            .backup_container("ghost", &BackupOptions::default())
            .await,
        Err(LxcoreError::ContainerNotFound(_))
    ));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_backup_delete() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    let request = CreateRequest::builder()
        .name("web1")
        .distribution("ubuntu")
        .release("noble")
        .architecture("amd64")
        .build();
    host.manager.create_container(&request).await?;

    let dir = host.backups.join("web1");
    fs::create_dir_all(&dir)?;
    let filename = "web1_2024-05-01T12-00-00.tar.xz";
    fs::write(dir.join(filename), b"archive")?;

    assert!(matches!(
        host.manager.delete_backup("web1", "../web1_x.tar.xz").await,
        Err(LxcoreError::InvalidBackupFilename(_))
    ));
    assert!(matches!(
        host.manager
            .delete_backup("web1", "web1_2023-01-01T00-00-00.tar.xz")
            .await,
        Err(LxcoreError::BackupNotFound(_))
    ));

    host.manager.delete_backup("web1", filename).await?;
    assert!(!dir.join(filename).exists());

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn archive_entries(path: &Path) -> anyhow::Result<Vec<String>> {
    let mut archive = tar::Archive::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        entries.push(
            entry
                .path()?
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string(),
        );
    }
    Ok(entries)
}
