mod common;

use std::fs;

use common::{wait_for_job, TestHost};
use lxcore::{
    config::LXC_HWADDR_PREFIX,
    management::OperationKind,
    models::{BackingStorage, ContainerState},
    utils::{rootfs_path, snapshot_dir},
    LxcoreError,
};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_snapshot_create_and_list() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Running, BackingStorage::Directory, "")?;

    let snapshot = host.manager.create_snapshot("web1").await?;
    assert_eq!(snapshot, "snap0");
    assert_eq!(
        host.lxc.calls(),
        vec![
            "state web1",
            "stop web1",
            "snapshot-create web1",
            "start web1"
        ]
    );
    assert_eq!(host.lxc.state_of("web1"), Some(ContainerState::Running));
    assert_eq!(host.manager.tracker().peek("web1"), None);

    assert_eq!(host.manager.create_snapshot("web1").await?, "snap1");

    let snapshots = host.manager.list_snapshots("web1").await?;
    let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["snap0", "snap1"]);
    assert_eq!(snapshots[0].created.as_deref(), Some("2024-01-15 10:30:00"));
    assert!(snapshots[0].size > 0);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_create_restarts_after_failure() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Running, BackingStorage::Directory, "")?;
    host.lxc.fail("snapshot-create");

    let result = host.manager.create_snapshot("web1").await;
    assert!(matches!(result, Err(LxcoreError::CommandFailed { .. })));
    assert_eq!(host.lxc.state_of("web1"), Some(ContainerState::Running));
    assert_eq!(host.manager.tracker().peek("web1"), None);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_delete() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Stopped, BackingStorage::Directory, "")?;
    let snapshot = host.manager.create_snapshot("web1").await?;

    host.manager.delete_snapshot("web1", &snapshot).await?;
    assert!(!snapshot_dir(&host.root, "web1", &snapshot).exists());
    assert!(host.manager.list_snapshots("web1").await?.is_empty());

    assert!(matches!(
        host.manager.delete_snapshot("web1", &snapshot).await,
        Err(LxcoreError::SnapshotNotFound { .. })
    ));
    assert!(matches!(
        host.manager.delete_snapshot("web1", "../snap0").await,
        Err(LxcoreError::InvalidSnapshotName(_))
    ));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_restore_keeps_identity() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container(
        "web1",
        ContainerState::Running,
        BackingStorage::Directory,
        "#container_order=2\n#container_description=Before\n",
    )?;
    let snapshot = host.manager.create_snapshot("web1").await?;

    fs::write(rootfs_path(&host.root, "web1").join("scratch"), b"after")?;
    host.manager.set_description("web1", Some("After")).await?;
    host.manager.set_autostart("web1", true).await?;
    host.manager
        .set_webui("web1", Some("http://web1.lan:8080"))
        .await?;

    let mut events = host.manager.subscribe();
    let started = host.manager.restore_snapshot("web1", &snapshot).await?;
    assert_eq!(started.operation, OperationKind::Snapshot);

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Snapshot).await?;
    assert!(outcome.is_completed(), "{:?}", outcome);

    assert!(!rootfs_path(&host.root, "web1").join("scratch").exists());
    assert!(rootfs_path(&host.root, "web1")
        .join("etc/hostname")
        .exists());

    let container = host.manager.get_container("web1").await?;
    assert_eq!(container.description.as_deref(), Some("After"));
    assert!(container.autostart);
    assert_eq!(container.webui.as_deref(), Some("http://web1.lan:8080"));
    assert_eq!(container.index, Some(2));
    assert_eq!(container.state, ContainerState::Running);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_clone() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container(
        "web1",
        ContainerState::Stopped,
        BackingStorage::Directory,
        "#container_order=1\n",
    )?;
    let snapshot = host.manager.create_snapshot("web1").await?;

    let mut events = host.manager.subscribe();
    let started = host
        .manager
        .clone_snapshot("web1", &snapshot, "web2")
        .await?;
    assert_eq!(started.name, "web2");

    let outcome = wait_for_job(&mut events, "web1", OperationKind::Snapshot).await?;
    assert!(outcome.is_completed(), "{:?}", outcome);

    let config = host.config("web2")?;
    assert!(config.contains("lxc.uts.name = web2"));
    assert!(config.contains(&format!(
        "lxc.rootfs.path = dir:{}",
        rootfs_path(&host.root, "web2").display()
    )));
    assert!(config.contains("#container_order=2"));

    let hwaddr = config
        .lines()
        .find_map(|line| line.strip_prefix("lxc.net.0.hwaddr = "))
        .unwrap();
    assert!(hwaddr.starts_with(LXC_HWADDR_PREFIX));
    assert_ne!(hwaddr, "00:16:3e:00:00:01");

    assert!(rootfs_path(&host.root, "web2")
        .join("etc/hostname")
        .exists());
    assert!(host.manager.container_exists("web2").await?);
    assert!(host.config("web1")?.contains("lxc.net.0.hwaddr = 00:16:3e:00:00:01"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_clone_refuses_existing_target() -> anyhow::Result<()> {
    let host = TestHost::new()?;
    host.add_container("web1", ContainerState::Stopped, BackingStorage::Directory, "")?;
    host.add_container("web2", ContainerState::Stopped, BackingStorage::Directory, "")?;
    let snapshot = host.manager.create_snapshot("web1").await?;

    assert!(matches!(
        host.manager.clone_snapshot("web1", &snapshot, "web2").await,
        Err(LxcoreError::TargetExists(_))
    ));
    assert!(matches!(
        host.manager.clone_snapshot("web1", "snap9", "web3").await,
        Err(LxcoreError::SnapshotNotFound { .. })
    ));
    assert_eq!(host.manager.tracker().peek("web1"), None);

    Ok(())
}
