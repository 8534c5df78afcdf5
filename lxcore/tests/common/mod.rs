//! In-memory stand-ins for the host collaborators, shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use lxcore::{
    config::{BackupSettings, CacheSettings, LxcSettings, Settings, StaticSettings},
    host::{ArchiveJob, Archiver, ContainerTool, CreateTemplate, StorageTool},
    management::{ContainerManager, OperationKind},
    models::{BackingStorage, ContainerState},
    notify::{JobEvent, JobOutcome, Notification, Notifier},
    utils::{config_path, container_dir, rootfs_path, snapshots_dir, CONFIG_FILENAME},
    LxcoreError, LxcoreResult,
};
use tempfile::TempDir;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The timestamp the fake tool records for every snapshot.
pub const SNAPSHOT_TIMESTAMP: &str = "2024:01:15 10:30:00";

const JOB_TIMEOUT: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A container tool that keeps run states in memory and lays containers out on disk the way
/// `lxc-create` and `lxc-snapshot` do.
#[derive(Debug, Default)]
pub struct FakeLxc {
    states: Mutex<BTreeMap<String, ContainerState>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

/// Storage that treats subvolumes as plain directories.
#[derive(Debug, Default)]
pub struct FakeStorage {
    btrfs: AtomicBool,
    calls: Mutex<Vec<String>>,
}

/// Writes uncompressed tar archives and can be held mid-archive or made to fail.
#[derive(Debug, Default)]
pub struct FakeArchiver {
    held: AtomicBool,
    fail: AtomicBool,
    gate: Notify,
    jobs: Mutex<Vec<ArchiveJob>>,
}

/// Keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

/// A manager wired to fakes over a temporary LXC root.
pub struct TestHost {
    pub dir: TempDir,
    pub root: PathBuf,
    pub backups: PathBuf,
    pub lxc: Arc<FakeLxc>,
    pub storage: Arc<FakeStorage>,
    pub archiver: Arc<FakeArchiver>,
    pub notifier: Arc<RecordingNotifier>,
    pub settings: Arc<StaticSettings>,
    pub manager: ContainerManager,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeLxc {
    /// Returns the recorded calls as `"<verb> <name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Makes every later `verb` call fail.
    pub fn fail(&self, verb: &str) {
        self.failing.lock().unwrap().insert(verb.to_string());
    }

    /// Returns the state of `name`, if the tool knows it.
    pub fn state_of(&self, name: &str) -> Option<ContainerState> {
        self.states.lock().unwrap().get(name).copied()
    }

    /// Sets the run state of `name` without touching the disk.
    pub fn register(&self, name: &str, state: ContainerState) {
        self.states.lock().unwrap().insert(name.to_string(), state);
    }

    fn record(&self, verb: &str, name: &str) -> LxcoreResult<()> {
        self.calls.lock().unwrap().push(format!("{} {}", verb, name));
        if self.failing.lock().unwrap().contains(verb) {
            return Err(LxcoreError::command_failed(verb, name, "injected failure"));
        }
        Ok(())
    }

    fn current(&self, lxc_root: &Path, name: &str) -> LxcoreResult<ContainerState> {
        if !config_path(lxc_root, name).exists() {
            return Err(LxcoreError::ContainerNotFound(name.to_string()));
        }
        Ok(self.state_of(name).unwrap_or(ContainerState::Stopped))
    }

    fn transition(&self, lxc_root: &Path, name: &str, state: ContainerState) -> LxcoreResult<()> {
        self.current(lxc_root, name)?;
        self.register(name, state);
        Ok(())
    }
}

impl FakeStorage {
    /// Makes the LXC root look like a BTRFS filesystem.
    pub fn set_btrfs(&self, btrfs: bool) {
        self.btrfs.store(btrfs, Ordering::SeqCst);
    }

    /// Returns the recorded calls as `"<operation> <path>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &str, path: &Path) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", operation, path.display()));
    }
}

impl FakeArchiver {
    /// Holds every archive job after it has started writing until [`FakeArchiver::release`].
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Lets one held archive job finish.
    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }

    /// Makes every later archive job fail after writing a partial archive.
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Returns the archive jobs received so far.
    pub fn jobs(&self) -> Vec<ArchiveJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl RecordingNotifier {
    /// Returns the titles of the notifications received so far.
    pub fn titles(&self) -> Vec<String> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.title.clone())
            .collect()
    }
}

impl TestHost {
    /// Builds a host with an empty LXC root and a configured backup root.
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("lxc");
        let backups = dir.path().join("backups");
        fs::create_dir_all(&root)?;

        let settings = Settings::builder()
            .lxc(
                LxcSettings::builder()
                    .path(root.clone())
                    .cgroup_root(dir.path().join("cgroup"))
                    .build(),
            )
            .backup(BackupSettings::builder().path(backups.clone()).build())
            .cache(CacheSettings::builder().dir(dir.path().join("cache")).build())
            .build();
        let settings = Arc::new(StaticSettings::new(settings));

        let lxc = Arc::new(FakeLxc::default());
        let storage = Arc::new(FakeStorage::default());
        let archiver = Arc::new(FakeArchiver::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let manager = ContainerManager::builder()
            .settings(settings.clone())
            .tool(lxc.clone())
            .storage(storage.clone())
            .archiver(archiver.clone())
            .notifier(notifier.clone())
            .build();

        Ok(Self {
            dir,
            root,
            backups,
            lxc,
            storage,
            archiver,
            notifier,
            settings,
            manager,
        })
    }

    /// Lays out a container on disk and registers it with the tool.
    pub fn add_container(
        &self,
        name: &str,
        state: ContainerState,
        storage: BackingStorage,
        extra_config: &str,
    ) -> anyhow::Result<()> {
        write_container(&self.root, name, "ubuntu", "noble", "amd64", storage)?;
        if !extra_config.is_empty() {
            let path = container_dir(&self.root, name).join(CONFIG_FILENAME);
            let mut config = fs::read_to_string(&path)?;
            config.push_str(extra_config);
            fs::write(&path, config)?;
        }

        self.lxc.register(name, state);
        Ok(())
    }

    /// Returns the raw config of `name`.
    pub fn config(&self, name: &str) -> anyhow::Result<String> {
        Ok(fs::read_to_string(
            container_dir(&self.root, name).join(CONFIG_FILENAME),
        )?)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Waits for the terminal event of the `kind` job holding the slot of `container`.
pub async fn wait_for_job(
    events: &mut broadcast::Receiver<JobEvent>,
    container: &str,
    kind: OperationKind,
) -> anyhow::Result<JobOutcome> {
    tokio::time::timeout(JOB_TIMEOUT, async {
        loop {
            let event = events.recv().await?;
            if event.container == container && event.kind == kind {
                return Ok::<_, anyhow::Error>(event.outcome);
            }
        }
    })
    .await?
}

/// Waits until `condition` holds, polling briefly.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(JOB_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

fn write_container(
    root: &Path,
    name: &str,
    distribution: &str,
    release: &str,
    architecture: &str,
    storage: BackingStorage,
) -> std::io::Result<()> {
    let dir = container_dir(root, name);
    let rootfs = rootfs_path(root, name);
    fs::create_dir_all(rootfs.join("etc"))?;
    fs::write(rootfs.join("etc").join("hostname"), format!("{}\n", name))?;

    let config = format!(
        "# Template used to create this container: /usr/share/lxc/templates/lxc-download\n\
         # Parameters passed to the template: --dist {} --release {} --arch {}\n\
         lxc.include = /usr/share/lxc/config/common.conf\n\
         lxc.arch = linux64\n\
         lxc.rootfs.path = {}{}\n\
         lxc.uts.name = {}\n\
         lxc.net.0.type = veth\n\
         lxc.net.0.link = lxcbr0\n\
         lxc.net.0.hwaddr = 00:16:3e:00:00:01\n",
        distribution,
        release,
        architecture,
        storage.rootfs_prefix(),
        rootfs.display(),
        name
    );
    fs::write(dir.join(CONFIG_FILENAME), config)
}

fn state_column(state: ContainerState) -> &'static str {
    match state {
        ContainerState::Running => "RUNNING",
        ContainerState::Stopped => "STOPPED",
        ContainerState::Frozen => "FROZEN",
    }
}

fn copy_dir(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        size += if metadata.is_dir() {
            dir_size(&entry.path())?
        } else {
            metadata.len()
        };
    }
    Ok(size)
}

fn container_names(root: &Path) -> std::io::Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(CONFIG_FILENAME).is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

fn snapshot_dirs(root: &Path, name: &str) -> std::io::Result<Vec<String>> {
    let snaps = snapshots_dir(root, name);
    if !snaps.exists() {
        return Ok(Vec::new());
    }

    let mut names: Vec<String> = fs::read_dir(snaps)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort_by_key(|snapshot| {
        snapshot
            .trim_start_matches("snap")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    Ok(names)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ContainerTool for FakeLxc {
    async fn list(&self, lxc_root: &Path) -> LxcoreResult<String> {
        let mut listing = format!(
            "{:<16}{:<10}{:<11}{:<8}{:<14}{:<6}{}\n",
            "NAME", "STATE", "AUTOSTART", "GROUPS", "IPV4", "IPV6", "UNPRIVILEGED"
        );
        for (position, name) in container_names(lxc_root)?.into_iter().enumerate() {
            let state = self.state_of(&name).unwrap_or(ContainerState::Stopped);
            let ipv4 = match state {
                ContainerState::Running => format!("10.0.3.{}", position + 10),
                _ => "-".to_string(),
            };
            listing.push_str(&format!(
                "{:<16}{:<10}{:<11}{:<8}{:<14}{:<6}{}\n",
                name,
                state_column(state),
                "0",
                "-",
                ipv4,
                "-",
                "false"
            ));
        }
        Ok(listing)
    }

    async fn state(&self, lxc_root: &Path, name: &str) -> LxcoreResult<ContainerState> {
        self.record("state", name)?;
        self.current(lxc_root, name)
    }

    async fn start(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        self.record("start", name)?;
        self.transition(lxc_root, name, ContainerState::Running)
    }

    async fn stop(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        self.record("stop", name)?;
        self.transition(lxc_root, name, ContainerState::Stopped)
    }

    async fn kill(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        self.record("kill", name)?;
        self.transition(lxc_root, name, ContainerState::Stopped)
    }

    async fn freeze(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        self.record("freeze", name)?;
        self.transition(lxc_root, name, ContainerState::Frozen)
    }

    async fn unfreeze(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        self.record("unfreeze", name)?;
        self.transition(lxc_root, name, ContainerState::Running)
    }

    async fn create(&self, lxc_root: &Path, template: &CreateTemplate) -> LxcoreResult<()> {
        self.record("create", &template.name)?;
        write_container(
            lxc_root,
            &template.name,
            &template.distribution,
            &template.release,
            &template.architecture,
            template.backing_storage,
        )?;
        self.register(&template.name, ContainerState::Stopped);
        Ok(())
    }

    async fn destroy(
        &self,
        lxc_root: &Path,
        name: &str,
        with_snapshots: bool,
    ) -> LxcoreResult<()> {
        self.record("destroy", name)?;
        if !with_snapshots && !snapshot_dirs(lxc_root, name)?.is_empty() {
            return Err(LxcoreError::command_failed(
                "destroy",
                name,
                "container has snapshots",
            ));
        }

        fs::remove_dir_all(container_dir(lxc_root, name))?;
        self.states.lock().unwrap().remove(name);
        Ok(())
    }

    async fn snapshot_create(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        self.record("snapshot-create", name)?;
        let snapshot = format!("snap{}", snapshot_dirs(lxc_root, name)?.len());
        let dir = snapshots_dir(lxc_root, name).join(&snapshot);
        fs::create_dir_all(&dir)?;
        fs::copy(
            container_dir(lxc_root, name).join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME),
        )?;
        copy_dir(&rootfs_path(lxc_root, name), &dir.join("rootfs"))?;
        fs::write(dir.join("ts"), SNAPSHOT_TIMESTAMP)?;
        Ok(())
    }

    async fn snapshot_list(&self, lxc_root: &Path, name: &str) -> LxcoreResult<String> {
        let snapshots = snapshot_dirs(lxc_root, name)?;
        if snapshots.is_empty() {
            return Ok("No snapshots\n".to_string());
        }

        let snaps = snapshots_dir(lxc_root, name);
        Ok(snapshots
            .into_iter()
            .map(|snapshot| {
                let created = fs::read_to_string(snaps.join(&snapshot).join("ts"))
                    .unwrap_or_default();
                format!("{} ({}) {}\n", snapshot, snaps.display(), created.trim())
            })
            .collect())
    }

    async fn snapshot_delete(
        &self,
        lxc_root: &Path,
        name: &str,
        snapshot: &str,
    ) -> LxcoreResult<()> {
        self.record("snapshot-delete", name)?;
        fs::remove_dir_all(snapshots_dir(lxc_root, name).join(snapshot))?;
        Ok(())
    }
}

#[async_trait]
impl StorageTool for FakeStorage {
    async fn is_btrfs(&self, _path: &Path) -> LxcoreResult<bool> {
        Ok(self.btrfs.load(Ordering::SeqCst))
    }

    async fn create_subvolume(&self, path: &Path) -> LxcoreResult<()> {
        self.record("create-subvolume", path);
        fs::create_dir_all(path)?;
        Ok(())
    }

    async fn snapshot_subvolume(&self, source: &Path, destination: &Path) -> LxcoreResult<()> {
        self.record("snapshot-subvolume", destination);
        copy_dir(source, destination)?;
        Ok(())
    }

    async fn delete_subvolume(&self, path: &Path) -> LxcoreResult<()> {
        self.record("delete-subvolume", path);
        fs::remove_dir_all(path)?;
        Ok(())
    }

    async fn list_subvolumes(&self, _dir: &Path) -> LxcoreResult<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    async fn clear_immutable(&self, dir: &Path) -> LxcoreResult<()> {
        self.record("clear-immutable", dir);
        Ok(())
    }

    async fn unmount(&self, path: &Path) -> LxcoreResult<()> {
        self.record("unmount", path);
        Ok(())
    }

    async fn disk_usage(&self, path: &Path) -> LxcoreResult<u64> {
        Ok(dir_size(path)?)
    }

    async fn copy_tree(&self, source: &Path, destination: &Path) -> LxcoreResult<()> {
        self.record("copy-tree", destination);
        copy_dir(source, destination)?;
        Ok(())
    }

    async fn shift_ownership(&self, path: &Path, _offset: u32, _range: u32) -> LxcoreResult<()> {
        self.record("shift-ownership", path);
        Ok(())
    }
}

#[async_trait]
impl Archiver for FakeArchiver {
    async fn archive(&self, job: &ArchiveJob, abort: CancellationToken) -> LxcoreResult<()> {
        self.jobs.lock().unwrap().push(job.clone());

        let file = fs::File::create(&job.destination)?;
        let mut builder = tar::Builder::new(file);
        for entry in fs::read_dir(&job.source)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if job.excludes.contains(&name) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                builder.append_dir_all(&name, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), &name)?;
            }
        }

        if self.held.load(Ordering::SeqCst) {
            tokio::select! {
                _ = abort.cancelled() => return Err(LxcoreError::Aborted),
                _ = self.gate.notified() => {}
            }
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(LxcoreError::ToolFailed {
                program: "xz".to_string(),
                message: "injected failure".to_string(),
            });
        }

        builder.finish()?;
        Ok(())
    }

    async fn extract(&self, archive: &Path, destination: &Path) -> LxcoreResult<()> {
        let file = fs::File::open(archive)?;
        tar::Archive::new(file).unpack(destination)?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.notifications.lock().unwrap().push(notification);
    }
}
