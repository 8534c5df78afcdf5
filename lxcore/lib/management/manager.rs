//! The container engine service.
//!
//! [`ContainerManager`] owns every collaborator and every piece of in-memory state: the operation
//! tracker, the metadata and path caches, and the job-event channel. Operations are implemented
//! in the sibling modules as further `impl ContainerManager` blocks.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Instant,
};

use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::{fs, sync::broadcast};
use typed_builder::TypedBuilder;

use crate::{
    config::{Settings, SettingsProvider, CPU_SAMPLE_WINDOW, METADATA_CACHE_TTL},
    host::{Archiver, ContainerTool, HostStorage, LxcCli, StorageTool, TarXzArchiver},
    models::{ContainerState, ContainerUsage},
    notify::{
        JobEvent, JobOutcome, Notification, Notifier, NullNotifier, Priority, UnixSocketNotifier,
    },
    utils::{config_path, icon_path, validate_container_name},
    LxcoreError, LxcoreResult,
};

use super::{CgroupSampler, OperationKind, OperationSlot, OperationTracker, TemplateMetadata};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many job events a slow subscriber may lag behind before it starts missing some.
const JOB_EVENT_CAPACITY: usize = 64;

/// The largest custom icon accepted.
pub const MAX_ICON_SIZE: usize = 5 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The container lifecycle engine.
///
/// Cloning is cheap and every clone shares the same tracker, caches and event channel, which is
/// how detached jobs keep working after the request that started them has returned. Separate
/// instances built with [`ContainerManager::builder`] share nothing.
#[derive(Clone, TypedBuilder)]
pub struct ContainerManager {
    /// Where settings come from.
    settings: Arc<dyn SettingsProvider>,

    /// The container tool.
    tool: Arc<dyn ContainerTool>,

    /// Filesystem operations beyond `std::fs`.
    #[builder(default = Arc::new(HostStorage::new()))]
    storage: Arc<dyn StorageTool>,

    /// Builds and unpacks backup archives.
    #[builder(default = Arc::new(TarXzArchiver::new()))]
    archiver: Arc<dyn Archiver>,

    /// The notification sink.
    #[builder(default = Arc::new(NullNotifier))]
    notifier: Arc<dyn Notifier>,

    /// The HTTP client used to download the image index.
    #[builder(default = default_http_client())]
    http: ClientWithMiddleware,

    #[builder(setter(skip), default)]
    tracker: OperationTracker,

    #[builder(setter(skip), default)]
    caches: Arc<ManagerCaches>,

    #[builder(setter(skip), default = broadcast::channel(JOB_EVENT_CAPACITY).0)]
    events: broadcast::Sender<JobEvent>,
}

#[derive(Debug, Default)]
pub(crate) struct ManagerCaches {
    lxc_root: Mutex<Option<PathBuf>>,
    metadata: Mutex<HashMap<String, (Instant, TemplateMetadata)>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerManager {
    /// Builds a manager wired to the real host tools.
    ///
    /// The notification sink is the configured Unix socket, or nothing if none is configured.
    pub async fn from_host(settings: Arc<dyn SettingsProvider>) -> LxcoreResult<Self> {
        let loaded = settings.load().await?;
        let notifier: Arc<dyn Notifier> = match loaded.get_notifications().get_socket() {
            Some(socket) => Arc::new(UnixSocketNotifier::new(socket)),
            None => Arc::new(NullNotifier),
        };

        Ok(Self::builder()
            .settings(settings)
            .tool(Arc::new(LxcCli::detect()?))
            .notifier(notifier)
            .build())
    }

    /// Returns a receiver of the terminal events of detached jobs.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Returns the operation tracker.
    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    /// Loads the current settings.
    pub async fn settings(&self) -> LxcoreResult<Settings> {
        self.settings.load().await
    }

    /// Returns the LXC root, served from cache when possible.
    pub async fn lxc_root(&self) -> LxcoreResult<PathBuf> {
        let cached = self.lock_lxc_root().clone();
        if let Some(root) = cached {
            return Ok(root);
        }

        let root = self.settings().await?.get_lxc().get_path().clone();
        *self.lock_lxc_root() = Some(root.clone());
        Ok(root)
    }

    /// Forgets the cached LXC root.
    pub fn invalidate_lxc_root(&self) {
        *self.lock_lxc_root() = None;
    }

    /// Returns the raw config file of `name`.
    pub async fn get_config(&self, name: &str) -> LxcoreResult<String> {
        validate_container_name(name)?;
        let path = config_path(&self.lxc_root().await?, name);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LxcoreError::ContainerNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Samples CPU and memory usage of one container over one sampling window.
    pub async fn usage(&self, name: &str) -> LxcoreResult<ContainerUsage> {
        validate_container_name(name)?;
        let sampler = self.sampler().await?;

        let cpu_percent = match sampler.snapshot(name).await {
            Some(sample) => {
                tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
                sampler.delta(&sample).await
            }
            None => 0.0,
        };

        Ok(ContainerUsage {
            name: name.to_string(),
            cpu_percent,
            memory: sampler.memory(name).await,
        })
    }

    /// Samples every running container, sharing a single sampling window between all of them.
    pub async fn usage_all(&self) -> LxcoreResult<Vec<ContainerUsage>> {
        let rows = self.list_rows().await?;
        let running: Vec<String> = rows
            .into_iter()
            .filter(|row| row.state == ContainerState::Running)
            .map(|row| row.name)
            .collect();

        let sampler = self.sampler().await?;
        let mut percents = sampler.cpu_percent_all(&running, CPU_SAMPLE_WINDOW).await;

        let mut usages = Vec::with_capacity(running.len());
        for name in running {
            let memory = sampler.memory(&name).await;
            usages.push(ContainerUsage {
                cpu_percent: percents.remove(&name).unwrap_or(0.0),
                memory,
                name,
            });
        }

        Ok(usages)
    }

    /// Stores `png` as the custom icon of `name`.
    pub async fn set_custom_icon(&self, name: &str, png: &[u8]) -> LxcoreResult<()> {
        validate_container_name(name)?;
        if png.is_empty() || png.len() > MAX_ICON_SIZE {
            return Err(LxcoreError::InvalidArgument(format!(
                "icon must be between 1 byte and {} bytes",
                MAX_ICON_SIZE
            )));
        }

        self.ensure_exists(name).await?;
        let icons_dir = self.settings().await?.icons_dir();
        fs::create_dir_all(&icons_dir).await?;
        fs::write(icon_path(&icons_dir, name), png).await?;

        tracing::info!(container = %name, "custom icon stored");
        Ok(())
    }

    /// Removes the custom icon of `name`. Returns `false` if there was none.
    pub async fn delete_custom_icon(&self, name: &str) -> LxcoreResult<bool> {
        validate_container_name(name)?;
        let icons_dir = self.settings().await?.icons_dir();
        remove_if_exists(&icon_path(&icons_dir, name)).await
    }

    pub(crate) fn tool(&self) -> &dyn ContainerTool {
        self.tool.as_ref()
    }

    pub(crate) fn storage(&self) -> &dyn StorageTool {
        self.storage.as_ref()
    }

    pub(crate) fn archiver(&self) -> &dyn Archiver {
        self.archiver.as_ref()
    }

    pub(crate) fn http(&self) -> &ClientWithMiddleware {
        &self.http
    }

    pub(crate) async fn sampler(&self) -> LxcoreResult<CgroupSampler> {
        let settings = self.settings().await?;
        Ok(CgroupSampler::new(settings.get_lxc().get_cgroup_root()))
    }

    /// Returns cached template metadata of `name` if it is still fresh.
    pub(crate) fn cached_metadata(&self, name: &str) -> Option<TemplateMetadata> {
        let cache = self.lock_metadata();
        cache
            .get(name)
            .filter(|(stored, _)| stored.elapsed() < METADATA_CACHE_TTL)
            .map(|(_, metadata)| metadata.clone())
    }

    /// Caches template metadata of `name`. Metadata without any field is never cached.
    pub(crate) fn cache_metadata(&self, name: &str, metadata: &TemplateMetadata) {
        if metadata.is_empty() {
            return;
        }

        self.lock_metadata()
            .insert(name.to_string(), (Instant::now(), metadata.clone()));
    }

    /// Drops the cached metadata of `name`.
    pub(crate) fn invalidate_metadata(&self, name: &str) {
        self.lock_metadata().remove(name);
    }

    /// Sends a notification, never failing.
    pub(crate) async fn notify(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        priority: Priority,
    ) {
        self.notifier
            .notify(Notification::new(title, message, priority))
            .await;
    }

    /// Runs `job` in the background while holding `slot`.
    ///
    /// Whatever happens inside the job, including a panic, the slot is released first and then
    /// exactly one terminal notification and job event are emitted.
    pub(crate) fn spawn_job<F>(&self, slot: OperationSlot, job: F)
    where
        F: Future<Output = LxcoreResult<String>> + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = match tokio::spawn(job).await {
                Ok(Ok(summary)) => JobOutcome::Completed(summary),
                Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
                Err(e) => JobOutcome::Failed(format!("job terminated unexpectedly: {}", e)),
            };

            let container = slot.name().to_string();
            let kind = slot.kind();
            slot.release();

            manager.finish_job(container, kind, outcome).await;
        });
    }

    async fn finish_job(&self, container: String, kind: OperationKind, outcome: JobOutcome) {
        let (title, message, priority) = match &outcome {
            JobOutcome::Completed(summary) => {
                tracing::info!(container = %container, %kind, "job completed");
                (
                    format!("{} completed", job_title(kind)),
                    summary.clone(),
                    Priority::Normal,
                )
            }
            JobOutcome::Failed(error) => {
                tracing::error!(container = %container, %kind, %error, "job failed");
                (
                    format!("{} failed", job_title(kind)),
                    format!("{}: {}", container, error),
                    Priority::High,
                )
            }
        };

        self.notify(title, message, priority).await;

        // No subscribers is the normal case in production.
        let _ = self.events.send(JobEvent {
            container,
            kind,
            outcome,
        });
    }

    fn lock_lxc_root(&self) -> std::sync::MutexGuard<'_, Option<PathBuf>> {
        self.caches
            .lxc_root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn lock_metadata(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, (Instant, TemplateMetadata)>> {
        self.caches
            .metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_http_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    ClientBuilder::new(Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

/// Returns the headline used in notifications about `kind` jobs.
pub(crate) fn job_title(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Backup => "Backup",
        OperationKind::Restore => "Restore",
        OperationKind::ConvertBtrfs => "BTRFS conversion",
        OperationKind::Snapshot => "Snapshot",
    }
}

/// Removes a file, treating a missing file as success. Returns whether something was removed.
pub(crate) async fn remove_if_exists(path: &Path) -> LxcoreResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
