//! State transitions of containers: start, stop, freeze, create and destroy.
//!
//! Every transition checks the operation tracker before the container tool is invoked, so a
//! container held by a backup, restore, conversion or snapshot job cannot be changed underneath
//! it.

use std::{os::unix::fs::PermissionsExt, path::Path};

use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{
    config::{RESTART_PAUSE, UNPRIVILEGED_ID_OFFSET, UNPRIVILEGED_ID_RANGE},
    host::CreateTemplate,
    models::CreateOutcome,
    utils::{
        config_path, container_dir, icon_path, rootfs_path, validate_container_name,
        validate_description,
    },
    LxcoreError, LxcoreResult,
};

use super::{edit_config, ContainerManager};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The parameters of a container creation.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct CreateRequest {
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

    /// Whether the container starts with the host.
    #[builder(default)]
    pub autostart: bool,

    /// An optional description.
    #[builder(default, setter(strip_option, into))]
    pub description: Option<String>,

    /// Whether to start the container once it is created.
    #[builder(default)]
    pub start_after_creation: bool,

    /// Whether to remap the container's ids into the unprivileged range.
    #[builder(default)]
    pub unprivileged: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerManager {
    /// Starts a stopped container.
    pub async fn start_container(&self, name: &str) -> LxcoreResult<()> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "start")?;

        self.tool().start(&self.lxc_root().await?, name).await?;
        tracing::info!(container = %name, "container started");
        Ok(())
    }

    /// Stops a running container gracefully.
    pub async fn stop_container(&self, name: &str) -> LxcoreResult<()> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "stop")?;

        self.tool().stop(&self.lxc_root().await?, name).await?;
        tracing::info!(container = %name, "container stopped");
        Ok(())
    }

    /// Stops a running container, pauses briefly, and starts it again.
    pub async fn restart_container(&self, name: &str) -> LxcoreResult<()> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "restart")?;

        let root = self.lxc_root().await?;
        if self.tool().state(&root, name).await?.is_active() {
            self.tool().stop(&root, name).await?;
        }

        tokio::time::sleep(RESTART_PAUSE).await;
        self.tool().start(&root, name).await?;
        tracing::info!(container = %name, "container restarted");
        Ok(())
    }

    /// Stops a running container forcibly.
    pub async fn kill_container(&self, name: &str) -> LxcoreResult<()> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "kill")?;

        self.tool().kill(&self.lxc_root().await?, name).await?;
        tracing::info!(container = %name, "container killed");
        Ok(())
    }

    /// Freezes the processes of a running container.
    pub async fn freeze_container(&self, name: &str) -> LxcoreResult<()> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "freeze")?;

        self.tool().freeze(&self.lxc_root().await?, name).await?;
        tracing::info!(container = %name, "container frozen");
        Ok(())
    }

    /// Thaws a frozen container.
    pub async fn unfreeze_container(&self, name: &str) -> LxcoreResult<()> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "unfreeze")?;

        self.tool().unfreeze(&self.lxc_root().await?, name).await?;
        tracing::info!(container = %name, "container unfrozen");
        Ok(())
    }

    /// Creates a container from a downloaded image.
    ///
    /// Once the container tool has created the container, the remaining steps (autostart,
    /// description, index, id mapping, start) never undo the creation. Their failures are logged,
    /// except a failed start, which is reported in the outcome.
    pub async fn create_container(&self, request: &CreateRequest) -> LxcoreResult<CreateOutcome> {
        let name = request.name.as_str();
        validate_container_name(name)?;
        if let Some(description) = &request.description {
            validate_description(description)?;
        }

        if self.container_exists(name).await? {
            return Err(LxcoreError::ContainerAlreadyExists(name.to_string()));
        }

        let settings = self.settings().await?;
        let root = self.lxc_root().await?;

        let template = CreateTemplate {
            name: name.to_string(),
            distribution: request.distribution.clone(),
            release: request.release.clone(),
            architecture: request.architecture.clone(),
            backing_storage: *settings.get_lxc().get_backing_storage(),
            server: settings.get_lxc().get_registry_mirror().clone(),
        };

        tracing::info!(
            container = %name,
            distribution = %template.distribution,
            release = %template.release,
            architecture = %template.architecture,
            storage = %template.backing_storage,
            "creating container"
        );
        self.tool().create(&root, &template).await?;
        self.invalidate_lxc_root();
        self.invalidate_metadata(name);

        let index = match self.next_available_index(Some(name)).await {
            Ok(index) => Some(index),
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "could not compute next index");
                None
            }
        };

        let config = config_path(&root, name);
        let applied = edit_config(&config, |config| {
            config.set_autostart(request.autostart);
            config.set_description(request.description.as_deref())?;
            config.set_index(index)
        })
        .await;
        if let Err(e) = applied {
            tracing::warn!(container = %name, error = %e, "could not apply container settings");
        }

        if request.unprivileged {
            if let Err(e) = self.make_unprivileged(&root, name).await {
                tracing::warn!(container = %name, error = %e, "could not set up id mapping");
            }
        }

        let mut outcome = CreateOutcome {
            name: name.to_string(),
            index,
            started: false,
            start_error: None,
        };

        if request.start_after_creation {
            match self.tool().start(&root, name).await {
                Ok(()) => outcome.started = true,
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "created container did not start");
                    outcome.start_error = Some(e.to_string());
                }
            }
        }

        tracing::info!(container = %name, ?index, "container created");
        Ok(outcome)
    }

    /// Destroys a container.
    ///
    /// If the container tool cannot destroy it, the container is torn down by hand. The custom
    /// icon is removed and the remaining containers are renumbered afterwards.
    pub async fn destroy_container(&self, name: &str, remove_disks: bool) -> LxcoreResult<()> {
        validate_container_name(name)?;
        self.tracker().ensure_idle(name, "destroy")?;
        self.ensure_exists(name).await?;

        let root = self.lxc_root().await?;
        if let Err(e) = self.tool().destroy(&root, name, remove_disks).await {
            tracing::warn!(container = %name, error = %e, "container tool could not destroy container, tearing down manually");
            self.teardown(&root, name).await?;
        }

        let icons_dir = self.settings().await?.icons_dir();
        if let Err(e) = fs::remove_file(icon_path(&icons_dir, name)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(container = %name, error = %e, "could not remove custom icon");
            }
        }

        self.invalidate_metadata(name);
        self.invalidate_lxc_root();

        if let Err(e) = self.reindex_containers().await {
            tracing::warn!(error = %e, "could not reindex containers");
        }

        tracing::info!(container = %name, "container destroyed");
        Ok(())
    }

    /// Removes a container directory without the container tool's help.
    pub(crate) async fn teardown(&self, root: &Path, name: &str) -> LxcoreResult<()> {
        let dir = container_dir(root, name);

        if let Err(e) = self.storage().clear_immutable(&dir).await {
            tracing::debug!(container = %name, error = %e, "could not clear immutable bits");
        }

        if let Err(e) = self.tool().kill(root, name).await {
            tracing::debug!(container = %name, error = %e, "forced stop failed");
        }

        match self.storage().list_subvolumes(&dir).await {
            Ok(subvolumes) => {
                for subvolume in subvolumes {
                    if let Err(e) = self.storage().delete_subvolume(&subvolume).await {
                        tracing::warn!(subvolume = %subvolume.display(), error = %e, "could not delete subvolume");
                    }
                }
            }
            Err(e) => tracing::debug!(container = %name, error = %e, "could not list subvolumes"),
        }

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LxcoreError::command_failed("destroy", name, e)),
        }

        if fs::try_exists(&dir).await? {
            return Err(LxcoreError::command_failed(
                "destroy",
                name,
                "container directory still present after teardown",
            ));
        }

        Ok(())
    }

    async fn make_unprivileged(&self, root: &Path, name: &str) -> LxcoreResult<()> {
        let mut already_mapped = false;
        edit_config(config_path(root, name), |config| {
            already_mapped = config.has_idmap();
            if !already_mapped {
                config.append_idmap(UNPRIVILEGED_ID_OFFSET, UNPRIVILEGED_ID_RANGE);
            }
            Ok(())
        })
        .await?;

        if already_mapped {
            tracing::debug!(container = %name, "id mapping already present");
            return Ok(());
        }

        self.storage()
            .shift_ownership(&rootfs_path(root, name), UNPRIVILEGED_ID_OFFSET, UNPRIVILEGED_ID_RANGE)
            .await?;

        let dir = container_dir(root, name);
        let mut permissions = fs::metadata(&dir).await?.permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&dir, permissions).await?;

        tracing::info!(container = %name, "container made unprivileged");
        Ok(())
    }
}
