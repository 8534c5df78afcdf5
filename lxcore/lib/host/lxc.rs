use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    models::ContainerState,
    utils::run_command,
    LxcoreError, LxcoreResult,
};

use super::{ContainerTool, CreateTemplate};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The binary used to locate the rest of the LXC tools.
const LXC_LS: &str = "lxc-ls";

/// The template used for image-based creation.
const DOWNLOAD_TEMPLATE: &str = "download";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// [`ContainerTool`] backed by the `lxc-*` command line tools.
#[derive(Debug, Clone)]
pub struct LxcCli {
    /// The directory holding the `lxc-*` binaries.
    bin_dir: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LxcCli {
    /// Locates the LXC tools on `PATH`.
    pub fn detect() -> LxcoreResult<Self> {
        let lxc_ls = which::which(LXC_LS).map_err(|e| LxcoreError::ToolFailed {
            program: LXC_LS.to_string(),
            message: e.to_string(),
        })?;

        tracing::debug!(path = %lxc_ls.display(), "found lxc tools");
        Ok(Self {
            bin_dir: lxc_ls.parent().map(Path::to_path_buf),
        })
    }

    /// Uses the LXC tools in `bin_dir`.
    pub fn with_bin_dir(bin_dir: impl AsRef<Path>) -> Self {
        Self {
            bin_dir: Some(bin_dir.as_ref().to_path_buf()),
        }
    }

    fn command(&self, tool: &str, lxc_root: &Path) -> Command {
        let program = match &self.bin_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        };

        let mut command = Command::new(program);
        command.arg("-P").arg(lxc_root);
        command
    }

    /// Runs a command against a named container and maps failures to
    /// [`LxcoreError::CommandFailed`].
    async fn run_for(
        &self,
        verb: &str,
        name: &str,
        mut command: Command,
    ) -> LxcoreResult<String> {
        run_command(&mut command).await.map_err(|e| match e {
            LxcoreError::ToolFailed { message, .. } => {
                LxcoreError::command_failed(verb, name, message)
            }
            other => LxcoreError::command_failed(verb, name, other),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ContainerTool for LxcCli {
    async fn list(&self, lxc_root: &Path) -> LxcoreResult<String> {
        let mut command = self.command(LXC_LS, lxc_root);
        command.arg("-f");
        run_command(&mut command).await
    }

    async fn state(&self, lxc_root: &Path, name: &str) -> LxcoreResult<ContainerState> {
        let mut command = self.command("lxc-info", lxc_root);
        command.args(["-n", name, "-s", "-H"]);
        self.run_for("inspect", name, command).await?.parse()
    }

    async fn start(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        let mut command = self.command("lxc-start", lxc_root);
        command.args(["-n", name]);
        self.run_for("start", name, command).await.map(drop)
    }

    async fn stop(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        let mut command = self.command("lxc-stop", lxc_root);
        command.args(["-n", name]);
        self.run_for("stop", name, command).await.map(drop)
    }

    async fn kill(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        let mut command = self.command("lxc-stop", lxc_root);
        command.args(["-k", "-n", name]);
        self.run_for("kill", name, command).await.map(drop)
    }

    async fn freeze(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        let mut command = self.command("lxc-freeze", lxc_root);
        command.args(["-n", name]);
        self.run_for("freeze", name, command).await.map(drop)
    }

    async fn unfreeze(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        let mut command = self.command("lxc-unfreeze", lxc_root);
        command.args(["-n", name]);
        self.run_for("unfreeze", name, command).await.map(drop)
    }

    async fn create(&self, lxc_root: &Path, template: &CreateTemplate) -> LxcoreResult<()> {
        let mut command = self.command("lxc-create", lxc_root);
        command
            .args(["-n", template.name.as_str()])
            .args(["-t", DOWNLOAD_TEMPLATE])
            .args(["-B", template.backing_storage.rootfs_prefix().trim_end_matches(':')])
            .arg("--")
            .args(["--dist", template.distribution.as_str()])
            .args(["--release", template.release.as_str()])
            .args(["--arch", template.architecture.as_str()]);

        if let Some(server) = &template.server {
            command.args(["--server", server.as_str()]);
        }

        self.run_for("create", &template.name, command)
            .await
            .map(drop)
    }

    async fn destroy(
        &self,
        lxc_root: &Path,
        name: &str,
        with_snapshots: bool,
    ) -> LxcoreResult<()> {
        let mut command = self.command("lxc-destroy", lxc_root);
        command.args(["-n", name, "-f"]);
        if with_snapshots {
            command.arg("-s");
        }

        self.run_for("destroy", name, command).await.map(drop)
    }

    async fn snapshot_create(&self, lxc_root: &Path, name: &str) -> LxcoreResult<()> {
        let mut command = self.command("lxc-snapshot", lxc_root);
        command.args(["-n", name]);
        self.run_for("snapshot", name, command).await.map(drop)
    }

    async fn snapshot_list(&self, lxc_root: &Path, name: &str) -> LxcoreResult<String> {
        let mut command = self.command("lxc-snapshot", lxc_root);
        command.args(["-n", name, "-L"]);
        self.run_for("list snapshots of", name, command).await
    }

    async fn snapshot_delete(
        &self,
        lxc_root: &Path,
        name: &str,
        snapshot: &str,
    ) -> LxcoreResult<()> {
        let mut command = self.command("lxc-snapshot", lxc_root);
        command.args(["-n", name, "-d", snapshot]);
        self.run_for("delete snapshot of", name, command)
            .await
            .map(drop)
    }
}
