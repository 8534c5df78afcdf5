use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{config::ABORT_POLL_INTERVAL, utils::run_command, LxcoreError, LxcoreResult};

use super::{ArchiveJob, Archiver};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Flags that keep ownership, ACLs and extended attributes intact in both directions.
const TAR_PRESERVE_FLAGS: [&str; 3] = ["--numeric-owner", "--xattrs", "--acls"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// [`Archiver`] that pipes `tar` into `xz` and writes the result straight to the archive file.
///
/// The stages are connected through their standard streams, so no archive data passes through
/// this process.
#[derive(Debug, Clone, Default)]
pub struct TarXzArchiver;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TarXzArchiver {
    /// Creates a new archiver.
    pub fn new() -> Self {
        Self
    }

    fn spawn_pipeline(job: &ArchiveJob, output: std::fs::File) -> LxcoreResult<(Child, Child)> {
        let mut tar = Command::new("tar");
        tar.args(TAR_PRESERVE_FLAGS).arg("-cpf").arg("-");
        for exclude in &job.excludes {
            tar.arg(format!("--exclude=./{}", exclude));
        }
        tar.arg("-C")
            .arg(&job.source)
            .arg(".")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(?tar, "spawning archive stage");
        let mut tar = tar.spawn()?;

        let tar_stdout: Stdio = tar
            .stdout
            .take()
            .ok_or_else(|| LxcoreError::custom(anyhow::anyhow!("tar stdout not captured")))?
            .try_into()?;

        let mut xz = Command::new("xz");
        xz.arg("-z")
            .arg(format!("-{}", job.compression))
            .arg(format!("-T{}", job.threads))
            .arg("-c")
            .stdin(tar_stdout)
            .stdout(Stdio::from(output))
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(?xz, "spawning compression stage");
        let xz = xz.spawn()?;

        Ok((tar, xz))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Archiver for TarXzArchiver {
    async fn archive(&self, job: &ArchiveJob, abort: CancellationToken) -> LxcoreResult<()> {
        let output = tokio::fs::File::create(&job.destination)
            .await?
            .into_std()
            .await;

        let (mut tar, mut xz) = Self::spawn_pipeline(job, output)?;
        let tar_stderr = drain(tar.stderr.take());
        let xz_stderr = drain(xz.stderr.take());

        let mut ticker = time::interval(ABORT_POLL_INTERVAL);
        let mut tar_status = None;
        let mut xz_status = None;

        while tar_status.is_none() || xz_status.is_none() {
            tokio::select! {
                status = tar.wait(), if tar_status.is_none() => tar_status = Some(status?),
                status = xz.wait(), if xz_status.is_none() => xz_status = Some(status?),
                _ = ticker.tick() => {
                    if abort.is_cancelled() {
                        tracing::info!(destination = %job.destination.display(), "aborting archive pipeline");
                        // Stop the producer first so the compressor does not report a broken pipe.
                        let _ = tar.kill().await;
                        let _ = xz.kill().await;
                        return Err(LxcoreError::Aborted);
                    }
                }
            }
        }

        let tar_stderr = tar_stderr.await.unwrap_or_default();
        let xz_stderr = xz_stderr.await.unwrap_or_default();

        if let Some(status) = tar_status.filter(|s| !s.success()) {
            return Err(LxcoreError::ToolFailed {
                program: "tar".to_string(),
                message: failure_message(&tar_stderr, status),
            });
        }

        if let Some(status) = xz_status.filter(|s| !s.success()) {
            return Err(LxcoreError::ToolFailed {
                program: "xz".to_string(),
                message: failure_message(&xz_stderr, status),
            });
        }

        Ok(())
    }

    async fn extract(&self, archive: &Path, destination: &Path) -> LxcoreResult<()> {
        run_command(
            Command::new("tar")
                .args(TAR_PRESERVE_FLAGS)
                .arg("-xJpf")
                .arg(archive)
                .arg("-C")
                .arg(destination),
        )
        .await
        .map(drop)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn drain<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = String::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_string(&mut buffer).await;
        }
        buffer
    })
}

fn failure_message(stderr: &str, status: std::process::ExitStatus) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", status)
    } else {
        stderr.to_string()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
