use tokio::process::Command;

use crate::{LxcoreError, LxcoreResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `command` to completion and returns its stdout.
///
/// A non-zero exit becomes [`LxcoreError::ToolFailed`] carrying stderr (or stdout when stderr is
/// empty).
pub async fn run_command(command: &mut Command) -> LxcoreResult<String> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    tracing::debug!(?command, "running command");
    let output = command.output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };

        return Err(LxcoreError::ToolFailed {
            program,
            message: if message.is_empty() {
                format!("exited with {}", output.status)
            } else {
                message
            },
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_stdout() -> anyhow::Result<()> {
        let out = run_command(Command::new("sh").args(["-c", "echo hello"])).await?;
        assert_eq!(out.trim(), "hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_reports_stderr() {
        let err = run_command(Command::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            LxcoreError::ToolFailed { program, message } => {
                assert_eq!(program, "sh");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
