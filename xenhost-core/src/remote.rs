//! Command execution on the host's control domain

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{XenhostError, XenhostResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    /// None when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs commands and copies files on a host over the management network
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, host_ip: &str, username: &str, command: &str) -> XenhostResult<RemoteOutput>;

    /// Copy a local file into `remote_dir` and apply `mode` to it
    async fn copy(
        &self,
        host_ip: &str,
        username: &str,
        local: &Path,
        remote_dir: &str,
        mode: &str,
    ) -> XenhostResult<()>;
}

/// Run a command whose failure must not fail the caller
///
/// Returns whether the command succeeded; failures are logged as warnings.
pub async fn run_best_effort(
    executor: &dyn RemoteExecutor,
    host_ip: &str,
    username: &str,
    command: &str,
) -> bool {
    match executor.run(host_ip, username, command).await {
        Ok(output) if output.success() => true,
        Ok(output) => {
            warn!(
                host = host_ip,
                exit_code = ?output.exit_code,
                "Remote command '{}' failed: {}",
                command,
                output.stderr.trim()
            );
            false
        }
        Err(e) => {
            warn!(host = host_ip, "Remote command '{}' could not run: {}", command, e);
            false
        }
    }
}

/// [`RemoteExecutor`] that shells out to the system `ssh` and `scp`
pub struct SshExecutor {
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ]
    }

    async fn execute(&self, program: &str, args: &[String]) -> XenhostResult<RemoteOutput> {
        debug!("Executing {} {:?}", program, args);
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| XenhostError::remote(program, e))?;

        Ok(RemoteOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host_ip: &str, username: &str, command: &str) -> XenhostResult<RemoteOutput> {
        let mut args = self.common_options();
        args.push(format!("{}@{}", username, host_ip));
        args.push(command.to_string());
        self.execute("ssh", &args).await
    }

    async fn copy(
        &self,
        host_ip: &str,
        username: &str,
        local: &Path,
        remote_dir: &str,
        mode: &str,
    ) -> XenhostResult<()> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| XenhostError::InvalidInput {
                field: "local".to_string(),
                message: format!("{} has no file name", local.display()),
            })?;

        let mut args = self.common_options();
        args.push(local.display().to_string());
        args.push(format!("{}@{}:{}/{}", username, host_ip, remote_dir, file_name));
        let output = self.execute("scp", &args).await?;
        if !output.success() {
            return Err(XenhostError::remote("scp", output.stderr.trim()));
        }

        let chmod = format!("chmod {} {}/{}", mode, remote_dir, file_name);
        let output = self.run(host_ip, username, &chmod).await?;
        if !output.success() {
            return Err(XenhostError::remote("chmod", output.stderr.trim()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    struct FailingExecutor {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteExecutor for FailingExecutor {
        async fn run(&self, _host_ip: &str, _username: &str, command: &str) -> XenhostResult<RemoteOutput> {
            self.commands.lock().push(command.to_string());
            Ok(RemoteOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "No such file or directory".to_string(),
            })
        }

        async fn copy(&self, _: &str, _: &str, _: &Path, _: &str, _: &str) -> XenhostResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_best_effort_logs_failure() {
        let executor = FailingExecutor {
            commands: Mutex::new(Vec::new()),
        };
        let ok = run_best_effort(&executor, "10.0.0.5", "root", "rm /opt/xensource/bin/x").await;

        assert!(!ok);
        assert_eq!(executor.commands.lock().len(), 1);
        assert!(logs_contain("No such file or directory"));
    }

    #[test]
    fn test_ssh_options_are_non_interactive() {
        let options = SshExecutor::default().common_options();
        assert!(options.contains(&"BatchMode=yes".to_string()));
        assert!(options.contains(&"ConnectTimeout=10".to_string()));
    }
}
