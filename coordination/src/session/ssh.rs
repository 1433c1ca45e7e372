//! OpenSSH-backed transport.
//!
//! Each node gets a multiplexed master connection (`ControlMaster`) when its
//! session opens. Commands then ride that channel without re-authenticating,
//! and `disconnect` sends `-O exit` to the master. Control sockets live in a
//! private temp directory owned by the transport, so they disappear with the
//! run.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CommandOutput, ExecutionError, SessionError, SshCredentials, Transport};

/// Exit status OpenSSH reserves for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

/// Extra time granted on top of `ConnectTimeout` for key exchange and auth.
const CONNECT_GRACE: Duration = Duration::from_secs(5);

/// Bound on tearing down a master connection.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for [`SshTransport`].
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// `ssh` executable.
    pub program: String,
    /// TCP connect timeout for the master connection.
    pub connect_timeout: Duration,
    /// How long an idle master outlives its last client. Bounds the lifetime
    /// of masters left behind by an aborted run.
    pub control_persist: Duration,
    /// Value for `StrictHostKeyChecking`.
    pub host_key_checking: String,
    /// Additional `-o` options, e.g. `ServerAliveInterval=30`.
    pub extra_options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            control_persist: Duration::from_secs(300),
            host_key_checking: "accept-new".to_string(),
            extra_options: Vec::new(),
        }
    }
}

/// [`Transport`] that shells out to the system `ssh` client.
pub struct SshTransport {
    config: SshConfig,
    control_dir: tempfile::TempDir,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> std::io::Result<Self> {
        let control_dir = tempfile::Builder::new().prefix("mars-ssh-").tempdir()?;
        Ok(Self {
            config,
            control_dir,
        })
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Arguments shared by every invocation against one node.
    fn base_args(&self, credentials: &SshCredentials) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            credentials.key_file.display().to_string(),
            "-l".to_string(),
            credentials.username.clone(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.config.host_key_checking),
            "-o".to_string(),
            format!("ControlPath={}/%C", self.control_dir.path().display()),
        ];
        for opt in &self.config.extra_options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args
    }

    /// Bound on establishing the master connection.
    fn connect_limit(&self) -> Duration {
        self.config.connect_timeout.saturating_add(CONNECT_GRACE)
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        address: &str,
        credentials: &SshCredentials,
    ) -> Result<(), SessionError> {
        let mut args = self.base_args(credentials);
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPersist={}s", self.config.control_persist.as_secs().max(1)),
            "-f".to_string(),
            "-N".to_string(),
            address.to_string(),
        ]);

        let limit = self.connect_limit();
        let output = match tokio::time::timeout(limit, self.command(&args).output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SessionError::ConnectionTimeout {
                    address: address.to_string(),
                    after: limit,
                })
            }
        };

        if output.status.success() {
            tracing::debug!(address, "ssh master established");
            return Ok(());
        }
        Err(classify_connect_failure(
            address,
            self.config.connect_timeout,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn execute(
        &self,
        address: &str,
        credentials: &SshCredentials,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SessionError> {
        let mut args = self.base_args(credentials);
        args.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            address.to_string(),
            command.to_string(),
        ]);

        let child = self.command(&args).output();
        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child).await {
                Ok(result) => result?,
                // Dropping the future kills the local ssh client.
                Err(_) => return Err(ExecutionError::timeout().into()),
            },
            None => child.await?,
        };

        interpret_output(output)
    }

    async fn disconnect(&self, address: &str, credentials: &SshCredentials) {
        let mut args = self.base_args(credentials);
        args.extend(["-O".to_string(), "exit".to_string(), address.to_string()]);

        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.command(&args).output()).await {
            Ok(Ok(out)) if out.status.success() => {}
            Ok(Ok(out)) => tracing::debug!(
                address,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "ssh master exit request failed"
            ),
            Ok(Err(e)) => tracing::warn!(address, error = %e, "failed to run ssh -O exit"),
            Err(_) => tracing::warn!(address, "timed out closing ssh master"),
        }
    }
}

/// Map a failed master connection attempt onto the session error taxonomy.
fn classify_connect_failure(address: &str, connect_timeout: Duration, stderr: &str) -> SessionError {
    let lower = stderr.to_ascii_lowercase();
    let message = stderr.trim().to_string();
    if lower.contains("permission denied") || lower.contains("too many authentication failures")
    {
        SessionError::Authentication {
            address: address.to_string(),
            message,
        }
    } else if lower.contains("timed out") {
        SessionError::ConnectionTimeout {
            address: address.to_string(),
            after: connect_timeout,
        }
    } else {
        SessionError::Connect {
            address: address.to_string(),
            message,
        }
    }
}

/// Turn a finished `ssh host command` into a [`CommandOutput`].
///
/// Status 255 is OpenSSH's own failure code, so it is read as a lost channel
/// rather than as the remote command's status.
fn interpret_output(output: Output) -> Result<CommandOutput, SessionError> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    match output.status.code() {
        Some(SSH_ERROR_STATUS) => Err(ExecutionError {
            kind: super::ExecutionErrorKind::ChannelClosed,
            exit_code: Some(SSH_ERROR_STATUS),
            stdout,
            stderr,
        }
        .into()),
        // Killed by a signal before ssh could report a status.
        None => Err(ExecutionError {
            kind: super::ExecutionErrorKind::ChannelClosed,
            exit_code: None,
            stdout,
            stderr,
        }
        .into()),
        Some(code) => Ok(CommandOutput {
            exit_code: Some(code),
            stdout,
            stderr,
        }),
    }
}
