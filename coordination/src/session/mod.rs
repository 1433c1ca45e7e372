//! Remote execution sessions.
//!
//! A [`RemoteSession`] is one authenticated channel to one node:
//!
//! ```text
//! Unopened --open()--> Open --close()--> Closed
//!     \___________________close()_________/
//! ```
//!
//! `run` is only valid while `Open`. `close` may be called any number of
//! times. The wire work is delegated to a [`Transport`]; production code uses
//! [`SshTransport`], tests plug in their own.

mod ssh;

pub use ssh::{SshConfig, SshTransport};

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shell_safety::{redact_credentials, wrap_in_container};

/// Default login user on provisioned nodes.
pub const DEFAULT_USERNAME: &str = "ubuntu";

/// Login identity used for every node in a run.
///
/// Passed explicitly to each session; nothing is read from or written to the
/// process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredentials {
    pub username: String,
    pub key_file: PathBuf,
}

impl SshCredentials {
    pub fn new(username: impl Into<String>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            key_file: key_file.into(),
        }
    }
}

/// Where a session's commands execute on the node. Fixed when the session is
/// created.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "name")]
pub enum ExecutionContext {
    /// The login shell of the node.
    #[default]
    Host,
    /// A running container on the node, addressed by name.
    Container(String),
}

impl ExecutionContext {
    pub fn container(name: impl Into<String>) -> Self {
        Self::Container(name.into())
    }

    /// Rewrite a command for this context.
    pub fn wrap<'a>(&self, command: &'a str) -> Cow<'a, str> {
        match self {
            Self::Host => Cow::Borrowed(command),
            Self::Container(name) => Cow::Owned(wrap_in_container(name, command)),
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Container(name) => write!(f, "container:{name}"),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unopened,
    Open,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unopened => write!(f, "unopened"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// What a finished remote command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Why a command did not complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The command ran and exited with a non-zero status.
    NonZeroExit,
    /// The command did not finish within its timeout.
    Timeout,
    /// The channel went away before the command finished.
    ChannelClosed,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit => write!(f, "non-zero exit"),
            Self::Timeout => write!(f, "timeout"),
            Self::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

/// Command-level failure; keeps whatever output was captured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution failed ({kind}){}", .exit_code.map(|c| format!(" with status {c}")).unwrap_or_default())]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionError {
    pub fn timeout() -> Self {
        Self {
            kind: ExecutionErrorKind::Timeout,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn channel_closed(stderr: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::ChannelClosed,
            exit_code: None,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn non_zero(output: CommandOutput) -> Self {
        Self {
            kind: ExecutionErrorKind::NonZeroExit,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Errors from opening or using a session. All of them are scoped to one node.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication rejected by {address}: {message}")]
    Authentication { address: String, message: String },

    #[error("{address} unreachable within {after:?}")]
    ConnectionTimeout { address: String, after: Duration },

    #[error("connection to {address} failed: {message}")]
    Connect { address: String, message: String },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("cannot {operation} a session that is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("failed to start transport process: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SessionError {
    /// Whether a caller-side retry could reasonably succeed. The dispatch
    /// coordinator never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionTimeout { .. } | Self::Connect { .. } => true,
            Self::Execution(e) => e.kind == ExecutionErrorKind::ChannelClosed,
            Self::Authentication { .. } | Self::InvalidState { .. } | Self::Spawn(_) => false,
        }
    }
}

/// Moves bytes to and from a node. Implementations are shared across all
/// sessions of a run and must be safe to call concurrently for different
/// addresses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate and establish a channel to `address`.
    async fn connect(&self, address: &str, credentials: &SshCredentials)
        -> Result<(), SessionError>;

    /// Run `command` over the established channel. A non-zero exit status is
    /// not an error at this level.
    async fn execute(
        &self,
        address: &str,
        credentials: &SshCredentials,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SessionError>;

    /// Tear the channel down. Best effort; failures are only logged.
    async fn disconnect(&self, address: &str, credentials: &SshCredentials);
}

/// One execution channel to a single node.
pub struct RemoteSession {
    transport: Arc<dyn Transport>,
    address: String,
    credentials: SshCredentials,
    context: ExecutionContext,
    state: SessionState,
}

impl RemoteSession {
    /// Create an unopened session.
    pub fn new(
        transport: Arc<dyn Transport>,
        address: impl Into<String>,
        credentials: SshCredentials,
        context: ExecutionContext,
    ) -> Self {
        Self {
            transport,
            address: address.into(),
            credentials,
            context,
            state: SessionState::Unopened,
        }
    }

    /// Create a session and open it in one step.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        address: impl Into<String>,
        credentials: SshCredentials,
        context: ExecutionContext,
    ) -> Result<Self, SessionError> {
        let mut session = Self::new(transport, address, credentials, context);
        session.open().await?;
        Ok(session)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Authenticate against the node. On failure the session stays
    /// `Unopened`.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Unopened {
            return Err(SessionError::InvalidState {
                operation: "open",
                state: self.state,
            });
        }
        self.transport
            .connect(&self.address, &self.credentials)
            .await?;
        self.state = SessionState::Open;
        tracing::debug!(address = %self.address, context = %self.context, "session open");
        Ok(())
    }

    /// Run a command in the session's execution context and capture its
    /// output. Non-zero exit becomes [`ExecutionErrorKind::NonZeroExit`].
    pub async fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SessionError> {
        if self.state != SessionState::Open {
            return Err(SessionError::InvalidState {
                operation: "run",
                state: self.state,
            });
        }

        let wrapped = self.context.wrap(command);
        tracing::debug!(
            address = %self.address,
            command = %redact_credentials(&wrapped),
            "running remote command"
        );

        let output = self
            .transport
            .execute(&self.address, &self.credentials, &wrapped, timeout)
            .await?;

        if output.success() {
            Ok(output)
        } else {
            Err(ExecutionError::non_zero(output).into())
        }
    }

    /// Release the channel. Safe to call repeatedly and in any state.
    pub async fn close(&mut self) {
        if self.state == SessionState::Open {
            self.transport
                .disconnect(&self.address, &self.credentials)
                .await;
            tracing::debug!(address = %self.address, "session closed");
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            tracing::warn!(address = %self.address, "session dropped while open; channel left to expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> SshCredentials {
        SshCredentials::new("ubuntu", "/keys/cluster.pem")
    }

    fn ok_output(stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_run_before_open_is_invalid_state() {
        let mut transport = MockTransport::new();
        transport.expect_execute().never();
        let mut session =
            RemoteSession::new(Arc::new(transport), "10.0.0.2", creds(), ExecutionContext::Host);

        let err = session.run("hostname", None).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                operation: "run",
                state: SessionState::Unopened
            }
        ));
    }

    #[tokio::test]
    async fn test_open_run_close_lifecycle() {
        let mut transport = MockTransport::new();
        transport.expect_connect().times(1).returning(|_, _| Ok(()));
        transport
            .expect_execute()
            .withf(|addr, _, cmd, _| addr == "10.0.0.2" && cmd == "hostname")
            .times(1)
            .returning(|_, _, _, _| Ok(ok_output("node-2\n")));
        transport.expect_disconnect().times(1).returning(|_, _| ());

        let mut session = RemoteSession::connect(
            Arc::new(transport),
            "10.0.0.2",
            creds(),
            ExecutionContext::Host,
        )
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Open);

        let out = session.run("hostname", None).await.unwrap();
        assert_eq!(out.stdout, "node-2\n");

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport = MockTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_disconnect().times(1).returning(|_, _| ());

        let mut session =
            RemoteSession::new(Arc::new(transport), "10.0.0.2", creds(), ExecutionContext::Host);
        session.open().await.unwrap();
        session.close().await;
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.run("true", None).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_unopened_skips_transport() {
        let mut transport = MockTransport::new();
        transport.expect_disconnect().never();
        let mut session =
            RemoteSession::new(Arc::new(transport), "10.0.0.2", creds(), ExecutionContext::Host);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_reopen_rejected() {
        let mut transport = MockTransport::new();
        transport.expect_connect().times(1).returning(|_, _| Ok(()));
        transport.expect_disconnect().returning(|_, _| ());
        let mut session =
            RemoteSession::new(Arc::new(transport), "10.0.0.2", creds(), ExecutionContext::Host);
        session.open().await.unwrap();
        assert!(matches!(
            session.open().await,
            Err(SessionError::InvalidState { operation: "open", .. })
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_authentication_failure_leaves_session_unopened() {
        let mut transport = MockTransport::new();
        transport.expect_connect().returning(|addr, _| {
            Err(SessionError::Authentication {
                address: addr.to_string(),
                message: "Permission denied (publickey)".into(),
            })
        });
        let mut session =
            RemoteSession::new(Arc::new(transport), "10.0.0.2", creds(), ExecutionContext::Host);
        let err = session.open().await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication { .. }));
        assert!(!err.is_retryable());
        assert_eq!(session.state(), SessionState::Unopened);
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_output() {
        let mut transport = MockTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_execute().returning(|_, _, _, _| {
            Ok(CommandOutput {
                exit_code: Some(3),
                stdout: "partial".into(),
                stderr: "boom".into(),
            })
        });
        transport.expect_disconnect().returning(|_, _| ());

        let mut session =
            RemoteSession::new(Arc::new(transport), "10.0.0.2", creds(), ExecutionContext::Host);
        session.open().await.unwrap();
        match session.run("false", None).await {
            Err(SessionError::Execution(e)) => {
                assert_eq!(e.kind, ExecutionErrorKind::NonZeroExit);
                assert_eq!(e.exit_code, Some(3));
                assert_eq!(e.stdout, "partial");
                assert_eq!(e.stderr, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_container_context_wraps_command() {
        let mut transport = MockTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport
            .expect_execute()
            .withf(|addr, _, cmd, timeout| {
                addr == "10.0.0.3"
                    && cmd == "docker exec 'trainer' sh -c 'nvidia-smi'"
                    && *timeout == Some(Duration::from_secs(5))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(ok_output("")));
        transport.expect_disconnect().returning(|_, _| ());

        let mut session = RemoteSession::new(
            Arc::new(transport),
            "10.0.0.3",
            creds(),
            ExecutionContext::container("trainer"),
        );
        session.open().await.unwrap();
        session
            .run("nvidia-smi", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        session.close().await;
    }

    #[test]
    fn test_execution_error_display() {
        assert_eq!(
            ExecutionError::timeout().to_string(),
            "execution failed (timeout)"
        );
        let e = ExecutionError::non_zero(CommandOutput {
            exit_code: Some(1),
            ..Default::default()
        });
        assert_eq!(e.to_string(), "execution failed (non-zero exit) with status 1");
    }

    #[test]
    fn test_retry_classification() {
        assert!(SessionError::ConnectionTimeout {
            address: "a".into(),
            after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(SessionError::Execution(ExecutionError::channel_closed("eof")).is_retryable());
        assert!(!SessionError::Execution(ExecutionError::timeout()).is_retryable());
    }
}
