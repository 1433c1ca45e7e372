//! Concurrent dispatch of per-node commands across a roster.
//!
//! ```text
//! ClusterRoster ──► plan (pure, all ranks validated up front)
//!                     │
//!                     ▼
//!   JoinSet::spawn(open → run → close) × N, Semaphore(k) guarded
//!                     │
//!                     ▼
//!   one slot per rank ──► Vec<DispatchResult> in rank order
//! ```
//!
//! ## Failure policy
//!
//! Configuration problems (bad launch parameters, bad prepare request, zero
//! concurrency) abort before any session is opened. Everything that goes
//! wrong on a node is recorded in that node's [`DispatchResult`] and never
//! affects its siblings. Nothing is retried here; re-run the failed subset
//! with [`DispatchCoordinator::dispatch_nodes`] if desired.
//!
//! ## Deadline
//!
//! With `dispatch_timeout` set, nodes still pending when it expires are
//! cancelled, their sessions closed, and recorded as [`NodeErrorKind::Timeout`].
//! Results that were already in keep their values.

mod prepare;
mod summary;

pub use prepare::{
    GitAuth, GitCredential, PrepareError, PrepareRequest, RepoRef, DEFAULT_CLONE_DIR,
    DEFAULT_GIT_HOST,
};
pub use summary::DispatchSummary;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::command::{self, CommandError, LaunchParameters, PayloadArgs, DEFAULT_LAUNCHER};
use crate::roster::{ClusterRoster, NodeRecord};
use crate::session::{
    CommandOutput, ExecutionContext, ExecutionErrorKind, RemoteSession, SessionError,
    SshCredentials, Transport,
};
use crate::shell_safety::redact_credentials;

/// Configuration-level failures. Raised before any remote call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid launch parameters for rank {rank}: {source}")]
    InvalidLaunch {
        rank: usize,
        #[source]
        source: CommandError,
    },

    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,

    #[error("nothing to dispatch: no nodes selected")]
    NoNodes,

    #[error(transparent)]
    Prepare(#[from] PrepareError),
}

impl DispatchError {
    pub fn is_missing_payload(&self) -> bool {
        matches!(
            self,
            Self::InvalidLaunch {
                source: CommandError::MissingPayload,
                ..
            }
        )
    }
}

/// Settings shared by every node of a run. Combined with a [`NodeRecord`]
/// they give that node's [`LaunchParameters`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLaunchConfig {
    pub coordinator_private_address: String,
    pub coordinator_port: u16,
    pub payload_path: String,
    pub payload_args: PayloadArgs,
    pub procs_per_node: u32,
    pub launcher: String,
}

impl SharedLaunchConfig {
    pub fn new(
        coordinator_private_address: impl Into<String>,
        coordinator_port: u16,
        payload_path: impl Into<String>,
    ) -> Self {
        Self {
            coordinator_private_address: coordinator_private_address.into(),
            coordinator_port,
            payload_path: payload_path.into(),
            payload_args: PayloadArgs::new(),
            procs_per_node: 1,
            launcher: DEFAULT_LAUNCHER.to_string(),
        }
    }

    pub fn with_args(mut self, args: PayloadArgs) -> Self {
        self.payload_args = args;
        self
    }

    pub fn with_procs_per_node(mut self, procs: u32) -> Self {
        self.procs_per_node = procs;
        self
    }

    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = launcher.into();
        self
    }

    /// Parameters for `node` in a world of `world_size` nodes.
    pub fn params_for(&self, node: &NodeRecord, world_size: usize) -> LaunchParameters {
        LaunchParameters {
            world_size,
            rank: node.rank,
            coordinator_private_address: self.coordinator_private_address.clone(),
            coordinator_port: self.coordinator_port,
            payload_path: self.payload_path.clone(),
            payload_args: self.payload_args.clone(),
            procs_per_node: self.procs_per_node,
            launcher: self.launcher.clone(),
        }
    }
}

/// Run-wide execution settings.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Maximum sessions open at once. `None` opens one per node.
    pub concurrency_limit: Option<usize>,
    /// Per-command timeout inside each session.
    pub command_timeout: Option<Duration>,
    /// Deadline for the whole run.
    pub dispatch_timeout: Option<Duration>,
    /// Where commands run on each node.
    pub context: ExecutionContext,
}

impl DispatchOptions {
    /// Run deadline measured from `start`. A timeout too large to represent
    /// means no deadline.
    fn deadline_from(&self, start: tokio::time::Instant) -> Option<tokio::time::Instant> {
        self.dispatch_timeout.and_then(|d| start.checked_add(d))
    }

    fn effective_limit(&self, nodes: usize) -> Result<usize, DispatchError> {
        match self.concurrency_limit {
            Some(0) => Err(DispatchError::ZeroConcurrency),
            Some(k) => Ok(k.min(nodes.max(1))),
            None => Ok(nodes.max(1)),
        }
    }
}

/// A rendered command bound to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeJob {
    pub rank: usize,
    pub address: String,
    pub command: String,
}

/// Category of a per-node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    Authentication,
    ConnectionTimeout,
    Connection,
    NonZeroExit,
    Timeout,
    ChannelClosed,
    InvalidState,
    Transport,
    /// The worker task for this node died without reporting.
    Worker,
}

impl fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Authentication => "authentication",
            Self::ConnectionTimeout => "connection timeout",
            Self::Connection => "connection",
            Self::NonZeroExit => "non-zero exit",
            Self::Timeout => "timeout",
            Self::ChannelClosed => "channel closed",
            Self::InvalidState => "invalid state",
            Self::Transport => "transport",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

/// Serializable description of what went wrong on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&SessionError> for NodeError {
    fn from(err: &SessionError) -> Self {
        let kind = match err {
            SessionError::Authentication { .. } => NodeErrorKind::Authentication,
            SessionError::ConnectionTimeout { .. } => NodeErrorKind::ConnectionTimeout,
            SessionError::Connect { .. } => NodeErrorKind::Connection,
            SessionError::Execution(e) => match e.kind {
                ExecutionErrorKind::NonZeroExit => NodeErrorKind::NonZeroExit,
                ExecutionErrorKind::Timeout => NodeErrorKind::Timeout,
                ExecutionErrorKind::ChannelClosed => NodeErrorKind::ChannelClosed,
            },
            SessionError::InvalidState { .. } => NodeErrorKind::InvalidState,
            SessionError::Spawn(_) => NodeErrorKind::Transport,
        };
        NodeError::new(kind, err.to_string())
    }
}

/// Outcome of one node in one run. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub rank: usize,
    pub address: String,
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<NodeError>,
    /// When the node's session started opening; `None` if it never did.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl DispatchResult {
    fn completed(job: &NodeJob, started_at: DateTime<Utc>, output: CommandOutput) -> Self {
        Self {
            rank: job.rank,
            address: job.address.clone(),
            succeeded: true,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            error: None,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    fn from_session_error(job: &NodeJob, started_at: DateTime<Utc>, err: SessionError) -> Self {
        let error = NodeError::from(&err);
        let (exit_code, stdout, stderr) = match err {
            SessionError::Execution(e) => (e.exit_code, e.stdout, e.stderr),
            _ => (None, String::new(), String::new()),
        };
        Self {
            rank: job.rank,
            address: job.address.clone(),
            succeeded: false,
            exit_code,
            stdout,
            stderr,
            error: Some(error),
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    fn failed(
        rank: usize,
        address: &str,
        started_at: Option<DateTime<Utc>>,
        error: NodeError,
    ) -> Self {
        Self {
            rank,
            address: address.to_string(),
            succeeded: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

enum NodeOutcome {
    Finished(Result<CommandOutput, SessionError>),
    Cancelled,
}

/// Drives one dispatch run: owns the transport shared by all sessions and the
/// run id that tags every log line and the final summary.
pub struct DispatchCoordinator {
    transport: Arc<dyn Transport>,
    run_id: Uuid,
}

impl DispatchCoordinator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Render every node's launch command without touching the network.
    /// Fails on the first invalid rank.
    pub fn plan(
        &self,
        roster: &ClusterRoster,
        shared: &SharedLaunchConfig,
    ) -> Result<Vec<NodeJob>, DispatchError> {
        plan(roster, shared)
    }

    /// Launch the payload on every node of `roster`. Results come back in rank
    /// order, one per node.
    pub async fn dispatch(
        &self,
        roster: &ClusterRoster,
        shared: &SharedLaunchConfig,
        credentials: &SshCredentials,
        options: &DispatchOptions,
    ) -> Result<Vec<DispatchResult>, DispatchError> {
        self.dispatch_nodes(roster, roster.nodes(), shared, credentials, options)
            .await
    }

    /// Launch on a subset of `roster` (e.g. the failed ranks of an earlier
    /// run). World size and ranks still come from the full roster.
    pub async fn dispatch_nodes(
        &self,
        roster: &ClusterRoster,
        nodes: &[NodeRecord],
        shared: &SharedLaunchConfig,
        credentials: &SshCredentials,
        options: &DispatchOptions,
    ) -> Result<Vec<DispatchResult>, DispatchError> {
        if nodes.is_empty() {
            return Err(DispatchError::NoNodes);
        }
        let jobs = plan_nodes(nodes, roster.len(), shared)?;
        info!(
            run_id = %self.run_id,
            world_size = roster.len(),
            nodes = jobs.len(),
            coordinator = %shared.coordinator_private_address,
            port = shared.coordinator_port,
            context = %options.context,
            "dispatching training payload"
        );
        self.fan_out("dispatch", jobs, credentials, options).await
    }

    /// Clone the requested branch onto every node. Same concurrency and
    /// isolation rules as [`dispatch`](Self::dispatch); never chained into it.
    pub async fn prepare(
        &self,
        roster: &ClusterRoster,
        request: &PrepareRequest,
        credentials: &SshCredentials,
        options: &DispatchOptions,
    ) -> Result<Vec<DispatchResult>, DispatchError> {
        let command = request.render()?;
        let jobs: Vec<NodeJob> = roster
            .iter()
            .map(|node| NodeJob {
                rank: node.rank,
                address: node.address.clone(),
                command: command.clone(),
            })
            .collect();
        info!(
            run_id = %self.run_id,
            nodes = jobs.len(),
            repo = %request.repo,
            branch = %request.branch,
            "preparing nodes"
        );
        self.fan_out("prepare", jobs, credentials, options).await
    }

    async fn fan_out(
        &self,
        operation: &'static str,
        jobs: Vec<NodeJob>,
        credentials: &SshCredentials,
        options: &DispatchOptions,
    ) -> Result<Vec<DispatchResult>, DispatchError> {
        let limit = options.effective_limit(jobs.len())?;
        let sem = Arc::new(Semaphore::new(limit));
        let cancel = CancellationToken::new();
        let mut join_set: JoinSet<(usize, DispatchResult)> = JoinSet::new();

        // Slot i belongs to jobs[i]; jobs are in rank order.
        let mut slots: Vec<Option<DispatchResult>> = vec![None; jobs.len()];
        let index: Vec<(usize, String)> = jobs.iter().map(|j| (j.rank, j.address.clone())).collect();

        debug!(operation, limit, nodes = jobs.len(), "spawning node workers");

        for (slot, job) in jobs.into_iter().enumerate() {
            let span = tracing::info_span!("node", run_id = %self.run_id, rank = job.rank, address = %job.address);
            let worker = NodeWorker {
                transport: self.transport.clone(),
                credentials: credentials.clone(),
                context: options.context.clone(),
                command_timeout: options.command_timeout,
                sem: sem.clone(),
                cancel: cancel.clone(),
            };
            join_set.spawn(async move { (slot, worker.run(job).await) }.instrument(span));
        }

        let deadline = options.deadline_from(tokio::time::Instant::now());

        loop {
            let next = match deadline {
                Some(at) if !cancel.is_cancelled() => {
                    let waited = tokio::time::timeout_at(at, join_set.join_next()).await;
                    match waited {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(
                                run_id = %self.run_id,
                                operation,
                                pending = join_set.len(),
                                "dispatch deadline reached; closing pending sessions"
                            );
                            cancel.cancel();
                            continue;
                        }
                    }
                }
                _ => join_set.join_next().await,
            };

            match next {
                None => break,
                Some(Ok((slot, result))) => {
                    debug_assert!(slots[slot].is_none(), "slot written twice");
                    slots[slot] = Some(result);
                }
                Some(Err(e)) => {
                    // The slot stays empty and is filled in below.
                    warn!(error = %e, operation, "node worker panicked");
                }
            }
        }

        let results: Vec<DispatchResult> = slots
            .into_iter()
            .zip(index)
            .map(|(slot, (rank, address))| {
                slot.unwrap_or_else(|| {
                    DispatchResult::failed(
                        rank,
                        &address,
                        None,
                        NodeError::new(NodeErrorKind::Worker, "worker task ended without a result"),
                    )
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.succeeded).count();
        info!(
            run_id = %self.run_id,
            operation,
            succeeded = results.len() - failed,
            failed,
            "all nodes reported"
        );
        Ok(results)
    }
}

/// Render every node's launch command. Pure: no transport involved.
pub fn plan(
    roster: &ClusterRoster,
    shared: &SharedLaunchConfig,
) -> Result<Vec<NodeJob>, DispatchError> {
    plan_nodes(roster.nodes(), roster.len(), shared)
}

fn plan_nodes(
    nodes: &[NodeRecord],
    world_size: usize,
    shared: &SharedLaunchConfig,
) -> Result<Vec<NodeJob>, DispatchError> {
    let mut jobs = nodes
        .iter()
        .map(|node| {
            let params = shared.params_for(node, world_size);
            command::build(&params)
                .map(|command| NodeJob {
                    rank: node.rank,
                    address: node.address.clone(),
                    command,
                })
                .map_err(|source| DispatchError::InvalidLaunch {
                    rank: node.rank,
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    jobs.sort_by_key(|j| j.rank);
    Ok(jobs)
}

/// Everything a spawned task needs to drive one node.
struct NodeWorker {
    transport: Arc<dyn Transport>,
    credentials: SshCredentials,
    context: ExecutionContext,
    command_timeout: Option<Duration>,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl NodeWorker {
    async fn run(self, job: NodeJob) -> DispatchResult {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return DispatchResult::failed(
                    job.rank,
                    &job.address,
                    None,
                    NodeError::new(NodeErrorKind::Timeout, "dispatch deadline reached before the node was started"),
                );
            }
            permit = self.sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return DispatchResult::failed(
                        job.rank,
                        &job.address,
                        None,
                        NodeError::new(NodeErrorKind::Worker, "worker pool closed"),
                    );
                }
            },
        };

        let started_at = Utc::now();
        debug!(command = %redact_credentials(&job.command), "starting node");

        let mut session = RemoteSession::new(
            self.transport.clone(),
            job.address.clone(),
            self.credentials.clone(),
            self.context.clone(),
        );

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => NodeOutcome::Cancelled,
            res = async {
                session.open().await?;
                session.run(&job.command, self.command_timeout).await
            } => NodeOutcome::Finished(res),
        };

        session.close().await;

        let result = match outcome {
            NodeOutcome::Finished(Ok(output)) => DispatchResult::completed(&job, started_at, output),
            NodeOutcome::Finished(Err(err)) => DispatchResult::from_session_error(&job, started_at, err),
            NodeOutcome::Cancelled => DispatchResult::failed(
                job.rank,
                &job.address,
                Some(started_at),
                NodeError::new(NodeErrorKind::Timeout, "dispatch deadline reached while the node was running"),
            ),
        };

        match &result.error {
            None => info!(exit_code = ?result.exit_code, "node succeeded"),
            Some(e) => warn!(error = %e, "node failed"),
        }
        result
    }
}
