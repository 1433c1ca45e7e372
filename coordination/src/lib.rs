//! Multi-node training dispatch over SSH.
//!
//! This library provides:
//! - Roster loading with deterministic rank assignment (coordinator = rank 0)
//! - Launch command rendering for `torch.distributed.launch`-style launchers
//! - Remote sessions over multiplexed OpenSSH connections, on the host or
//!   inside a container
//! - Concurrent dispatch with per-node result isolation, a concurrency bound
//!   and an optional run deadline
//! - Code sync (`git clone` of a branch) across every node
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use coordination::{
//!     DispatchCoordinator, DispatchOptions, RosterStore, SharedLaunchConfig, SshConfig,
//!     SshCredentials, SshTransport,
//! };
//!
//! let artifacts = RosterStore::load_artifacts("./cluster")?;
//! let shared = SharedLaunchConfig::new(&artifacts.coordinator_private_address, 1234, "train.py");
//! let transport = Arc::new(SshTransport::new(SshConfig::default())?);
//! let coordinator = DispatchCoordinator::new(transport);
//! let results = coordinator
//!     .dispatch(
//!         &artifacts.roster,
//!         &shared,
//!         &SshCredentials::new("ubuntu", "~/.ssh/cluster.pem"),
//!         &DispatchOptions::default(),
//!     )
//!     .await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod command;
pub mod dispatch;
pub mod roster;
pub mod session;
pub mod shell_safety;

// Re-export roster types
pub use roster::{ClusterArtifacts, ClusterRoster, NodeRecord, RosterError, RosterStore};

// Re-export launch command types
pub use command::{
    build as build_launch_command, CommandError, LaunchParameters, PayloadArgs,
    DEFAULT_COORDINATOR_PORT, DEFAULT_LAUNCHER,
};

// Re-export session types
pub use session::{
    CommandOutput, ExecutionContext, ExecutionError, ExecutionErrorKind, RemoteSession,
    SessionError, SessionState, SshConfig, SshCredentials, SshTransport, Transport,
    DEFAULT_USERNAME,
};

// Re-export dispatch types
pub use dispatch::{
    DispatchCoordinator, DispatchError, DispatchOptions, DispatchResult, DispatchSummary,
    GitAuth, GitCredential, NodeError, NodeErrorKind, NodeJob, PrepareError, PrepareRequest,
    RepoRef, SharedLaunchConfig,
};
