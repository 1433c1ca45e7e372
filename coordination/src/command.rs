//! Launch command rendering.
//!
//! Turns a node's [`LaunchParameters`] into the single line of shell text that
//! starts the training payload under the distributed launcher. Rendering is
//! pure: the same parameters always give byte-identical text, so the whole
//! rank layout of a run can be checked without touching a node.
//!
//! ```text
//! python -m torch.distributed.launch --nproc_per_node=1 --nnodes=3 --node_rank=1 \
//!     --master_addr="10.0.0.1" --master_port=1234 train.py --lr 0.001 --batch-size 128
//! ```
//! (shown wrapped; the rendered command is one line)

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shell_safety::{quote_if_needed, validate_arg};

/// Launcher used when the caller does not name one.
pub const DEFAULT_LAUNCHER: &str = "python -m torch.distributed.launch";

/// Port the coordinator listens on for rendezvous unless configured.
pub const DEFAULT_COORDINATOR_PORT: u16 = 1234;

/// Errors raised while rendering a launch command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No payload path was given: the path is empty or only whitespace,
    /// which no launcher can execute. Always reported ahead of any other
    /// problem.
    #[error("missing payload: no training script path was provided")]
    MissingPayload,

    #[error("world size must be at least 1")]
    EmptyWorld,

    #[error("rank {rank} is outside a world of {world_size} nodes")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("processes per node must be at least 1")]
    NoProcesses,

    #[error("coordinator port must be between 1 and 65535")]
    InvalidPort,

    #[error("launcher program is empty")]
    EmptyLauncher,

    #[error("invalid payload argument name {0:?}")]
    InvalidArgumentName(String),

    #[error("coordinator address {address:?} is not usable: {reason}")]
    InvalidCoordinatorAddress { address: String, reason: String },

    #[error("value for --{key} cannot be passed through a shell: {reason}")]
    UnquotableValue { key: String, reason: String },
}

/// Ordered `--key value` arguments for the payload.
///
/// Insertion order is rendering order. Inserting an existing key replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadArgs(Vec<(String, String)>);

impl PayloadArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` on top of `self`; keys already present keep their
    /// position and take the new value.
    pub fn extend(&mut self, other: &PayloadArgs) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for PayloadArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = PayloadArgs::new();
        for (k, v) in iter {
            args.insert(k, v);
        }
        args
    }
}

/// Everything one node needs to join the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParameters {
    pub world_size: usize,
    pub rank: usize,
    /// Private (intra-cluster) address of rank 0. Never the public address:
    /// workers may have no route to each other's public side.
    pub coordinator_private_address: String,
    pub coordinator_port: u16,
    pub payload_path: String,
    pub payload_args: PayloadArgs,
    /// Processes started on each node (one per GPU).
    pub procs_per_node: u32,
    /// Launcher program and its fixed leading arguments.
    pub launcher: String,
}

impl LaunchParameters {
    pub fn new(
        world_size: usize,
        rank: usize,
        coordinator_private_address: impl Into<String>,
        coordinator_port: u16,
        payload_path: impl Into<String>,
    ) -> Self {
        Self {
            world_size,
            rank,
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

    /// Check every field without rendering.
    pub fn validate(&self) -> Result<(), CommandError> {
        if self.payload_path.trim().is_empty() {
            return Err(CommandError::MissingPayload);
        }
        if self.world_size == 0 {
            return Err(CommandError::EmptyWorld);
        }
        if self.rank >= self.world_size {
            return Err(CommandError::RankOutOfRange {
                rank: self.rank,
                world_size: self.world_size,
            });
        }
        if self.procs_per_node == 0 {
            return Err(CommandError::NoProcesses);
        }
        if self.coordinator_port == 0 {
            return Err(CommandError::InvalidPort);
        }
        if self.launcher.trim().is_empty() {
            return Err(CommandError::EmptyLauncher);
        }

        let address = &self.coordinator_private_address;
        if address.trim().is_empty() || address.contains(char::is_whitespace) {
            return Err(CommandError::InvalidCoordinatorAddress {
                address: address.clone(),
                reason: "empty or contains whitespace".into(),
            });
        }
        validate_arg(address).map_err(|e| CommandError::InvalidCoordinatorAddress {
            address: address.clone(),
            reason: e.to_string(),
        })?;

        for (key, _) in self.payload_args.iter() {
            if !is_valid_arg_name(key) {
                return Err(CommandError::InvalidArgumentName(key.to_string()));
            }
        }
        Ok(())
    }
}

fn is_valid_arg_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Render the launch command for one node.
///
/// Fails with [`CommandError::MissingPayload`] when `payload_path` is empty
/// or whitespace-only, before anything else is looked at.
pub fn build(params: &LaunchParameters) -> Result<String, CommandError> {
    params.validate()?;

    let payload = quote_if_needed(&params.payload_path).map_err(|e| {
        CommandError::UnquotableValue {
            key: "payload".into(),
            reason: e.to_string(),
        }
    })?;

    let mut cmd = String::with_capacity(192);
    // Writing into a String cannot fail.
    let _ = write!(
        cmd,
        "{} --nproc_per_node={} --nnodes={} --node_rank={} --master_addr=\"{}\" --master_port={} {}",
        params.launcher.trim(),
        params.procs_per_node,
        params.world_size,
        params.rank,
        params.coordinator_private_address,
        params.coordinator_port,
        payload,
    );

    for (key, value) in params.payload_args.iter() {
        let value = quote_if_needed(value).map_err(|e| CommandError::UnquotableValue {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let _ = write!(cmd, " --{} {}", key, value);
    }

    Ok(cmd)
}
