use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::MarsConfig;

/// Launch and manage multi-node training runs on a provisioned cluster.
#[derive(Parser, Debug)]
#[command(name = "mars", author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./mars.toml when present)
    #[arg(long, global = true, env = "MARS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the training payload on every node
    Dispatch {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        payload: PayloadFlags,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Clone a branch of the training repository onto every node
    Prepare {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        git: GitArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Print the rank assignment
    Roster {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Print each node's launch command without connecting
    Render {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        payload: PayloadFlags,
    },
}

#[derive(Args, Debug, Default)]
pub struct ClusterArgs {
    /// Directory with master_public.txt, master_private.txt and worker_public.txt
    #[arg(short = 'a', long)]
    pub artifacts: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct ConnectionArgs {
    /// SSH private key file
    #[arg(short = 'k', long = "key")]
    pub key_file: Option<PathBuf>,

    /// Login user on every node
    #[arg(long)]
    pub username: Option<String>,

    /// Run commands inside this container on each node
    #[arg(long)]
    pub container: Option<String>,

    /// SSH connect timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,
}

#[derive(Args, Debug, Default)]
pub struct PayloadFlags {
    /// Rendezvous port on the coordinator
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Training script passed to the launcher
    #[arg(long)]
    pub payload: Option<String>,

    /// Payload argument as KEY=VALUE (repeatable, kept in order)
    #[arg(long = "arg", value_parser = parse_key_val)]
    pub args: Vec<(String, String)>,

    /// Processes per node
    #[arg(long)]
    pub procs_per_node: Option<u32>,

    /// Launcher command
    #[arg(long)]
    pub launcher: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct GitArgs {
    /// Repository as OWNER/NAME
    #[arg(long)]
    pub repo: Option<String>,

    /// Branch to clone
    #[arg(long)]
    pub branch: Option<String>,

    /// git-credential-store file holding the token for the git host
    #[arg(long)]
    pub git_credentials: Option<PathBuf>,

    /// Use $GITHUB_USER/$GITHUB_TOKEN already exported on the nodes
    #[arg(long, default_value_t = false)]
    pub remote_env: bool,

    /// Directory to clone into
    #[arg(long)]
    pub clone_dir: Option<String>,

    /// Clone without sudo
    #[arg(long, default_value_t = false)]
    pub no_sudo: bool,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Maximum sessions open at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Deadline for the whole run, in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Per-node command timeout, in seconds
    #[arg(long)]
    pub command_timeout: Option<u64>,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    let key = key.trim().trim_start_matches("--");
    if key.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

impl ClusterArgs {
    pub fn apply(&self, config: &mut MarsConfig) {
        if let Some(dir) = &self.artifacts {
            config.cluster.artifacts = Some(dir.clone());
        }
    }
}

impl ConnectionArgs {
    pub fn apply(&self, config: &mut MarsConfig) {
        if let Some(key) = &self.key_file {
            config.ssh.key_file = Some(key.clone());
        }
        if let Some(user) = &self.username {
            config.ssh.username = user.clone();
        }
        if let Some(name) = &self.container {
            config.cluster.container = Some(name.clone());
        }
        if let Some(secs) = self.connect_timeout {
            config.ssh.connect_timeout_secs = secs;
        }
    }
}

impl PayloadFlags {
    /// `--arg` values replace same-named config entries in place and append
    /// new ones.
    pub fn apply(&self, config: &mut MarsConfig) {
        if let Some(port) = self.port {
            config.cluster.port = port;
        }
        if let Some(path) = &self.payload {
            config.payload.path = Some(path.clone());
        }
        for (key, value) in &self.args {
            config
                .payload
                .args
                .insert(key.clone(), toml::Value::String(value.clone()));
        }
        if let Some(procs) = self.procs_per_node {
            config.payload.procs_per_node = procs;
        }
        if let Some(launcher) = &self.launcher {
            config.payload.launcher = launcher.clone();
        }
    }
}

impl GitArgs {
    pub fn apply(&self, config: &mut MarsConfig) {
        if let Some(repo) = &self.repo {
            config.git.repo = Some(repo.clone());
        }
        if let Some(branch) = &self.branch {
            config.git.branch = branch.clone();
        }
        if let Some(path) = &self.git_credentials {
            config.git.credentials_file = Some(path.clone());
        }
        if self.remote_env {
            config.git.remote_env = true;
        }
        if let Some(dir) = &self.clone_dir {
            config.git.clone_dir = dir.clone();
        }
        if self.no_sudo {
            config.git.sudo = false;
        }
    }
}

impl RunArgs {
    pub fn apply(&self, config: &mut MarsConfig) {
        if let Some(k) = self.concurrency {
            config.dispatch.concurrency = Some(k);
        }
        if let Some(secs) = self.timeout {
            config.dispatch.timeout_secs = Some(secs);
        }
        if let Some(secs) = self.command_timeout {
            config.dispatch.command_timeout_secs = Some(secs);
        }
    }
}
