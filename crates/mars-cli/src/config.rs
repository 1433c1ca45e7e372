//! Layered run configuration: `mars.toml` < `MARS_*` environment < flags.
//!
//! ```toml
//! [ssh]
//! username = "ubuntu"
//! key_file = "~/.ssh/cluster.pem"
//!
//! [cluster]
//! artifacts = "./terraform/out"
//! port = 1234
//! container = "trainer"
//!
//! [payload]
//! path = "train.py"
//! procs_per_node = 8
//!
//! [payload.args]
//! lr = 0.001
//! batch-size = 128
//!
//! [dispatch]
//! concurrency = 16
//! timeout_secs = 600
//!
//! [git]
//! repo = "medivo/uwmodels"
//! branch = "master"
//! credentials_file = "~/.git-credentials"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use coordination::{
    DispatchOptions, ExecutionContext, GitAuth, GitCredential, PayloadArgs, PrepareRequest,
    RepoRef, SharedLaunchConfig, SshConfig, SshCredentials, DEFAULT_COORDINATOR_PORT,
    DEFAULT_LAUNCHER, DEFAULT_USERNAME,
};
use serde::Deserialize;
use tracing::warn;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "mars.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarsConfig {
    pub ssh: SshSection,
    pub cluster: ClusterSection,
    pub payload: PayloadSection,
    pub dispatch: DispatchSection,
    pub git: GitSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSection {
    pub username: String,
    pub key_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub control_persist_secs: u64,
    pub host_key_checking: String,
    /// Extra `-o` options passed to every ssh invocation.
    pub options: Vec<String>,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            key_file: None,
            connect_timeout_secs: 10,
            control_persist_secs: 300,
            host_key_checking: "accept-new".to_string(),
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSection {
    /// Directory holding `master_public.txt`, `master_private.txt` and
    /// `worker_public.txt`.
    pub artifacts: Option<PathBuf>,
    pub port: u16,
    /// Run inside this container instead of the login shell.
    pub container: Option<String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            artifacts: None,
            port: DEFAULT_COORDINATOR_PORT,
            container: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PayloadSection {
    pub path: Option<String>,
    pub procs_per_node: u32,
    pub launcher: String,
    /// Forwarded as `--key value` in table order.
    pub args: toml::Table,
}

impl Default for PayloadSection {
    fn default() -> Self {
        Self {
            path: None,
            procs_per_node: 1,
            launcher: DEFAULT_LAUNCHER.to_string(),
            args: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSection {
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitSection {
    pub repo: Option<String>,
    pub branch: String,
    pub clone_dir: String,
    pub sudo: bool,
    pub host: String,
    /// `~/.git-credentials` style file holding the token for `host`.
    pub credentials_file: Option<PathBuf>,
    /// Use `$GITHUB_USER`/`$GITHUB_TOKEN` already set on the nodes.
    pub remote_env: bool,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            repo: None,
            branch: "master".to_string(),
            clone_dir: coordination::dispatch::DEFAULT_CLONE_DIR.to_string(),
            sudo: true,
            host: coordination::dispatch::DEFAULT_GIT_HOST.to_string(),
            credentials_file: None,
            remote_env: false,
        }
    }
}

impl MarsConfig {
    /// Load `path`, or `./mars.toml` if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `MARS_*` variables from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    /// Overlay `MARS_*` variables resolved through `var`. Unparseable values
    /// are ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("MARS_USERNAME") {
            self.ssh.username = v;
        }
        if let Some(v) = var("MARS_KEY_FILE") {
            self.ssh.key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = parsed(&var, "MARS_CONNECT_TIMEOUT_SECS") {
            self.ssh.connect_timeout_secs = v;
        }
        if let Some(v) = var("MARS_ARTIFACTS") {
            self.cluster.artifacts = Some(PathBuf::from(v));
        }
        if let Some(v) = parsed(&var, "MARS_PORT") {
            self.cluster.port = v;
        }
        if let Some(v) = var("MARS_CONTAINER") {
            self.cluster.container = Some(v).filter(|c| !c.trim().is_empty());
        }
        if let Some(v) = var("MARS_PAYLOAD") {
            self.payload.path = Some(v);
        }
        if let Some(v) = parsed(&var, "MARS_PROCS_PER_NODE") {
            self.payload.procs_per_node = v;
        }
        if let Some(v) = var("MARS_LAUNCHER") {
            self.payload.launcher = v;
        }
        if let Some(v) = parsed(&var, "MARS_CONCURRENCY") {
            self.dispatch.concurrency = Some(v);
        }
        if let Some(v) = parsed(&var, "MARS_DISPATCH_TIMEOUT_SECS") {
            self.dispatch.timeout_secs = Some(v);
        }
        if let Some(v) = parsed(&var, "MARS_COMMAND_TIMEOUT_SECS") {
            self.dispatch.command_timeout_secs = Some(v);
        }
        if let Some(v) = var("MARS_GIT_CREDENTIALS") {
            self.git.credentials_file = Some(PathBuf::from(v));
        }
    }

    pub fn credentials(&self) -> Result<SshCredentials> {
        let Some(key_file) = &self.ssh.key_file else {
            bail!("No SSH key configured: pass -k/--key, set MARS_KEY_FILE or ssh.key_file");
        };
        if self.ssh.username.trim().is_empty() {
            bail!("SSH username must not be empty");
        }
        Ok(SshCredentials::new(
            self.ssh.username.clone(),
            expand_home(key_file),
        ))
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs.max(1)),
            control_persist: Duration::from_secs(self.ssh.control_persist_secs.max(1)),
            host_key_checking: self.ssh.host_key_checking.clone(),
            extra_options: self.ssh.options.clone(),
            ..SshConfig::default()
        }
    }

    pub fn artifacts_dir(&self) -> Result<PathBuf> {
        match &self.cluster.artifacts {
            Some(dir) => Ok(expand_home(dir)),
            None => bail!("No cluster artifacts directory: pass -a/--artifacts, set MARS_ARTIFACTS or cluster.artifacts"),
        }
    }

    pub fn payload_args(&self) -> Result<PayloadArgs> {
        let mut args = PayloadArgs::new();
        for (key, value) in &self.payload.args {
            let rendered = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                // Debug keeps the decimal point on whole floats and uses
                // exponent form for very large or small magnitudes.
                toml::Value::Float(f) => format!("{f:?}"),
                toml::Value::Boolean(b) => b.to_string(),
                other => bail!(
                    "payload.args.{key} must be a string, number or boolean, got {}",
                    other.type_str()
                ),
            };
            args.insert(key.clone(), rendered);
        }
        Ok(args)
    }

    /// Launch settings shared by every node. An unset payload path is passed
    /// through as empty so dispatch reports it before connecting.
    pub fn shared_launch(&self, coordinator_private_address: &str) -> Result<SharedLaunchConfig> {
        Ok(SharedLaunchConfig::new(
            coordinator_private_address,
            self.cluster.port,
            self.payload.path.clone().unwrap_or_default(),
        )
        .with_args(self.payload_args()?)
        .with_procs_per_node(self.payload.procs_per_node)
        .with_launcher(self.payload.launcher.clone()))
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            concurrency_limit: self.dispatch.concurrency,
            command_timeout: self.dispatch.command_timeout_secs.map(Duration::from_secs),
            dispatch_timeout: self.dispatch.timeout_secs.map(Duration::from_secs),
            context: match &self.cluster.container {
                Some(name) => ExecutionContext::container(name.clone()),
                None => ExecutionContext::Host,
            },
        }
    }

    pub fn prepare_request(&self) -> Result<PrepareRequest> {
        let Some(repo) = &self.git.repo else {
            bail!("No repository configured: pass --repo or set git.repo");
        };
        let repo: RepoRef = repo.parse()?;

        let auth = match &self.git.credentials_file {
            Some(path) => {
                let path = expand_home(path);
                let credential = GitCredential::from_credentials_file(&path, &self.git.host)
                    .with_context(|| format!("Failed to load git credential for {}", self.git.host))?;
                GitAuth::Explicit(credential)
            }
            None if self.git.remote_env => GitAuth::RemoteEnvironment,
            None => GitAuth::Anonymous,
        };

        let mut request = PrepareRequest::new(repo, self.git.branch.clone())
            .with_auth(auth)
            .with_clone_dir(self.git.clone_dir.clone())
            .with_sudo(self.git.sudo);
        request.host = self.git.host.clone();
        Ok(request)
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Expand a leading `~` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MarsConfig::default();
        assert_eq!(config.ssh.username, "ubuntu");
        assert_eq!(config.cluster.port, 1234);
        assert_eq!(config.payload.procs_per_node, 1);
        assert_eq!(config.payload.launcher, "python -m torch.distributed.launch");
        assert_eq!(config.git.clone_dir, "/opt/");
        assert!(config.git.sudo);
        assert_eq!(config.dispatch_options().context, ExecutionContext::Host);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(MarsConfig::from_toml("[ssh]\nuser = \"root\"\n").is_err());
    }

    #[test]
    fn test_payload_args_render_scalars() {
        let config = MarsConfig::from_toml(
            "[payload.args]\nlr = 0.001\nepochs = 3\nfp16 = true\nname = \"run-1\"\n",
        )
        .unwrap();
        let args = config.payload_args().unwrap();
        let rendered: Vec<(&str, &str)> = args.iter().collect();
        assert_eq!(
            rendered,
            vec![("lr", "0.001"), ("epochs", "3"), ("fp16", "true"), ("name", "run-1")]
        );

        let config = MarsConfig::from_toml("[payload.args]\nlayers = [1, 2]\n").unwrap();
        assert!(config.payload_args().is_err());
    }

    #[test]
    fn test_payload_args_keep_float_form() {
        let config = MarsConfig::from_toml(
            "[payload.args]\nlr = 1.0\nwd = 1e-5\nscale = 1e20\nmomentum = 0.9\n",
        )
        .unwrap();
        let args = config.payload_args().unwrap();
        let rendered: Vec<(&str, &str)> = args.iter().collect();
        assert_eq!(
            rendered,
            vec![("lr", "1.0"), ("wd", "1e-5"), ("scale", "1e20"), ("momentum", "0.9")]
        );
    }

    #[test]
    fn test_missing_key_is_reported() {
        let err = MarsConfig::default().credentials().unwrap_err();
        assert!(err.to_string().contains("No SSH key configured"));
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home(Path::new("/keys/cluster.pem")),
            PathBuf::from("/keys/cluster.pem")
        );
    }
}
