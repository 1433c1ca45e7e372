//! Cluster roster loading and rank assignment.
//!
//! The provisioning step leaves one address per line in plain text files,
//! each address usually wrapped in quotes (Terraform output). The coordinator
//! always takes global rank 0 and workers take ranks `1..N` in file order,
//! which is the layout `torch.distributed.launch --node_rank` expects: rank 0
//! hosts the rendezvous store on the coordinator's private address.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coordinator address used for SSH.
pub const COORDINATOR_PUBLIC_FILE: &str = "master_public.txt";
/// Coordinator address on the cluster's internal network, used for rendezvous.
pub const COORDINATOR_PRIVATE_FILE: &str = "master_private.txt";
/// Ordered worker addresses used for SSH.
pub const WORKER_PUBLIC_FILE: &str = "worker_public.txt";

/// Errors raised while loading a roster. Every variant is a malformed roster
/// and aborts the run before any network activity.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("malformed roster: {source_name} not found at {path}")]
    Missing { source_name: String, path: PathBuf },

    #[error("malformed roster: {source_name} contains no addresses")]
    Empty { source_name: String },

    #[error("malformed roster: {source_name} line {line}: {reason}")]
    InvalidLine {
        source_name: String,
        line: usize,
        reason: String,
    },

    #[error("malformed roster: {source_name} must hold exactly one address, found {found}")]
    NotSingle { source_name: String, found: usize },

    #[error("malformed roster: address {address} appears more than once")]
    DuplicateAddress { address: String },

    #[error("malformed roster: failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One node of the cluster and its identity within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub rank: usize,
    pub address: String,
    pub is_coordinator: bool,
}

impl NodeRecord {
    fn new(rank: usize, address: impl Into<String>) -> Self {
        Self {
            rank,
            address: address.into(),
            is_coordinator: rank == 0,
        }
    }
}

/// Ordered, immutable set of nodes participating in one dispatch run.
///
/// `nodes()[i].rank == i` for every `i`, and only rank 0 is the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRoster {
    nodes: Vec<NodeRecord>,
}

impl ClusterRoster {
    /// Number of nodes, i.e. the world size of the run.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A loaded roster always has a coordinator, so this is `false` in
    /// practice; provided for the usual `len`/`is_empty` pairing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn coordinator(&self) -> &NodeRecord {
        &self.nodes[0]
    }

    pub fn workers(&self) -> &[NodeRecord] {
        &self.nodes[1..]
    }

    pub fn get(&self, rank: usize) -> Option<&NodeRecord> {
        self.nodes.get(rank)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeRecord> {
        self.nodes.iter()
    }

    /// Restrict the roster to the given ranks, keeping their original rank
    /// numbers. Used to re-run a failed subset with the same world layout.
    pub fn select(&self, ranks: &[usize]) -> Vec<NodeRecord> {
        self.nodes
            .iter()
            .filter(|n| ranks.contains(&n.rank))
            .cloned()
            .collect()
    }
}

impl<'a> IntoIterator for &'a ClusterRoster {
    type Item = &'a NodeRecord;
    type IntoIter = std::slice::Iter<'a, NodeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

/// Everything the provisioning step hands over: the roster plus the
/// coordinator's private address used for rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterArtifacts {
    pub roster: ClusterRoster,
    pub coordinator_private_address: String,
}

/// Parses roster sources into a [`ClusterRoster`].
pub struct RosterStore;

impl RosterStore {
    /// Build a roster from the text of the coordinator source (exactly one
    /// address) and the worker source (one or more addresses, in rank order).
    pub fn load(coordinator_source: &str, worker_source: &str) -> Result<ClusterRoster, RosterError> {
        let coordinator = parse_single("coordinator list", coordinator_source)?;
        let workers = parse_addresses("worker list", worker_source)?;
        if workers.is_empty() {
            return Err(RosterError::Empty {
                source_name: "worker list".into(),
            });
        }

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(workers.len() + 1);
        for (rank, address) in std::iter::once(coordinator).chain(workers).enumerate() {
            if !seen.insert(address.clone()) {
                return Err(RosterError::DuplicateAddress { address });
            }
            nodes.push(NodeRecord::new(rank, address));
        }

        tracing::debug!(world_size = nodes.len(), "roster loaded");
        Ok(ClusterRoster { nodes })
    }

    /// Read both sources from disk and build the roster.
    pub fn load_files(
        coordinator_path: impl AsRef<Path>,
        worker_path: impl AsRef<Path>,
    ) -> Result<ClusterRoster, RosterError> {
        let coordinator = read_source(coordinator_path.as_ref())?;
        let workers = read_source(worker_path.as_ref())?;
        Self::load(&coordinator, &workers)
    }

    /// Load the provisioning artifact directory (`master_public.txt`,
    /// `master_private.txt`, `worker_public.txt`).
    pub fn load_artifacts(dir: impl AsRef<Path>) -> Result<ClusterArtifacts, RosterError> {
        let dir = dir.as_ref();
        let roster = Self::load_files(
            dir.join(COORDINATOR_PUBLIC_FILE),
            dir.join(WORKER_PUBLIC_FILE),
        )?;
        let private = read_source(&dir.join(COORDINATOR_PRIVATE_FILE))?;
        let coordinator_private_address = parse_single(COORDINATOR_PRIVATE_FILE, &private)?;

        tracing::info!(
            artifacts = %dir.display(),
            world_size = roster.len(),
            coordinator = %roster.coordinator().address,
            rendezvous = %coordinator_private_address,
            "cluster artifacts loaded"
        );

        Ok(ClusterArtifacts {
            roster,
            coordinator_private_address,
        })
    }
}

fn read_source(path: &Path) -> Result<String, RosterError> {
    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RosterError::Missing {
            source_name,
            path: path.to_path_buf(),
        }),
        Err(e) => Err(RosterError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn parse_single(source_name: &str, text: &str) -> Result<String, RosterError> {
    let mut addresses = parse_addresses(source_name, text)?;
    match addresses.len() {
        0 => Err(RosterError::Empty {
            source_name: source_name.into(),
        }),
        1 => Ok(addresses.remove(0)),
        found => Err(RosterError::NotSingle {
            source_name: source_name.into(),
            found,
        }),
    }
}

/// Parse every non-blank line as an address. Any bad line fails the whole
/// source.
fn parse_addresses(source_name: &str, text: &str) -> Result<Vec<String>, RosterError> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let address = parse_address(line).map_err(|reason| RosterError::InvalidLine {
            source_name: source_name.into(),
            line: idx + 1,
            reason,
        })?;
        out.push(address);
    }
    Ok(out)
}

fn parse_address(line: &str) -> Result<String, String> {
    let unquoted = strip_quotes(line)?;
    if unquoted.is_empty() {
        return Err("empty address".into());
    }
    if unquoted.parse::<IpAddr>().is_ok() || is_hostname(unquoted) {
        Ok(unquoted.to_string())
    } else {
        Err(format!("not an IP address or hostname: {line:?}"))
    }
}

fn strip_quotes(line: &str) -> Result<&str, String> {
    let first = line.chars().next();
    let last = line.chars().last();
    match (first, last) {
        (Some(q @ ('"' | '\'')), Some(l)) if line.len() >= 2 && q == l => {
            Ok(&line[1..line.len() - 1])
        }
        (Some('"' | '\''), _) | (_, Some('"' | '\'')) => {
            Err(format!("unbalanced quotes: {line:?}"))
        }
        _ => Ok(line),
    }
}

fn is_hostname(candidate: &str) -> bool {
    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    let re = HOSTNAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
            .expect("hostname pattern is valid")
    });
    candidate.len() <= 253 && re.is_match(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_assigns_coordinator_rank_zero() {
        let roster = RosterStore::load("\"10.0.0.1\"\n", "\"10.0.0.2\"\n\"10.0.0.3\"\n").unwrap();
        let got: Vec<(usize, &str, bool)> = roster
            .iter()
            .map(|n| (n.rank, n.address.as_str(), n.is_coordinator))
            .collect();
        assert_eq!(
            got,
            vec![
                (0, "10.0.0.1", true),
                (1, "10.0.0.2", false),
                (2, "10.0.0.3", false)
            ]
        );
        assert_eq!(roster.coordinator().address, "10.0.0.1");
        assert_eq!(roster.workers().len(), 2);
    }

    #[test]
    fn test_ranks_are_contiguous_for_any_size() {
        for workers in 1..20 {
            let list: String = (0..workers).map(|i| format!("'10.1.0.{}'\n", i + 2)).collect();
            let roster = RosterStore::load("10.1.0.1", &list).unwrap();
            assert_eq!(roster.len(), workers + 1);
            for (i, node) in roster.iter().enumerate() {
                assert_eq!(node.rank, i);
                assert_eq!(node.is_coordinator, i == 0);
            }
            assert_eq!(roster.iter().filter(|n| n.is_coordinator).count(), 1);
        }
    }

    #[test]
    fn test_unquoted_and_hostname_lines_accepted() {
        let roster = RosterStore::load(
            "ec2-54-81-154-42.compute-1.amazonaws.com",
            "10.0.0.2\n\n  'worker-b.internal'  \n",
        )
        .unwrap();
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.get(2).unwrap().address, "worker-b.internal");
    }

    #[test]
    fn test_ipv6_accepted() {
        let roster = RosterStore::load("\"fd00::1\"", "\"fd00::2\"").unwrap();
        assert_eq!(roster.get(1).unwrap().address, "fd00::2");
    }

    #[test]
    fn test_empty_sources_rejected() {
        assert!(matches!(
            RosterStore::load("", "10.0.0.2"),
            Err(RosterError::Empty { .. })
        ));
        assert!(matches!(
            RosterStore::load("10.0.0.1", "\n  \n"),
            Err(RosterError::Empty { .. })
        ));
    }

    #[test]
    fn test_bad_line_fails_whole_load() {
        let err = RosterStore::load("10.0.0.1", "10.0.0.2\nnot an address\n10.0.0.4").unwrap_err();
        match err {
            RosterError::InvalidLine { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        assert!(matches!(
            RosterStore::load("\"10.0.0.1'", "10.0.0.2"),
            Err(RosterError::InvalidLine { .. })
        ));
        assert!(matches!(
            RosterStore::load("10.0.0.1", "\"10.0.0.2"),
            Err(RosterError::InvalidLine { .. })
        ));
    }

    #[test]
    fn test_multiple_coordinators_rejected() {
        let err = RosterStore::load("10.0.0.1\n10.0.0.9", "10.0.0.2").unwrap_err();
        assert!(matches!(err, RosterError::NotSingle { found: 2, .. }));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let err = RosterStore::load("10.0.0.1", "10.0.0.2\n10.0.0.1").unwrap_err();
        assert!(matches!(err, RosterError::DuplicateAddress { .. }));
        assert!(err.to_string().starts_with("malformed roster"));
    }

    #[test]
    fn test_select_keeps_original_ranks() {
        let roster = RosterStore::load("10.0.0.1", "10.0.0.2\n10.0.0.3\n10.0.0.4").unwrap();
        let subset = roster.select(&[1, 3]);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset[0].rank, 1);
        assert_eq!(subset[1].address, "10.0.0.4");
    }

    #[test]
    fn test_is_hostname() {
        assert!(is_hostname("localhost"));
        assert!(is_hostname("node-1.cluster.local"));
        assert!(!is_hostname("-bad.example"));
        assert!(!is_hostname("bad_host"));
        assert!(!is_hostname("a b"));
    }
}
