//! Where this process sits in the batch allocation.
//!
//! The topology is read once at startup from the environment the batch
//! scheduler sets up: rank, cluster size and the rank-ordered node list.
//! Everything downstream (role derivation, manager placement, the node-list
//! exchange) works off this one snapshot.

use std::env;

use crate::{
    configuration::{Configuration, RemoteMechanism},
    errors::ClusterError,
    net,
};

/// One rank of the allocation and the address it is reachable under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNode {
    pub rank: usize,
    pub ip: String,
}

/// The full allocation as seen from this rank.
#[derive(Clone, Debug)]
pub struct ClusterTopology {
    pub rank: usize,
    pub size: usize,
    /// The address this rank announces to its peers.
    pub my_ip: String,
    /// All ranks in rank order; `nodes[rank]` is this process.
    pub nodes: Vec<ClusterNode>,
    pub num_islands: usize,
    pub proxy_enabled: bool,
}

impl ClusterTopology {
    pub fn new(
        rank: usize,
        size: usize,
        my_ip: String,
        node_ips: Vec<String>,
        num_islands: usize,
        proxy_enabled: bool,
    ) -> Result<Self, ClusterError> {
        if size == 0 || rank >= size {
            return Err(ClusterError::Configuration(format!(
                "rank {} does not exist in a cluster of {} ranks",
                rank, size
            )));
        }
        if node_ips.len() != size {
            return Err(ClusterError::Configuration(format!(
                "the node list names {} hosts but the cluster runs {} ranks",
                node_ips.len(),
                size
            )));
        }
        let nodes = node_ips
            .into_iter()
            .enumerate()
            .map(|(rank, ip)| ClusterNode { rank, ip })
            .collect();
        Ok(Self {
            rank,
            size,
            my_ip,
            nodes,
            num_islands,
            proxy_enabled,
        })
    }

    /// Reads the topology from the batch scheduler's environment.
    ///
    /// Under `slurm` the node list comes from `SLURM_JOB_NODELIST` (one task
    /// per node); under `mpi` the launcher is expected to export the
    /// rank-ordered host list as `DLG_CLUSTER_HOSTS`.
    pub fn discover(config: &Configuration) -> Result<Self, ClusterError> {
        let (rank, size, hosts) = match config.remote_mechanism {
            RemoteMechanism::Slurm => {
                let rank = numeric_env_var(&["SLURM_PROCID"])?;
                let size = numeric_env_var(&["SLURM_NTASKS"])?;
                let hosts = expand_hostlist(&env_var(&["SLURM_JOB_NODELIST"])?)?;
                (rank, size, hosts)
            }
            RemoteMechanism::Mpi => {
                let rank = numeric_env_var(&["OMPI_COMM_WORLD_RANK", "PMI_RANK"])?;
                let size = numeric_env_var(&["OMPI_COMM_WORLD_SIZE", "PMI_SIZE"])?;
                let hosts = env_var(&["DLG_CLUSTER_HOSTS"])?
                    .split(',')
                    .map(|host| host.trim().to_string())
                    .filter(|host| !host.is_empty())
                    .collect();
                (rank, size, hosts)
            }
        };

        let my_ip = match discover_ip(config) {
            Ok(ip) => ip,
            Err(e) => {
                let fallback = hosts
                    .get(rank)
                    .cloned()
                    .unwrap_or_else(|| "127.0.0.1".to_string());
                tracing::warn!(
                    "Could not discover the local IP address ({}); falling back \
                     to the node list entry '{}'",
                    e,
                    fallback,
                );
                fallback
            }
        };

        Self::new(
            rank,
            size,
            my_ip,
            hosts,
            config.num_islands,
            config.monitor_host.is_some(),
        )
    }

    /// The ranks that run node managers, per the role layout.
    pub fn node_manager_ips(&self) -> Vec<String> {
        let reserved = if self.num_islands == 1 {
            if self.proxy_enabled {
                2
            } else {
                1
            }
        } else {
            self.num_islands + 1
        };
        self.nodes
            .iter()
            .skip(reserved)
            .map(|node| node.ip.clone())
            .collect()
    }

    /// The ranks that run island managers, per the role layout.
    pub fn island_manager_ips(&self) -> Vec<String> {
        if self.num_islands == 1 {
            self.nodes
                .iter()
                .take(1)
                .map(|node| node.ip.clone())
                .collect()
        } else {
            self.nodes
                .iter()
                .skip(1)
                .take(self.num_islands)
                .map(|node| node.ip.clone())
                .collect()
        }
    }

    /// The address of the highest-level manager (always rank 0).
    pub fn highest_manager_ip(&self) -> &str {
        &self.nodes[0].ip
    }
}

fn discover_ip(config: &Configuration) -> Result<String, ClusterError> {
    if config.use_ifconfig {
        net::ip_via_ifconfig(&config.loc)
    } else {
        net::ip_via_probe()
    }
}

fn env_var(names: &[&str]) -> Result<String, ClusterError> {
    for name in names {
        if let Ok(value) = env::var(name) {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }
    Err(ClusterError::Configuration(format!(
        "none of the environment variables {:?} are set; is this process \
         running under the configured remote mechanism?",
        names
    )))
}

fn numeric_env_var(names: &[&str]) -> Result<usize, ClusterError> {
    let value = env_var(names)?;
    value.parse().map_err(|_| {
        ClusterError::Configuration(format!(
            "cannot parse '{}' from {:?} as a number",
            value, names
        ))
    })
}

/// Expands a slurm hostlist such as `nid[0001-0003,0007],login1` into the
/// individual host names, preserving zero padding.
pub(crate) fn expand_hostlist(spec: &str) -> Result<Vec<String>, ClusterError> {
    let malformed =
        || ClusterError::Configuration(format!("cannot parse the node list '{}'", spec));

    // Split on commas outside brackets.
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, c) in spec.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                segments.push(&spec[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    segments.push(&spec[start..]);

    let mut hosts = Vec::new();
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match (segment.find('['), segment.find(']')) {
            (Some(open), Some(close)) if open < close => {
                let prefix = &segment[..open];
                let suffix = &segment[close + 1..];
                for token in segment[open + 1..close].split(',') {
                    let token = token.trim();
                    let (lo, hi) = match token.find('-') {
                        Some(dash) => (&token[..dash], &token[dash + 1..]),
                        None => (token, token),
                    };
                    let width = lo.len();
                    let lo: u64 = lo.parse().map_err(|_| malformed())?;
                    let hi: u64 = hi.parse().map_err(|_| malformed())?;
                    if hi < lo {
                        return Err(malformed());
                    }
                    for n in lo..=hi {
                        hosts.push(format!(
                            "{}{:0width$}{}",
                            prefix,
                            n,
                            suffix,
                            width = width
                        ));
                    }
                }
            }
            (None, None) => hosts.push(segment.to_string()),
            _ => return Err(malformed()),
        }
    }
    if hosts.is_empty() {
        return Err(malformed());
    }
    Ok(hosts)
}
