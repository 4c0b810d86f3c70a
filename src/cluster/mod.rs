//! Cluster-level orchestration: topology discovery, the node-list exchange
//! between manager ranks, and the per-role execution coordinator.

use std::fmt;

use crate::errors::ClusterError;

// Public submodules
pub mod coordinator;
pub mod exchange;
pub mod topology;

// Public exports
pub use coordinator::ExecutionCoordinator;
pub use topology::{ClusterNode, ClusterTopology};

/// What this rank does for the lifetime of the run.
///
/// Computed exactly once, before any subprocess is started; illegal
/// combinations are rejected here rather than surfacing as dead ranks later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Runs a node manager; all ranks not claimed by a manager role.
    NodeManagerHost,
    /// Rank 0 with a single island: runs the island manager and submits.
    SingleIslandOwner,
    /// Rank 1 when a monitor host is configured: relays to the monitor.
    SingleIslandProxy,
    /// Rank 0 with multiple islands: runs the master manager and submits.
    MultiIslandHighest,
    /// Ranks 1..=num_islands with multiple islands: run island managers.
    MultiIslandMember,
}

impl Role {
    pub fn derive(
        rank: usize,
        size: usize,
        num_islands: usize,
        proxy_requested: bool,
    ) -> Result<Role, ClusterError> {
        if num_islands == 0 {
            return Err(ClusterError::Configuration(
                "at least one data island is required".to_string(),
            ));
        }
        if rank >= size {
            return Err(ClusterError::Configuration(format!(
                "rank {} does not exist in a cluster of {} ranks",
                rank, size
            )));
        }
        if proxy_requested && num_islands > 1 {
            return Err(ClusterError::Configuration(
                "a monitor proxy cannot be combined with multiple data islands".to_string(),
            ));
        }
        if proxy_requested && size < 2 {
            return Err(ClusterError::Configuration(
                "a monitor proxy requires at least two ranks".to_string(),
            ));
        }
        if num_islands > 1 && size < num_islands + 2 {
            return Err(ClusterError::Configuration(format!(
                "a cluster of {} ranks cannot host {} data islands: {} island \
                 managers, one master manager and at least one node manager \
                 are required",
                size, num_islands, num_islands
            )));
        }

        let role = if num_islands == 1 {
            match rank {
                0 => Role::SingleIslandOwner,
                1 if proxy_requested => Role::SingleIslandProxy,
                _ => Role::NodeManagerHost,
            }
        } else {
            match rank {
                0 => Role::MultiIslandHighest,
                r if r <= num_islands => Role::MultiIslandMember,
                _ => Role::NodeManagerHost,
            }
        };
        Ok(role)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::NodeManagerHost => "node manager host",
            Role::SingleIslandOwner => "island owner",
            Role::SingleIslandProxy => "monitor proxy",
            Role::MultiIslandHighest => "master manager host",
            Role::MultiIslandMember => "island manager host",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_island_roles() {
        assert_eq!(Role::derive(0, 4, 1, false).unwrap(), Role::SingleIslandOwner);
        assert_eq!(Role::derive(1, 4, 1, false).unwrap(), Role::NodeManagerHost);
        assert_eq!(Role::derive(3, 4, 1, false).unwrap(), Role::NodeManagerHost);
    }

    #[test]
    fn test_proxy_claims_rank_one() {
        assert_eq!(Role::derive(0, 4, 1, true).unwrap(), Role::SingleIslandOwner);
        assert_eq!(Role::derive(1, 4, 1, true).unwrap(), Role::SingleIslandProxy);
        assert_eq!(Role::derive(2, 4, 1, true).unwrap(), Role::NodeManagerHost);
    }

    #[test]
    fn test_multi_island_roles() {
        assert_eq!(Role::derive(0, 6, 2, false).unwrap(), Role::MultiIslandHighest);
        assert_eq!(Role::derive(1, 6, 2, false).unwrap(), Role::MultiIslandMember);
        assert_eq!(Role::derive(2, 6, 2, false).unwrap(), Role::MultiIslandMember);
        assert_eq!(Role::derive(3, 6, 2, false).unwrap(), Role::NodeManagerHost);
    }

    #[test]
    fn test_illegal_combinations_are_rejected() {
        // Proxy with multiple islands.
        assert!(Role::derive(0, 8, 2, true).is_err());
        // Proxy in a single-rank cluster.
        assert!(Role::derive(0, 1, 1, true).is_err());
        // Too few ranks for the islands requested.
        assert!(Role::derive(0, 3, 2, false).is_err());
        // No islands at all.
        assert!(Role::derive(0, 4, 0, false).is_err());
        // Rank outside the cluster.
        assert!(Role::derive(4, 4, 1, false).is_err());
    }
}
