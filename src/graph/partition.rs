//! Partitioning of unrolled graphs onto numbered partitions.
//!
//! Partitions are stamped as `#<index>` tags in each drop's `node` and
//! `island` fields; indices below the island count denote island managers,
//! the rest node managers. The tags are resolved to concrete hosts by
//! [`map_resources`](super::assembler::map_resources) once the healthy host
//! set is known.

use std::collections::HashMap;

use crate::{
    errors::ClusterError,
    graph::{DropSpec, PhysicalGraph},
};

/// Free-form `key=val` parameters forwarded to the partitioning algorithm.
pub type AlgoParams = HashMap<String, String>;

/// Splits an unrolled drop list into `num_partitions` partitions, of which
/// the first `num_islands` belong to island managers.
pub trait GraphPartitioner: std::fmt::Debug {
    fn partition(
        &self,
        pipeline_name: &str,
        drops: Vec<DropSpec>,
        num_partitions: usize,
        num_islands: usize,
        params: &AlgoParams,
    ) -> Result<PhysicalGraph, ClusterError>;
}

/// Resolves a `--part-algo` name to a partitioner implementation.
pub fn partitioner_for(algo: &str) -> Result<Box<dyn GraphPartitioner>, ClusterError> {
    match algo {
        "metis" | "mysarkar" | "min_num_parts" | "pso" => {
            Ok(Box::new(ContiguousBlockPartitioner))
        }
        other => Err(ClusterError::Configuration(format!(
            "unknown partitioning algorithm '{}'; \
             known algorithms are metis, mysarkar, min_num_parts and pso",
            other
        ))),
    }
}

/// Assigns drops to node partitions in contiguous blocks, in graph order,
/// and spreads the node partitions evenly over the islands.
#[derive(Debug)]
pub struct ContiguousBlockPartitioner;

impl GraphPartitioner for ContiguousBlockPartitioner {
    fn partition(
        &self,
        pipeline_name: &str,
        mut drops: Vec<DropSpec>,
        num_partitions: usize,
        num_islands: usize,
        params: &AlgoParams,
    ) -> Result<PhysicalGraph, ClusterError> {
        if num_islands == 0 {
            return Err(ClusterError::Configuration(
                "cannot partition a graph onto zero islands".to_string(),
            ));
        }
        if num_partitions <= num_islands {
            return Err(ClusterError::Configuration(format!(
                "cannot partition a graph into {} partitions with {} islands: \
                 at least one node partition is required",
                num_partitions, num_islands
            )));
        }
        tracing::debug!(
            "Partitioning {} drops of '{}' into {} partitions on {} islands \
             with parameters {:?}",
            drops.len(),
            pipeline_name,
            num_partitions,
            num_islands,
            params,
        );

        let node_partitions = num_partitions - num_islands;
        // Ceiling division; every node partition below the last gets a full
        // block, the last one picks up the remainder.
        let block = (drops.len() + node_partitions - 1) / node_partitions;
        for (index, drop) in drops.iter_mut().enumerate() {
            let partition = if block == 0 {
                0
            } else {
                (index / block).min(node_partitions - 1)
            };
            let island = partition * num_islands / node_partitions;
            drop.node = Some(format!("#{}", num_islands + partition));
            drop.island = Some(format!("#{}", island));
        }

        Ok(PhysicalGraph {
            pipeline_name: pipeline_name.to_string(),
            drops,
        })
    }
}
