//! Turns the configured graph input into a mapped, persisted physical graph.
//!
//! Assembly runs only on the highest manager rank: it loads or unrolls the
//! graph, applies the modifier pipeline, probes the candidate node managers
//! and maps every drop onto the islands and the healthy node managers. The
//! mapped graph is persisted to `<log-dir>/pg.json` as an audit record of
//! what was actually submitted.

use std::{collections::HashMap, path::Path};

use crate::{
    configuration::{Configuration, Timing},
    errors::ClusterError,
    graph::{modifiers, partition, pipeline_name_from, DropSpec, PhysicalGraph},
    health,
    manager::NODE_MANAGER_REST_PORT,
};

/// Derives the physical graph the configuration asks for, before any health
/// probing or resource mapping. Returns `None` when no graph was requested.
pub fn derive_graph(
    config: &Configuration,
    num_partitions: usize,
    num_islands: usize,
) -> Result<Option<PhysicalGraph>, ClusterError> {
    let mut graph = if let Some(path) = &config.physical_graph {
        tracing::info!("Loading physical graph from '{}'", path.display());
        PhysicalGraph::load(path)?
    } else if let Some(path) = &config.logical_graph {
        tracing::info!(
            "Unrolling logical graph '{}' into {} partitions",
            path.display(),
            num_partitions,
        );
        let drops =
            unroll_logical_graph(path, &config.session_id, config.zerorun, config.app)?;
        let partitioner = partition::partitioner_for(&config.part_algo)?;
        partitioner.partition(
            &pipeline_name_from(path),
            drops,
            num_partitions,
            num_islands,
            &config.algo_params,
        )?
    } else {
        return Ok(None);
    };

    if let Some(specs) = &config.pg_modifiers {
        let pipeline = modifiers::parse_pipeline(specs)?;
        graph = modifiers::apply_pipeline(graph, &pipeline)?;
    }
    graph.validate()?;
    Ok(Some(graph))
}

/// Reads a logical graph and expands it into the drop list to be
/// partitioned: `num_of_copies` fan-out is unrolled, references are remapped
/// onto the copies, and every oid is namespaced under the session id.
fn unroll_logical_graph(
    path: &Path,
    session_id: &str,
    zerorun: bool,
    app: crate::configuration::CannedApp,
) -> Result<Vec<DropSpec>, ClusterError> {
    let contents = std::fs::read_to_string(path)?;
    let logical: Vec<DropSpec> = serde_json::from_str(&contents).map_err(|e| {
        ClusterError::Configuration(format!(
            "cannot parse graph file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let mut copies: HashMap<String, u64> = HashMap::new();
    for drop in &logical {
        let n = drop
            .extra
            .get("num_of_copies")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        if n > 1 {
            copies.insert(drop.oid.clone(), n);
        }
    }

    // A reference to a copied drop fans out to all of its copies.
    let expand = |reference: &String| -> Vec<String> {
        match copies.get(reference) {
            Some(&n) => (0..n)
                .map(|k| format!("{}_{}_{}", session_id, reference, k))
                .collect(),
            None => vec![format!("{}_{}", session_id, reference)],
        }
    };

    let mut drops = Vec::new();
    for drop in &logical {
        let n = copies.get(&drop.oid).copied().unwrap_or(1);
        for k in 0..n {
            let mut copy = drop.clone();
            copy.extra.remove("num_of_copies");
            copy.oid = if n > 1 {
                format!("{}_{}_{}", session_id, drop.oid, k)
            } else {
                format!("{}_{}", session_id, drop.oid)
            };
            copy.inputs = drop.inputs.iter().flat_map(&expand).collect();
            copy.outputs = drop.outputs.iter().flat_map(&expand).collect();
            if copy.app_type == "app" {
                if let Some(command) = app.command() {
                    copy.command = command.to_string();
                }
                if zerorun {
                    copy.extra
                        .insert("sleep_time".to_string(), serde_json::json!(0));
                }
            }
            drops.push(copy);
        }
    }
    Ok(drops)
}

/// Stamps a concrete host into every drop's `node` and `island` fields.
///
/// `hosts` lists the island manager hosts first, then the healthy node
/// manager hosts; `#<index>` partition tags index into it. Drops without a
/// mapping are spread round-robin by drop index. Fails, rather than
/// silently truncating, when fewer hosts are available than partitions were
/// requested.
pub fn map_resources(
    graph: &mut PhysicalGraph,
    hosts: &[String],
    num_islands: usize,
    requested_partitions: usize,
) -> Result<(), ClusterError> {
    if num_islands == 0 || hosts.len() <= num_islands {
        return Err(ClusterError::Configuration(format!(
            "cannot map pipeline '{}' onto {} hosts with {} islands",
            graph.pipeline_name,
            hosts.len(),
            num_islands
        )));
    }
    if hosts.len() < requested_partitions {
        return Err(ClusterError::Configuration(format!(
            "only {} hosts passed their health checks but the graph was \
             partitioned for {} partitions",
            hosts.len(),
            requested_partitions
        )));
    }

    let node_hosts = &hosts[num_islands..];
    for (index, drop) in graph.drops.iter_mut().enumerate() {
        let node = match drop.node.as_deref() {
            Some(tag) if tag.starts_with('#') => {
                Some(hosts[tagged_index(tag, &drop.oid, hosts.len())?].clone())
            }
            Some(_) => None,
            None => Some(node_hosts[index % node_hosts.len()].clone()),
        };
        if let Some(host) = node {
            drop.node = Some(host);
        }

        let island = match drop.island.as_deref() {
            Some(tag) if tag.starts_with('#') => {
                Some(hosts[tagged_index(tag, &drop.oid, hosts.len())?].clone())
            }
            Some(_) => None,
            None => Some(hosts[index % num_islands].clone()),
        };
        if let Some(host) = island {
            drop.island = Some(host);
        }
    }
    Ok(())
}

fn tagged_index(tag: &str, oid: &str, num_hosts: usize) -> Result<usize, ClusterError> {
    let index: usize = tag[1..].parse().map_err(|_| {
        ClusterError::Configuration(format!(
            "malformed partition tag '{}' on drop '{}'",
            tag, oid
        ))
    })?;
    if index >= num_hosts {
        return Err(ClusterError::Configuration(format!(
            "partition tag '{}' on drop '{}' is out of range for {} mapped hosts",
            tag, oid, num_hosts
        )));
    }
    Ok(index)
}

/// Assembles the graph for this run: derive it, keep only the node managers
/// that answer their health probes, map the drops, and persist the result to
/// `<log-dir>/pg.json`.
pub async fn assemble(
    config: &Configuration,
    node_ips: &[String],
    island_ips: &[String],
    timing: &Timing,
) -> Result<Option<PhysicalGraph>, ClusterError> {
    let num_islands = island_ips.len();
    let requested_partitions = node_ips.len() + num_islands;
    let mut graph = match derive_graph(config, requested_partitions, num_islands)? {
        Some(graph) => graph,
        None => return Ok(None),
    };

    let healthy = health::check_hosts(
        node_ips,
        NODE_MANAGER_REST_PORT,
        Some(timing.master_manager_wait),
        config.check_with_session,
        1,
    )
    .await;

    let mut hosts = island_ips.to_vec();
    hosts.extend(healthy);
    map_resources(&mut graph, &hosts, num_islands, requested_partitions)?;

    let path = config.log_dir.join("pg.json");
    graph.save(&path)?;
    tracing::info!(
        "Physical graph '{}' with {} drops saved to '{}'",
        graph.pipeline_name,
        graph.drops.len(),
        path.display(),
    );
    Ok(Some(graph))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::CannedApp;
    use std::io::Write;

    fn write_graph(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_unroll_expands_copies_and_remaps_references() {
        let file = write_graph(
            r#"[
                {"oid": "split", "app_type": "app", "num_of_copies": 3},
                {"oid": "gather", "app_type": "app", "inputs": ["split"]}
            ]"#,
        );
        let drops = unroll_logical_graph(file.path(), "s1", false, CannedApp::None).unwrap();
        assert_eq!(drops.len(), 4);
        let oids: Vec<_> = drops.iter().map(|d| d.oid.as_str()).collect();
        assert_eq!(oids, vec!["s1_split_0", "s1_split_1", "s1_split_2", "s1_gather"]);
        assert_eq!(
            drops[3].inputs,
            vec!["s1_split_0", "s1_split_1", "s1_split_2"]
        );
        assert!(drops[0].extra.get("num_of_copies").is_none());
    }

    #[test]
    fn test_unroll_applies_canned_app_and_zerorun() {
        let file = write_graph(
            r#"[
                {"oid": "work", "app_type": "app", "command": "real_work"},
                {"oid": "store", "app_type": "data"}
            ]"#,
        );
        let drops = unroll_logical_graph(file.path(), "s1", true, CannedApp::Sleep).unwrap();
        assert_eq!(drops[0].command, "sleep");
        assert_eq!(drops[0].extra["sleep_time"], serde_json::json!(0));
        assert_eq!(drops[1].command, "");
        assert!(drops[1].extra.get("sleep_time").is_none());
    }

    fn tagged_graph() -> PhysicalGraph {
        let mut first = DropSpec::new("a");
        first.node = Some("#1".to_string());
        first.island = Some("#0".to_string());
        let mut second = DropSpec::new("b");
        second.node = Some("#2".to_string());
        second.island = Some("#0".to_string());
        PhysicalGraph {
            pipeline_name: "test".to_string(),
            drops: vec![first, second],
        }
    }

    #[test]
    fn test_map_resources_resolves_partition_tags() {
        let mut graph = tagged_graph();
        let hosts = vec![
            "10.0.0.1".to_string(),
            "10.0.0.2".to_string(),
            "10.0.0.3".to_string(),
        ];
        map_resources(&mut graph, &hosts, 1, 3).unwrap();
        assert_eq!(graph.drops[0].node.as_deref(), Some("10.0.0.2"));
        assert_eq!(graph.drops[1].node.as_deref(), Some("10.0.0.3"));
        assert_eq!(graph.drops[0].island.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_map_resources_round_robins_unmapped_drops() {
        let mut graph = PhysicalGraph {
            pipeline_name: "test".to_string(),
            drops: vec![DropSpec::new("a"), DropSpec::new("b"), DropSpec::new("c")],
        };
        let hosts = vec![
            "island".to_string(),
            "nm1".to_string(),
            "nm2".to_string(),
        ];
        map_resources(&mut graph, &hosts, 1, 3).unwrap();
        let nodes: Vec<_> = graph.drops.iter().map(|d| d.node.as_deref().unwrap()).collect();
        assert_eq!(nodes, vec!["nm1", "nm2", "nm1"]);
        for drop in &graph.drops {
            assert_eq!(drop.island.as_deref(), Some("island"));
        }
    }

    #[test]
    fn test_map_resources_rejects_too_few_hosts() {
        let mut graph = tagged_graph();
        let hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let err = map_resources(&mut graph, &hosts, 1, 3).unwrap_err();
        let message = format!("{}", err);
        assert!(message.contains("2 hosts"), "{}", message);
        assert!(message.contains("3 partitions"), "{}", message);
    }

    #[test]
    fn test_map_resources_rejects_out_of_range_tags() {
        let mut graph = tagged_graph();
        graph.drops[1].node = Some("#9".to_string());
        let hosts = vec![
            "10.0.0.1".to_string(),
            "10.0.0.2".to_string(),
            "10.0.0.3".to_string(),
        ];
        let err = map_resources(&mut graph, &hosts, 1, 3).unwrap_err();
        assert!(format!("{}", err).contains("out of range"));
    }
}
