use std::path::{Path, PathBuf};

use dlg_cluster::{
    graph::{self, PhysicalGraph},
    Configuration,
};

fn write_graph(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_logical_graph_unrolls_partitions_and_maps() {
    let dir = tempfile::tempdir().unwrap();
    let logical = r#"[
        {"oid": "split", "app_type": "app", "command": "sleep 5",
         "num_of_copies": 3, "outputs": ["gather"]},
        {"oid": "gather", "app_type": "data", "inputs": ["split"]}
    ]"#;
    let path = write_graph(dir.path(), "pipeline.json", logical);

    let mut config = Configuration::new(dir.path().to_path_buf());
    config.logical_graph = Some(path);
    config.zerorun = true;
    config.session_id = "s1".to_string();

    // Three partitions over one island leaves two node partitions.
    let mut graph = graph::derive_graph(&config, 3, 1).unwrap().unwrap();
    assert_eq!(graph.pipeline_name, "pipeline");
    assert_eq!(graph.drops.len(), 4);

    let split = &graph.drops[0];
    assert_eq!(split.oid, "s1_split_0");
    assert_eq!(split.extra["sleep_time"], serde_json::json!(0));

    let gather = graph.drops.iter().find(|d| d.oid == "s1_gather").unwrap();
    assert_eq!(
        gather.inputs,
        vec![
            "s1_split_0".to_string(),
            "s1_split_1".to_string(),
            "s1_split_2".to_string(),
        ]
    );

    // One island host followed by three node manager hosts.
    let hosts = vec![
        "10.0.0.1".to_string(),
        "10.0.0.2".to_string(),
        "10.0.0.3".to_string(),
        "10.0.0.4".to_string(),
    ];
    graph::map_resources(&mut graph, &hosts, 1, 3).unwrap();
    let nodes: Vec<_> = graph
        .drops
        .iter()
        .map(|d| d.node.as_deref().unwrap())
        .collect();
    assert_eq!(nodes, vec!["10.0.0.2", "10.0.0.2", "10.0.0.3", "10.0.0.3"]);
    for drop in &graph.drops {
        assert_eq!(drop.island.as_deref(), Some("10.0.0.1"));
    }
}

#[test]
fn test_too_few_healthy_hosts_fail_the_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let logical = r#"[
        {"oid": "work", "app_type": "app", "num_of_copies": 4}
    ]"#;
    let path = write_graph(dir.path(), "wide.json", logical);

    let mut config = Configuration::new(dir.path().to_path_buf());
    config.logical_graph = Some(path);

    let mut graph = graph::derive_graph(&config, 4, 1).unwrap().unwrap();
    // Partitioned for three node partitions, but only one node host came up.
    let hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    let error = graph::map_resources(&mut graph, &hosts, 1, 4).unwrap_err();
    let message = error.to_string();
    assert!(message.contains("2 hosts"), "unexpected message: {}", message);
}

#[test]
fn test_graph_modifiers_apply_before_submission() {
    let dir = tempfile::tempdir().unwrap();
    let physical = r#"[
        {"oid": "a", "app_type": "app", "command": "sleep 10", "sleep_time": 10},
        {"oid": "b", "app_type": "data"}
    ]"#;
    let path = write_graph(dir.path(), "pg.json", physical);

    let mut config = Configuration::new(dir.path().to_path_buf());
    config.physical_graph = Some(path);
    config.pg_modifiers = Some("zerorun:prefix_oids,run7".to_string());

    let graph = graph::derive_graph(&config, 2, 1).unwrap().unwrap();
    let first = &graph.drops[0];
    assert_eq!(first.oid, "run7_a");
    assert_eq!(first.extra["sleep_time"], serde_json::json!(0));
    assert_eq!(graph.drops[1].oid, "run7_b");
}

#[test]
fn test_physical_graph_round_trips_through_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let contents = r#"[
        {"oid": "a", "app_type": "data", "outputs": ["b"], "custom_field": 42},
        {"oid": "b", "app_type": "app", "inputs": ["a"]}
    ]"#;
    let source = write_graph(dir.path(), "pg.json", contents);
    let graph = PhysicalGraph::load(&source).unwrap();
    assert_eq!(graph.pipeline_name, "pg");

    let copy_path = dir.path().join("copy.json");
    graph.save(&copy_path).unwrap();
    let copy = PhysicalGraph::load(&copy_path).unwrap();
    assert_eq!(copy.drops.len(), 2);
    // Fields this crate does not model survive the round trip.
    assert_eq!(copy.drops[0].extra["custom_field"], serde_json::json!(42));
}
