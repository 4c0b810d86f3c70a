use dlg_cluster::cluster::{exchange, ClusterTopology};

mod utils;

/// A four-rank, two-island cluster running entirely on loopback, seen from
/// the given rank.
fn topology(rank: usize) -> ClusterTopology {
    ClusterTopology::new(
        rank,
        4,
        "127.0.0.1".to_string(),
        vec![
            "127.0.0.1".to_string(),
            "127.0.0.1".to_string(),
            "127.0.0.1".to_string(),
            "127.0.0.1".to_string(),
        ],
        2,
        false,
    )
    .unwrap()
}

#[tokio::test]
async fn test_island_ranks_receive_their_assigned_node_lists() {
    let port = utils::get_unique_port();
    let lists = vec![
        (1, vec!["10.0.0.3".to_string(), "10.0.0.4".to_string()]),
        (2, vec!["10.0.0.5".to_string()]),
    ];

    // Rank 0 serves the lists; the receivers retry their connects until it
    // is bound, so no startup coordination is needed.
    let sender = {
        let topology = topology(0);
        let lists = lists.clone();
        tokio::spawn(async move { exchange::send_island_node_lists(&topology, port, lists).await })
    };
    let first = {
        let topology = topology(1);
        tokio::spawn(async move { exchange::recv_island_node_list(&topology, port).await })
    };
    let second = {
        let topology = topology(2);
        tokio::spawn(async move { exchange::recv_island_node_list(&topology, port).await })
    };

    let (sender, first, second) = tokio::join!(sender, first, second);
    sender.unwrap().unwrap();
    assert_eq!(
        first.unwrap().unwrap(),
        vec!["10.0.0.3".to_string(), "10.0.0.4".to_string()]
    );
    assert_eq!(second.unwrap().unwrap(), vec!["10.0.0.5".to_string()]);
}
