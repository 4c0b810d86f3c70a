//! Per-role orchestration of one cluster rank.
//!
//! Every rank runs exactly one coordinator for the lifetime of the
//! allocation. The coordinator derives its role once, then follows that
//! role's script: starting managers, exchanging node lists, submitting the
//! graph and supervising execution. Every blocking wait races against the
//! interrupt channel fed by the signal handler, and manager teardown is
//! reachable from every exit path.

use std::{path::PathBuf, time::Duration};

use tokio::sync::{oneshot, watch};

use crate::{
    cluster::{exchange, ClusterTopology, Role},
    configuration::{Configuration, Timing},
    errors::ClusterError,
    graph::{self, PhysicalGraph},
    health,
    manager::{self, supervisor, ManagedProcess, ManagerRole, RestManagerClient},
    monitor::{self, proxy, ExecutionMonitor},
    net,
};

/// Drives one rank from startup to teardown.
pub struct ExecutionCoordinator {
    config: Configuration,
    topology: ClusterTopology,
    timing: Timing,
    role: Role,
    interrupt: watch::Receiver<bool>,
}

impl ExecutionCoordinator {
    /// Derives this rank's role and prepares the coordinator. Illegal
    /// role/cluster combinations are rejected here, before any subprocess
    /// is started anywhere in the cluster.
    pub fn new(
        config: Configuration,
        topology: ClusterTopology,
        timing: Timing,
        interrupt: watch::Receiver<bool>,
    ) -> Result<Self, ClusterError> {
        let role = Role::derive(
            topology.rank,
            topology.size,
            config.num_islands,
            config.monitor_host.is_some(),
        )?;
        Ok(Self {
            config,
            topology,
            timing,
            role,
            interrupt,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn run(self) -> Result<(), ClusterError> {
        tracing::info!(
            "[Coordinator {}] Acting as the {} of a cluster of {} ranks",
            self.topology.rank,
            self.role,
            self.topology.size,
        );
        let mut interrupt = self.interrupt.clone();
        match self.role {
            Role::NodeManagerHost => self.run_node_manager(&mut interrupt).await,
            Role::SingleIslandProxy => self.run_proxy(&mut interrupt).await,
            Role::SingleIslandOwner => self.run_island_owner(&mut interrupt).await,
            Role::MultiIslandHighest => self.run_highest_manager(&mut interrupt).await,
            Role::MultiIslandMember => self.run_island_member(&mut interrupt).await,
        }
    }

    /// Starts the node manager and blocks until it exits or the run is
    /// interrupted.
    async fn run_node_manager(
        &self,
        interrupt: &mut watch::Receiver<bool>,
    ) -> Result<(), ClusterError> {
        let log_dir = self.config.rank_log_dir(self.topology.rank);
        let bind_host = if self.config.all_nics {
            "0.0.0.0".to_string()
        } else {
            self.topology.my_ip.clone()
        };
        let process = supervisor::start_node_manager(&self.config, &log_dir, &bind_host)?;
        self.supervise_to_exit(interrupt, process).await
    }

    /// Waits for the island manager port, then relays it to the external
    /// monitor host.
    async fn run_proxy(&self, interrupt: &mut watch::Receiver<bool>) -> Result<(), ClusterError> {
        let rank = self.topology.rank;
        let manager_host = self.topology.highest_manager_ip().to_string();
        tracing::info!(
            "[Coordinator {}] Waiting up to {:?} for the island manager at {}:{}",
            rank,
            self.timing.proxy_port_wait,
            manager_host,
            manager::ISLAND_MANAGER_REST_PORT,
        );
        let open = tokio::select! {
            open = net::port_is_open(
                &manager_host,
                manager::ISLAND_MANAGER_REST_PORT,
                Some(self.timing.proxy_port_wait),
            ) => open,
            _ = interrupted(interrupt) => return Err(ClusterError::Interrupted),
        };
        if !open {
            tracing::warn!(
                "[Coordinator {}] Could not connect to the island manager; \
                 proxy not started",
                rank,
            );
            return Ok(());
        }

        let monitor_host = self.config.monitor_host.clone().ok_or_else(|| {
            ClusterError::Configuration("the proxy role requires a monitor host".to_string())
        })?;
        let bridge = proxy::ProxyBridge::new(
            proxy::proxy_id(&self.config.loc),
            manager_host,
            manager::ISLAND_MANAGER_REST_PORT,
            monitor_host,
            self.config.monitor_port,
        );
        tokio::select! {
            result = bridge.run() => result,
            _ = interrupted(interrupt) => {
                tracing::warn!("[Coordinator {}] Interrupted; stopping the proxy", rank);
                Err(ClusterError::Interrupted)
            }
        }
    }

    /// Single-island rank 0: assemble, submit in the background, run the
    /// island manager and tear it down once execution finished.
    async fn run_island_owner(
        &self,
        interrupt: &mut watch::Receiver<bool>,
    ) -> Result<(), ClusterError> {
        let rank = self.topology.rank;
        let node_ips = self.topology.node_manager_ips();
        let island_ips = self.topology.island_manager_ips();

        let graph = tokio::select! {
            graph = graph::assemble(&self.config, &node_ips, &island_ips, &self.timing) => graph?,
            _ = interrupted(interrupt) => return Err(ClusterError::Interrupted),
        };

        let submission = graph.map(|graph| {
            let dump_path = if self.config.dump {
                Some(self.config.rank_log_dir(rank).join("monitor"))
            } else {
                None
            };
            self.spawn_submission(ManagerRole::Island, graph, dump_path)
        });

        let result = self.supervise_island_execution(interrupt, &node_ips).await;
        self.drain_submission(submission);
        result
    }

    /// The island-manager part of the owner path: start it, wait for the
    /// pipeline to finish, tear it down.
    async fn supervise_island_execution(
        &self,
        interrupt: &mut watch::Receiver<bool>,
        node_ips: &[String],
    ) -> Result<(), ClusterError> {
        let rank = self.topology.rank;
        let log_dir = self.config.rank_log_dir(rank);
        let mut process = supervisor::start_island_manager(&self.config, &log_dir, node_ips)?;

        let client = RestManagerClient::new(
            "localhost",
            manager::ISLAND_MANAGER_REST_PORT,
            Some(self.timing.island_manager_wait),
        );
        let mut result = match client {
            Ok(client) => tokio::select! {
                result = monitor::monitor_execution_finished(
                    &client,
                    self.timing.monitor_interval,
                ) => result,
                _ = interrupted(interrupt) => {
                    tracing::warn!(
                        "[Coordinator {}] Interrupted while waiting for the \
                         pipeline to finish",
                        rank,
                    );
                    Err(ClusterError::Interrupted)
                }
            },
            Err(e) => Err(e),
        };

        if result.is_ok() && self.config.sleep_after_execution > Duration::from_secs(0) {
            tracing::info!(
                "[Coordinator {}] Sleeping {:?} before stopping the island manager",
                rank,
                self.config.sleep_after_execution,
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.sleep_after_execution) => {}
                _ = interrupted(interrupt) => {
                    result = Err(ClusterError::Interrupted);
                }
            }
        }

        if let Err(e) =
            supervisor::terminate_or_kill(&mut process, self.timing.teardown_grace).await
        {
            tracing::warn!(
                "[Coordinator {}] Teardown of the island manager failed: {}",
                rank,
                e,
            );
        }
        result
    }

    /// Multi-island rank 0: assemble, hand each island rank its node list,
    /// submit in the background and run the master manager in the
    /// foreground.
    async fn run_highest_manager(
        &self,
        interrupt: &mut watch::Receiver<bool>,
    ) -> Result<(), ClusterError> {
        let rank = self.topology.rank;
        let node_ips = self.topology.node_manager_ips();
        let island_ips = self.topology.island_manager_ips();

        let graph = tokio::select! {
            graph = graph::assemble(&self.config, &node_ips, &island_ips, &self.timing) => graph?,
            _ = interrupted(interrupt) => return Err(ClusterError::Interrupted),
        };

        let lists = island_node_lists(graph.as_ref(), &node_ips, &island_ips);
        tokio::select! {
            result = exchange::send_island_node_lists(
                &self.topology,
                exchange::NODE_LIST_EXCHANGE_PORT,
                lists,
            ) => result?,
            _ = interrupted(interrupt) => return Err(ClusterError::Interrupted),
        }

        let up = tokio::select! {
            up = health::check_hosts(
                &island_ips,
                manager::ISLAND_MANAGER_REST_PORT,
                Some(self.timing.master_manager_wait),
                false,
                10,
            ) => up,
            _ = interrupted(interrupt) => return Err(ClusterError::Interrupted),
        };
        if up.len() < island_ips.len() {
            tracing::warn!(
                "[Coordinator {}] Not all island managers were up and running: {}/{}",
                rank,
                up.len(),
                island_ips.len(),
            );
        }

        let submission =
            graph.map(|graph| self.spawn_submission(ManagerRole::Master, graph, None));

        let log_dir = self.config.rank_log_dir(rank);
        let result = match supervisor::start_master_manager(&self.config, &log_dir, &island_ips)
        {
            Ok(process) => self.supervise_to_exit(interrupt, process).await,
            Err(e) => Err(e),
        };
        self.drain_submission(submission);
        result
    }

    /// Island rank in a multi-island cluster: receive the assigned node
    /// list, run an island manager over it and wait it out.
    async fn run_island_member(
        &self,
        interrupt: &mut watch::Receiver<bool>,
    ) -> Result<(), ClusterError> {
        let rank = self.topology.rank;
        let nodes = tokio::select! {
            nodes = exchange::recv_island_node_list(
                &self.topology,
                exchange::NODE_LIST_EXCHANGE_PORT,
            ) => nodes?,
            _ = interrupted(interrupt) => return Err(ClusterError::Interrupted),
        };

        let log_dir = self.config.rank_log_dir(rank);
        let mut process = supervisor::start_island_manager(&self.config, &log_dir, &nodes)?;
        let result = tokio::select! {
            result = supervisor::wait_or_kill(
                &mut process,
                self.timing.member_wait_ceiling,
                self.timing.member_wait_period,
                self.timing.teardown_grace,
            ) => result,
            _ = interrupted(interrupt) => {
                tracing::warn!(
                    "[Coordinator {}] Interrupted; stopping the island manager",
                    rank,
                );
                Err(ClusterError::Interrupted)
            }
        };
        if let Err(e) =
            supervisor::terminate_or_kill(&mut process, self.timing.teardown_grace).await
        {
            tracing::warn!(
                "[Coordinator {}] Teardown of the island manager failed: {}",
                rank,
                e,
            );
        }
        result
    }

    /// Blocks on a foreground manager until it exits or the run is
    /// interrupted, then tears it down. Teardown failures are logged, not
    /// propagated; the supervision outcome wins.
    async fn supervise_to_exit(
        &self,
        interrupt: &mut watch::Receiver<bool>,
        mut process: ManagedProcess,
    ) -> Result<(), ClusterError> {
        let rank = self.topology.rank;
        let role = process.role();
        let result = tokio::select! {
            status = process.wait() => match status {
                Ok(status) => {
                    tracing::info!(
                        "[Coordinator {}] The {} exited with {}",
                        rank, role, status,
                    );
                    Ok(())
                }
                Err(e) => Err(ClusterError::Io(e)),
            },
            _ = interrupted(interrupt) => {
                tracing::warn!(
                    "[Coordinator {}] Interrupted; stopping the {}",
                    rank, role,
                );
                Err(ClusterError::Interrupted)
            }
        };
        if let Err(e) =
            supervisor::terminate_or_kill(&mut process, self.timing.teardown_grace).await
        {
            tracing::warn!(
                "[Coordinator {}] Teardown of the {} failed: {}",
                rank,
                role,
                e,
            );
        }
        result
    }

    /// Launches the one detached submission task of this process. Its
    /// outcome is logged inside the task when it happens and once more from
    /// the returned channel when the coordinator exits.
    fn spawn_submission(
        &self,
        role: ManagerRole,
        graph: PhysicalGraph,
        dump_path: Option<PathBuf>,
    ) -> oneshot::Receiver<Result<(), ClusterError>> {
        let rank = self.topology.rank;
        let session_id = self.config.session_id.clone();
        let gate_wait = self.timing.graph_submit_wait;
        let monitor_interval = self.timing.monitor_interval;
        let client_timeout = self.timing.island_manager_wait;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = submit_and_monitor(
                rank,
                role,
                graph,
                session_id,
                gate_wait,
                monitor_interval,
                client_timeout,
                dump_path,
            )
            .await;
            if let Err(e) = &result {
                tracing::warn!("[Coordinator {}] Graph submission failed: {}", rank, e);
            }
            // The coordinator may already be gone.
            let _ = tx.send(result);
        });
        rx
    }

    /// Reports whatever the submission task delivered by the time the
    /// coordinator exits.
    fn drain_submission(
        &self,
        submission: Option<oneshot::Receiver<Result<(), ClusterError>>>,
    ) {
        let mut receiver = match submission {
            Some(receiver) => receiver,
            None => return,
        };
        let rank = self.topology.rank;
        match receiver.try_recv() {
            Ok(Ok(())) => {
                tracing::info!("[Coordinator {}] Graph submission completed", rank)
            }
            Ok(Err(e)) => {
                tracing::warn!("[Coordinator {}] Graph submission failed: {}", rank, e)
            }
            Err(_) => tracing::warn!(
                "[Coordinator {}] The submission task did not report an outcome \
                 before shutdown",
                rank,
            ),
        }
    }
}

/// Resolves once the interrupt channel has seen a signal, including one
/// registered before this call.
async fn interrupted(interrupt: &mut watch::Receiver<bool>) {
    if *interrupt.borrow_and_update() {
        return;
    }
    loop {
        if interrupt.changed().await.is_err() {
            // The signal task is gone; nothing can interrupt us anymore.
            futures::future::pending::<()>().await;
        }
        if *interrupt.borrow_and_update() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn submit_and_monitor(
    rank: usize,
    role: ManagerRole,
    graph: PhysicalGraph,
    session_id: String,
    gate_wait: Duration,
    monitor_interval: Duration,
    client_timeout: Duration,
    dump_path: Option<PathBuf>,
) -> Result<(), ClusterError> {
    let port = role.rest_port();
    if !health::check_host("localhost", port, Some(gate_wait), false).await {
        tracing::warn!(
            "[Coordinator {}] The {} didn't come up within {:?}",
            rank,
            role,
            gate_wait,
        );
    }
    let client = RestManagerClient::new("localhost", port, Some(client_timeout))?;
    manager::submit_graph(&client, &session_id, &graph).await?;
    match dump_path {
        Some(path) => {
            ExecutionMonitor::new(client, monitor_interval)
                .with_dump_path(path)
                .run()
                .await
        }
        None => Ok(()),
    }
}

/// Which node managers each island rank supervises, keyed by that rank.
///
/// Derived from the mapped graph where possible; islands the graph does not
/// mention fall back to an even contiguous split of the node manager list.
fn island_node_lists(
    graph: Option<&PhysicalGraph>,
    node_ips: &[String],
    island_ips: &[String],
) -> Vec<(usize, Vec<String>)> {
    use std::collections::{BTreeSet, HashMap};

    let mut by_island: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    if let Some(graph) = graph {
        for drop in &graph.drops {
            if let (Some(island), Some(node)) = (&drop.island, &drop.node) {
                by_island
                    .entry(island.as_str())
                    .or_default()
                    .insert(node.as_str());
            }
        }
    }

    let islands = island_ips.len();
    let mut lists = Vec::with_capacity(islands);
    for (index, island_ip) in island_ips.iter().enumerate() {
        let assigned = match by_island.get(island_ip.as_str()) {
            Some(nodes) if !nodes.is_empty() => {
                nodes.iter().map(|node| node.to_string()).collect()
            }
            _ => even_split(node_ips, islands, index),
        };
        lists.push((index + 1, assigned));
    }
    lists
}

/// The `index`-th piece of an even contiguous split of `node_ips` into
/// `islands` pieces; the first pieces absorb the remainder.
fn even_split(node_ips: &[String], islands: usize, index: usize) -> Vec<String> {
    let base = node_ips.len() / islands;
    let remainder = node_ips.len() % islands;
    let start = index * base + index.min(remainder);
    let count = base + if index < remainder { 1 } else { 0 };
    node_ips[start..start + count].to_vec()
}
