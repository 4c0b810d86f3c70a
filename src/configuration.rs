use std::{path::PathBuf, time::Duration};

use crate::{
    errors::ClusterError,
    graph::{modifiers, partition, AlgoParams},
    net,
};

/// The canned application substituted for real work when unrolling a
/// logical graph.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CannedApp {
    /// Keep whatever the logical graph specifies.
    None,
    /// Replace application commands with a plain sleep.
    Sleep,
    /// Replace application commands with a sleep that copies its inputs.
    SleepAndCopy,
}

impl CannedApp {
    /// The command stamped into application drops, if any.
    pub fn command(self) -> Option<&'static str> {
        match self {
            CannedApp::None => None,
            CannedApp::Sleep => Some("sleep"),
            CannedApp::SleepAndCopy => Some("sleep_and_copy"),
        }
    }

    fn from_index(index: u8) -> Result<Self, ClusterError> {
        match index {
            0 => Ok(CannedApp::None),
            1 => Ok(CannedApp::Sleep),
            2 => Ok(CannedApp::SleepAndCopy),
            other => Err(ClusterError::Configuration(format!(
                "invalid canned application index '{}'; expected 0 (none), \
                 1 (sleep) or 2 (sleep-and-copy)",
                other
            ))),
        }
    }
}

/// How the batch scheduler exposes rank, size and the node list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoteMechanism {
    Mpi,
    Slurm,
}

/// Every timing constant of the orchestration, threaded explicitly so tests
/// can shrink them.
#[derive(Clone, Copy, Debug)]
pub struct Timing {
    /// Request timeout against an island manager's REST interface.
    pub island_manager_wait: Duration,
    /// How long managers may take to come up before probing gives up.
    pub master_manager_wait: Duration,
    /// How long the submission task waits for the local manager.
    pub graph_submit_wait: Duration,
    /// Nominal pause between monitor cycles.
    pub monitor_interval: Duration,
    /// How long the proxy rank waits for the island manager port.
    pub proxy_port_wait: Duration,
    /// Grace between SIGTERM and SIGKILL during teardown.
    pub teardown_grace: Duration,
    /// Ceiling on an island member's wait for its manager; effectively
    /// unbounded.
    pub member_wait_ceiling: Duration,
    /// Poll period while an island member waits for its manager.
    pub member_wait_period: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            island_manager_wait: Duration::from_secs(60),
            master_manager_wait: Duration::from_secs(60),
            graph_submit_wait: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(5),
            proxy_port_wait: Duration::from_secs(100),
            teardown_grace: Duration::from_secs(5),
            member_wait_ceiling: Duration::from_secs(100_000_000),
            member_wait_period: Duration::from_secs(5),
        }
    }
}

/// The configuration parameters of one cluster bootstrap run.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Root directory for logs and persisted artifacts.
    pub log_dir: PathBuf,
    /// External monitor host relayed to by the proxy rank, if any.
    pub monitor_host: Option<String>,
    /// Port of the external monitor host.
    pub monitor_port: u16,
    /// Verbosity handed to this process and the managers it spawns (1-3).
    pub verbose_level: u8,
    /// Zero out application sleep times when unrolling.
    pub zerorun: bool,
    /// Canned application substituted when unrolling.
    pub app: CannedApp,
    /// Maximum worker threads per node manager; 0 leaves the choice to it.
    pub max_threads: usize,
    /// Logical graph to unroll and partition.
    pub logical_graph: Option<PathBuf>,
    /// Physical graph to submit as-is.
    pub physical_graph: Option<PathBuf>,
    /// Number of data islands the cluster is split into.
    pub num_islands: usize,
    /// Persist graph and status snapshots while monitoring.
    pub dump: bool,
    /// Deployment site; feeds the ifconfig line heuristic and the proxy id.
    pub loc: String,
    /// Name of the partitioning algorithm.
    pub part_algo: String,
    /// Free-form parameters forwarded to the partitioning algorithm.
    pub algo_params: AlgoParams,
    /// Session id; namespaces the oids of unrolled graphs.
    pub session_id: String,
    /// Bind node managers on all interfaces instead of the discovered IP.
    pub all_nics: bool,
    /// Discover the local IP by parsing ifconfig output instead of probing.
    pub use_ifconfig: bool,
    /// Probe node managers by creating and destroying a session instead of
    /// only checking the port.
    pub check_with_session: bool,
    /// Colon-separated event listener classes handed to node managers.
    pub event_listeners: String,
    /// Pause between execution finishing and island manager teardown.
    pub sleep_after_execution: Duration,
    /// Colon-separated graph modifier pipeline.
    pub pg_modifiers: Option<String>,
    /// How the batch scheduler exposes the cluster topology.
    pub remote_mechanism: RemoteMechanism,
}

impl Configuration {
    /// Creates a configuration with the command line defaults.
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            monitor_host: None,
            monitor_port: crate::manager::DEFAULT_MONITOR_PORT,
            verbose_level: 1,
            zerorun: false,
            app: CannedApp::None,
            max_threads: 0,
            logical_graph: None,
            physical_graph: None,
            num_islands: 1,
            dump: false,
            loc: "Pawsey".to_string(),
            part_algo: "metis".to_string(),
            algo_params: AlgoParams::new(),
            session_id: "1".to_string(),
            all_nics: false,
            use_ifconfig: false,
            check_with_session: false,
            event_listeners: String::new(),
            sleep_after_execution: Duration::from_secs(0),
            pg_modifiers: None,
            remote_mechanism: RemoteMechanism::Mpi,
        }
    }

    /// Creates a configuration from command line arguments, rejecting every
    /// illegal combination before any orchestration starts.
    pub fn from_args(args: &clap::ArgMatches) -> Result<Self, ClusterError> {
        let log_dir = PathBuf::from(required_value(args, "log-dir")?);

        let verbose_level: u8 = parse_value(args, "verbose-level")?;
        let verbose_level = verbose_level.max(1).min(3);

        let monitor_host = args.value_of("monitor-host").map(String::from);
        let monitor_port: u16 = parse_value(args, "monitor-port")?;

        let app = CannedApp::from_index(parse_value(args, "app")?)?;
        let max_threads: usize = parse_value(args, "max-threads")?;

        let logical_graph = args.value_of("logical-graph").map(PathBuf::from);
        let physical_graph = args.value_of("physical-graph").map(PathBuf::from);
        match (&logical_graph, &physical_graph) {
            (None, None) | (Some(_), Some(_)) => {
                return Err(ClusterError::Configuration(
                    "Either a logical graph or physical graph filename must be \
                     specified"
                        .to_string(),
                ));
            }
            _ => {}
        }
        if let Some(path) = logical_graph.as_ref().or_else(|| physical_graph.as_ref()) {
            if !path.exists() {
                return Err(ClusterError::Configuration(format!(
                    "Cannot locate graph file at '{}'",
                    path.display()
                )));
            }
        }

        let num_islands: usize = parse_value(args, "num-islands")?;
        if num_islands == 0 {
            return Err(ClusterError::Configuration(
                "at least one data island is required".to_string(),
            ));
        }
        if monitor_host.is_some() && num_islands > 1 {
            return Err(ClusterError::Configuration(
                "cannot specify a monitor host and more than one data island \
                 at the same time"
                    .to_string(),
            ));
        }

        let loc = required_value(args, "loc")?.to_string();
        let use_ifconfig = args.is_present("use-ifconfig");
        if use_ifconfig {
            // An unknown site only matters when ifconfig parsing is selected.
            net::ifconfig_line_for(&loc)?;
        }

        let part_algo = required_value(args, "part-algo")?.to_string();
        partition::partitioner_for(&part_algo)?;

        let mut algo_params = AlgoParams::new();
        if let Some(values) = args.values_of("algo-param") {
            for value in values {
                match value.find('=') {
                    Some(idx) if idx > 0 => {
                        algo_params
                            .insert(value[..idx].to_string(), value[idx + 1..].to_string());
                    }
                    _ => {
                        return Err(ClusterError::Configuration(format!(
                            "malformed --algo-param '{}'; expected key=value",
                            value
                        )));
                    }
                }
            }
        }

        let pg_modifiers = args.value_of("pg-modifiers").map(String::from);
        if let Some(specs) = &pg_modifiers {
            // Resolve every modifier name now; a typo must not surface after
            // managers have been started.
            modifiers::parse_pipeline(specs)?;
        }

        let sleep_after_execution =
            Duration::from_secs(parse_value(args, "sleep-after-execution")?);

        let remote_mechanism = match required_value(args, "remote-mechanism")? {
            "mpi" => RemoteMechanism::Mpi,
            "slurm" => RemoteMechanism::Slurm,
            other => {
                return Err(ClusterError::Configuration(format!(
                    "unknown remote mechanism '{}'; expected 'mpi' or 'slurm'",
                    other
                )));
            }
        };

        Ok(Self {
            log_dir,
            monitor_host,
            monitor_port,
            verbose_level,
            zerorun: args.is_present("zerorun"),
            app,
            max_threads,
            logical_graph,
            physical_graph,
            num_islands,
            dump: args.is_present("dump"),
            loc,
            part_algo,
            algo_params,
            session_id: required_value(args, "ssid")?.to_string(),
            all_nics: args.is_present("all-nics"),
            use_ifconfig,
            check_with_session: args.is_present("check-with-session"),
            event_listeners: required_value(args, "event-listeners")?.to_string(),
            sleep_after_execution,
            pg_modifiers,
            remote_mechanism,
        })
    }

    /// The per-rank directory logs and snapshots are written under.
    pub fn rank_log_dir(&self, rank: usize) -> PathBuf {
        self.log_dir.join(rank.to_string())
    }
}

fn required_value<'a>(args: &'a clap::ArgMatches, name: &str) -> Result<&'a str, ClusterError> {
    args.value_of(name).ok_or_else(|| {
        ClusterError::Configuration(format!("missing required argument '--{}'", name))
    })
}

fn parse_value<T: std::str::FromStr>(
    args: &clap::ArgMatches,
    name: &str,
) -> Result<T, ClusterError> {
    let value = required_value(args, name)?;
    value.parse().map_err(|_| {
        ClusterError::Configuration(format!("cannot parse --{} value '{}'", name, value))
    })
}
