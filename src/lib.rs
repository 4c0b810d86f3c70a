//! `dlg-cluster` bootstraps a DALiuGE graph-execution cluster inside an HPC
//! allocation. Launched once per rank by `mpirun` or `srun`, it derives the
//! rank's role from its position in the allocation, starts the right DALiuGE
//! manager as a subprocess, wires the managers to each other, submits the
//! physical graph and supervises execution until the pipeline finishes or the
//! allocation is torn down.
//!
//! ## Example
//! The binary in `src/bin` is a thin wrapper around this sequence:
//!
//! ```ignore
//! let args = dlg_cluster::new_app("dlg-cluster").get_matches();
//! let config = Configuration::from_args(&args)?;
//! let topology = ClusterTopology::discover(&config)?;
//! let (_shutdown, interrupt) = tokio::sync::watch::channel(false);
//! ExecutionCoordinator::new(config, topology, Timing::default(), interrupt)?
//!     .run()
//!     .await?;
//! ```
//!
//! ## Roles
//! With a single data island, rank 0 owns the island manager, rank 1 becomes
//! a monitor proxy when a monitor host was requested, and every other rank
//! hosts a node manager. With multiple islands, rank 0 runs the master
//! manager, ranks 1 through the island count run island managers over node
//! lists received from rank 0, and the rest host node managers. The exact
//! rules live in [`cluster::Role`].

// Libraries used in this file.
use clap::{self, App, Arg};

// Private submodules
mod configuration;

// Public submodules
pub mod cluster;
pub mod errors;
pub mod graph;
pub mod health;
pub mod manager;
pub mod monitor;
pub mod net;

// Public exports
pub use cluster::ExecutionCoordinator;
pub use configuration::{CannedApp, Configuration, RemoteMechanism, Timing};
pub use errors::ClusterError;

/// Defines command line arguments for launching one rank of a cluster.
pub fn new_app(name: &str) -> clap::App {
    App::new(name)
        .arg(
            Arg::with_name("log-dir")
                .short("l")
                .long("log-dir")
                .takes_value(true)
                .required(true)
                .help("Log directory (required)"),
        )
        .arg(
            Arg::with_name("monitor-host")
                .short("m")
                .long("monitor-host")
                .takes_value(true)
                .help("Monitor host IP (optional); reserves one rank for a relay proxy"),
        )
        .arg(
            Arg::with_name("monitor-port")
                .short("o")
                .long("monitor-port")
                .default_value("8081")
                .help("Monitor port"),
        )
        .arg(
            Arg::with_name("verbose-level")
                .short("v")
                .long("verbose-level")
                .default_value("1")
                .help("Verbosity level (1-3) of the manager logging"),
        )
        .arg(
            Arg::with_name("zerorun")
                .short("z")
                .long("zerorun")
                .help("Generate a physical graph that takes no time to run"),
        )
        .arg(
            Arg::with_name("app")
                .long("app")
                .default_value("0")
                .help("The canned app to use in the graph. 1=sleep, 2=sleep_and_copy"),
        )
        .arg(
            Arg::with_name("max-threads")
                .short("t")
                .long("max-threads")
                .default_value("0")
                .help("Max thread pool size used for executing drops. 0 means no pool."),
        )
        .arg(
            Arg::with_name("logical-graph")
                .short("L")
                .long("logical-graph")
                .takes_value(true)
                .help("The filename of the logical graph to deploy"),
        )
        .arg(
            Arg::with_name("physical-graph")
                .short("P")
                .long("physical-graph")
                .takes_value(true)
                .help("The filename of the physical graph (template) to deploy"),
        )
        .arg(
            Arg::with_name("num-islands")
                .short("s")
                .long("num-islands")
                .default_value("1")
                .help("The number of data islands"),
        )
        .arg(
            Arg::with_name("dump")
                .short("d")
                .long("dump")
                .help("Dump session status and graphs to per-rank monitor files"),
        )
        .arg(
            Arg::with_name("loc")
                .short("c")
                .long("loc")
                .default_value("Pawsey")
                .help("Deployment location (e.g. 'Pawsey' or 'Tianhe2')"),
        )
        .arg(
            Arg::with_name("part-algo")
                .long("part-algo")
                .default_value("metis")
                .help("Partition algorithm"),
        )
        .arg(
            Arg::with_name("algo-param")
                .short("A")
                .long("algo-param")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Extra name=value parameters used by the algorithms (algorithm-specific)"),
        )
        .arg(
            Arg::with_name("ssid")
                .long("ssid")
                .default_value("1")
                .help("Session id"),
        )
        .arg(
            Arg::with_name("all-nics")
                .short("u")
                .long("all-nics")
                .help("Listen on all NICs for a node manager"),
        )
        .arg(
            Arg::with_name("check-interfaces")
                .long("check-interfaces")
                .help("Run a small network interfaces test and exit"),
        )
        .arg(
            Arg::with_name("use-ifconfig")
                .long("use-ifconfig")
                .help("Use ifconfig to find a suitable external interface/address for each host"),
        )
        .arg(
            Arg::with_name("check-with-session")
                .short("S")
                .long("check-with-session")
                .help("Check for node managers' availability by creating/destroying a session"),
        )
        .arg(
            Arg::with_name("event-listeners")
                .long("event-listeners")
                .default_value("")
                .help("A colon-separated list of event listener classes to be used"),
        )
        .arg(
            Arg::with_name("sleep-after-execution")
                .long("sleep-after-execution")
                .default_value("0")
                .help("Sleep time interval (in seconds) after graph execution finished"),
        )
        .arg(
            Arg::with_name("pg-modifiers")
                .long("pg-modifiers")
                .takes_value(true)
                .help(
                    "A colon-separated list of modifiers applied to the graph before \
                     submission. Each specification is in the form of \
                     <name>[,[arg1=]val1][,[arg2=]val2]...",
                ),
        )
        .arg(
            Arg::with_name("remote-mechanism")
                .short("r")
                .long("remote-mechanism")
                .possible_values(&["mpi", "slurm"])
                .default_value("mpi")
                .help("The mechanism used to coordinate the processes of this run"),
        )
}
