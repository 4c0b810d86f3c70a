//! Launches one rank of a DALiuGE cluster.
//!
//! Meant to be started once per allocated node by `mpirun` or `srun`; every
//! instance figures out its own role from the allocation and runs it to
//! completion. The exit code is 0 on success, 1 when the run failed or was
//! interrupted, and 2 when it never got off the ground.

use std::process;

use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::{Handle, Signals};
use tokio::{sync::watch, task::JoinHandle};
use tracing::Level;

use dlg_cluster::{
    cluster::ClusterTopology, net, ClusterError, Configuration, ExecutionCoordinator, Timing,
};

/// The signal plumbing handed back to `main`: the handle to uninstall the
/// handlers, the forwarding task, and the receiver the coordinator watches.
type InterruptChannel = (Handle, JoinHandle<()>, watch::Receiver<bool>);

fn setup_interrupt_channel() -> std::io::Result<InterruptChannel> {
    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    let signals_task = tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            tracing::warn!("Received signal {}; interrupting the run", signal);
            // Every receiver may be gone already if the run just finished.
            let _ = interrupt_tx.send(true);
        }
    });
    Ok((signals_handle, signals_task, interrupt_rx))
}

async fn cleanup_interrupt_channel(signals_handle: Handle, signals_task: JoinHandle<()>) {
    // Uninstall the signal handlers and wait for the forwarding task to stop.
    signals_handle.close();
    let _ = signals_task.await;
}

fn main() {
    process::exit(run());
}

#[tokio::main]
async fn run() -> i32 {
    let args = dlg_cluster::new_app("dlg-cluster").get_matches();

    if args.is_present("check-interfaces") {
        let loc = args.value_of("loc").unwrap_or("Pawsey");
        match net::ip_via_probe() {
            Ok(ip) => println!("From probe: {}", ip),
            Err(e) => println!("From probe: {}", e),
        }
        match net::ip_via_ifconfig(loc) {
            Ok(ip) => println!("From ifconfig: {}", ip),
            Err(e) => println!("From ifconfig: {}", e),
        }
        return 0;
    }

    let config = match Configuration::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };
    let topology = match ClusterTopology::discover(&config) {
        Ok(topology) => topology,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };

    let rank_dir = config.rank_log_dir(topology.rank);
    if let Err(e) = std::fs::create_dir_all(&rank_dir) {
        eprintln!("cannot create log directory '{}': {}", rank_dir.display(), e);
        return 2;
    }

    // Set up the logger.
    let logging_level = match config.verbose_level {
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let display_thread_ids = logging_level >= Level::TRACE;
    let display_target = logging_level >= Level::TRACE;
    let file_appender = tracing_appender::rolling::never(&rank_dir, "start_dlg_cluster.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let subscriber = tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_ids(display_thread_ids)
        .with_target(display_target)
        .with_max_level(logging_level);
    subscriber.init();
    // Flushes buffered logs when dropped.
    let _logger_guard = guard;

    tracing::info!(
        "Starting DALiuGE cluster with {} nodes, rank {}",
        topology.size,
        topology.rank,
    );
    tracing::debug!("Cluster nodes: {:?}", topology.nodes);
    tracing::debug!("Using {} as the local IP where required", topology.my_ip);

    let (signals_handle, signals_task, interrupt) = match setup_interrupt_channel() {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!("Cannot install the signal handlers: {}", e);
            return 2;
        }
    };

    let coordinator =
        match ExecutionCoordinator::new(config, topology, Timing::default(), interrupt) {
            Ok(coordinator) => coordinator,
            Err(e) => {
                tracing::error!("{}", e);
                cleanup_interrupt_channel(signals_handle, signals_task).await;
                return 2;
            }
        };

    let result = coordinator.run().await;
    cleanup_interrupt_channel(signals_handle, signals_task).await;

    match result {
        Ok(()) => 0,
        Err(ClusterError::Interrupted) => {
            tracing::warn!("The run was interrupted before completion");
            1
        }
        Err(e) => {
            tracing::error!("{}", e);
            1
        }
    }
}
