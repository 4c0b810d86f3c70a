//! Launching and tearing down drop manager subprocesses.
//!
//! Every manager started here is wrapped in a [`ManagedProcess`] that is
//! exclusively owned by the coordinator state that created it. Teardown goes
//! through [`terminate_or_kill`], which is idempotent and safe to call on a
//! process that already exited; `kill_on_drop` backstops abnormal unwinds.

use std::{
    env,
    process::ExitStatus,
    time::Duration,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{
    process::{Child, Command},
    time::Instant,
};

use crate::{configuration::Configuration, errors::ClusterError, manager::ManagerRole};

/// Environment variable overriding the name of the manager binary.
const MANAGER_BINARY_VAR: &str = "DLG_MANAGER_BINARY";
/// Default name of the manager binary, resolved through `PATH`.
const DEFAULT_MANAGER_BINARY: &str = "dlg";

fn manager_binary() -> String {
    env::var(MANAGER_BINARY_VAR).unwrap_or_else(|_| DEFAULT_MANAGER_BINARY.to_string())
}

/// A manager subprocess together with the role it was started for.
///
/// The process is torn down exactly once, by whichever coordinator state owns
/// it; the handle is never shared across components.
pub struct ManagedProcess {
    child: Child,
    role: ManagerRole,
    started_at: Instant,
}

impl ManagedProcess {
    /// The role this process was started for.
    pub fn role(&self) -> ManagerRole {
        self.role
    }

    /// The OS pid, while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Returns the exit status if the process has already exited.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
}

fn spawn_manager(role: ManagerRole, args: Vec<String>) -> Result<ManagedProcess, ClusterError> {
    let binary = manager_binary();
    tracing::debug!("Launching the {}: {} {}", role, binary, args.join(" "));
    let child = Command::new(&binary)
        .args(&args)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ClusterError::ManagerLaunch { role, source })?;
    if let Some(pid) = child.id() {
        tracing::info!("The {} process started with pid {}", role, pid);
    }
    Ok(ManagedProcess {
        child,
        role,
        started_at: Instant::now(),
    })
}

fn verbosity_flag(level: u8) -> String {
    let level = level.max(1).min(3) as usize;
    format!("-{}", "v".repeat(level))
}

/// Starts a node manager bound to `bind_host`.
pub fn start_node_manager(
    config: &Configuration,
    log_dir: &std::path::Path,
    bind_host: &str,
) -> Result<ManagedProcess, ClusterError> {
    tracing::info!("Starting the node manager on host {}", bind_host);
    let mut args = vec![
        ManagerRole::Node.subcommand().to_string(),
        "-l".to_string(),
        log_dir.display().to_string(),
        verbosity_flag(config.verbose_level),
        "-H".to_string(),
        bind_host.to_string(),
        "-m".to_string(),
        "1024".to_string(),
        "-t".to_string(),
        config.max_threads.to_string(),
        "--no-dlm".to_string(),
    ];
    if !config.event_listeners.is_empty() {
        args.push("--event-listeners".to_string());
        args.push(config.event_listeners.clone());
    }
    spawn_manager(ManagerRole::Node, args)
}

/// Starts a data island manager supervising the node managers at
/// `member_ips`.
///
/// The caller is responsible for only invoking this once those node managers
/// passed their health probes; the dependency order is not enforced here.
pub fn start_island_manager(
    config: &Configuration,
    log_dir: &std::path::Path,
    member_ips: &[String],
) -> Result<ManagedProcess, ClusterError> {
    tracing::info!(
        "Starting the island manager for node managers {:?}",
        member_ips
    );
    let args = vec![
        ManagerRole::Island.subcommand().to_string(),
        "-l".to_string(),
        log_dir.display().to_string(),
        verbosity_flag(config.verbose_level),
        "-N".to_string(),
        member_ips.join(","),
        "-H".to_string(),
        "0.0.0.0".to_string(),
        "-m".to_string(),
        "2048".to_string(),
    ];
    spawn_manager(ManagerRole::Island, args)
}

/// Starts a master manager overseeing the island managers at `island_ips`.
///
/// The returned handle is meant to be awaited in the foreground as the last
/// action of the top-level process, interrupted only by termination signals.
pub fn start_master_manager(
    config: &Configuration,
    log_dir: &std::path::Path,
    island_ips: &[String],
) -> Result<ManagedProcess, ClusterError> {
    tracing::info!(
        "Starting the master manager for island managers {:?}",
        island_ips
    );
    let args = vec![
        ManagerRole::Master.subcommand().to_string(),
        "-l".to_string(),
        log_dir.display().to_string(),
        "-N".to_string(),
        island_ips.join(","),
        verbosity_flag(config.verbose_level),
        "-H".to_string(),
        "0.0.0.0".to_string(),
        "-m".to_string(),
        "2048".to_string(),
    ];
    spawn_manager(ManagerRole::Master, args)
}

/// Stops `process` gracefully, force-killing it if it ignores the request.
///
/// Sends SIGTERM, waits up to `grace` for the process to exit, and sends
/// SIGKILL if it is still alive afterwards. Idempotent: calling this on a
/// process that already exited is a no-op.
pub async fn terminate_or_kill(
    process: &mut ManagedProcess,
    grace: Duration,
) -> Result<(), ClusterError> {
    let role = process.role;
    if let Some(status) = process.child.try_wait()? {
        tracing::debug!("The {} already exited with {}", role, status);
        return Ok(());
    }

    if let Some(pid) = process.child.id() {
        tracing::info!(
            "Stopping the {} (pid {}) after {:?} of runtime",
            role,
            pid,
            process.started_at.elapsed(),
        );
        // ESRCH means the process went away on its own in the meantime.
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    match tokio::time::timeout(grace, process.child.wait()).await {
        Ok(status) => {
            tracing::info!("The {} exited with {}", role, status?);
        }
        Err(_) => {
            tracing::warn!(
                "The {} did not stop within {:?}; sending SIGKILL",
                role,
                grace,
            );
            process.child.kill().await?;
        }
    }
    Ok(())
}

/// Waits for `process` to exit, checking every `period`, for up to `ceiling`;
/// a process still alive afterwards is torn down via [`terminate_or_kill`]
/// with the given `grace`.
pub async fn wait_or_kill(
    process: &mut ManagedProcess,
    ceiling: Duration,
    period: Duration,
    grace: Duration,
) -> Result<(), ClusterError> {
    let deadline = Instant::now() + ceiling;
    loop {
        if let Some(status) = process.child.try_wait()? {
            tracing::info!("The {} exited with {}", process.role, status);
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(period).await;
    }
    tracing::warn!(
        "The {} did not exit within {:?}; stopping it",
        process.role,
        ceiling,
    );
    terminate_or_kill(process, grace).await
}
