//! Polling supervision of the sessions running on a manager.
//!
//! The monitor drives a manager's REST surface on a fixed cadence and stops
//! once every session it can see has reached a terminal status. With a dump
//! path configured it also persists two append-only JSON-Lines files next to
//! the rank's logs: `<path>_g.log` holds each session's graph (written once
//! per session) and `<path>_s.log` holds a status snapshot per cycle.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use crate::{errors::ClusterError, manager::ManagerInterface};

// Public submodules
pub mod proxy;

// Public exports
pub use proxy::ProxyBridge;

/// Supervises the sessions of one manager until they all finish.
pub struct ExecutionMonitor<C: ManagerInterface> {
    client: C,
    interval: Duration,
    dump_path: Option<PathBuf>,
    seen: HashSet<String>,
}

impl<C: ManagerInterface> ExecutionMonitor<C> {
    pub fn new(client: C, interval: Duration) -> Self {
        Self {
            client,
            interval,
            dump_path: None,
            seen: HashSet::new(),
        }
    }

    /// Also persist graph and status snapshots under `<path>_g.log` and
    /// `<path>_s.log`.
    pub fn with_dump_path(mut self, path: PathBuf) -> Self {
        self.dump_path = Some(path);
        self
    }

    /// Polls until every visible session is terminal.
    ///
    /// Sessions appearing mid-run are picked up on their first visible
    /// cycle. A snapshot persistence failure aborts the monitor with
    /// [`ClusterError::MonitorIo`]; it is not retried.
    pub async fn run(mut self) -> Result<(), ClusterError> {
        tracing::info!("Monitoring session execution every {:?}", self.interval);
        let dump_path = self.dump_path.take();
        loop {
            let cycle_start = tokio::time::Instant::now();
            let sessions = self.client.sessions().await?;

            if let Some(base) = &dump_path {
                for session in &sessions {
                    if !self.seen.contains(&session.session_id) {
                        let graph = self.client.graph(&session.session_id).await?;
                        let record = serde_json::json!({
                            "ssid": session.session_id,
                            "g": graph,
                        });
                        append_json_line(&suffixed(base, "_g.log"), &record).await?;
                        self.seen.insert(session.session_id.clone());
                    }
                    let statuses = self.client.graph_status(&session.session_id).await?;
                    let record = serde_json::json!({
                        "ssid": session.session_id,
                        "gs": statuses,
                        "ts": unix_time(),
                    });
                    append_json_line(&suffixed(base, "_s.log"), &record).await?;
                }
            }

            if !sessions.is_empty() && sessions.iter().all(|s| s.status.is_terminal()) {
                tracing::info!("All {} sessions finished", sessions.len());
                return Ok(());
            }
            tracing::debug!(
                "{} of {} sessions still running",
                sessions.iter().filter(|s| !s.status.is_terminal()).count(),
                sessions.len(),
            );

            if let Some(pause) = self.interval.checked_sub(cycle_start.elapsed()) {
                tokio::time::sleep(pause).await;
            }
        }
    }
}

/// Polls `sessions()` on the given cadence until every session is terminal.
/// The no-persistence variant; the island owner uses it to decide when its
/// manager can be torn down.
pub async fn monitor_execution_finished<C: ManagerInterface>(
    client: &C,
    interval: Duration,
) -> Result<(), ClusterError> {
    loop {
        let cycle_start = tokio::time::Instant::now();
        let sessions = client.sessions().await?;
        if !sessions.is_empty() && sessions.iter().all(|s| s.status.is_terminal()) {
            tracing::info!("All {} sessions finished", sessions.len());
            return Ok(());
        }
        if let Some(pause) = interval.checked_sub(cycle_start.elapsed()) {
            tokio::time::sleep(pause).await;
        }
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

/// Seconds since the epoch with millisecond precision.
pub(crate) fn unix_time() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_millis() as f64) / 1000.0,
        Err(_) => 0.0,
    }
}

async fn append_json_line(path: &Path, record: &serde_json::Value) -> Result<(), ClusterError> {
    let mut line = serde_json::to_vec(record)
        .map_err(|e| ClusterError::MonitorIo(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(ClusterError::MonitorIo)?;
    file.write_all(&line).await.map_err(ClusterError::MonitorIo)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixed_appends_to_the_file_name() {
        let path = suffixed(Path::new("/tmp/0/monitor"), "_g.log");
        assert_eq!(path, PathBuf::from("/tmp/0/monitor_g.log"));
    }

    #[test]
    fn test_unix_time_has_sub_second_resolution() {
        let first = unix_time();
        assert!(first > 1.5e9, "clock reads {}", first);
        // Fractional part is carried, not truncated.
        assert_eq!((first * 1000.0).round() / 1000.0, first);
    }
}
