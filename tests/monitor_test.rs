use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use dlg_cluster::{
    errors::ClusterError,
    graph::PhysicalGraph,
    manager::{ManagerInterface, Session, SessionStatus},
    monitor::{monitor_execution_finished, ExecutionMonitor},
};

/// Feeds the monitor a scripted sequence of `sessions()` responses; the last
/// response repeats once the script runs out.
struct ScriptedManager {
    script: Mutex<VecDeque<Vec<Session>>>,
}

impl ScriptedManager {
    fn new(cycles: Vec<Vec<Session>>) -> Self {
        Self {
            script: Mutex::new(cycles.into()),
        }
    }
}

#[async_trait]
impl ManagerInterface for ScriptedManager {
    async fn create_session(&self, _session_id: &str) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn destroy_session(&self, _session_id: &str) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<Session>, ClusterError> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            Ok(script.pop_front().unwrap())
        } else {
            script
                .front()
                .cloned()
                .ok_or_else(|| ClusterError::Submission("empty session script".to_string()))
        }
    }

    async fn graph_status(
        &self,
        _session_id: &str,
    ) -> Result<HashMap<String, SessionStatus>, ClusterError> {
        let mut statuses = HashMap::new();
        statuses.insert("node-1".to_string(), SessionStatus::Running);
        Ok(statuses)
    }

    async fn graph(&self, session_id: &str) -> Result<serde_json::Value, ClusterError> {
        Ok(serde_json::json!({ "session": session_id }))
    }

    async fn append_graph(
        &self,
        _session_id: &str,
        _graph: &PhysicalGraph,
    ) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn deploy_session(&self, _session_id: &str) -> Result<(), ClusterError> {
        Ok(())
    }
}

fn session(id: &str, status: SessionStatus) -> Session {
    Session {
        session_id: id.to_string(),
        status,
    }
}

#[tokio::test]
async fn test_monitor_returns_once_every_session_is_terminal() {
    let manager = ScriptedManager::new(vec![
        vec![
            session("s1", SessionStatus::Running),
            session("s2", SessionStatus::Finished),
        ],
        vec![
            session("s1", SessionStatus::Finished),
            session("s2", SessionStatus::Finished),
        ],
    ]);
    tokio::time::timeout(
        Duration::from_secs(5),
        monitor_execution_finished(&manager, Duration::from_millis(10)),
    )
    .await
    .expect("monitor did not finish")
    .unwrap();
}

#[tokio::test]
async fn test_a_failed_session_counts_as_terminal() {
    let manager = ScriptedManager::new(vec![vec![session("s1", SessionStatus::Error)]]);
    tokio::time::timeout(
        Duration::from_secs(5),
        monitor_execution_finished(&manager, Duration::from_millis(10)),
    )
    .await
    .expect("monitor did not finish")
    .unwrap();
}

#[tokio::test]
async fn test_monitor_keeps_waiting_on_a_straggler() {
    let manager = ScriptedManager::new(vec![vec![
        session("s1", SessionStatus::Finished),
        session("s2", SessionStatus::Running),
    ]]);
    let result = tokio::time::timeout(
        Duration::from_millis(300),
        monitor_execution_finished(&manager, Duration::from_millis(10)),
    )
    .await;
    assert!(result.is_err(), "monitor must not finish while a session runs");
}

#[tokio::test]
async fn test_monitor_waits_for_sessions_to_appear() {
    let manager = ScriptedManager::new(vec![vec![]]);
    let result = tokio::time::timeout(
        Duration::from_millis(300),
        monitor_execution_finished(&manager, Duration::from_millis(10)),
    )
    .await;
    assert!(
        result.is_err(),
        "an empty manager must not count as a finished execution"
    );
}

#[tokio::test]
async fn test_dump_writes_graphs_once_and_statuses_every_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("monitor");

    // s2 appears in the third cycle only; s1 is monitored throughout.
    let manager = ScriptedManager::new(vec![
        vec![session("s1", SessionStatus::Running)],
        vec![session("s1", SessionStatus::Running)],
        vec![
            session("s1", SessionStatus::Finished),
            session("s2", SessionStatus::Finished),
        ],
    ]);
    tokio::time::timeout(
        Duration::from_secs(5),
        ExecutionMonitor::new(manager, Duration::from_millis(10))
            .with_dump_path(base)
            .run(),
    )
    .await
    .expect("monitor did not finish")
    .unwrap();

    let graphs = std::fs::read_to_string(dir.path().join("monitor_g.log")).unwrap();
    let graph_lines: Vec<&str> = graphs.lines().collect();
    // One graph record per session, written when it is first seen.
    assert_eq!(graph_lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(graph_lines[0]).unwrap();
    assert_eq!(first["ssid"], "s1");
    assert_eq!(first["g"]["session"], "s1");
    let second: serde_json::Value = serde_json::from_str(graph_lines[1]).unwrap();
    assert_eq!(second["ssid"], "s2");

    let statuses = std::fs::read_to_string(dir.path().join("monitor_s.log")).unwrap();
    let status_lines: Vec<&str> = statuses.lines().collect();
    // One status record per session per cycle: 1 + 1 + 2.
    assert_eq!(status_lines.len(), 4);
    let last: serde_json::Value = serde_json::from_str(status_lines[3]).unwrap();
    assert_eq!(last["ssid"], "s2");
    assert!(last.get("gs").is_some());
    assert!(last["ts"].as_f64().unwrap() > 1.5e9);
}
