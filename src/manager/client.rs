//! REST client for the drop managers.
//!
//! Only the narrow surface this crate consumes is modelled here; the wire
//! protocol beyond these calls belongs to the manager implementation.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;

use crate::{
    errors::ClusterError,
    graph::PhysicalGraph,
    manager::{Session, SessionStatus},
};

/// The operations a running drop manager exposes to this crate.
///
/// [`RestManagerClient`] is the production implementation; tests substitute
/// scripted implementations to drive the monitor without a live manager.
#[async_trait]
pub trait ManagerInterface {
    /// Creates a session with the given id.
    async fn create_session(&self, session_id: &str) -> Result<(), ClusterError>;

    /// Destroys the session with the given id.
    async fn destroy_session(&self, session_id: &str) -> Result<(), ClusterError>;

    /// Lists the sessions the manager currently tracks.
    async fn sessions(&self) -> Result<Vec<Session>, ClusterError>;

    /// Retrieves the per-participant status of a session's graph.
    async fn graph_status(
        &self,
        session_id: &str,
    ) -> Result<HashMap<String, SessionStatus>, ClusterError>;

    /// Retrieves the full graph of a session.
    async fn graph(&self, session_id: &str) -> Result<serde_json::Value, ClusterError>;

    /// Appends the drops of `graph` to the session.
    async fn append_graph(
        &self,
        session_id: &str,
        graph: &PhysicalGraph,
    ) -> Result<(), ClusterError>;

    /// Deploys the session, starting the execution of its graph.
    async fn deploy_session(&self, session_id: &str) -> Result<(), ClusterError>;
}

/// A [`ManagerInterface`] implementation speaking to a manager's REST API.
pub struct RestManagerClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestManagerClient {
    /// Creates a client for the manager at `host`:`port`.
    ///
    /// The `timeout` applies to every request issued through the client; a
    /// `None` leaves requests unbounded.
    pub fn new(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self, ClusterError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            base_url: format!("http://{}:{}/api", host, port),
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl ManagerInterface for RestManagerClient {
    async fn create_session(&self, session_id: &str) -> Result<(), ClusterError> {
        self.client
            .post(&format!("{}/sessions", self.base_url))
            .json(&serde_json::json!({ "sessionId": session_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), ClusterError> {
        self.client
            .delete(&format!("{}/sessions/{}", self.base_url, session_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<Session>, ClusterError> {
        let sessions = self
            .client
            .get(&format!("{}/sessions", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(sessions)
    }

    async fn graph_status(
        &self,
        session_id: &str,
    ) -> Result<HashMap<String, SessionStatus>, ClusterError> {
        let status = self
            .client
            .get(&format!(
                "{}/sessions/{}/graph/status",
                self.base_url, session_id
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status)
    }

    async fn graph(&self, session_id: &str) -> Result<serde_json::Value, ClusterError> {
        let graph = self
            .client
            .get(&format!("{}/sessions/{}/graph", self.base_url, session_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(graph)
    }

    async fn append_graph(
        &self,
        session_id: &str,
        graph: &PhysicalGraph,
    ) -> Result<(), ClusterError> {
        self.client
            .post(&format!(
                "{}/sessions/{}/graph/append",
                self.base_url, session_id
            ))
            .json(&graph.drops)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn deploy_session(&self, session_id: &str) -> Result<(), ClusterError> {
        self.client
            .post(&format!("{}/sessions/{}/deploy", self.base_url, session_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Submits `graph` to the manager behind `client` as session `session_id`:
/// creates the session, appends the graph and deploys it.
///
/// Any failure along the way is reported as a
/// [`Submission`](ClusterError::Submission) error; the caller decides whether
/// that is fatal (the detached submission task only logs it).
pub async fn submit_graph<C>(
    client: &C,
    session_id: &str,
    graph: &PhysicalGraph,
) -> Result<(), ClusterError>
where
    C: ManagerInterface,
{
    let submission = async {
        client.create_session(session_id).await?;
        client.append_graph(session_id, graph).await?;
        client.deploy_session(session_id).await
    };
    submission.await.map_err(|e| {
        ClusterError::Submission(format!(
            "could not submit graph {} as session {}: {}",
            graph.pipeline_name, session_id, e,
        ))
    })
}
