//! Concurrent reachability and liveness checks for manager hosts.

use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::{
    manager::{ManagerInterface, RestManagerClient},
    net,
};

/// Upper bound on the number of hosts probed concurrently by [`check_hosts`].
const MAX_PROBE_CONCURRENCY: usize = 50;

/// Checks whether `host`:`port` is up and serving.
///
/// Without session probing this is a plain TCP connect within `timeout` (see
/// [`net::port_is_open`]). With session probing the host is assumed to run a
/// drop manager: a session with a fresh random id is created and destroyed
/// through its REST API, and the check passes only if both calls succeed.
/// This distinguishes "the port is open" from "the manager actually serves".
pub async fn check_host(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
    use_session_probe: bool,
) -> bool {
    if !use_session_probe {
        return net::port_is_open(host, port, timeout).await;
    }

    let probe = async {
        let client = RestManagerClient::new(host, port, timeout)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        client.create_session(&session_id).await?;
        client.destroy_session(&session_id).await
    };
    match probe.await {
        Ok(()) => true,
        Err(error) => {
            tracing::debug!("Session probe against {}:{} failed: {}", host, port, error);
            false
        }
    }
}

/// Checks that the given hosts are all up on `port`, and returns the subset
/// that was found to be up, preserving the order of `ips`.
///
/// Each host gets up to `max_attempts` probe attempts and is included if any
/// of them succeeds; every failed attempt is logged as a warning. The fan-out
/// runs at most `min(50, ips.len())` probes concurrently and the call returns
/// only once every host has either passed or exhausted its attempt budget.
///
/// A single unreachable host never raises; `max_attempts` of zero and a zero
/// port are programmer errors and panic.
pub async fn check_hosts(
    ips: &[String],
    port: u16,
    timeout: Option<Duration>,
    use_session_probe: bool,
    max_attempts: u32,
) -> Vec<String> {
    assert!(max_attempts >= 1, "max_attempts must be at least 1");
    assert!(port != 0, "port must be non-zero");
    if ips.is_empty() {
        return Vec::new();
    }

    let concurrency = ips.len().min(MAX_PROBE_CONCURRENCY);
    let probes = ips.iter().cloned().map(|ip| async move {
        let mut attempts_left = max_attempts;
        while attempts_left > 0 {
            if check_host(&ip, port, timeout, use_session_probe).await {
                tracing::info!("Host {}:{} is running", ip, port);
                return Some(ip);
            }
            tracing::warn!("Failed to contact host {}:{}", ip, port);
            attempts_left -= 1;
        }
        None
    });

    // `buffered` keeps the input order, so the result is an order-preserving
    // subsequence of `ips`.
    let results: Vec<Option<String>> = stream::iter(probes).buffered(concurrency).collect().await;
    results.into_iter().flatten().collect()
}
