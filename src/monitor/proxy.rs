//! Byte-level relay between a manager behind the cluster firewall and an
//! external monitor host.
//!
//! The bridge dials both sides itself, so no inbound connectivity into the
//! cluster is needed; everything beyond byte forwarding is up to the two
//! endpoints.

use std::{io, time::Duration};

use tokio::net::TcpStream;

use crate::{errors::ClusterError, health};

/// How long one reachability probe of the local manager may take.
const MANAGER_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between relay attempts after the monitor side drops.
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// A unique bridge id derived from the deployment site and the wall clock.
pub fn proxy_id(loc: &str) -> String {
    format!("{}{:.3}", loc, crate::monitor::unix_time())
}

/// Relays bytes between one manager and one monitor endpoint.
pub struct ProxyBridge {
    id: String,
    manager_host: String,
    manager_port: u16,
    monitor_host: String,
    monitor_port: u16,
}

impl ProxyBridge {
    pub fn new(
        id: String,
        manager_host: String,
        manager_port: u16,
        monitor_host: String,
        monitor_port: u16,
    ) -> Self {
        Self {
            id,
            manager_host,
            manager_port,
            monitor_host,
            monitor_port,
        }
    }

    /// Runs the relay until the local manager disappears or the task is
    /// dropped. A lost monitor connection is re-dialed after a pause; a
    /// manager that stops answering ends the bridge with an error.
    pub async fn run(self) -> Result<(), ClusterError> {
        tracing::info!(
            "[Proxy {}] Bridging manager {}:{} to monitor {}:{}",
            self.id,
            self.manager_host,
            self.manager_port,
            self.monitor_host,
            self.monitor_port,
        );
        loop {
            if !health::check_host(
                &self.manager_host,
                self.manager_port,
                Some(MANAGER_VERIFY_TIMEOUT),
                false,
            )
            .await
            {
                return Err(ClusterError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!(
                        "manager at {}:{} stopped answering",
                        self.manager_host, self.manager_port
                    ),
                )));
            }

            let mut manager =
                TcpStream::connect((self.manager_host.as_str(), self.manager_port)).await?;
            let mut monitor =
                match TcpStream::connect((self.monitor_host.as_str(), self.monitor_port)).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(
                            "[Proxy {}] Cannot reach monitor {}:{}: {}; retrying in {:?}",
                            self.id,
                            self.monitor_host,
                            self.monitor_port,
                            e,
                            RECONNECT_PAUSE,
                        );
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                        continue;
                    }
                };

            tracing::info!("[Proxy {}] Relaying traffic", self.id);
            match tokio::io::copy_bidirectional(&mut manager, &mut monitor).await {
                Ok((to_monitor, to_manager)) => {
                    tracing::debug!(
                        "[Proxy {}] Relay closed after {} bytes to the monitor and {} back",
                        self.id,
                        to_monitor,
                        to_manager,
                    );
                }
                Err(e) => {
                    tracing::warn!("[Proxy {}] Relay failed: {}", self.id, e);
                }
            }
            tokio::time::sleep(RECONNECT_PAUSE).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[test]
    fn test_proxy_ids_carry_the_site_prefix() {
        let id = proxy_id("Pawsey");
        assert!(id.starts_with("Pawsey1"), "{}", id);
        assert!(id.contains('.'), "{}", id);
    }

    #[tokio::test]
    async fn test_bridge_relays_bytes_both_ways() {
        // An echoing stand-in for the island manager.
        let manager = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager_port = manager.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = manager.accept().await.unwrap();
            let mut buffer = [0u8; 4];
            socket.read_exact(&mut buffer).await.unwrap();
            socket.write_all(&buffer).await.unwrap();
        });

        let monitor = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let monitor_port = monitor.local_addr().unwrap().port();

        let bridge = ProxyBridge::new(
            "test".to_string(),
            "127.0.0.1".to_string(),
            manager_port,
            "127.0.0.1".to_string(),
            monitor_port,
        );
        let relay = tokio::spawn(bridge.run());

        // The monitor sends a probe and expects the manager's echo back
        // through the bridge.
        let (mut socket, _) = monitor.accept().await.unwrap();
        socket.write_all(b"ping").await.unwrap();
        let mut buffer = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), socket.read_exact(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buffer, b"ping");

        relay.abort();
    }
}
