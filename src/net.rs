//! Low-level network helpers: TCP reachability probing and discovery of the
//! address this process should advertise to its peers.

use std::{
    io,
    net::UdpSocket,
    process::Command,
    time::Duration,
};

use tokio::{net::TcpStream, time::Instant};

use crate::errors::ClusterError;

/// Pause between connection attempts while a probed port is still closed.
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Checks whether `host`:`port` accepts TCP connections within `timeout`.
///
/// The check simply opens a connection and closes it again. A refused
/// connection is retried after a short pause for as long as the timeout
/// budget lasts, since the service may still be binding its port. A `timeout`
/// of `None` waits without bound.
pub async fn port_is_open(host: &str, port: u16, timeout: Option<Duration>) -> bool {
    let address = format!("{}:{}", host, port);
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let attempt_budget = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                Some(deadline - now)
            }
            None => None,
        };

        let attempt = match attempt_budget {
            Some(budget) => match tokio::time::timeout(budget, TcpStream::connect(&address)).await
            {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(
                        "Timed out while trying to connect to {} with timeout of {:?}",
                        address,
                        timeout,
                    );
                    return false;
                }
            },
            None => TcpStream::connect(&address).await,
        };

        match attempt {
            Ok(_stream) => return true,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                // The port is closed; keep trying until the budget runs out.
                tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
            }
            Err(e) => {
                tracing::debug!("Connection to {} failed: {}", address, e);
                return false;
            }
        }
    }
}

/// Discovers the local address by parsing `ifconfig` output.
///
/// This is brittle, but matches the known interface layout of the supported
/// deployment sites: the usable address sits on a fixed line of the output.
pub fn ip_via_ifconfig(loc: &str) -> Result<String, ClusterError> {
    let line_index = ifconfig_line_for(loc)?;
    let output = Command::new("ifconfig").output().map_err(|e| {
        ClusterError::Configuration(format!("failed to run ifconfig: {}", e))
    })?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    match parse_ifconfig_address(&stdout, line_index) {
        Some(address) => Ok(address),
        None => {
            tracing::warn!("Failed to obtain an IP address from {:?}", stdout);
            Err(ClusterError::Configuration(format!(
                "could not parse an address for site {} from the ifconfig output",
                loc,
            )))
        }
    }
}

/// Maps a deployment site to the `ifconfig` output line carrying its address.
pub(crate) fn ifconfig_line_for(loc: &str) -> Result<usize, ClusterError> {
    match loc {
        "Pawsey" => Ok(1),   // e.g. 10.128.0.98
        "Tianhe2" => Ok(18), // e.g. 12.6.2.134
        other => Err(ClusterError::Configuration(format!(
            "unknown deployment location: {}",
            other,
        ))),
    }
}

fn parse_ifconfig_address(output: &str, line_index: usize) -> Option<String> {
    let token = output.lines().nth(line_index)?.split_whitespace().nth(1)?;
    // Both the "inet addr:10.0.0.1" and the "inet 10.0.0.1" output formats
    // place the address in the second token.
    let address = match token.find(':') {
        Some(at) => &token[at + 1..],
        None => token,
    };
    if address.is_empty() {
        None
    } else {
        Some(address.to_string())
    }
}

/// Discovers the local address by reading the source address of a UDP socket
/// "connected" to a public address. No packets are sent.
pub fn ip_via_probe() -> Result<String, ClusterError> {
    let probe = || -> io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().map_err(|e| {
        ClusterError::Configuration(format!("could not discover the local address: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_port_is_open_on_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_is_open("127.0.0.1", port, Some(Duration::from_secs(5))).await);
    }

    #[tokio::test]
    async fn test_port_is_open_gives_up_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!port_is_open("127.0.0.1", port, Some(Duration::from_millis(300))).await);
    }

    #[test]
    fn test_ifconfig_line_for_rejects_unknown_site() {
        assert!(ifconfig_line_for("Pawsey").is_ok());
        assert!(ifconfig_line_for("Tianhe2").is_ok());
        assert!(ifconfig_line_for("Narnia").is_err());
    }

    #[test]
    fn test_parse_ifconfig_address_formats() {
        let old_style = "eth0      Link encap:Ethernet\n          inet addr:10.128.0.98  Bcast:...\n";
        assert_eq!(
            parse_ifconfig_address(old_style, 1),
            Some("10.128.0.98".to_string())
        );
        let new_style = "eth0: flags=4163<UP>\n        inet 10.128.0.98  netmask 255.255.0.0\n";
        assert_eq!(
            parse_ifconfig_address(new_style, 1),
            Some("10.128.0.98".to_string())
        );
        assert_eq!(parse_ifconfig_address("only one line", 1), None);
    }
}
