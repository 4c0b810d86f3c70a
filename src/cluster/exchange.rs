//! The node-list exchange between the highest manager rank and the island
//! manager ranks.
//!
//! Rank 0 owns the mapped graph and therefore knows which node managers each
//! island supervises; the island ranks need those lists before they can
//! start their managers. The exchange is a one-shot TCP protocol: each
//! island rank connects, identifies itself by rank, and receives exactly the
//! list assigned to it. Messages are bincode frames behind a 4-byte
//! network-endian length prefix.

use std::time::Duration;

use byteorder::{ByteOrder, NetworkEndian, WriteBytesExt};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::{
    cluster::ClusterTopology,
    errors::{ClusterError, CodecError},
};

/// The port rank 0 listens on for island-rank requests.
pub const NODE_LIST_EXCHANGE_PORT: u16 = 8084;

/// Pause between connect attempts while rank 0 is still binding.
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(100);
/// Bounded connect budget for the member side, about 20 seconds.
const CONNECT_ATTEMPTS: u32 = 200;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
enum ExchangeNotification {
    /// An island rank asking for its node list.
    Request { rank: usize },
    /// The node list assigned to the requesting rank.
    Assignment { nodes: Vec<String> },
}

struct ExchangeCodec {
    msg_size: Option<usize>,
}

impl ExchangeCodec {
    fn new() -> Self {
        Self { msg_size: None }
    }

    fn try_read_message(
        &mut self,
        buf: &mut BytesMut,
        msg_size: usize,
    ) -> Result<Option<ExchangeNotification>, CodecError> {
        if buf.len() >= msg_size {
            let msg_bytes = buf.split_to(msg_size);
            self.msg_size = None;
            bincode::deserialize(&msg_bytes)
                .map(Some)
                .map_err(CodecError::from)
        } else {
            Ok(None)
        }
    }

    fn try_read_msg_size(&self, buf: &mut BytesMut) -> Option<usize> {
        if buf.len() >= 4 {
            let msg_size_bytes = buf.split_to(4);
            Some(NetworkEndian::read_u32(&msg_size_bytes) as usize)
        } else {
            None
        }
    }
}

impl Decoder for ExchangeCodec {
    type Item = ExchangeNotification;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, CodecError> {
        if let Some(msg_size) = self.msg_size {
            self.try_read_message(buf, msg_size)
        } else if let Some(msg_size) = self.try_read_msg_size(buf) {
            self.msg_size = Some(msg_size);
            self.try_read_message(buf, msg_size)
        } else {
            // We need more bytes before we can read the message size.
            Ok(None)
        }
    }
}

impl Encoder<ExchangeNotification> for ExchangeCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: ExchangeNotification, buf: &mut BytesMut) -> Result<(), CodecError> {
        let msg_size = bincode::serialized_size(&msg).map_err(CodecError::from)? as u32;
        let mut size_buffer: Vec<u8> = Vec::new();
        size_buffer.write_u32::<NetworkEndian>(msg_size)?;
        buf.extend(size_buffer);
        let serialized_msg = bincode::serialize(&msg).map_err(CodecError::from)?;
        buf.extend(serialized_msg);
        Ok(())
    }
}

/// Rank 0 side: answers each island rank's request with its assigned list,
/// returning once every list in `lists` has been delivered.
pub async fn send_island_node_lists(
    topology: &ClusterTopology,
    port: u16,
    lists: Vec<(usize, Vec<String>)>,
) -> Result<(), ClusterError> {
    let mut pending: std::collections::HashMap<usize, Vec<String>> =
        lists.into_iter().collect();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ClusterError::Exchange(CodecError::from(e)))?;
    tracing::debug!(
        "[Exchange {}] Waiting for {} island ranks on port {}",
        topology.rank,
        pending.len(),
        port,
    );

    while !pending.is_empty() {
        let (stream, address) = listener
            .accept()
            .await
            .map_err(|e| ClusterError::Exchange(CodecError::from(e)))?;
        let mut framed = Framed::new(stream, ExchangeCodec::new());
        match framed.next().await {
            Some(Ok(ExchangeNotification::Request { rank })) => match pending.remove(&rank) {
                Some(nodes) => {
                    tracing::debug!(
                        "[Exchange {}] Sending {} node addresses to rank {}",
                        topology.rank,
                        nodes.len(),
                        rank,
                    );
                    framed
                        .send(ExchangeNotification::Assignment { nodes })
                        .await
                        .map_err(ClusterError::Exchange)?;
                }
                None => {
                    tracing::warn!(
                        "[Exchange {}] Request from rank {} at {} has no pending list",
                        topology.rank,
                        rank,
                        address,
                    );
                }
            },
            Some(Ok(message)) => {
                tracing::warn!(
                    "[Exchange {}] Unexpected message from {}: {:?}",
                    topology.rank,
                    address,
                    message,
                );
            }
            Some(Err(e)) => return Err(ClusterError::Exchange(e)),
            None => {
                tracing::warn!(
                    "[Exchange {}] Connection from {} closed before a request",
                    topology.rank,
                    address,
                );
            }
        }
    }
    Ok(())
}

/// Island-rank side: asks rank 0 for this rank's node list and returns it.
/// Connect attempts are retried while rank 0 is still binding, up to a
/// bounded budget.
pub async fn recv_island_node_list(
    topology: &ClusterTopology,
    port: u16,
) -> Result<Vec<String>, ClusterError> {
    let host = topology.highest_manager_ip().to_string();
    let mut attempts_left = CONNECT_ATTEMPTS;
    let stream = loop {
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => break stream,
            Err(e) => {
                attempts_left -= 1;
                if attempts_left == 0 {
                    return Err(ClusterError::Exchange(CodecError::from(e)));
                }
                tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
            }
        }
    };

    let mut framed = Framed::new(stream, ExchangeCodec::new());
    framed
        .send(ExchangeNotification::Request {
            rank: topology.rank,
        })
        .await
        .map_err(ClusterError::Exchange)?;
    match framed.next().await {
        Some(Ok(ExchangeNotification::Assignment { nodes })) => {
            tracing::info!(
                "[Exchange {}] Received {} node addresses from rank 0",
                topology.rank,
                nodes.len(),
            );
            Ok(nodes)
        }
        Some(Ok(message)) => Err(ClusterError::Exchange(CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("rank 0 answered with an unexpected message: {:?}", message),
        )))),
        Some(Err(e)) => Err(ClusterError::Exchange(e)),
        None => Err(ClusterError::Exchange(CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "rank 0 closed the connection before sending an assignment",
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip() {
        let mut codec = ExchangeCodec::new();
        let mut buf = BytesMut::new();
        let sent = ExchangeNotification::Assignment {
            nodes: vec!["10.0.0.4".to_string(), "10.0.0.5".to_string()],
        };
        codec.encode(sent.clone(), &mut buf).unwrap();
        codec
            .encode(ExchangeNotification::Request { rank: 2 }, &mut buf)
            .unwrap();

        // Both frames decode back out in order, leaving nothing behind.
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sent));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ExchangeNotification::Request { rank: 2 })
        );
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_waits_for_a_full_frame() {
        let mut codec = ExchangeCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(ExchangeNotification::Request { rank: 7 }, &mut buf)
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.extend(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(ExchangeNotification::Request { rank: 7 })
        );
    }
}
