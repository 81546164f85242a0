//! Client wire format: length-prefixed JSON packets.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON-encoded
//! [`Packet`]. The same framing runs over raw TCP and inside WebSocket
//! binary messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClusterError, ClusterResult};
use crate::session::Outbound;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// A route given either by name or by its handshake code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteRef {
    Code(u16),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// First packet a client receives: the route dictionary.
    Handshake { routes: BTreeMap<String, u16> },
    Request {
        id: u64,
        route: RouteRef,
        #[serde(default)]
        data: Vec<u8>,
    },
    Notify {
        route: RouteRef,
        #[serde(default)]
        data: Vec<u8>,
    },
    Response {
        id: u64,
        #[serde(default)]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Push {
        route: String,
        #[serde(default)]
        data: Vec<u8>,
    },
}

impl From<Outbound> for Packet {
    fn from(message: Outbound) -> Self {
        match message {
            Outbound::Response { id, data, error } => Packet::Response {
                id,
                data: data.to_vec(),
                error,
            },
            Outbound::Push { route, data } => Packet::Push {
                route,
                data: data.to_vec(),
            },
        }
    }
}

/// Encode a packet into a complete frame.
pub fn encode(packet: &Packet) -> ClusterResult<Vec<u8>> {
    let body = serde_json::to_vec(packet)
        .map_err(|e| ClusterError::Transport(format!("encode packet: {e}")))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ClusterError::Transport(format!(
            "packet of {} bytes exceeds frame limit",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one packet. Returns `Ok(None)` on a clean end of stream.
pub async fn read_packet<R>(reader: &mut R) -> ClusterResult<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ClusterError::Transport(format!("read frame header: {e}"))),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ClusterError::Transport(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ClusterError::Transport(format!("read frame body: {e}")))?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| ClusterError::Transport(format!("decode packet: {e}")))
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> ClusterResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(packet)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| ClusterError::Transport(format!("write frame: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| ClusterError::Transport(format!("flush frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let sent = Packet::Request {
            id: 4,
            route: RouteRef::Name("room.join".to_string()),
            data: b"{}".to_vec(),
        };
        write_packet(&mut client, &sent).await.unwrap();
        drop(client);

        assert_eq!(read_packet(&mut server).await.unwrap(), Some(sent));
        assert_eq!(read_packet(&mut server).await.unwrap(), None);
    }

    #[test]
    fn route_may_be_a_code() {
        let packet: Packet =
            serde_json::from_str(r#"{"type":"notify","route":3,"data":[1,2]}"#).unwrap();
        assert_eq!(
            packet,
            Packet::Notify {
                route: RouteRef::Code(3),
                data: vec![1, 2],
            }
        );
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = client
                .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
                .await;
        });

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_)));
    }

    #[test]
    fn response_omits_missing_error() {
        let json = serde_json::to_string(&Packet::from(Outbound::Response {
            id: 1,
            data: bytes::Bytes::new(),
            error: None,
        }))
        .unwrap();
        assert_eq!(json, r#"{"type":"response","id":1,"data":[]}"#);
    }
}
