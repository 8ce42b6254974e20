use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};

use super::RpcError;
use crate::generation::Generation;
use crate::status::SpyStatus;

/// Upper bound on a single frame; anything larger is treated as garbage.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Return address a client hands to an enforcer, tagged with the numeric id
/// of the client-side layer that owns the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub client_tag: u32,
}

impl ClientAddr {
    pub fn new(socket: SocketAddr, client_tag: u32) -> Self {
        Self {
            ip: socket.ip(),
            port: socket.port(),
            client_tag,
        }
    }

    pub fn with_tag(&self, client_tag: u32) -> Self {
        Self { client_tag, ..*self }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Identity string the enforcer keys its client records by.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.ip, self.port, self.client_tag)
    }
}

/// A monitored target together with the generation the sender believes in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub name: String,
    pub generation: Generation,
}

impl TargetRef {
    pub fn new(name: impl Into<String>, generation: Generation) -> Self {
        Self {
            name: name.into(),
            generation,
        }
    }
}

/// Client to enforcer calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SpyRequest {
    Null,
    Register {
        target: TargetRef,
        client: ClientAddr,
        lethal: bool,
        /// Requested Up period; negative means no Up notifications.
        up_interval_ms: i64,
    },
    Cancel {
        target: TargetRef,
        client: ClientAddr,
    },
    Kill {
        target: TargetRef,
        client: ClientAddr,
    },
    GetGeneration {
        target: TargetRef,
        client: ClientAddr,
    },
}

impl SpyRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SpyRequest::Null => "null",
            SpyRequest::Register { .. } => "register",
            SpyRequest::Cancel { .. } => "cancel",
            SpyRequest::Kill { .. } => "kill",
            SpyRequest::GetGeneration { .. } => "get_generation",
        }
    }
}

/// Enforcer reply to every [`SpyRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpyReply {
    pub status: SpyStatus,
    pub target: TargetRef,
}

/// Enforcer to client calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Heartbeat.
    Null,
    Up {
        target: TargetRef,
        client_tag: u32,
    },
    Down {
        target: TargetRef,
        layer_status: u32,
        killed: bool,
        would_kill: bool,
        client_tag: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    Ack,
}

/// Write a length-prefixed JSON message to a stream.
///
/// Format: 4-byte big-endian length prefix + JSON data
pub fn write_message<T: Serialize, W: Write>(stream: &mut W, message: &T) -> Result<(), RpcError> {
    let json = serde_json::to_vec(message)?;
    if json.len() > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge { len: json.len() });
    }
    let len = json.len() as u32;

    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&json)?;
    stream.flush()?;

    Ok(())
}

/// Read a length-prefixed JSON message from a stream.
pub fn read_message<T: for<'de> Deserialize<'de>, R: Read>(stream: &mut R) -> Result<T, RpcError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge { len });
    }

    let mut json_bytes = vec![0u8; len];
    stream.read_exact(&mut json_bytes)?;

    Ok(serde_json::from_slice(&json_bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    fn addr() -> ClientAddr {
        ClientAddr {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            port: 4100,
            client_tag: 7,
        }
    }

    #[test]
    fn test_client_addr_id() {
        assert_eq!(addr().id(), "10.0.0.5:4100:7");
        assert_eq!(addr().with_tag(9).id(), "10.0.0.5:4100:9");
    }

    #[test]
    fn test_write_and_read_register() {
        let mut buffer = Vec::new();
        let request = SpyRequest::Register {
            target: TargetRef::new("app", Generation::new(vec![1, 0])),
            client: addr(),
            lethal: true,
            up_interval_ms: 5000,
        };

        write_message(&mut buffer, &request).expect("Failed to write message");

        let mut cursor = Cursor::new(buffer);
        let decoded: SpyRequest = read_message(&mut cursor).expect("Failed to read message");

        match decoded {
            SpyRequest::Register {
                target,
                client,
                lethal,
                up_interval_ms,
            } => {
                assert_eq!(target.name, "app");
                assert_eq!(target.generation, Generation::new(vec![1, 0]));
                assert_eq!(client, addr());
                assert!(lethal);
                assert_eq!(up_interval_ms, 5000);
            }
            other => panic!("Expected Register request, got {other:?}"),
        }
    }

    #[test]
    fn test_read_message_too_large() {
        let mut buffer = Vec::new();
        let len: u32 = (MAX_FRAME_BYTES as u32) + 1;
        buffer.extend_from_slice(&len.to_be_bytes());

        let mut cursor = Cursor::new(buffer);
        let result: Result<SpyRequest, RpcError> = read_message(&mut cursor);

        assert!(matches!(result, Err(RpcError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_read_truncated_frame_is_io_error() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_be_bytes());
        buffer.extend_from_slice(b"{\"Nu");

        let mut cursor = Cursor::new(buffer);
        let result: Result<ClientRequest, RpcError> = read_message(&mut cursor);

        assert!(matches!(result, Err(RpcError::Io(_))));
    }
}
