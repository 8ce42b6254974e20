//! RPC plumbing between clients and enforcers.
//!
//! Messages are length-prefixed JSON frames over TCP, one request/reply pair
//! per connection turn. The transport seams are traits so the tree and
//! enforcer logic can be driven by in-memory fakes.

mod server;
mod transport;
mod wire;

use std::io;
use thiserror::Error;

pub use server::RpcServer;
pub use transport::{
    ClientTransport, Connector, EnforcerLink, RpcPolicy, TcpClientTransport, TcpConnector,
    TcpLink,
};
pub use wire::{
    read_message, write_message, ClientAddr, ClientReply, ClientRequest, SpyReply, SpyRequest,
    TargetRef, MAX_FRAME_BYTES,
};

/// Transport failure. Every variant is retryable from the caller's side.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("call to {peer} timed out")]
    Timeout { peer: String },
    #[error("failed to encode or decode message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("message too large: {len} bytes")]
    FrameTooLarge { len: usize },
    #[error("cannot resolve address for layer {name}")]
    Resolve { name: String },
    #[error("unexpected reply from {peer}")]
    Unexpected { peer: String },
}
