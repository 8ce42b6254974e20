//! TCP implementations of the transport seams.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::wire::{read_message, write_message, ClientAddr, ClientReply, ClientRequest, SpyReply, SpyRequest};
use super::RpcError;

/// Pause between blocking retries of a failed call.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// A connection from a client-side layer to the enforcer of that layer.
pub trait EnforcerLink: Send + Sync {
    fn call(&self, request: &SpyRequest) -> Result<SpyReply, RpcError>;

    /// Human readable peer name for logs.
    fn peer(&self) -> String;
}

/// Resolves a layer name to a link to the enforcer running at that layer.
pub trait Connector: Send + Sync {
    fn connect(&self, layer: &str) -> Result<Arc<dyn EnforcerLink>, RpcError>;
}

/// Outbound calls from an enforcer to its clients.
pub trait ClientTransport: Send + Sync {
    fn call(&self, addr: &ClientAddr, request: &ClientRequest) -> Result<(), RpcError>;
}

/// Per-call timeout and blocking retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcPolicy {
    pub timeout: Duration,
    pub attempts: u32,
}

impl Default for RpcPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            attempts: 3,
        }
    }
}

/// One request/reply exchange over a fresh TCP connection.
fn exchange<Req, Resp>(addr: SocketAddr, request: &Req, timeout: Duration) -> Result<Resp, RpcError>
where
    Req: Serialize,
    Resp: for<'de> Deserialize<'de>,
{
    let peer = addr.to_string();
    let map_timeout = |e: RpcError| match e {
        RpcError::Io(io_err)
            if io_err.kind() == io::ErrorKind::WouldBlock
                || io_err.kind() == io::ErrorKind::TimedOut =>
        {
            RpcError::Timeout { peer: peer.clone() }
        }
        other => other,
    };

    let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| map_timeout(e.into()))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    write_message(&mut stream, request).map_err(map_timeout)?;
    read_message(&mut stream).map_err(map_timeout)
}

/// [`EnforcerLink`] over TCP.
#[derive(Debug, Clone)]
pub struct TcpLink {
    addr: SocketAddr,
    policy: RpcPolicy,
}

impl TcpLink {
    pub fn new(addr: SocketAddr, policy: RpcPolicy) -> Self {
        Self { addr, policy }
    }
}

impl EnforcerLink for TcpLink {
    fn call(&self, request: &SpyRequest) -> Result<SpyReply, RpcError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match exchange(self.addr, request, self.policy.timeout) {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < attempts => {
                    debug!(
                        peer = %self.addr,
                        call = request.kind(),
                        attempt,
                        error = %e,
                        "enforcer call failed, retrying"
                    );
                    attempt += 1;
                    thread::sleep(RETRY_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn peer(&self) -> String {
        self.addr.to_string()
    }
}

/// Resolves layer names through static overrides first, then DNS, using a
/// fixed enforcer port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    port: u16,
    hosts: HashMap<String, SocketAddr>,
    policy: RpcPolicy,
}

impl TcpConnector {
    pub fn new(port: u16, hosts: HashMap<String, SocketAddr>, policy: RpcPolicy) -> Self {
        Self { port, hosts, policy }
    }

    fn resolve(&self, layer: &str) -> Result<SocketAddr, RpcError> {
        if let Some(addr) = self.hosts.get(layer) {
            return Ok(*addr);
        }
        let resolve_err = || RpcError::Resolve {
            name: layer.to_string(),
        };
        let addrs: Vec<SocketAddr> = (layer, self.port)
            .to_socket_addrs()
            .map_err(|_| resolve_err())?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(resolve_err)
    }
}

impl Connector for TcpConnector {
    fn connect(&self, layer: &str) -> Result<Arc<dyn EnforcerLink>, RpcError> {
        let addr = self.resolve(layer)?;
        debug!(layer, %addr, "resolved enforcer address");
        Ok(Arc::new(TcpLink::new(addr, self.policy)))
    }
}

/// [`ClientTransport`] over TCP. Enforcer-side retries are explicit in the
/// enforcer, so each call is a single attempt.
#[derive(Debug, Clone)]
pub struct TcpClientTransport {
    timeout: Duration,
}

impl TcpClientTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientTransport for TcpClientTransport {
    fn call(&self, addr: &ClientAddr, request: &ClientRequest) -> Result<(), RpcError> {
        let reply: ClientReply = exchange(addr.socket_addr(), request, self.timeout)?;
        match reply {
            ClientReply::Ack => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_prefers_static_hosts() {
        let mut hosts = HashMap::new();
        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        hosts.insert("hostA".to_string(), addr);
        let connector = TcpConnector::new(22222, hosts, RpcPolicy::default());

        assert_eq!(connector.resolve("hostA").unwrap(), addr);
    }

    #[test]
    fn test_connector_resolves_ip_literals_with_port() {
        let connector = TcpConnector::new(22222, HashMap::new(), RpcPolicy::default());
        let addr = connector.resolve("127.0.0.1").unwrap();
        assert_eq!(addr, "127.0.0.1:22222".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_call_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let link = TcpLink::new(
            addr,
            RpcPolicy {
                timeout: Duration::from_millis(200),
                attempts: 1,
            },
        );
        assert!(link.call(&SpyRequest::Null).is_err());
    }
}
