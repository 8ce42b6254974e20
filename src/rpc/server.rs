//! Threaded TCP listener shared by enforcers and client notification endpoints.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::wire::{read_message, write_message};
use super::RpcError;

/// Maximum concurrent connections.
const MAX_CONNECTIONS: usize = 100;

/// Idle connections are dropped after this long without a request.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown_flag: Arc<AtomicBool>,
    connection_count: Arc<AtomicUsize>,
}

impl RpcServer {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("Failed to bind TCP listener on {addr}"))?;

        // Non-blocking accept so the shutdown flag is observed.
        listener
            .set_nonblocking(true)
            .context("Failed to set listener to non-blocking")?;
        let local_addr = listener.local_addr().context("Failed to read listener address")?;

        Ok(Self {
            listener,
            local_addr,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            connection_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Setting the returned flag stops the accept loop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Run the accept loop on a background thread.
    pub fn spawn<Req, Resp, H>(self, name: &str, handler: H) -> Result<JoinHandle<()>>
    where
        Req: for<'de> Deserialize<'de> + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(Req) -> Option<Resp> + Send + Sync + 'static,
    {
        let label = name.to_string();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Err(e) = self.serve(handler) {
                    warn!(server = %label, error = %e, "rpc server stopped");
                }
            })
            .context("Failed to spawn rpc server thread")
    }

    /// Accept connections until the shutdown flag is set. Each connection is
    /// served on its own thread; a handler returning `None` closes it.
    pub fn serve<Req, Resp, H>(self, handler: H) -> Result<()>
    where
        Req: for<'de> Deserialize<'de> + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(Req) -> Option<Resp> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);

        while !self.shutdown_flag.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let current = self.connection_count.load(Ordering::Relaxed);
                    if current >= MAX_CONNECTIONS {
                        warn!(%peer, "connection limit reached ({MAX_CONNECTIONS}), rejecting");
                        drop(stream);
                        continue;
                    }
                    self.connection_count.fetch_add(1, Ordering::Relaxed);

                    let handler = Arc::clone(&handler);
                    let shutdown_flag = Arc::clone(&self.shutdown_flag);
                    let connection_count = Arc::clone(&self.connection_count);

                    thread::spawn(move || {
                        let result = handle_connection(stream, shutdown_flag, handler.as_ref());
                        connection_count.fetch_sub(1, Ordering::Relaxed);
                        if let Err(e) = result {
                            debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    return Err(e).context("Accept failed");
                }
            }
        }

        Ok(())
    }
}

fn handle_connection<Req, Resp, H>(
    mut stream: TcpStream,
    shutdown_flag: Arc<AtomicBool>,
    handler: &H,
) -> Result<(), RpcError>
where
    Req: for<'de> Deserialize<'de>,
    Resp: Serialize,
    H: Fn(Req) -> Option<Resp>,
{
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IDLE_TIMEOUT))?;
    stream.set_nodelay(true)?;

    while !shutdown_flag.load(Ordering::Relaxed) {
        let request: Req = match read_message(&mut stream) {
            Ok(request) => request,
            Err(RpcError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match handler(request) {
            Some(reply) => write_message(&mut stream, &reply)?,
            None => return Ok(()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{ClientReply, ClientRequest};

    #[test]
    fn test_serves_requests_until_shutdown() {
        let server = RpcServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_flag();
        let handle = server
            .spawn("test-rpc", |request: ClientRequest| match request {
                ClientRequest::Null => Some(ClientReply::Ack),
                _ => None,
            })
            .unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        write_message(&mut stream, &ClientRequest::Null).unwrap();
        let reply: ClientReply = read_message(&mut stream).unwrap();
        assert_eq!(reply, ClientReply::Ack);

        // Same connection can carry a second request.
        write_message(&mut stream, &ClientRequest::Null).unwrap();
        let reply: ClientReply = read_message(&mut stream).unwrap();
        assert_eq!(reply, ClientReply::Ack);

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
