//! Single-threaded enforcer event loop behind a threaded RPC listener.
//!
//! Connection threads never touch enforcer state. They forward each request
//! to the loop and wait for its reply; probe reports and finished outbound
//! calls arrive on the same channel, so the core sees one event at a time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};

use super::core::{EnforcerCore, OutboundCall};
use super::generation_log::GenerationLog;
use super::{EnforcerError, EnforcerSettings};
use crate::config::EnforcerConfig;
use crate::probe::{Probe, ProbeEvent, ProbeHandle};
use crate::rpc::{ClientTransport, RpcServer, SpyReply, SpyRequest, TcpClientTransport};

enum LoopEvent {
    Rpc {
        request: SpyRequest,
        reply: SyncSender<SpyReply>,
    },
    Probe(ProbeEvent),
    CallCompleted {
        call: OutboundCall,
        ok: bool,
    },
    Shutdown,
}

/// Asks a running enforcer to stop. Usable from signal handlers.
#[derive(Clone)]
pub struct ShutdownTrigger {
    events: Sender<LoopEvent>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.events.send(LoopEvent::Shutdown);
    }
}

pub struct EnforcerServer {
    local_addr: SocketAddr,
    events: Sender<LoopEvent>,
    event_loop: Option<JoinHandle<Result<(), EnforcerError>>>,
    listener: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl EnforcerServer {
    /// Start an enforcer from configuration, notifying clients over TCP.
    pub fn start(config: &EnforcerConfig, probe: Box<dyn Probe>) -> Result<Self> {
        let transport = Arc::new(TcpClientTransport::new(Duration::from_secs(
            config.rpc_timeout_secs,
        )));
        Self::start_with(config, probe, transport)
    }

    pub fn start_with(
        config: &EnforcerConfig,
        mut probe: Box<dyn Probe>,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<Self> {
        let (events, receiver) = mpsc::channel();

        let sink = events.clone();
        let handle = ProbeHandle::new(move |event| {
            let _ = sink.send(LoopEvent::Probe(event));
        });
        let base_generation = probe
            .init(handle)
            .context("Failed to initialise probe")?
            .unwrap_or_else(|| config.base_generation.clone());

        let log = GenerationLog::open(&config.generation_log)
            .context("Failed to open generation log")?;
        let settings = EnforcerSettings {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_retries: config.heartbeat_retries,
            down_retries: config.down_retries,
        };
        let core = EnforcerCore::new(probe, log, base_generation.clone(), settings);

        let server = RpcServer::bind(&config.listen)?;
        let local_addr = server.local_addr();

        let completions = events.clone();
        let event_loop = thread::Builder::new()
            .name("falcon-enforcer".to_string())
            .spawn(move || run_loop(core, receiver, completions, transport))
            .context("Failed to spawn enforcer loop")?;

        let shutdown = server.shutdown_flag();
        let requests = events.clone();
        let listener = server.spawn("falcon-spy", move |request: SpyRequest| {
            let (reply, response) = mpsc::sync_channel(1);
            requests.send(LoopEvent::Rpc { request, reply }).ok()?;
            response.recv().ok()
        })?;

        info!(addr = %local_addr, generation = %base_generation, "enforcer listening");
        Ok(Self {
            local_addr,
            events,
            event_loop: Some(event_loop),
            listener: Some((shutdown, listener)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            events: self.events.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_trigger().trigger();
    }

    /// Wait for the event loop to finish, then stop accepting connections.
    /// Returns the fatal error that stopped the loop, if any.
    pub fn join(mut self) -> Result<()> {
        self.wait()
    }

    fn wait(&mut self) -> Result<()> {
        let result = match self.event_loop.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result.context("Enforcer stopped on a fatal error"),
                Err(_) => Err(anyhow!("Enforcer loop panicked")),
            },
            None => Ok(()),
        };
        if let Some((shutdown, listener)) = self.listener.take() {
            shutdown.store(true, Ordering::Relaxed);
            let _ = listener.join();
        }
        result
    }
}

impl Drop for EnforcerServer {
    fn drop(&mut self) {
        if self.event_loop.is_some() {
            self.shutdown();
            if let Err(e) = self.wait() {
                warn!(error = %e, "enforcer stopped with error");
            }
        }
    }
}

fn run_loop(
    mut core: EnforcerCore,
    events: Receiver<LoopEvent>,
    completions: Sender<LoopEvent>,
    transport: Arc<dyn ClientTransport>,
) -> Result<(), EnforcerError> {
    let result = loop {
        core.fire_due_timers(Instant::now());
        send_outbox(&mut core, &completions, &transport);

        let event = match core.next_deadline() {
            Some(deadline) => {
                match events.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break Ok(()),
                }
            }
            None => match events.recv() {
                Ok(event) => event,
                Err(_) => break Ok(()),
            },
        };

        let now = Instant::now();
        let step = match event {
            LoopEvent::Rpc { request, reply } => core.dispatch(&request, now).map(|response| {
                // The connection may have gone away.
                let _ = reply.send(response);
            }),
            LoopEvent::Probe(ProbeEvent::Up { target }) => {
                core.observe_up(&target, now);
                Ok(())
            }
            LoopEvent::Probe(ProbeEvent::Down {
                target,
                status,
                killed,
                would_kill,
            }) => core.observe_down(&target, status, killed, would_kill),
            LoopEvent::CallCompleted { call, ok } => {
                core.call_completed(call, ok, now);
                Ok(())
            }
            LoopEvent::Shutdown => break Ok(()),
        };
        if let Err(e) = step {
            error!(error = %e, "fatal enforcer error");
            break Err(e);
        }
    };

    core.shutdown();
    debug!("enforcer loop exiting");
    result
}

/// Send every queued client call on its own thread; outcomes come back as
/// loop events.
fn send_outbox(
    core: &mut EnforcerCore,
    completions: &Sender<LoopEvent>,
    transport: &Arc<dyn ClientTransport>,
) {
    for call in core.drain_outbox() {
        let pending = call.clone();
        let completions_for_call = completions.clone();
        let transport = Arc::clone(transport);
        let spawned = thread::Builder::new()
            .name("falcon-call".to_string())
            .spawn(move || {
                let ok = match transport.call(&call.addr, &call.request) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(client = %call.client, error = %e, "client call failed");
                        false
                    }
                };
                let _ = completions_for_call.send(LoopEvent::CallCompleted { call, ok });
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn client call");
            let _ = completions.send(LoopEvent::CallCompleted {
                call: pending,
                ok: false,
            });
        }
    }
}
