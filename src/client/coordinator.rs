//! Client coordinator: owns the monitoring tree, serialises every structural
//! change through one worker thread, and receives Up/Down notifications from
//! enforcers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::callback::{CallbackFn, CallbackPool, FalconCallback, UserData};
use super::layer::{LayerNode, TreeContext};
use super::target::MonitorTarget;
use super::watchdog::WatchdogSettings;
use super::{lock, ClientError};
use crate::config::ClientConfig;
use crate::generation::Generation;
use crate::rpc::{
    ClientAddr, ClientReply, ClientRequest, Connector, RpcPolicy, RpcServer, TcpConnector,
};
use crate::status::FalconStatus;

/// Knobs the coordinator needs beyond its transport.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    pub watchdog: WatchdogSettings,
    pub callback_workers: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            watchdog: WatchdogSettings::default(),
            callback_workers: 4,
        }
    }
}

enum Request {
    Start {
        chain: Vec<String>,
        lethal: bool,
        callback: Option<CallbackFn>,
        user_data: Option<UserData>,
        up_interval_secs: i32,
        done: SyncSender<Result<MonitorTarget, ClientError>>,
    },
    Stop {
        chain: Vec<String>,
    },
    Shutdown,
}

struct Inner {
    base: Arc<LayerNode>,
    routes: Mutex<HashMap<u32, Weak<LayerNode>>>,
    next_tag: AtomicU32,
    pool: CallbackPool,
}

impl Inner {
    fn next_tag(&self) -> u32 {
        self.next_tag.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn add_route(&self, node: &Arc<LayerNode>) {
        let mut routes = lock(&self.routes);
        routes.retain(|_, layer| layer.strong_count() > 0);
        routes.insert(node.return_addr().client_tag, Arc::downgrade(node));
    }

    fn route(&self, tag: u32) -> Option<Arc<LayerNode>> {
        lock(&self.routes).get(&tag).and_then(Weak::upgrade)
    }

    /// Walk the chain outermost first, adding one layer per step. The last
    /// step (the application itself) is the leaf and gets the watchdog.
    fn build(
        &self,
        chain: Vec<String>,
        lethal: bool,
        callback: Option<CallbackFn>,
        user_data: Option<UserData>,
        up_interval_secs: i32,
    ) -> Result<MonitorTarget, ClientError> {
        let cb = Arc::new(FalconCallback::new(
            callback,
            chain.clone(),
            user_data,
            true,
            self.pool.clone(),
        ));

        if chain.len() < 2 {
            warn!(chain = ?chain, "a monitoring chain needs at least two layers");
            let layer = chain.first().map_or("", String::as_str);
            cb.invoke(layer, FalconStatus::RegistrationError, 0);
            return Err(ClientError::InvalidChain { len: chain.len() });
        }

        let mut current = Arc::clone(&self.base);
        for (i, layer) in chain.iter().enumerate().rev() {
            let is_leaf = i == 0;
            let addr = self.base.return_addr().with_tag(self.next_tag());
            match current.add_child(layer, lethal, addr, up_interval_secs, is_leaf, Arc::clone(&cb)) {
                Ok(node) => {
                    if !is_leaf {
                        self.add_route(&node);
                    }
                    current = node;
                }
                Err(source) => {
                    warn!(layer = %layer, error = %source, "registration failed");
                    cb.invoke(layer, FalconStatus::RegistrationError, 0);
                    return Err(ClientError::Registration {
                        layer: layer.clone(),
                        source,
                    });
                }
            }
        }

        info!(chain = ?chain, "registered monitoring chain");
        Ok(MonitorTarget::new(cb, Arc::downgrade(&current)))
    }

    /// Find the leaf for `chain` and unwind it without escalating.
    fn stop(&self, chain: &[String]) {
        let mut current = Arc::clone(&self.base);
        for layer in chain.iter().rev() {
            match current.child(layer) {
                Some(next) => current = next,
                None => {
                    debug!(layer = %layer, chain = ?chain, "nothing monitored for chain");
                    return;
                }
            }
        }
        match current.watchdog() {
            Some(watchdog) => {
                info!(chain = ?chain, "stopping monitoring");
                watchdog.cancel();
            }
            None => debug!(chain = ?chain, "chain does not end at a leaf"),
        }
    }

    fn received_up(&self, tag: u32, layer: &str, generation: &Generation) {
        match self.route(tag) {
            Some(node) => node.do_child_up(layer, generation),
            None => debug!(layer, tag, "up for non-present layer"),
        }
    }

    fn received_down(
        &self,
        tag: u32,
        layer: &str,
        generation: &Generation,
        status: FalconStatus,
        remote_status: u32,
    ) {
        match self.route(tag) {
            Some(node) => node.do_child_down(layer, generation, status, remote_status),
            None => debug!(layer, tag, "down for non-present layer"),
        }
    }

    fn handle_notification(&self, request: ClientRequest) -> ClientReply {
        match request {
            ClientRequest::Null => {}
            ClientRequest::Up { target, client_tag } => {
                self.received_up(client_tag, &target.name, &target.generation);
            }
            ClientRequest::Down {
                target,
                layer_status,
                killed,
                would_kill,
                client_tag,
            } => {
                let status = FalconStatus::from_down(killed, would_kill);
                self.received_down(client_tag, &target.name, &target.generation, status, layer_status);
            }
        }
        ClientReply::Ack
    }
}

fn worker_loop(inner: Arc<Inner>, requests: Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::Start {
                chain,
                lethal,
                callback,
                user_data,
                up_interval_secs,
                done,
            } => {
                let result = inner.build(chain, lethal, callback, user_data, up_interval_secs);
                // The caller may have gone away; nothing to do then.
                let _ = done.send(result);
            }
            Request::Stop { chain } => inner.stop(&chain),
            Request::Shutdown => break,
        }
    }
    debug!("coordinator worker exiting");
}

/// Entry point for applications. Construct one per process and share it.
pub struct ClientCoordinator {
    inner: Arc<Inner>,
    requests: Sender<Request>,
    worker: Option<JoinHandle<()>>,
    server: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl ClientCoordinator {
    /// Build a coordinator over `connector`. Notifications for this tree must
    /// be sent to `return_addr` and fed in through [`Self::notify`].
    pub fn new(
        connector: Arc<dyn Connector>,
        return_addr: SocketAddr,
        options: CoordinatorOptions,
    ) -> Result<Self> {
        let context = Arc::new(TreeContext {
            connector,
            watchdog: options.watchdog,
        });
        let inner = Arc::new(Inner {
            base: LayerNode::base(ClientAddr::new(return_addr, 0), context),
            routes: Mutex::new(HashMap::new()),
            next_tag: AtomicU32::new(0),
            pool: CallbackPool::new(options.callback_workers),
        });

        let (requests, receiver) = mpsc::channel();
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("falcon-coordinator".to_string())
            .spawn(move || worker_loop(worker_inner, receiver))
            .context("Failed to spawn coordinator worker")?;

        Ok(Self {
            inner,
            requests,
            worker: Some(worker),
            server: None,
        })
    }

    /// Bind the notification responder and connect to enforcers over TCP.
    pub fn start(config: &ClientConfig) -> Result<Self> {
        let server = RpcServer::bind(&config.listen)?;
        let return_addr = advertised_addr(server.local_addr(), config.advertise_host.as_deref())?;

        let policy = RpcPolicy {
            timeout: Duration::from_secs(config.rpc_timeout_secs),
            attempts: config.rpc_attempts,
        };
        let connector = Arc::new(TcpConnector::new(
            config.enforcer_port,
            config.hosts.clone(),
            policy,
        ));
        let options = CoordinatorOptions {
            watchdog: WatchdogSettings {
                kill_retry: Duration::from_secs(config.kill_retry_secs),
                kill_attempts: config.kill_attempts,
            },
            callback_workers: config.callback_workers,
        };

        let mut coordinator = Self::new(connector, return_addr, options)?;
        let shutdown = server.shutdown_flag();
        let inner = Arc::clone(&coordinator.inner);
        let handle = server.spawn("falcon-notify", move |request: ClientRequest| {
            Some(inner.handle_notification(request))
        })?;
        coordinator.server = Some((shutdown, handle));

        info!(addr = %return_addr, "client coordinator listening");
        Ok(coordinator)
    }

    pub fn return_addr(&self) -> ClientAddr {
        self.inner.base.return_addr()
    }

    pub fn base(&self) -> &Arc<LayerNode> {
        &self.inner.base
    }

    /// Register `chain` (innermost layer first) and block until the tree is
    /// built. On failure the callback has already received a registration
    /// error.
    pub fn start_monitoring(
        &self,
        chain: &[String],
        lethal: bool,
        callback: Option<CallbackFn>,
        user_data: Option<UserData>,
        up_interval_secs: i32,
    ) -> Result<MonitorTarget, ClientError> {
        let (done, completed) = mpsc::sync_channel(1);
        self.requests
            .send(Request::Start {
                chain: chain.to_vec(),
                lethal,
                callback,
                user_data,
                up_interval_secs,
                done,
            })
            .map_err(|_| ClientError::CoordinatorStopped)?;
        completed.recv().map_err(|_| ClientError::CoordinatorStopped)?
    }

    /// `start_monitoring` without a callback; install one later through the
    /// returned target.
    pub fn init(
        &self,
        chain: &[String],
        lethal: bool,
        user_data: Option<UserData>,
        up_interval_secs: i32,
    ) -> Result<MonitorTarget, ClientError> {
        self.start_monitoring(chain, lethal, None, user_data, up_interval_secs)
    }

    /// Ask for `chain` to be unwound. Returns without waiting.
    pub fn stop_monitoring(&self, chain: &[String]) -> Result<(), ClientError> {
        self.requests
            .send(Request::Stop {
                chain: chain.to_vec(),
            })
            .map_err(|_| ClientError::CoordinatorStopped)
    }

    /// Feed an enforcer notification into the tree.
    pub fn notify(&self, request: ClientRequest) -> ClientReply {
        self.inner.handle_notification(request)
    }
}

impl Drop for ClientCoordinator {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some((shutdown, handle)) = self.server.take() {
            shutdown.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
    }
}

/// Address enforcers should call back on.
fn advertised_addr(local: SocketAddr, advertise_host: Option<&str>) -> Result<SocketAddr> {
    let port = local.port();
    if let Some(host) = advertise_host {
        return resolve_ipv4(host, port)
            .with_context(|| format!("Failed to resolve advertise_host {host}"));
    }
    if !local.ip().is_unspecified() {
        return Ok(local);
    }
    let hostname = nix::unistd::gethostname().context("Failed to read hostname")?;
    let hostname = hostname.to_string_lossy().into_owned();
    match resolve_ipv4(&hostname, port) {
        Ok(addr) => Ok(addr),
        Err(e) => {
            warn!(%hostname, error = %e, "hostname does not resolve, advertising loopback");
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        }
    }
}

fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("No IPv4 address for {host}"))
}
