//! Enforcer bookkeeping.
//!
//! The core never blocks and never does I/O apart from the generation log.
//! Calls to clients are queued on an outbox; whoever drives the core sends
//! them and reports each outcome back through [`EnforcerCore::call_completed`].
//! Delayed work (heartbeats, Up eligibility) lives on a timer queue that the
//! driver fires with [`EnforcerCore::fire_due_timers`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::generation_log::GenerationLog;
use super::timers::TimerQueue;
use super::{EnforcerError, EnforcerSettings};
use crate::generation::{GenComparison, Generation};
use crate::probe::Probe;
use crate::rpc::{ClientAddr, ClientRequest, SpyReply, SpyRequest, TargetRef};
use crate::status::SpyStatus;

/// Server-side record of one client endpoint.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub addr: ClientAddr,
    /// Distinguishes this incarnation from earlier records with the same id.
    pub epoch: u64,
    /// Requested Up period per target in milliseconds; negative means none.
    pub up_intervals: HashMap<String, i64>,
    pub added_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    Heartbeat { attempt: u32 },
    Up,
    Down { target: String, attempt: u32 },
}

/// A call the driver must make to a client.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub client: String,
    pub epoch: u64,
    pub addr: ClientAddr,
    pub request: ClientRequest,
    pub kind: CallKind,
}

#[derive(Debug)]
enum Timer {
    Heartbeat {
        client: String,
        epoch: u64,
    },
    UpDue {
        client: String,
        epoch: u64,
        target: String,
    },
}

pub struct EnforcerCore {
    probe: Box<dyn Probe>,
    log: GenerationLog,
    base_generation: Generation,
    settings: EnforcerSettings,
    clients: HashMap<String, ClientRecord>,
    subscribers: HashMap<String, BTreeSet<String>>,
    waiting_for_up: HashMap<String, BTreeSet<String>>,
    lethal: HashMap<String, BTreeSet<String>>,
    timers: TimerQueue<Timer>,
    outbox: VecDeque<OutboundCall>,
    next_epoch: u64,
}

impl EnforcerCore {
    pub fn new(
        probe: Box<dyn Probe>,
        log: GenerationLog,
        base_generation: Generation,
        settings: EnforcerSettings,
    ) -> Self {
        Self {
            probe,
            log,
            base_generation,
            settings,
            clients: HashMap::new(),
            subscribers: HashMap::new(),
            waiting_for_up: HashMap::new(),
            lethal: HashMap::new(),
            timers: TimerQueue::new(),
            outbox: VecDeque::new(),
            next_epoch: 0,
        }
    }

    /// `base_generation` with the target's own counter appended.
    pub fn generation(&self, target: &str) -> Generation {
        self.base_generation.compose(self.log.get(target))
    }

    pub fn base_generation(&self) -> &Generation {
        &self.base_generation
    }

    pub fn is_monitored(&self, target: &str) -> bool {
        self.subscribers.contains_key(target)
    }

    pub fn subscribers(&self, target: &str) -> Vec<String> {
        self.subscribers
            .get(target)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn client(&self, id: &str) -> Option<&ClientRecord> {
        self.clients.get(id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_licensed(&self, target: &str) -> bool {
        self.lethal.get(target).is_some_and(|set| !set.is_empty())
    }

    /// Answer one client request.
    pub fn dispatch(&mut self, request: &SpyRequest, now: Instant) -> Result<SpyReply, EnforcerError> {
        match request {
            SpyRequest::Null => Ok(SpyReply {
                status: SpyStatus::Success,
                target: TargetRef::new("", self.base_generation.clone()),
            }),
            SpyRequest::Register {
                target,
                client,
                lethal,
                up_interval_ms,
            } => self.register(target, client, *lethal, *up_interval_ms, now),
            SpyRequest::Cancel { target, client } => self.cancel(target, client),
            SpyRequest::Kill { target, client } => self.kill(target, client),
            SpyRequest::GetGeneration { target, .. } => self.get_generation(target),
        }
    }

    fn reply(&self, status: SpyStatus, target: &str) -> SpyReply {
        SpyReply {
            status,
            target: TargetRef::new(target, self.generation(target)),
        }
    }

    fn refresh_generation(&mut self, target: &str) -> Result<(), EnforcerError> {
        if let Some(counter) = self.probe.update_generations(target) {
            if GenerationLog::is_recordable(target) {
                self.log.fast_forward(target, counter)?;
            }
        }
        Ok(())
    }

    fn is_unknown(&self, target: &str) -> bool {
        !GenerationLog::is_recordable(target) || self.probe.invalid_target(target)
    }

    /// Compare `query` with the current generation of `query.name`.
    fn gen_check(&mut self, query: &TargetRef) -> Result<SpyStatus, EnforcerError> {
        self.refresh_generation(&query.name)?;
        if self.is_unknown(&query.name) {
            return Ok(SpyStatus::UnknownTarget);
        }
        let status = match self.generation(&query.name).compare_query(&query.generation) {
            GenComparison::Current => SpyStatus::Success,
            GenComparison::BadLength => SpyStatus::BadGenVec,
            GenComparison::FutureGen => SpyStatus::FutureGen,
            GenComparison::LongDead => SpyStatus::LongDead,
        };
        Ok(status)
    }

    fn register(
        &mut self,
        target: &TargetRef,
        addr: &ClientAddr,
        lethal: bool,
        up_interval_ms: i64,
        now: Instant,
    ) -> Result<SpyReply, EnforcerError> {
        let status = self.gen_check(target)?;
        if status != SpyStatus::Success {
            info!(target = %target.name, client = %addr, %status, "register rejected");
            return Ok(self.reply(status, &target.name));
        }

        let (id, epoch) = self.get_client(addr);
        if let Some(record) = self.clients.get_mut(&id) {
            record.up_intervals.insert(target.name.clone(), up_interval_ms);
            record.last_seen = Utc::now();
        }
        let subscribers = self.subscribers.entry(target.name.clone()).or_default();
        let first = subscribers.insert(id.clone()) && subscribers.len() == 1;
        self.repeat_waiting(&target.name, &id, epoch, now);
        if lethal {
            self.grant_license(&target.name, &id);
        }
        if first {
            info!(target = %target.name, "start monitoring");
            self.probe.start_monitoring(&target.name);
        }

        info!(target = %target.name, client = %id, lethal, up_interval_ms, "registered");
        Ok(self.reply(SpyStatus::RegisterAck, &target.name))
    }

    fn cancel(&mut self, target: &TargetRef, addr: &ClientAddr) -> Result<SpyReply, EnforcerError> {
        let status = self.gen_check(target)?;
        if status != SpyStatus::Success {
            info!(target = %target.name, client = %addr, %status, "cancel rejected");
            return Ok(self.reply(status, &target.name));
        }

        let id = addr.id();
        if !self.unsubscribe(&target.name, &id) {
            debug!(target = %target.name, client = %id, "cancel for non-subscriber");
            return Ok(self.reply(SpyStatus::CancelError, &target.name));
        }
        let now_idle = match self.clients.get_mut(&id) {
            Some(record) => {
                record.up_intervals.remove(&target.name);
                record.last_seen = Utc::now();
                record.up_intervals.is_empty()
            }
            None => false,
        };
        if now_idle {
            self.remove_client(&id);
        }

        info!(target = %target.name, client = %id, "cancelled");
        Ok(self.reply(SpyStatus::CancelAck, &target.name))
    }

    fn kill(&mut self, target: &TargetRef, addr: &ClientAddr) -> Result<SpyReply, EnforcerError> {
        let status = self.gen_check(target)?;
        if status != SpyStatus::Success {
            info!(target = %target.name, client = %addr, %status, "kill rejected");
            return Ok(self.reply(status, &target.name));
        }
        let licensed = self.is_licensed(&target.name);
        info!(target = %target.name, client = %addr, licensed, "kill requested");
        self.probe.kill(&target.name, licensed);
        Ok(self.reply(SpyStatus::KillAck, &target.name))
    }

    fn get_generation(&mut self, target: &TargetRef) -> Result<SpyReply, EnforcerError> {
        if self.is_unknown(&target.name) {
            return Ok(self.reply(SpyStatus::UnknownTarget, &target.name));
        }
        self.refresh_generation(&target.name)?;
        Ok(self.reply(SpyStatus::GenResponse, &target.name))
    }

    /// Look up the record for `addr`, creating it (and its heartbeat) if new.
    fn get_client(&mut self, addr: &ClientAddr) -> (String, u64) {
        let id = addr.id();
        if let Some(record) = self.clients.get(&id) {
            return (id, record.epoch);
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let now = Utc::now();
        self.clients.insert(
            id.clone(),
            ClientRecord {
                addr: *addr,
                epoch,
                up_intervals: HashMap::new(),
                added_at: now,
                last_seen: now,
            },
        );
        info!(client = %id, "adding new client");
        self.queue(&id, epoch, *addr, ClientRequest::Null, CallKind::Heartbeat { attempt: 0 });
        (id, epoch)
    }

    fn current_epoch(&self, id: &str) -> Option<u64> {
        self.clients.get(id).map(|record| record.epoch)
    }

    /// Drop a client and release every target it held.
    pub fn remove_client(&mut self, id: &str) {
        let Some(record) = self.clients.remove(id) else {
            return;
        };
        info!(client = %id, targets = record.up_intervals.len(), "removing client");
        for target in record.up_intervals.keys() {
            self.unsubscribe(target, id);
        }
    }

    /// Remove `id` from a target's sets. Returns false if it was not
    /// subscribed. Stops monitoring when the last subscriber leaves.
    fn unsubscribe(&mut self, target: &str, id: &str) -> bool {
        let Some(subscribers) = self.subscribers.get_mut(target) else {
            return false;
        };
        if !subscribers.remove(id) {
            return false;
        }
        let emptied = subscribers.is_empty();
        if let Some(waiting) = self.waiting_for_up.get_mut(target) {
            waiting.remove(id);
        }
        self.revoke_license(target, id);

        if emptied {
            self.subscribers.remove(target);
            self.waiting_for_up.remove(target);
            info!(target, "stop monitoring");
            self.probe.stop_monitoring(target);
        } else {
            debug!(target, client = id, "other clients still subscribed");
        }
        true
    }

    fn grant_license(&mut self, target: &str, id: &str) {
        let holders = self.lethal.entry(target.to_string()).or_default();
        let was_empty = holders.is_empty();
        holders.insert(id.to_string());
        if was_empty {
            self.probe.set_licensed(target, true);
        }
    }

    fn revoke_license(&mut self, target: &str, id: &str) {
        let Some(holders) = self.lethal.get_mut(target) else {
            return;
        };
        if holders.remove(id) && holders.is_empty() {
            self.lethal.remove(target);
            self.probe.set_licensed(target, false);
        }
    }

    /// Make `id` eligible for its next Up on `target` per its interval.
    fn repeat_waiting(&mut self, target: &str, id: &str, epoch: u64, now: Instant) {
        if !self.subscribers.get(target).is_some_and(|set| set.contains(id)) {
            return;
        }
        let Some(interval) = self
            .clients
            .get(id)
            .and_then(|record| record.up_intervals.get(target).copied())
        else {
            return;
        };
        if interval < 0 {
            return;
        }
        if interval == 0 {
            self.waiting_for_up
                .entry(target.to_string())
                .or_default()
                .insert(id.to_string());
            return;
        }
        self.timers.schedule(
            now + Duration::from_millis(interval as u64),
            Timer::UpDue {
                client: id.to_string(),
                epoch,
                target: target.to_string(),
            },
        );
    }

    /// The probe saw `target` alive: notify every client that is due.
    pub fn observe_up(&mut self, target: &str, now: Instant) {
        let Some(due) = self.waiting_for_up.remove(target) else {
            return;
        };
        let generation = self.generation(target);
        for id in due {
            let Some(record) = self.clients.get(&id) else {
                continue;
            };
            let (addr, epoch) = (record.addr, record.epoch);
            let request = ClientRequest::Up {
                target: TargetRef::new(target, generation.clone()),
                client_tag: addr.client_tag,
            };
            self.queue(&id, epoch, addr, request, CallKind::Up);
            self.repeat_waiting(target, &id, epoch, now);
        }
    }

    /// The probe saw `target` fail. Every subscriber is told, the durable
    /// counter advances once, and the target goes back to unmonitored.
    pub fn observe_down(
        &mut self,
        target: &str,
        status: u32,
        killed: bool,
        would_kill: bool,
    ) -> Result<(), EnforcerError> {
        let Some(subscribers) = self.subscribers.remove(target) else {
            debug!(target, "down for unmonitored target");
            return Ok(());
        };
        info!(target, status, killed, would_kill, clients = subscribers.len(), "target down");

        let generation = self.generation(target);
        for id in &subscribers {
            let Some(record) = self.clients.get(id) else {
                continue;
            };
            let (addr, epoch) = (record.addr, record.epoch);
            let request = ClientRequest::Down {
                target: TargetRef::new(target, generation.clone()),
                layer_status: status,
                killed,
                would_kill,
                client_tag: addr.client_tag,
            };
            let kind = CallKind::Down {
                target: target.to_string(),
                attempt: 1,
            };
            self.queue(id, epoch, addr, request, kind);
        }

        self.log.increment(target)?;

        self.waiting_for_up.remove(target);
        if self.lethal.remove(target).is_some() {
            self.probe.set_licensed(target, false);
        }
        self.probe.stop_monitoring(target);
        Ok(())
    }

    fn queue(&mut self, id: &str, epoch: u64, addr: ClientAddr, request: ClientRequest, kind: CallKind) {
        self.outbox.push_back(OutboundCall {
            client: id.to_string(),
            epoch,
            addr,
            request,
            kind,
        });
    }

    /// Calls queued since the last drain, in order.
    pub fn drain_outbox(&mut self) -> Vec<OutboundCall> {
        self.outbox.drain(..).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn fire_due_timers(&mut self, now: Instant) {
        while let Some(timer) = self.timers.pop_due(now) {
            match timer {
                Timer::Heartbeat { client, epoch } => {
                    if self.current_epoch(&client) != Some(epoch) {
                        continue;
                    }
                    if let Some(addr) = self.clients.get(&client).map(|record| record.addr) {
                        self.queue(&client, epoch, addr, ClientRequest::Null, CallKind::Heartbeat { attempt: 0 });
                    }
                }
                Timer::UpDue {
                    client,
                    epoch,
                    target,
                } => {
                    if self.current_epoch(&client) != Some(epoch) {
                        continue;
                    }
                    if self.subscribers.get(&target).is_some_and(|set| set.contains(&client)) {
                        self.waiting_for_up.entry(target).or_default().insert(client);
                    }
                }
            }
        }
    }

    /// Outcome of an outbound call taken from the outbox.
    pub fn call_completed(&mut self, call: OutboundCall, ok: bool, now: Instant) {
        if self.current_epoch(&call.client) != Some(call.epoch) {
            debug!(client = %call.client, "completion for removed client");
            return;
        }
        if ok {
            if let Some(record) = self.clients.get_mut(&call.client) {
                record.last_seen = Utc::now();
            }
        }

        match call.kind {
            CallKind::Heartbeat { attempt } => {
                if ok {
                    self.timers.schedule(
                        now + self.settings.heartbeat_interval,
                        Timer::Heartbeat {
                            client: call.client,
                            epoch: call.epoch,
                        },
                    );
                } else if attempt < self.settings.heartbeat_retries {
                    warn!(client = %call.client, attempt = attempt + 1, "heartbeat failed");
                    let kind = CallKind::Heartbeat { attempt: attempt + 1 };
                    self.queue(&call.client, call.epoch, call.addr, call.request, kind);
                } else {
                    warn!(client = %call.client, "client stopped answering heartbeats");
                    self.remove_client(&call.client);
                }
            }
            CallKind::Up => {
                if !ok {
                    debug!(client = %call.client, "up notification lost");
                }
            }
            CallKind::Down { target, attempt } => {
                if ok {
                    info!(target = %target, client = %call.client, "down delivered");
                    let now_idle = match self.clients.get_mut(&call.client) {
                        Some(record) => {
                            record.up_intervals.remove(&target);
                            record.up_intervals.is_empty()
                        }
                        None => false,
                    };
                    if now_idle {
                        self.remove_client(&call.client);
                    }
                } else if attempt < self.settings.down_retries {
                    warn!(target = %target, client = %call.client, attempt = attempt + 1, "retrying down notification");
                    let kind = CallKind::Down {
                        target,
                        attempt: attempt + 1,
                    };
                    self.queue(&call.client, call.epoch, call.addr, call.request, kind);
                } else {
                    warn!(target = %target, client = %call.client, "down notification undeliverable");
                    self.remove_client(&call.client);
                }
            }
        }
    }

    /// Stop every probe activity; used when the loop exits.
    pub fn shutdown(&mut self) {
        let targets: Vec<String> = self.subscribers.keys().cloned().collect();
        for target in targets {
            self.probe.stop_monitoring(&target);
        }
        self.subscribers.clear();
        self.waiting_for_up.clear();
        self.lethal.clear();
    }
}
