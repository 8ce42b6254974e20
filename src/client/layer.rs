//! Client-side monitoring tree.
//!
//! Each [`LayerNode`] stands for one layer registered with the enforcer of its
//! parent. A node owns its children and holds a link to the enforcer running
//! at its own layer, which is the enforcer that watches those children. The
//! base node is a local sentinel with no enforcer behind it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use super::callback::{CallbackList, FalconCallback};
use super::watchdog::{Watchdog, WatchdogSettings};
use super::{lock, RegisterError};
use crate::generation::{is_child, Generation};
use crate::rpc::{ClientAddr, Connector, EnforcerLink, SpyReply, SpyRequest, TargetRef};
use crate::status::{FalconStatus, SpyStatus};

/// Collaborators shared by every node of one tree.
pub struct TreeContext {
    pub connector: Arc<dyn Connector>,
    pub watchdog: WatchdogSettings,
}

/// Result of asking a node to kill one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The enforcer acknowledged the kill.
    Killed,
    /// The child is not killable; an end-to-end timeout was reported instead.
    Reported,
    /// The enforcer says the child is already gone.
    LongDead,
    /// No such child in the tree.
    Missing,
    /// Transport failure or unexpected reply; the caller may retry.
    Retry,
}

impl KillOutcome {
    pub fn is_final(self) -> bool {
        self != KillOutcome::Retry
    }
}

#[derive(Default)]
struct Subtree {
    children: HashMap<String, Arc<LayerNode>>,
    /// Number of registration chains terminating through each child.
    child_leaves: HashMap<String, usize>,
}

pub struct LayerNode {
    handle: String,
    generation: Generation,
    killable: bool,
    is_base: bool,
    parent: Weak<LayerNode>,
    link: Option<Arc<dyn EnforcerLink>>,
    return_addr: ClientAddr,
    callbacks: CallbackList,
    watchdog: Option<Watchdog>,
    tree: Mutex<Subtree>,
    // Exclusive sections, acquired in this order. An operation holds at most one.
    kill_section: Mutex<()>,
    cancel_section: Mutex<()>,
    add_section: Mutex<()>,
    context: Arc<TreeContext>,
}

impl LayerNode {
    /// The root sentinel. It has no enforcer and an empty generation.
    pub fn base(return_addr: ClientAddr, context: Arc<TreeContext>) -> Arc<Self> {
        Arc::new(Self {
            handle: String::new(),
            generation: Generation::empty(),
            killable: false,
            is_base: true,
            parent: Weak::new(),
            link: None,
            return_addr,
            callbacks: CallbackList::default(),
            watchdog: None,
            tree: Mutex::new(Subtree::default()),
            kill_section: Mutex::new(()),
            cancel_section: Mutex::new(()),
            add_section: Mutex::new(()),
            context,
        })
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn is_base(&self) -> bool {
        self.is_base
    }

    pub fn killable(&self) -> bool {
        self.killable
    }

    pub fn parent(&self) -> Option<Arc<LayerNode>> {
        self.parent.upgrade()
    }

    /// Return address (and routing tag) this node registers its children with.
    pub fn return_addr(&self) -> ClientAddr {
        self.return_addr
    }

    pub fn child(&self, name: &str) -> Option<Arc<LayerNode>> {
        lock(&self.tree).children.get(name).cloned()
    }

    pub fn child_leaves(&self, name: &str) -> usize {
        lock(&self.tree).child_leaves.get(name).copied().unwrap_or(0)
    }

    pub fn children(&self) -> Vec<String> {
        lock(&self.tree).children.keys().cloned().collect()
    }

    pub fn add_callback(&self, cb: Arc<FalconCallback>) {
        self.callbacks.add(cb);
    }

    /// Deliver `status` to every callback attached to this node.
    pub fn run_callbacks(&self, layer: &str, status: FalconStatus, remote_status: u32) {
        self.callbacks.run_all(layer, status, remote_status);
    }

    pub fn watchdog(&self) -> Option<&Watchdog> {
        self.watchdog.as_ref()
    }

    /// Find or register `child` under this node.
    ///
    /// An existing child is shared: the callback is attached and the chain
    /// count bumped without contacting any enforcer. A new child is checked
    /// against this node's generation and registered with this node's
    /// enforcer before it is inserted.
    #[allow(clippy::too_many_arguments)]
    pub fn add_child(
        self: &Arc<Self>,
        child: &str,
        killable: bool,
        return_addr: ClientAddr,
        up_interval_secs: i32,
        is_leaf: bool,
        cb: Arc<FalconCallback>,
    ) -> Result<Arc<LayerNode>, RegisterError> {
        if let Some(existing) = self.attach_existing(child, &cb) {
            return Ok(existing);
        }

        let _section = lock(&self.add_section);
        // Another caller may have registered it while we waited.
        if let Some(existing) = self.attach_existing(child, &cb) {
            return Ok(existing);
        }

        let child_link = if is_leaf {
            None
        } else {
            let link = self
                .context
                .connector
                .connect(child)
                .map_err(|source| RegisterError::Connect {
                    layer: child.to_string(),
                    source,
                })?;
            Some(link)
        };

        if self.is_base {
            let node = self.new_child(
                child,
                self.generation.clone(),
                killable,
                return_addr,
                is_leaf,
                child_link,
            );
            debug!(layer = child, "added top-level layer");
            return Ok(self.insert_child(node, cb));
        }

        let child_gen = self.fetch_child_generation(child)?;

        let up_interval_ms = if is_leaf && up_interval_secs >= 0 {
            i64::from(up_interval_secs) * 1000
        } else {
            -1
        };
        let reply = self.call(&SpyRequest::Register {
            target: TargetRef::new(child, child_gen.clone()),
            client: self.return_addr,
            lethal: killable,
            up_interval_ms,
        })?;
        if reply.status != SpyStatus::RegisterAck {
            warn!(layer = child, at = %self.handle, status = %reply.status, "registration rejected");
            return Err(RegisterError::Rejected {
                layer: child.to_string(),
                status: reply.status,
            });
        }

        info!(layer = child, at = %self.handle, generation = %child_gen, "registered layer");
        let node = self.new_child(child, child_gen, killable, return_addr, is_leaf, child_link);
        Ok(self.insert_child(node, cb))
    }

    fn attach_existing(&self, child: &str, cb: &Arc<FalconCallback>) -> Option<Arc<LayerNode>> {
        let mut tree = lock(&self.tree);
        let existing = tree.children.get(child).cloned()?;
        *tree.child_leaves.entry(child.to_string()).or_insert(0) += 1;
        existing.add_callback(Arc::clone(cb));
        Some(existing)
    }

    fn fetch_child_generation(&self, child: &str) -> Result<Generation, RegisterError> {
        let reply = self.call(&SpyRequest::GetGeneration {
            target: TargetRef::new(child, Generation::empty()),
            client: self.return_addr,
        })?;
        if reply.status != SpyStatus::GenResponse {
            warn!(layer = child, at = %self.handle, status = %reply.status, "generation query rejected");
            return Err(RegisterError::Rejected {
                layer: child.to_string(),
                status: reply.status,
            });
        }
        let child_gen = reply.target.generation;
        if !is_child(&self.generation, &child_gen) {
            warn!(
                layer = child,
                parent = %self.generation,
                generation = %child_gen,
                "enforcer returned a generation that does not extend its parent"
            );
            return Err(RegisterError::BadGeneration {
                layer: child.to_string(),
                parent: self.generation.clone(),
                child: child_gen,
            });
        }
        Ok(child_gen)
    }

    fn new_child(
        self: &Arc<Self>,
        child: &str,
        generation: Generation,
        killable: bool,
        return_addr: ClientAddr,
        is_leaf: bool,
        link: Option<Arc<dyn EnforcerLink>>,
    ) -> Arc<LayerNode> {
        let watchdog = is_leaf.then(|| {
            Watchdog::spawn(child.to_string(), self.escalation_path(child), self.context.watchdog)
        });
        Arc::new(LayerNode {
            handle: child.to_string(),
            generation,
            killable,
            is_base: false,
            parent: Arc::downgrade(self),
            link,
            return_addr,
            callbacks: CallbackList::default(),
            watchdog,
            tree: Mutex::new(Subtree::default()),
            kill_section: Mutex::new(()),
            cancel_section: Mutex::new(()),
            add_section: Mutex::new(()),
            context: Arc::clone(&self.context),
        })
    }

    fn insert_child(&self, node: Arc<LayerNode>, cb: Arc<FalconCallback>) -> Arc<LayerNode> {
        let mut tree = lock(&self.tree);
        node.add_callback(cb);
        tree.children.insert(node.handle.clone(), Arc::clone(&node));
        *tree.child_leaves.entry(node.handle.clone()).or_insert(0) += 1;
        node
    }

    /// `(owner, child)` pairs from `child` up to the base, nearest first.
    fn escalation_path(self: &Arc<Self>, child: &str) -> Vec<(Weak<LayerNode>, String)> {
        let mut path = vec![(Arc::downgrade(self), child.to_string())];
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent() {
            path.push((Arc::downgrade(&parent), current.handle.clone()));
            current = parent;
        }
        path
    }

    fn call(&self, request: &SpyRequest) -> Result<SpyReply, RegisterError> {
        let link = self.link.as_ref().ok_or_else(|| RegisterError::NoEnforcer {
            layer: self.handle.clone(),
        })?;
        link.call(request).map_err(|source| RegisterError::Rpc {
            peer: link.peer(),
            source,
        })
    }

    /// Drop one chain's reference to `child`. When none remain the child is
    /// removed and its registration cancelled remotely. Returns false for the
    /// base layer or while other chains still use the child.
    pub fn cancel_child(&self, child: &str) -> bool {
        let _section = lock(&self.cancel_section);
        if self.is_base {
            return false;
        }

        let removed = {
            let mut tree = lock(&self.tree);
            match tree.child_leaves.get_mut(child) {
                None => {
                    debug!(layer = child, at = %self.handle, "cancel for untracked child");
                    return false;
                }
                Some(count) => {
                    *count = count.saturating_sub(1);
                    if *count > 0 {
                        return false;
                    }
                }
            }
            tree.child_leaves.remove(child);
            tree.children.remove(child)
        };

        let Some(node) = removed else {
            debug!(layer = child, at = %self.handle, "child already gone, skipping remote cancel");
            return true;
        };

        let result = self.call(&SpyRequest::Cancel {
            target: TargetRef::new(child, node.generation.clone()),
            client: self.return_addr,
        });
        match result {
            Ok(reply) if reply.status == SpyStatus::CancelAck => {
                info!(layer = child, at = %self.handle, "cancel success");
            }
            Ok(reply) => {
                warn!(layer = child, at = %self.handle, status = %reply.status, "cancel error");
            }
            Err(e) => {
                warn!(layer = child, at = %self.handle, error = %e, "cancel error");
            }
        }
        true
    }

    /// Kill `child` through this node's enforcer.
    ///
    /// # Panics
    ///
    /// The base layer has nothing to kill with; asking it to is a bug.
    pub fn kill_child(&self, child: &str) -> KillOutcome {
        let _section = lock(&self.kill_section);
        if self.is_base {
            panic!("attempted to kill {child} at the base layer");
        }

        let Some(node) = self.child(child) else {
            warn!(layer = child, at = %self.handle, "kill for non-existent child");
            return KillOutcome::Missing;
        };

        if !node.killable {
            info!(layer = child, "layer is not killable, reporting end-to-end timeout");
            node.callbacks.run_all(child, FalconStatus::E2eTimeout, 0);
            return KillOutcome::Reported;
        }

        let result = self.call(&SpyRequest::Kill {
            target: TargetRef::new(child, node.generation.clone()),
            client: self.return_addr,
        });
        match result {
            Ok(reply) if reply.status == SpyStatus::KillAck => {
                info!(layer = child, at = %self.handle, "kill acknowledged");
                KillOutcome::Killed
            }
            Ok(reply) if reply.status.is_stale() => {
                info!(layer = child, at = %self.handle, status = %reply.status, "layer already dead");
                node.callbacks.run_all(child, FalconStatus::KillLongDead, 0);
                KillOutcome::LongDead
            }
            Ok(reply) => {
                warn!(layer = child, at = %self.handle, status = %reply.status, "kill error");
                KillOutcome::Retry
            }
            Err(e) => {
                warn!(layer = child, at = %self.handle, error = %e, "kill error");
                KillOutcome::Retry
            }
        }
    }

    /// Liveness notification for `child` from this node's enforcer.
    pub fn do_child_up(&self, child: &str, generation: &Generation) {
        let Some(node) = self.child(child) else {
            debug!(layer = child, at = %self.handle, "up for non-existent child");
            return;
        };
        if node.generation == *generation {
            node.pet();
        } else {
            info!(
                layer = child,
                current = %node.generation,
                received = %generation,
                "discarding up with stale generation"
            );
        }
    }

    /// Failure notification for `child`. Runs the child's callbacks and
    /// erases it, together with everything below it.
    pub fn do_child_down(
        &self,
        child: &str,
        generation: &Generation,
        status: FalconStatus,
        remote_status: u32,
    ) {
        let erased = {
            let mut tree = lock(&self.tree);
            let Some(node) = tree.children.get(child).cloned() else {
                debug!(layer = child, at = %self.handle, "down for non-existent child");
                return;
            };
            if node.generation != *generation {
                info!(
                    layer = child,
                    current = %node.generation,
                    received = %generation,
                    "discarding down with stale generation"
                );
                return;
            }
            node.callbacks.run_all(child, status, remote_status);
            tree.child_leaves.remove(child);
            tree.children.remove(child)
        };
        info!(layer = child, at = %self.handle, %status, "layer down");
        drop(erased);
    }

    /// Forward a sign of life to the watchdog, if this is a leaf.
    pub fn pet(&self) {
        match &self.watchdog {
            Some(watchdog) => watchdog.pet(),
            None => debug!(layer = %self.handle, "up for layer without watchdog"),
        }
    }
}

impl Drop for LayerNode {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
    }
}

impl fmt::Debug for LayerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerNode")
            .field("handle", &self.handle)
            .field("generation", &self.generation)
            .field("killable", &self.killable)
            .field("is_base", &self.is_base)
            .field("return_addr", &self.return_addr)
            .finish_non_exhaustive()
    }
}
