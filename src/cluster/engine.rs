//! Engine Facade
//!
//! `ClusterEngine` composes the topology, the node status state machine, the
//! listener registry and the dispatcher. The membership layer drives it
//! through [`MembershipEvents`]; caches and other consumers use the query and
//! listener API.
//!
//! ## Locking
//! - The state lock guards `NodeStatus` and the current node record. Every
//!   transition decides its events while holding it and dispatches them after
//!   releasing it, so listener callbacks may freely query the engine.
//! - The topology has its own structure lock; it is only ever taken after the
//!   state lock, never before.
//! - `FiredEventMark` has its own monitor so a leaving thread can wait for a
//!   disablement without blocking other transitions.

use anyhow::Result;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::config::ClusterConfig;
use super::dispatcher::EventDispatcher;
use super::listeners::{ClusterListener, ListenerRegistry};
use super::notifier::NotifierStats;
use super::status::{FiredEventMark, JoinTransition, LeaveTransition, NodeStatus};
use super::topology::Topology;
use super::types::{ClusterEvent, EngineState, EventType, NodeId, NodeRecord};

/// Inbound surface used by the membership/protocol layer.
///
/// Every call is fire-and-forget for the caller; ordering and any blocking
/// happen inside the implementation.
pub trait MembershipEvents: Send + Sync {
    fn this_node_joined(&self, node_id: NodeId, cluster_members: &[NodeId]);
    fn this_node_rejoined(&self, node_id: NodeId, cluster_members: &[NodeId]);
    fn this_node_left(&self);
    fn node_joined(&self, node_id: NodeId);
    fn node_left(&self, node_id: NodeId);
    fn operations_enabled(&self);
    fn operations_disabled(&self);
    fn node_error(&self);
}

#[derive(Default)]
struct LocalNode {
    status: NodeStatus,
    current: Option<Arc<NodeRecord>>,
}

pub struct ClusterEngine {
    topology: Topology,
    listeners: ListenerRegistry,
    local: RwLock<LocalNode>,
    fired: FiredEventMark,
    dispatcher: EventDispatcher,
    join_sync: Mutex<()>,
    join_signal: Condvar,
    joined_tx: watch::Sender<Option<Arc<NodeRecord>>>,
    shut_down: AtomicBool,
}

impl ClusterEngine {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        let (joined_tx, _) = watch::channel(None);
        Arc::new(Self {
            topology: Topology::new(),
            listeners: ListenerRegistry::new(),
            local: RwLock::new(LocalNode::default()),
            fired: FiredEventMark::new(),
            dispatcher: EventDispatcher::new(&config),
            join_sync: Mutex::new(()),
            join_signal: Condvar::new(),
            joined_tx,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Starts the delivery workers. Events fired before `init` stay queued
    /// and are delivered once it runs.
    pub fn init(&self, runtime: &Handle) -> Result<()> {
        self.dispatcher.start(runtime)?;
        tracing::info!("Cluster engine started");
        Ok(())
    }

    /// Stops future delivery. Callbacks already running are not interrupted.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.shutdown();
        tracing::info!("Cluster engine shut down");
    }

    // --- Listeners ---

    /// Subscribes `listener` and replays the current state to it alone.
    ///
    /// Returns `false` (and replays nothing) if it was already subscribed.
    pub fn add_listener(&self, listener: Arc<dyn ClusterListener>) -> bool {
        // The replay is enqueued before the state lock is released, so no
        // live event for a later transition can overtake it.
        let local = self.local.write();
        if !self.listeners.add(listener.clone()) {
            tracing::debug!("Listener already registered");
            return false;
        }
        for event in &Self::replay_for(&local) {
            self.dispatcher.dispatch(event, &listener);
        }
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ClusterListener>) -> bool {
        let _local = self.local.write();
        self.listeners.remove(listener)
    }

    // NODE_ERROR is transient and never replayed.
    fn replay_for(local: &LocalNode) -> Vec<ClusterEvent> {
        let Some(node) = &local.current else {
            return Vec::new();
        };

        let state = local.status.state();
        let mut replay = Vec::with_capacity(2);
        if state.is_node_left() {
            replay.push(ClusterEvent::new(EventType::NodeLeft, node.clone()));
        } else {
            if state.is_node_joined() {
                replay.push(ClusterEvent::new(EventType::NodeJoin, node.clone()));
            }
            if state.are_operations_enabled() {
                replay.push(ClusterEvent::new(EventType::OperationsEnabled, node.clone()));
            }
        }
        replay
    }

    // --- Queries ---

    pub fn current_node(&self) -> Option<Arc<NodeRecord>> {
        self.local.read().current.clone()
    }

    pub fn topology(&self) -> Vec<Arc<NodeRecord>> {
        self.topology.snapshot()
    }

    /// Record for `node_id`, registering it if this is the first sighting.
    pub fn node(&self, node_id: NodeId) -> Arc<NodeRecord> {
        self.topology.register_or_get(node_id)
    }

    pub fn state(&self) -> EngineState {
        self.local.read().status.state()
    }

    pub fn is_node_joined(&self) -> bool {
        self.state().is_node_joined()
    }

    pub fn are_operations_enabled(&self) -> bool {
        self.state().are_operations_enabled()
    }

    /// Resolves once every ordered-listener callback for events fired so far
    /// has returned. Out-of-band deliveries are not covered.
    pub async fn flush_ordered(&self) {
        self.dispatcher.flush_ordered().await;
    }

    pub fn notifier_stats(&self) -> NotifierStats {
        self.dispatcher.notifier_stats()
    }

    /// Blocks the calling thread until this node has joined the cluster.
    pub fn wait_until_node_joins_cluster(&self) -> Arc<NodeRecord> {
        let mut guard = self.join_sync.lock();
        loop {
            if let Some(node) = self.current_node() {
                return node;
            }
            self.join_signal.wait(&mut guard);
        }
    }

    /// Like [`wait_until_node_joins_cluster`](Self::wait_until_node_joins_cluster)
    /// but gives up after `timeout`.
    pub fn wait_until_node_joins_cluster_timeout(
        &self,
        timeout: Duration,
    ) -> Option<Arc<NodeRecord>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.join_sync.lock();
        loop {
            if let Some(node) = self.current_node() {
                return Some(node);
            }
            if self.join_signal.wait_until(&mut guard, deadline).timed_out() {
                return self.current_node();
            }
        }
    }

    /// Resolves once this node has joined the cluster.
    pub async fn joined(&self) -> Arc<NodeRecord> {
        let mut rx = self.joined_tx.subscribe();
        loop {
            if let Some(node) = rx.borrow_and_update().clone() {
                return node;
            }
            // The sender lives in `self`, so this only fails once the engine is gone.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub(crate) fn notify_join_waiters(&self) {
        let _guard = self.join_sync.lock();
        self.join_signal.notify_all();
    }

    // --- Ingestion ---

    pub fn fire_this_node_joined(&self, node_id: NodeId, cluster_members: &[NodeId]) {
        self.join_local(node_id, cluster_members, false);
    }

    /// Rejoin: the current identity leaves and `node_id` takes its place.
    /// Callers normally run [`cleanup`](Self::cleanup) first.
    pub fn fire_this_node_rejoined(&self, node_id: NodeId, cluster_members: &[NodeId]) {
        self.join_local(node_id, cluster_members, true);
    }

    fn join_local(&self, node_id: NodeId, cluster_members: &[NodeId], rejoin: bool) {
        let (transition, previous, current) = {
            let mut local = self.local.write();
            // While joined, the identity only changes through a leave or a rejoin.
            if !rejoin
                && local.status.state().is_node_joined()
                && let Some(joined) = local.current.clone()
                && joined.id != node_id
            {
                tracing::warn!(
                    "Ignoring join as {}: this node is still joined as {}",
                    node_id,
                    joined.id
                );
                let transition = local.status.this_node_joined(false);
                (transition, Some(joined.clone()), joined)
            } else {
                let transition = local.status.this_node_joined(rejoin);
                if let JoinTransition::Rejoin { .. } = transition
                    && let Some(old) = &local.current
                    && old.id != node_id
                {
                    self.topology.remove(&old.id);
                }
                let current = self.topology.register_members(node_id, cluster_members);
                let previous = local.current.replace(current.clone());
                (transition, previous, current)
            }
        };

        tracing::info!(
            "This node joined the cluster as {} ({:?}, {} member(s))",
            current.id,
            transition,
            cluster_members.len()
        );

        self.joined_tx.send_replace(Some(current.clone()));
        self.notify_join_waiters();

        match transition {
            JoinTransition::First => {
                self.broadcast(EventType::NodeJoin, &current);
                self.fire_operations_enabled_event(&current);
            }
            JoinTransition::Reconnect => {
                self.fire_operations_enabled_event(&current);
            }
            JoinTransition::Rejoin { old_was_joined } => {
                if old_was_joined && let Some(old) = &previous {
                    self.broadcast(EventType::NodeLeft, old);
                }
                self.broadcast(EventType::NodeJoin, &current);
                self.fire_operations_enabled_event(&current);
                self.broadcast(EventType::NodeRejoined, &current);
            }
        }
    }

    pub fn fire_this_node_left(&self) {
        let (leave, node) = {
            let mut local = self.local.write();
            let Some(node) = local.current.clone() else {
                tracing::debug!("Ignoring node left: this node never joined");
                return;
            };
            let Some(leave) = local.status.this_node_left() else {
                tracing::debug!("Ignoring node left for {}: not joined", node.id);
                return;
            };
            (leave, node)
        };

        match leave {
            LeaveTransition::DisableThenLeave { generation } => {
                self.fire_operations_disabled_event(&node, generation);
            }
            LeaveTransition::AwaitDisabledThenLeave { generation } => {
                tracing::debug!("Waiting for operations disabled to fire before node left");
                self.fired.wait_until_operations_disabled_fired(generation);
            }
        }

        self.topology.remove(&node.id);
        tracing::info!("This node {} left the cluster", node.id);
        self.broadcast(EventType::NodeLeft, &node);
    }

    pub fn fire_node_joined(&self, node_id: NodeId) {
        match self.topology.register_if_absent(node_id) {
            Some(node) => {
                tracing::info!("Node {} joined the cluster", node_id);
                self.broadcast(EventType::NodeJoin, &node);
            }
            None => {
                tracing::debug!("Node {} already known, no join fired", node_id);
            }
        }
    }

    pub fn fire_node_left(&self, node_id: NodeId) {
        match self.topology.remove(&node_id) {
            Some(node) => {
                tracing::info!("Node {} left the cluster", node_id);
                self.broadcast(EventType::NodeLeft, &node);
            }
            None => {
                tracing::debug!("Node {} not in topology, no leave fired", node_id);
            }
        }
    }

    pub fn fire_operations_enabled(&self) {
        let node = {
            let mut local = self.local.write();
            let Some(node) = local.current.clone() else {
                tracing::debug!("Ignoring operations enabled: this node never joined");
                return;
            };
            if !local.status.operations_enabled() {
                tracing::debug!(
                    "Operations already enabled (or node not joined), state {:?}",
                    local.status.state()
                );
                return;
            }
            node
        };

        self.fire_operations_enabled_event(&node);
    }

    pub fn fire_operations_disabled(&self) {
        let (node, generation) = {
            let mut local = self.local.write();
            let Some(node) = local.current.clone() else {
                tracing::debug!("Ignoring operations disabled: this node never joined");
                return;
            };
            let Some(generation) = local.status.operations_disabled() else {
                tracing::debug!(
                    "Operations already disabled, state {:?}",
                    local.status.state()
                );
                return;
            };
            (node, generation)
        };

        self.fire_operations_disabled_event(&node, generation);
    }

    pub fn fire_node_error(&self) {
        let Some(node) = self.current_node() else {
            tracing::debug!("Ignoring node error: this node never joined");
            return;
        };
        tracing::warn!("Node error reported for {}", node.id);
        self.broadcast(EventType::NodeError, &node);
    }

    /// Drops every topology record; used at the start of a rejoin.
    pub fn cleanup(&self) {
        self.topology.clear();
        tracing::info!("Cluster topology cleaned up");
    }

    fn fire_operations_enabled_event(&self, node: &Arc<NodeRecord>) {
        self.broadcast(EventType::OperationsEnabled, node);
        self.fired.operations_enabled_fired();
    }

    fn fire_operations_disabled_event(&self, node: &Arc<NodeRecord>, generation: u64) {
        self.broadcast(EventType::OperationsDisabled, node);
        self.fired.operations_disabled_fired(generation);
    }

    fn broadcast(&self, kind: EventType, node: &Arc<NodeRecord>) {
        let event = ClusterEvent::new(kind, node.clone());
        let listeners = self.listeners.snapshot();
        self.dispatcher.broadcast(&event, &listeners);
    }
}

impl MembershipEvents for ClusterEngine {
    fn this_node_joined(&self, node_id: NodeId, cluster_members: &[NodeId]) {
        self.fire_this_node_joined(node_id, cluster_members);
    }

    fn this_node_rejoined(&self, node_id: NodeId, cluster_members: &[NodeId]) {
        self.fire_this_node_rejoined(node_id, cluster_members);
    }

    fn this_node_left(&self) {
        self.fire_this_node_left();
    }

    fn node_joined(&self, node_id: NodeId) {
        self.fire_node_joined(node_id);
    }

    fn node_left(&self, node_id: NodeId) {
        self.fire_node_left(node_id);
    }

    fn operations_enabled(&self) {
        self.fire_operations_enabled();
    }

    fn operations_disabled(&self) {
        self.fire_operations_disabled();
    }

    fn node_error(&self) {
        self.fire_node_error();
    }
}
