//! Node Status State Machine
//!
//! Tracks the lifecycle of the local node and decides, for every ingestion
//! call, which events (if any) must be fired. The engine holds `NodeStatus`
//! under its exclusive state lock; the returned transition values are then
//! dispatched after the lock is released.
//!
//! `FiredEventMark` is the other half: it records which operations events
//! have actually been handed to listeners, so that a leaving thread can wait
//! for a disablement decided elsewhere to be dispatched before `NODE_LEFT`.

use parking_lot::{Condvar, Mutex};

use super::types::{EngineState, EventType};

/// Outcome of `this_node_joined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinTransition {
    /// First join of this engine: fire `NODE_JOIN` then `OPERATIONS_ENABLED`.
    First,
    /// Reconnect with the same lifecycle: fire `OPERATIONS_ENABLED` only.
    Reconnect,
    /// Identity replaced: `NODE_LEFT` (old, if `old_was_joined`), `NODE_JOIN`,
    /// `OPERATIONS_ENABLED`, `NODE_REJOINED`.
    Rejoin { old_was_joined: bool },
}

/// Outcome of `this_node_left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveTransition {
    /// Operations were enabled: fire `OPERATIONS_DISABLED` (tagged with the
    /// generation) before `NODE_LEFT`.
    DisableThenLeave { generation: u64 },
    /// Operations were already disabled by the transition with this
    /// generation; wait for it to be fired before `NODE_LEFT`.
    AwaitDisabledThenLeave { generation: u64 },
}

#[derive(Debug, Default)]
pub struct NodeStatus {
    state: EngineState,
    generation: u64,
    disabled_generation: u64,
    ever_joined: bool,
}

impl NodeStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn ever_joined(&self) -> bool {
        self.ever_joined
    }

    fn transition(&mut self, to: EngineState) -> u64 {
        tracing::trace!("Node status {:?} -> {:?}", self.state, to);
        self.generation += 1;
        if to == EngineState::OperationsDisabled {
            self.disabled_generation = self.generation;
        }
        self.state = to;
        self.generation
    }

    /// Moves the local node to `OperationsEnabled` through `Joined`.
    pub fn this_node_joined(&mut self, rejoin: bool) -> JoinTransition {
        let outcome = if rejoin && self.ever_joined {
            JoinTransition::Rejoin {
                old_was_joined: self.state.is_node_joined(),
            }
        } else if self.ever_joined {
            JoinTransition::Reconnect
        } else {
            JoinTransition::First
        };

        self.ever_joined = true;
        self.transition(EngineState::Joined);
        self.transition(EngineState::OperationsEnabled);
        outcome
    }

    /// Returns `false` when operations are already enabled or the node is not
    /// joined; nothing should be fired in that case.
    pub fn operations_enabled(&mut self) -> bool {
        match self.state {
            EngineState::Joined | EngineState::OperationsDisabled => {
                self.transition(EngineState::OperationsEnabled);
                true
            }
            _ => false,
        }
    }

    /// Returns the generation of the disablement, or `None` when operations
    /// were not enabled.
    pub fn operations_disabled(&mut self) -> Option<u64> {
        if !self.state.are_operations_enabled() {
            return None;
        }
        Some(self.transition(EngineState::OperationsDisabled))
    }

    /// Returns `None` when the node never joined (or already left).
    pub fn this_node_left(&mut self) -> Option<LeaveTransition> {
        // `Joined` never outlives `this_node_joined`, which always moves on
        // to `OperationsEnabled`.
        let outcome = match self.state {
            EngineState::Joined | EngineState::OperationsEnabled => {
                let generation = self.transition(EngineState::OperationsDisabled);
                LeaveTransition::DisableThenLeave { generation }
            }
            EngineState::OperationsDisabled => LeaveTransition::AwaitDisabledThenLeave {
                generation: self.disabled_generation,
            },
            EngineState::NotJoined | EngineState::Left => return None,
        };
        self.transition(EngineState::Left);
        Some(outcome)
    }
}

#[derive(Debug, Default)]
struct FiredEvents {
    last: Option<EventType>,
    disabled_generation: u64,
}

/// Last operations event handed to listeners for the local node.
#[derive(Debug, Default)]
pub struct FiredEventMark {
    inner: Mutex<FiredEvents>,
    fired: Condvar,
}

impl FiredEventMark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_fired(&self) -> Option<EventType> {
        self.inner.lock().last
    }

    pub fn operations_enabled_fired(&self) {
        let mut inner = self.inner.lock();
        inner.last = Some(EventType::OperationsEnabled);
        self.fired.notify_all();
    }

    pub fn operations_disabled_fired(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.last = Some(EventType::OperationsDisabled);
        inner.disabled_generation = inner.disabled_generation.max(generation);
        self.fired.notify_all();
    }

    /// Blocks until the disablement with `generation` (or a later one) has
    /// been fired. Spurious wake-ups are looped past.
    pub fn wait_until_operations_disabled_fired(&self, generation: u64) {
        let mut inner = self.inner.lock();
        while inner.disabled_generation < generation {
            self.fired.wait(&mut inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_first_join_then_reconnect() {
        let mut status = NodeStatus::new();

        assert_eq!(status.this_node_joined(false), JoinTransition::First);
        assert_eq!(status.state(), EngineState::OperationsEnabled);

        assert_eq!(status.this_node_joined(false), JoinTransition::Reconnect);
        assert_eq!(status.state(), EngineState::OperationsEnabled);
    }

    #[test]
    fn test_rejoin_before_first_join_is_a_first_join() {
        let mut status = NodeStatus::new();
        assert_eq!(status.this_node_joined(true), JoinTransition::First);
    }

    #[test]
    fn test_rejoin_after_leave_skips_old_left() {
        let mut status = NodeStatus::new();
        status.this_node_joined(false);
        status.this_node_left();

        assert_eq!(
            status.this_node_joined(true),
            JoinTransition::Rejoin {
                old_was_joined: false
            }
        );
    }

    #[test]
    fn test_enable_disable_are_idempotent() {
        let mut status = NodeStatus::new();
        assert!(!status.operations_enabled(), "not joined yet");
        assert!(status.operations_disabled().is_none());

        status.this_node_joined(false);
        assert!(!status.operations_enabled(), "already enabled");

        assert!(status.operations_disabled().is_some());
        assert!(status.operations_disabled().is_none());

        assert!(status.operations_enabled());
        assert!(status.state().are_operations_enabled());
    }

    #[test]
    fn test_leave_before_join_is_ignored() {
        let mut status = NodeStatus::new();
        assert!(status.this_node_left().is_none());
        assert_eq!(status.state(), EngineState::NotJoined);
    }

    #[test]
    fn test_leave_while_enabled_disables_first() {
        let mut status = NodeStatus::new();
        status.this_node_joined(false);

        let leave = status.this_node_left();

        assert!(matches!(
            leave,
            Some(LeaveTransition::DisableThenLeave { .. })
        ));
        assert!(status.state().is_node_left());
        assert!(status.this_node_left().is_none());
    }

    #[test]
    fn test_leave_while_disabled_awaits_that_disablement() {
        let mut status = NodeStatus::new();
        status.this_node_joined(false);
        let disabled = status.operations_disabled().unwrap();

        let leave = status.this_node_left();

        assert_eq!(
            leave,
            Some(LeaveTransition::AwaitDisabledThenLeave {
                generation: disabled
            })
        );
    }

    #[test]
    fn test_join_never_rests_in_joined() {
        let mut status = NodeStatus::new();

        status.this_node_joined(false);
        assert_eq!(status.state(), EngineState::OperationsEnabled);

        status.this_node_left();
        status.this_node_joined(true);
        assert_eq!(status.state(), EngineState::OperationsEnabled);

        // So every leave from a joined node has a disablement to order against.
        assert!(matches!(
            status.this_node_left(),
            Some(LeaveTransition::DisableThenLeave { .. })
        ));
    }

    #[test]
    fn test_fired_mark_wait_releases_on_matching_generation() {
        let mark = Arc::new(FiredEventMark::new());
        mark.operations_disabled_fired(1);

        let waiter = {
            let mark = mark.clone();
            thread::spawn(move || mark.wait_until_operations_disabled_fired(5))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished(), "stale disablement must not release");

        mark.operations_enabled_fired();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        mark.operations_disabled_fired(5);
        waiter.join().unwrap();
        assert_eq!(mark.last_fired(), Some(EventType::OperationsDisabled));
    }
}
