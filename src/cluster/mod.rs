//! Cluster Membership & Event Dispatch
//!
//! Records the membership facts reported by the protocol layer and broadcasts
//! them to interested listeners. This module never decides membership itself:
//! no failure detection, no quorum. It only tracks and announces.
//!
//! ## Core Mechanisms
//! - **Topology**: concurrent `NodeId -> NodeRecord` registry with first-writer-wins registration.
//! - **Node Status**: the local node's `NotJoined -> Joined -> OperationsEnabled/Disabled -> Left` progression.
//! - **Ordered Delivery**: one worker thread delivers every event to ordinary listeners in enqueue order.
//! - **Out-of-Band Delivery**: listeners that opt out are served from a blocking pool with a bounded join,
//!   so a stalled callback cannot hold up anyone else.
//! - **Late Subscription Replay**: a new listener is told the current state exactly once.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod listeners;
pub mod notifier;
pub mod status;
pub mod topology;
pub mod types;
