//! Cluster Events Library
//!
//! Membership and event-notification core of a clustered runtime. Caches,
//! persistence and messaging subsystems consult it to learn whether this node
//! is connected, whether it may perform cluster operations, and who else is
//! in the cluster.
//!
//! ## Architecture Modules
//! - **`cluster`**: The engine (`ClusterEngine`) together with its topology, node-status state
//!   machine, listener registry, and the ordered/out-of-band event dispatcher.
//!   The protocol layer feeds it through the `MembershipEvents` trait; consumers subscribe with
//!   `ClusterListener` implementations.

pub mod cluster;
