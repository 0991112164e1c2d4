use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of a cluster participant, derived from its channel id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn channel_id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientID[{}]", self.0)
    }
}

/// A known member of the cluster.
///
/// Records are created the first time an id is seen and are never mutated
/// afterwards; they are shared as `Arc<NodeRecord>` so every holder of a
/// given id observes the same record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub handle: u64,
    pub is_local: bool,
}

impl NodeRecord {
    pub fn remote(id: NodeId) -> Self {
        Self {
            id,
            name: id.to_string(),
            handle: id.channel_id(),
            is_local: false,
        }
    }

    pub fn local(id: NodeId) -> Self {
        Self {
            is_local: true,
            ..Self::remote(id)
        }
    }
}

/// Kinds of membership notifications delivered to listeners.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    NodeJoin,
    NodeLeft,
    OperationsEnabled,
    OperationsDisabled,
    NodeRejoined,
    NodeError,
}

impl EventType {
    /// Short label used in log lines and event display.
    pub fn label(&self) -> &'static str {
        match self {
            EventType::NodeJoin => "JOINED",
            EventType::NodeLeft => "LEFT",
            EventType::OperationsEnabled => "ENABLED",
            EventType::OperationsDisabled => "DISABLED",
            EventType::NodeRejoined => "REJOINED",
            EventType::NodeError => "NODE ERROR",
        }
    }
}

/// An immutable `(EventType, NodeRecord)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: EventType,
    pub node: Arc<NodeRecord>,
}

impl ClusterEvent {
    pub fn new(kind: EventType, node: Arc<NodeRecord>) -> Self {
        Self { kind, node }
    }
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.node.name, self.kind.label())
    }
}

/// Lifecycle state of the local node.
///
/// The variants form a single progression: a node is joined before its
/// operations can be enabled or disabled, and `Left` is only reachable from
/// a joined state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    NotJoined,
    Joined,
    OperationsEnabled,
    OperationsDisabled,
    Left,
}

impl EngineState {
    pub fn is_node_joined(&self) -> bool {
        matches!(
            self,
            EngineState::Joined | EngineState::OperationsEnabled | EngineState::OperationsDisabled
        )
    }

    pub fn are_operations_enabled(&self) -> bool {
        *self == EngineState::OperationsEnabled
    }

    pub fn is_node_left(&self) -> bool {
        *self == EngineState::Left
    }
}
