//! Node Registry
//!
//! Holds every node record currently known to this engine. Lookups and the
//! idempotent first-writer-wins insert run concurrently on the shared side of
//! the structure lock; removals, `clear` and rejoin bulk registration take
//! the exclusive side so they never interleave with a half-finished insert.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::sync::Arc;

use super::types::{NodeId, NodeRecord};

pub struct Topology {
    nodes: DashMap<NodeId, Arc<NodeRecord>>,
    structure: RwLock<()>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            structure: RwLock::new(()),
        }
    }

    /// Returns the record for `id`, creating a remote record if none exists.
    ///
    /// Racing callers for the same id all receive the record of whichever
    /// insert landed first.
    pub fn register_or_get(&self, id: NodeId) -> Arc<NodeRecord> {
        let _shared = self.structure.read();
        self.nodes
            .entry(id)
            .or_insert_with(|| Arc::new(NodeRecord::remote(id)))
            .value()
            .clone()
    }

    /// Inserts a remote record only if `id` is unknown.
    ///
    /// Returns `Some` exclusively to the caller that created the record, which
    /// is what makes remote `NODE_JOIN` fire once per node.
    pub fn register_if_absent(&self, id: NodeId) -> Option<Arc<NodeRecord>> {
        let _shared = self.structure.read();
        match self.nodes.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let record = Arc::new(NodeRecord::remote(id));
                vacant.insert(record.clone());
                Some(record)
            }
        }
    }

    /// Registers `id` as the local node.
    ///
    /// A remote record seen earlier for the same id (e.g. from a topology
    /// query) is replaced, since the local flag is fixed at creation.
    pub fn register_local(&self, id: NodeId) -> Arc<NodeRecord> {
        let _exclusive = self.structure.write();
        Self::insert_local(&self.nodes, id)
    }

    /// Bulk registration used when this node (re)joins: the local record plus
    /// every peer reported by the membership layer, applied atomically with
    /// respect to other structural changes.
    pub fn register_members(&self, local: NodeId, peers: &[NodeId]) -> Arc<NodeRecord> {
        let _exclusive = self.structure.write();
        let record = Self::insert_local(&self.nodes, local);
        for peer in peers.iter().filter(|peer| **peer != local) {
            self.nodes
                .entry(*peer)
                .or_insert_with(|| Arc::new(NodeRecord::remote(*peer)));
        }
        tracing::debug!(
            "Registered local node {} with {} peer(s), topology size {}",
            local,
            peers.len(),
            self.nodes.len()
        );
        record
    }

    fn insert_local(nodes: &DashMap<NodeId, Arc<NodeRecord>>, id: NodeId) -> Arc<NodeRecord> {
        match nodes.entry(id) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_local {
                    occupied.insert(Arc::new(NodeRecord::local(id)));
                }
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => vacant
                .insert(Arc::new(NodeRecord::local(id)))
                .value()
                .clone(),
        }
    }

    pub fn remove(&self, id: &NodeId) -> Option<Arc<NodeRecord>> {
        let _exclusive = self.structure.write();
        self.nodes.remove(id).map(|(_, record)| record)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let _shared = self.structure.read();
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<NodeRecord>> {
        let _shared = self.structure.read();
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    /// Copy of all known records, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<NodeRecord>> {
        let _shared = self.structure.read();
        let mut records: Vec<Arc<NodeRecord>> =
            self.nodes.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn clear(&self) {
        let _exclusive = self.structure.write();
        let dropped = self.nodes.len();
        self.nodes.clear();
        tracing::debug!("Cleared topology ({} node(s) dropped)", dropped);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}
