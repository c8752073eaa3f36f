//! Dirty-flag dependency graph.
//!
//! Each node stands for a piece of derived GPU state (a buffer, a bind
//! group, a texture). Setters call [`DependencyGraph::notify_changed`] on the
//! node they touched; the renderer later walks its nodes leaves first and
//! rebuilds whatever [`DependencyGraph::take_dirty`] reports.
//!
//! Nodes only know their dependents. Edges are checked when added, so the
//! graph is always acyclic and propagation cannot loop.

use slotmap::{new_key_type, SecondaryMap, SlotMap};
use smallvec::SmallVec;

use crate::error::GraphError;

new_key_type! {
    /// Identifier for a node in a [`DependencyGraph`].
    pub struct NodeId;
}

struct DependencyNode {
    name: &'static str,
    dirty: bool,
    dependents: SmallVec<[NodeId; 4]>,
}

/// Arena of dependency nodes.
#[derive(Default)]
pub struct DependencyGraph {
    nodes: SlotMap<NodeId, DependencyNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. New nodes start dirty so their state is built on first use.
    pub fn add_node(&mut self, name: &'static str) -> NodeId {
        self.nodes.insert(DependencyNode {
            name,
            dirty: true,
            dependents: SmallVec::new(),
        })
    }

    /// Record that `dependent` must be rebuilt whenever `of` changes.
    ///
    /// Adding an existing edge is a no-op. An edge that would close a cycle
    /// is rejected and the graph is left unchanged.
    pub fn add_dependent(&mut self, of: NodeId, dependent: NodeId) -> Result<(), GraphError> {
        let (from, to) = match (self.nodes.get(of), self.nodes.get(dependent)) {
            (Some(a), Some(b)) => (a.name, b.name),
            _ => return Err(GraphError::UnknownNode),
        };
        if self.reaches(dependent, of) {
            return Err(GraphError::Cycle { from, to });
        }
        let Some(node) = self.nodes.get_mut(of) else {
            return Err(GraphError::UnknownNode);
        };
        if !node.dependents.contains(&dependent) {
            node.dependents.push(dependent);
        }
        Ok(())
    }

    /// Mark `id` and everything downstream of it dirty.
    ///
    /// Each node is visited once per call, even when it is reachable along
    /// several paths.
    pub fn notify_changed(&mut self, id: NodeId) {
        let mut visited: SecondaryMap<NodeId, ()> = SecondaryMap::new();
        let mut stack: SmallVec<[NodeId; 8]> = SmallVec::new();
        stack.push(id);

        while let Some(current) = stack.pop() {
            if visited.insert(current, ()).is_some() {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(current) {
                node.dirty = true;
                stack.extend(node.dependents.iter().copied());
            }
        }
    }

    pub fn is_dirty(&self, id: NodeId) -> bool {
        self.nodes.get(id).map(|n| n.dirty).unwrap_or(false)
    }

    /// Resolve a node: report whether it was dirty and clear only its flag.
    pub fn take_dirty(&mut self, id: NodeId) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => std::mem::replace(&mut node.dirty, false),
            None => false,
        }
    }

    /// Names of every dirty node, for diagnostics.
    pub fn dirty_nodes(&self) -> Vec<&'static str> {
        self.nodes
            .values()
            .filter(|n| n.dirty)
            .map(|n| n.name)
            .collect()
    }

    pub fn name(&self, id: NodeId) -> Option<&'static str> {
        self.nodes.get(id).map(|n| n.name)
    }

    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if `to` is reachable from `from` (a node reaches itself).
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited: SecondaryMap<NodeId, ()> = SecondaryMap::new();
        let mut stack: SmallVec<[NodeId; 8]> = SmallVec::new();
        stack.push(from);

        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if visited.insert(current, ()).is_some() {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                stack.extend(node.dependents.iter().copied());
            }
        }
        false
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.nodes.len())
            .field("dirty", &self.dirty_nodes())
            .finish()
    }
}
