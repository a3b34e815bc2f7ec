// Copyright 2024 Keel Build contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;

use fixedbitset::FixedBitSet;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
pub use petgraph::Direction;

pub type EntryId = petgraph::stable_graph::NodeIndex<u32>;

type PGraph<N, K> = StableDiGraph<N, K, u32>;

///
/// A node in a `Graph`. Nodes are interned by their stable id: two nodes with equal ids are the
/// same node, regardless of their payloads.
///
pub trait Node: Clone + Debug {
    type Id: Clone + Debug + Eq + Hash + Ord;

    fn id(&self) -> &Self::Id;
}

///
/// A label distinguishing the relation that an edge belongs to. An edge is keyed by
/// `(from, to, kind)`, so a pair of nodes may be connected once per kind.
///
pub trait EdgeId: Copy + Debug + Eq + Hash + 'static {}

///
/// A directed multigraph with labeled edges, keyed by stable node ids.
///
/// Nodes are never removed implicitly: removing an edge may orphan a node, but the node remains
/// in the graph until `remove_node` is called for its id.
///
pub struct Graph<N: Node, K: EdgeId> {
    pg: PGraph<N, K>,
    nodes: HashMap<N::Id, EntryId>,
}

impl<N: Node, K: EdgeId> Graph<N, K> {
    pub fn new() -> Graph<N, K> {
        Graph {
            pg: StableDiGraph::default(),
            nodes: HashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn entry_id(&self, id: &N::Id) -> Option<EntryId> {
        self.nodes.get(id).copied()
    }

    fn expect_entry_id(&self, id: &N::Id) -> EntryId {
        self.entry_id(id)
            .unwrap_or_else(|| panic!("Node {id:?} is not present in the graph."))
    }

    ///
    /// Ensures that the given node is present, and returns its id. If a node with the same id
    /// already exists, the existing payload is kept and the call is a no-op.
    ///
    pub fn ensure_node(&mut self, node: N) -> EntryId {
        if let Some(&id) = self.nodes.get(node.id()) {
            return id;
        }

        let node_id = node.id().clone();
        let id = self.pg.add_node(node);
        self.nodes.insert(node_id, id);
        id
    }

    pub fn has_node(&self, id: &N::Id) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &N::Id) -> Option<&N> {
        self.entry_id(id).and_then(|eid| self.pg.node_weight(eid))
    }

    pub fn node_mut(&mut self, id: &N::Id) -> Option<&mut N> {
        self.entry_id(id)
            .and_then(|eid| self.pg.node_weight_mut(eid))
    }

    ///
    /// Removes the node with the given id along with all of its incident edges, in either
    /// direction.
    ///
    pub fn remove_node(&mut self, id: &N::Id) -> Option<N> {
        let eid = self.nodes.remove(id)?;
        log::trace!("Removing node {id:?}");
        self.pg.remove_node(eid)
    }

    ///
    /// Adds an edge of the given kind. Edges are keyed by `(from, to, kind)`: re-adding an
    /// existing edge is a no-op. Both endpoints must already be present.
    ///
    pub fn add_edge(&mut self, from: &N::Id, to: &N::Id, kind: K) {
        let from_eid = self.expect_entry_id(from);
        let to_eid = self.expect_entry_id(to);
        if !self.has_edge_internal(from_eid, to_eid, kind) {
            self.pg.add_edge(from_eid, to_eid, kind);
        }
    }

    pub fn has_edge(&self, from: &N::Id, to: &N::Id, kind: K) -> bool {
        match (self.entry_id(from), self.entry_id(to)) {
            (Some(from_eid), Some(to_eid)) => self.has_edge_internal(from_eid, to_eid, kind),
            _ => false,
        }
    }

    fn has_edge_internal(&self, from: EntryId, to: EntryId, kind: K) -> bool {
        self.pg.edges_connecting(from, to).any(|e| *e.weight() == kind)
    }

    ///
    /// The nodes reached by following out-edges of the given kind from the given node.
    ///
    pub fn nodes_connected_from<'a>(
        &'a self,
        id: &N::Id,
        kind: K,
    ) -> impl Iterator<Item = &'a N> + 'a {
        self.neighbors(id, Direction::Outgoing, kind)
    }

    ///
    /// The nodes with an edge of the given kind pointing at the given node.
    ///
    pub fn nodes_connected_to<'a>(
        &'a self,
        id: &N::Id,
        kind: K,
    ) -> impl Iterator<Item = &'a N> + 'a {
        self.neighbors(id, Direction::Incoming, kind)
    }

    fn neighbors<'a>(
        &'a self,
        id: &N::Id,
        direction: Direction,
        kind: K,
    ) -> impl Iterator<Item = &'a N> + 'a {
        let eid = self.entry_id(id);
        eid.into_iter().flat_map(move |eid| {
            self.pg
                .edges_directed(eid, direction)
                .filter(move |e| *e.weight() == kind)
                .map(move |e| {
                    let neighbor = match direction {
                        Direction::Outgoing => e.target(),
                        Direction::Incoming => e.source(),
                    };
                    &self.pg[neighbor]
                })
        })
    }

    ///
    /// Atomically diffs the out-edges of the given kind from the given node against `new_targets`:
    /// edges to targets no longer present are removed, and edges to new targets are added. Targets
    /// must already be present in the graph. Nodes orphaned by edge removal are not deleted.
    ///
    pub fn replace_nodes_connected_to(&mut self, from: &N::Id, new_targets: &[N::Id], kind: K) {
        let from_eid = self.expect_entry_id(from);
        let new_eids: HashSet<EntryId> = new_targets
            .iter()
            .map(|id| self.expect_entry_id(id))
            .collect();

        let stale_edges: Vec<_> = self
            .pg
            .edges_directed(from_eid, Direction::Outgoing)
            .filter(|e| *e.weight() == kind && !new_eids.contains(&e.target()))
            .map(|e| e.id())
            .collect();
        log::trace!(
            "Replacing {} {kind:?} edge(s) from {from:?} with {} target(s)",
            stale_edges.len(),
            new_eids.len()
        );
        for edge_id in stale_edges {
            self.pg.remove_edge(edge_id);
        }

        let existing: HashSet<EntryId> = self
            .pg
            .edges_directed(from_eid, Direction::Outgoing)
            .filter(|e| *e.weight() == kind)
            .map(|e| e.target())
            .collect();
        for to_eid in new_eids {
            if !existing.contains(&to_eid) {
                self.pg.add_edge(from_eid, to_eid, kind);
            }
        }
    }

    ///
    /// All nodes, in stable insertion order. Serialization relies on this order being
    /// reproducible after a round trip.
    ///
    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.pg.node_weights()
    }

    ///
    /// All edges as `(from, to, kind)` triples, in stable insertion order.
    ///
    pub fn edges(&self) -> impl Iterator<Item = (&N::Id, &N::Id, K)> {
        self.pg.edge_indices().filter_map(move |edge_id| {
            let (source, target) = self.pg.edge_endpoints(edge_id)?;
            let kind = *self.pg.edge_weight(edge_id)?;
            Some((self.pg[source].id(), self.pg[target].id(), kind))
        })
    }

    ///
    /// Begins a Walk from the given roots, following only edges of the given kind.
    ///
    /// The Walk is breadth-first, includes the roots themselves, and carries a visited set: it
    /// terminates even if the edges of the walked kind form a cycle.
    ///
    pub fn walk<'a>(
        &'a self,
        roots: impl IntoIterator<Item = &'a N::Id>,
        direction: Direction,
        kind: K,
    ) -> Walk<'a, N, K> {
        let deque: VecDeque<EntryId> = roots
            .into_iter()
            .filter_map(|id| self.entry_id(id))
            .collect();
        Walk {
            graph: self,
            direction,
            kind,
            deque,
            walked: self.pg.visit_map(),
        }
    }
}

///
/// Represents the state of a particular walk through a Graph. Implements Iterator and has the
/// same lifetime as the Graph itself.
///
pub struct Walk<'a, N: Node, K: EdgeId> {
    graph: &'a Graph<N, K>,
    direction: Direction,
    kind: K,
    deque: VecDeque<EntryId>,
    walked: FixedBitSet,
}

impl<'a, N: Node + 'a, K: EdgeId> Iterator for Walk<'a, N, K> {
    type Item = &'a N;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.deque.pop_front() {
            if !self.walked.visit(id) {
                continue;
            }

            self.deque.extend(
                self.graph
                    .pg
                    .edges_directed(id, self.direction)
                    .filter(|e| *e.weight() == self.kind)
                    .map(|e| match self.direction {
                        Direction::Outgoing => e.target(),
                        Direction::Incoming => e.source(),
                    }),
            );
            return Some(&self.graph.pg[id]);
        }

        None
    }
}
