// Copyright 2024 Keel Build contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::nodes::{NodeId, RequestEdgeKind, RequestGraphNode};
use crate::request_graph::RequestGraph;

///
/// Bumped whenever the serialized shape changes. A mismatch is not an error for callers: stale
/// bytes decode to "no prior state".
///
pub const GRAPH_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
struct SerializedEdge {
    from: NodeId,
    to: NodeId,
    kind: RequestEdgeKind,
}

///
/// The on-disk shape of a `RequestGraph`: nodes in graph order, edges as `(from, to, kind)`
/// triples, and each auxiliary id-set as a sorted list. Sorting the sets (and relying on the
/// graph's stable iteration order) makes serialization reproducible: decoding and re-encoding
/// yields the same bytes.
///
#[derive(Debug, Deserialize, Serialize)]
struct SerializedRequestGraph {
    version: u32,
    nodes: Vec<RequestGraphNode>,
    edges: Vec<SerializedEdge>,
    invalid_request_ids: Vec<NodeId>,
    incomplete_request_ids: Vec<NodeId>,
    glob_node_ids: Vec<NodeId>,
    env_node_ids: Vec<NodeId>,
    option_node_ids: Vec<NodeId>,
    unpredictable_request_ids: Vec<NodeId>,
}

fn sorted_ids(ids: &HashSet<NodeId>) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = ids.iter().cloned().collect();
    ids.sort();
    ids
}

fn restore_id_set(
    graph: &RequestGraph,
    ids: Vec<NodeId>,
    name: &str,
) -> Result<HashSet<NodeId>, String> {
    for id in &ids {
        if !graph.graph.has_node(id) {
            return Err(format!(
                "The {name} id set references {id}, which is not present in the graph"
            ));
        }
    }
    Ok(ids.into_iter().collect())
}

impl RequestGraph {
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(&self.to_serialized())
            .map_err(|e| format!("Failed to serialize the request graph: {e}"))
    }

    fn to_serialized(&self) -> SerializedRequestGraph {
        SerializedRequestGraph {
            version: GRAPH_FORMAT_VERSION,
            nodes: self.graph.nodes().cloned().collect(),
            edges: self
                .graph
                .edges()
                .map(|(from, to, kind)| SerializedEdge {
                    from: from.clone(),
                    to: to.clone(),
                    kind,
                })
                .collect(),
            invalid_request_ids: sorted_ids(&self.invalid_request_ids),
            incomplete_request_ids: sorted_ids(&self.incomplete_request_ids),
            glob_node_ids: sorted_ids(&self.glob_node_ids),
            env_node_ids: sorted_ids(&self.env_node_ids),
            option_node_ids: sorted_ids(&self.option_node_ids),
            unpredictable_request_ids: sorted_ids(&self.unpredictable_request_ids),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<RequestGraph, String> {
        let serialized: SerializedRequestGraph = bincode::deserialize(bytes)
            .map_err(|e| format!("Failed to deserialize the request graph: {e}"))?;
        if serialized.version != GRAPH_FORMAT_VERSION {
            return Err(format!(
                "Unsupported request graph version {} (expected {})",
                serialized.version, GRAPH_FORMAT_VERSION
            ));
        }
        RequestGraph::from_serialized(serialized)
    }

    fn from_serialized(serialized: SerializedRequestGraph) -> Result<RequestGraph, String> {
        let mut graph = RequestGraph::new();
        for node in serialized.nodes {
            graph.graph.ensure_node(node);
        }
        for edge in serialized.edges {
            if !graph.graph.has_node(&edge.from) || !graph.graph.has_node(&edge.to) {
                return Err(format!(
                    "The edge {} -> {} references a node that is not present in the graph",
                    edge.from, edge.to
                ));
            }
            graph.graph.add_edge(&edge.from, &edge.to, edge.kind);
        }
        graph.invalid_request_ids = restore_id_set(&graph, serialized.invalid_request_ids, "invalid")?;
        graph.incomplete_request_ids =
            restore_id_set(&graph, serialized.incomplete_request_ids, "incomplete")?;
        graph.glob_node_ids = restore_id_set(&graph, serialized.glob_node_ids, "glob")?;
        graph.env_node_ids = restore_id_set(&graph, serialized.env_node_ids, "env")?;
        graph.option_node_ids = restore_id_set(&graph, serialized.option_node_ids, "option")?;
        graph.unpredictable_request_ids = restore_id_set(
            &graph,
            serialized.unpredictable_request_ids,
            "unpredictable",
        )?;
        Ok(graph)
    }
}
