//! Execution planning over the workflow DAG.
//!
//! Planning happens once, at execution creation: the definition is validated
//! (ids, edge endpoints, acyclicity) and layered with Kahn's algorithm.
//! During execution, [`find_ready`] inspects current node statuses and edge
//! conditions to pick the next batch.
//!
//! An incoming edge is *satisfied* when its source completed (normally or
//! from cache) and its condition, if any, holds against the source's output.
//! It is *dead* when the condition is false or the source was skipped; dead
//! edges propagate: a node whose every incoming edge is dead is skipped,
//! which can kill further edges downstream.

use crate::condition;
use crate::error::ValidationError;
use crate::model::{EdgeDefinition, ExecutionContext, NodeDefinition, NodeId, NodeStatus};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Validates a workflow definition and computes its execution layers.
///
/// Layer 0 holds the nodes with no incoming edges; removing a layer yields
/// the next. Nodes within a layer are independent and may run concurrently.
///
/// # Errors
///
/// Returns an error for duplicate node ids, edges referencing unknown nodes,
/// or cycles.
pub fn plan(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
) -> Result<Vec<Vec<NodeId>>, ValidationError> {
    let mut indices: HashMap<&NodeId, NodeIndex> = HashMap::new();
    let mut graph: DiGraph<NodeId, ()> = DiGraph::new();

    for node in nodes {
        if indices.contains_key(&node.id) {
            return Err(ValidationError::DuplicateNodeId {
                node_id: node.id.to_string(),
            });
        }
        let index = graph.add_node(node.id.clone());
        indices.insert(&node.id, index);
    }

    for edge in edges {
        let source = *indices
            .get(&edge.source)
            .ok_or_else(|| ValidationError::UnknownEdgeEndpoint {
                node_id: edge.source.to_string(),
            })?;
        let target = *indices
            .get(&edge.target)
            .ok_or_else(|| ValidationError::UnknownEdgeEndpoint {
                node_id: edge.target.to_string(),
            })?;
        graph.add_edge(source, target, ());
    }

    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(ValidationError::CycleDetected);
    }

    // Kahn layering: repeatedly peel the zero-in-degree frontier.
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| {
            (
                idx,
                graph.edges_directed(idx, Direction::Incoming).count(),
            )
        })
        .collect();

    let mut layers = Vec::new();
    let mut remaining: HashSet<NodeIndex> = graph.node_indices().collect();

    while !remaining.is_empty() {
        let mut frontier: Vec<NodeIndex> = remaining
            .iter()
            .copied()
            .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) == 0)
            .collect();

        if frontier.is_empty() {
            // Unreachable after the cycle check, but fail loudly over looping.
            return Err(ValidationError::CycleDetected);
        }

        // Deterministic layer order for stable plans and tests.
        frontier.sort_by(|a, b| graph[*a].cmp(&graph[*b]));

        for &idx in &frontier {
            remaining.remove(&idx);
            for neighbor in graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&neighbor) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }

        layers.push(frontier.into_iter().map(|idx| graph[idx].clone()).collect());
    }

    Ok(layers)
}

/// The outcome of a readiness scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadySet {
    /// Pending nodes whose dependencies are satisfied, ready to run.
    pub ready: Vec<NodeId>,
    /// Pending nodes whose every incoming edge is dead; to be skipped.
    pub skipped: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Satisfied,
    Dead,
    Blocked,
    Pending,
}

/// Scans the execution for nodes whose dependencies are resolved.
#[must_use]
pub fn find_ready(ctx: &ExecutionContext) -> ReadySet {
    let mut statuses: HashMap<&NodeId, NodeStatus> = ctx
        .node_executions
        .iter()
        .map(|(id, exec)| (id, exec.status))
        .collect();

    let mut skipped = Vec::new();

    // Dead edges propagate: skipping a node can kill every edge into its
    // successors, so scan to a fixpoint.
    loop {
        let mut changed = false;

        for node in &ctx.nodes {
            if statuses.get(&node.id) != Some(&NodeStatus::Pending) {
                continue;
            }
            let incoming: Vec<EdgeState> = ctx
                .edges
                .iter()
                .filter(|edge| edge.target == node.id)
                .map(|edge| edge_state(edge, &statuses, &ctx.outputs))
                .collect();

            if !incoming.is_empty() && incoming.iter().all(|state| *state == EdgeState::Dead) {
                statuses.insert(&node.id, NodeStatus::Skipped);
                skipped.push(node.id.clone());
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    let ready = ctx
        .nodes
        .iter()
        .filter(|node| statuses.get(&node.id) == Some(&NodeStatus::Pending))
        .filter(|node| {
            ctx.edges
                .iter()
                .filter(|edge| edge.target == node.id)
                .all(|edge| {
                    matches!(
                        edge_state(edge, &statuses, &ctx.outputs),
                        EdgeState::Satisfied | EdgeState::Dead
                    )
                })
        })
        .map(|node| node.id.clone())
        .collect();

    ReadySet { ready, skipped }
}

fn edge_state(
    edge: &EdgeDefinition,
    statuses: &HashMap<&NodeId, NodeStatus>,
    outputs: &HashMap<NodeId, Value>,
) -> EdgeState {
    match statuses.get(&edge.source) {
        Some(NodeStatus::Skipped) => EdgeState::Dead,
        Some(NodeStatus::Completed | NodeStatus::Cached) => match &edge.condition {
            None => EdgeState::Satisfied,
            Some(condition) => {
                let output = outputs.get(&edge.source).unwrap_or(&Value::Null);
                if condition::evaluate(condition, output) {
                    EdgeState::Satisfied
                } else {
                    EdgeState::Dead
                }
            }
        },
        Some(NodeStatus::Failed | NodeStatus::Cancelled) => EdgeState::Blocked,
        _ => EdgeState::Pending,
    }
}
