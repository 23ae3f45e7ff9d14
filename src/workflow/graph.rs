/// Petgraph compilation and validation of workflow definitions
///
/// Converts a workflow into a directed graph, checks structure and node configs,
/// and rejects cycles before any run is created.

use crate::error::EngineError;
use crate::workflow::types::{Node, NodeType, Workflow};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub const HANDLE_TRUE: &str = "true";
pub const HANDLE_FALSE: &str = "false";

/// Internal representation of a workflow as a petgraph DAG
#[derive(Debug)]
pub struct WorkflowGraph {
    /// Node weights are the node definitions, edge weights the optional source handle
    graph: DiGraph<Node, Option<String>>,
    node_id_to_index: HashMap<String, NodeIndex>,
    topo_order: Vec<NodeIndex>,
}

impl WorkflowGraph {
    /// Build and validate the graph for a workflow
    pub fn build(workflow: &Workflow) -> Result<Self, EngineError> {
        tracing::debug!("🏗️ Building workflow graph for '{}' ({} nodes, {} edges)",
            workflow.id, workflow.nodes.len(), workflow.edges.len());

        if workflow.nodes.is_empty() {
            return Err(EngineError::Validation(format!("workflow '{}' has no nodes", workflow.id)));
        }

        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &workflow.nodes {
            if node_id_to_index.contains_key(&node.id) {
                return Err(EngineError::Validation(format!("duplicate node id '{}'", node.id)));
            }
            validate_node_config(node)?;
            let index = graph.add_node(node.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        let mut seen_edges = HashSet::new();
        for edge in &workflow.edges {
            let from_index = *node_id_to_index.get(&edge.from)
                .ok_or_else(|| EngineError::Validation(format!("edge references unknown node '{}'", edge.from)))?;
            let to_index = *node_id_to_index.get(&edge.to)
                .ok_or_else(|| EngineError::Validation(format!("edge references unknown node '{}'", edge.to)))?;

            if !edge.id.is_empty() && !seen_edges.insert(edge.id.as_str()) {
                return Err(EngineError::Validation(format!("duplicate edge id '{}'", edge.id)));
            }

            if let Some(handle) = &edge.source_handle {
                let source = &graph[from_index];
                if source.node_type != NodeType::Condition {
                    return Err(EngineError::Validation(format!(
                        "edge from '{}' uses handle '{}' but only condition nodes have handles",
                        edge.from, handle
                    )));
                }
                if handle != HANDLE_TRUE && handle != HANDLE_FALSE {
                    return Err(EngineError::Validation(format!(
                        "condition '{}' has unknown handle '{}' (expected \"true\" or \"false\")",
                        edge.from, handle
                    )));
                }
            }

            graph.add_edge(from_index, to_index, edge.source_handle.clone());
        }

        let topo_order = toposort(&graph, None).map_err(|cycle| {
            let node_id = graph[cycle.node_id()].id.clone();
            tracing::error!("❌ Workflow '{}' contains a cycle through '{}'", workflow.id, node_id);
            EngineError::Validation(format!("workflow contains a cycle through node '{}'", node_id))
        })?;

        tracing::debug!("✅ DAG validation successful - no cycles detected");

        Ok(Self {
            graph,
            node_id_to_index,
            topo_order,
        })
    }

    pub fn index_of(&self, node_id: &str) -> Option<NodeIndex> {
        self.node_id_to_index.get(node_id).copied()
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.graph[index]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Nodes in a valid topological order
    pub fn topo_order(&self) -> &[NodeIndex] {
        &self.topo_order
    }

    /// Nodes with no incoming edges
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.topo_order
            .iter()
            .copied()
            .filter(|&idx| self.incoming(idx).next().is_none())
            .collect()
    }

    /// Incoming edges as (edge, source node)
    pub fn incoming(&self, index: NodeIndex) -> impl Iterator<Item = (EdgeIndex, NodeIndex)> + '_ {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| (e.id(), e.source()))
    }

    /// Outgoing edges as (edge, target node, handle)
    pub fn outgoing(&self, index: NodeIndex) -> impl Iterator<Item = (EdgeIndex, NodeIndex, Option<&str>)> + '_ {
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|e| (e.id(), e.target(), e.weight().as_deref()))
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

/// Validate the presence of required config keys per node type
fn validate_node_config(node: &Node) -> Result<(), EngineError> {
    let required = match node.node_type {
        NodeType::Webhook => Some("token"),
        NodeType::CronTrigger => Some("schedule"),
        NodeType::Condition => Some("expression"),
        NodeType::Transform => Some("code"),
        NodeType::HTTPClient => Some("url"),
        NodeType::Agent => Some("endpoint"),
        NodeType::ManualTrigger => None,
    };
    if let Some(key) = required {
        // A condition expression may also be a literal; other keys are strings
        let present = match (node.node_type, node.config.get(key)) {
            (_, None | Some(Value::Null)) => false,
            (NodeType::Condition, Some(Value::String(s))) => !s.is_empty(),
            (NodeType::Condition, Some(_)) => true,
            (_, Some(_)) => node.config_str(key).map(|s| !s.is_empty()).unwrap_or(false),
        };
        if !present {
            return Err(EngineError::Validation(format!(
                "{:?} node '{}' requires a non-empty '{}' config value",
                node.node_type, node.id, key
            )));
        }
    }
    Ok(())
}

/// Validate a workflow without keeping the compiled graph
pub fn validate_workflow(workflow: &Workflow) -> Result<(), EngineError> {
    WorkflowGraph::build(workflow).map(|_| ())
}
