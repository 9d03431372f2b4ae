//! Flow validation: edge endpoint existence, port direction/type
//! compatibility, and the system-port no-cycle invariant.
//!
//! Data cycles are legal when they cross a stream port, so cycle detection
//! only walks the *system*-edge subgraph, unlike a generic DAG validator
//! that would reject any cycle.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Flow, PortDirection, PortKind};
use crate::value::PortConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    UnknownNode { edge_id: String, node_id: String },
    UnknownPort { edge_id: String, node_id: String, port_id: String },
    IncompatibleDirection { edge_id: String },
    IncompatibleTypes {
        edge_id: String,
        source_type: String,
        target_type: String,
    },
    SystemCycle,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNode { edge_id, node_id } => {
                write!(f, "edge '{edge_id}' references unknown node '{node_id}'")
            }
            Self::UnknownPort { edge_id, node_id, port_id } => write!(
                f,
                "edge '{edge_id}' references unknown port '{port_id}' on node '{node_id}'"
            ),
            Self::IncompatibleDirection { edge_id } => {
                write!(f, "edge '{edge_id}' connects incompatible port directions")
            }
            Self::IncompatibleTypes {
                edge_id,
                source_type,
                target_type,
            } => write!(
                f,
                "edge '{edge_id}' connects incompatible types: {source_type} -> {target_type}"
            ),
            Self::SystemCycle => write!(f, "cycle detected among system (flow-control) ports"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a flow's structural invariants. Returns every error found,
/// not just the first.
pub fn validate_flow(flow: &Flow) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_edges(flow, &mut errors);
    detect_system_cycles(flow, &mut errors);
    errors
}

fn validate_edges(flow: &Flow, errors: &mut Vec<ValidationError>) {
    for edge in &flow.edges {
        let source_node = match flow.node(&edge.source_node_id) {
            Some(n) => n,
            None => {
                errors.push(ValidationError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: edge.source_node_id.clone(),
                });
                continue;
            }
        };
        let target_node = match flow.node(&edge.target_node_id) {
            Some(n) => n,
            None => {
                errors.push(ValidationError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: edge.target_node_id.clone(),
                });
                continue;
            }
        };
        let source_port = match source_node.port(&edge.source_port_id) {
            Some(p) => p,
            None => {
                errors.push(ValidationError::UnknownPort {
                    edge_id: edge.id.clone(),
                    node_id: edge.source_node_id.clone(),
                    port_id: edge.source_port_id.clone(),
                });
                continue;
            }
        };
        let target_port = match target_node.port(&edge.target_port_id) {
            Some(p) => p,
            None => {
                errors.push(ValidationError::UnknownPort {
                    edge_id: edge.id.clone(),
                    node_id: edge.target_node_id.clone(),
                    port_id: edge.target_port_id.clone(),
                });
                continue;
            }
        };

        let source_ok = matches!(source_port.direction, PortDirection::Output | PortDirection::Passthrough);
        let target_ok = matches!(target_port.direction, PortDirection::Input | PortDirection::Passthrough);
        if !source_ok || !target_ok {
            errors.push(ValidationError::IncompatibleDirection {
                edge_id: edge.id.clone(),
            });
        }

        if source_port.kind == PortKind::Data && target_port.kind == PortKind::Data {
            if !PortConfig::is_compatible(&source_port.config, &target_port.config) {
                errors.push(ValidationError::IncompatibleTypes {
                    edge_id: edge.id.clone(),
                    source_type: source_port.config.tag().to_string(),
                    target_type: target_port.config.tag().to_string(),
                });
            }
        }
    }
}

/// Kahn's algorithm restricted to the system-edge subgraph: a cycle here
/// would mean the flow-control graph itself never terminates.
fn detect_system_cycles(flow: &Flow, errors: &mut Vec<ValidationError>) {
    let system_edges: Vec<_> = flow
        .edges
        .iter()
        .filter(|e| is_system_edge(flow, e))
        .collect();

    let mut in_degree: HashMap<&str, usize> = flow.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for edge in &system_edges {
        *in_degree.entry(edge.target_node_id.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id) {
            continue;
        }
        for edge in &system_edges {
            if edge.source_node_id == node_id {
                if let Some(deg) = in_degree.get_mut(edge.target_node_id.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(&edge.target_node_id);
                    }
                }
            }
        }
    }

    if visited.len() < flow.nodes.len() {
        errors.push(ValidationError::SystemCycle);
    }
}

/// True iff both endpoints of `edge` are system ports.
pub fn is_system_edge(flow: &Flow, edge: &crate::model::Edge) -> bool {
    let source_is_system = flow
        .node(&edge.source_node_id)
        .and_then(|n| n.port(&edge.source_port_id))
        .is_some_and(|p| p.kind == PortKind::System);
    let target_is_system = flow
        .node(&edge.target_node_id)
        .and_then(|n| n.port(&edge.target_port_id))
        .is_some_and(|p| p.kind == PortKind::System);
    source_is_system && target_is_system
}
