//! Fluent builder for constructing flows programmatically.
//!
//! Mirrors the source graph's node/edge shape but keeps system and data
//! ports on the same node, since a flow-control branch and a value
//! computation live in one graph here rather than two.

use crate::model::{Edge, Flow, Node, Port, PortDirection};
use crate::value::PortConfig;

/// Fluent builder for a [`Flow`].
///
/// # Example
///
/// ```ignore
/// let flow = FlowBuilder::new("f1", "Add Two Numbers")
///     .add_node("a", "number", "A")
///     .add_data_port("a", "out", PortDirection::Output, PortConfig::Number)
///     .add_node("sum", "add", "Sum")
///     .add_data_port("sum", "in_a", PortDirection::Input, PortConfig::Number)
///     .add_data_edge("a", "out", "sum", "in_a")
///     .build();
/// ```
pub struct FlowBuilder {
    flow: Flow,
    edge_counter: usize,
}

impl FlowBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            flow: Flow::new(id, name),
            edge_counter: 0,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.flow.metadata.description = description.into();
        self
    }

    /// Add a node with no ports. Follow with `add_system_port`/`add_data_port`
    /// calls to attach ports to it.
    pub fn add_node(mut self, id: impl Into<String>, node_type: impl Into<String>, title: impl Into<String>) -> Self {
        self.flow.nodes.push(Node {
            id: id.into(),
            node_type: node_type.into(),
            title: title.into(),
            category: String::new(),
            config: serde_json::Value::Null,
            ports: Vec::new(),
            version: 0,
        });
        self
    }

    /// Set the `config` blob on the most recently added node.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        if let Some(node) = self.flow.nodes.last_mut() {
            node.config = config;
        }
        self
    }

    /// Add a system (flow-control) port to the most recently added node.
    /// The port's id is `{node_id}.{key}`.
    pub fn add_system_port(mut self, node_id: impl Into<String>, key: impl Into<String>, direction: PortDirection) -> Self {
        let node_id = node_id.into();
        let key = key.into();
        if let Some(node) = self.flow.nodes.iter_mut().find(|n| n.id == node_id) {
            let port_id = format!("{node_id}.{key}");
            node.ports.push(Port::system(port_id, key, direction));
        }
        self
    }

    /// Add a data port to a node, with an explicit port id (unique within
    /// the node).
    pub fn add_data_port(
        mut self,
        node_id: impl Into<String>,
        port_id: impl Into<String>,
        direction: PortDirection,
        config: PortConfig,
    ) -> Self {
        let node_id = node_id.into();
        let port_id = port_id.into();
        if let Some(node) = self.flow.nodes.iter_mut().find(|n| n.id == node_id) {
            let key = port_id.clone();
            let port = match direction {
                PortDirection::Input => Port::data_input(port_id, key, config),
                _ => Port::data_output(port_id, key, config),
            };
            node.ports.push(port);
        }
        self
    }

    /// Add an edge between a system output port and a system input port
    /// (auto-generates the edge id). Port ids are resolved as
    /// `{node_id}.{port_key}`, matching `add_system_port`.
    pub fn add_system_edge(
        mut self,
        source_node: impl Into<String>,
        source_port_key: impl Into<String>,
        target_node: impl Into<String>,
        target_port_key: impl Into<String>,
    ) -> Self {
        let source_node = source_node.into();
        let source_port_key = source_port_key.into();
        let target_node = target_node.into();
        let target_port_key = target_port_key.into();
        self.edge_counter += 1;
        self.flow.edges.push(Edge {
            id: format!("edge-{}", self.edge_counter),
            source_port_id: format!("{source_node}.{source_port_key}"),
            source_node_id: source_node,
            target_port_id: format!("{target_node}.{target_port_key}"),
            target_node_id: target_node,
            metadata: serde_json::Value::Null,
        });
        self
    }

    /// Add an edge between two data ports, referenced by their full port
    /// ids (as passed to `add_data_port`).
    pub fn add_data_edge(
        mut self,
        source_node: impl Into<String>,
        source_port_id: impl Into<String>,
        target_node: impl Into<String>,
        target_port_id: impl Into<String>,
    ) -> Self {
        self.edge_counter += 1;
        self.flow.edges.push(Edge {
            id: format!("edge-{}", self.edge_counter),
            source_node_id: source_node.into(),
            source_port_id: source_port_id.into(),
            target_node_id: target_node.into(),
            target_port_id: target_port_id.into(),
            metadata: serde_json::Value::Null,
        });
        self
    }

    /// Bind a named event to a child flow.
    pub fn bind_child_flow(mut self, event_name: impl Into<String>, flow_id: impl Into<String>) -> Self {
        self.flow.event_child_flows.insert(event_name.into(), flow_id.into());
        self
    }

    /// Build the flow without validation. Callers should run
    /// `crate::validation::validate_flow` before executing it.
    pub fn build(self) -> Flow {
        self.flow
    }
}
