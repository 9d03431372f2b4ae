//! Node descriptor trait and metadata types: node types declare an explicit
//! port schema rather than relying on runtime reflection.
//!
//! A node type's port shape is declared once, by the type itself, rather
//! than discovered by inspecting a live instance. This keeps the registry
//! (`crate::registry::NodeRegistry`) a plain lookup table instead of a
//! reflection layer.

use serde::{Deserialize, Serialize};

use crate::model::{PortDirection, PortKind};
use crate::value::PortConfig;

/// Trait for node implementations that can describe their own port schema.
///
/// # Example
///
/// ```ignore
/// use chaingraph_engine::{NodeDescriptor, NodeMetadata, PortTemplate, NodeCategory};
/// use chaingraph_engine::{PortDirection, PortConfig};
///
/// impl NodeDescriptor for AddNode {
///     fn descriptor() -> NodeMetadata {
///         NodeMetadata {
///             node_type: "add".to_string(),
///             category: NodeCategory::Processing,
///             label: "Add".to_string(),
///             description: "Sums two numbers".to_string(),
///             ports: vec![
///                 PortTemplate::data("a", PortDirection::Input, PortConfig::Number, true),
///                 PortTemplate::data("b", PortDirection::Input, PortConfig::Number, true),
///                 PortTemplate::data("sum", PortDirection::Output, PortConfig::Number, false),
///             ],
///         }
///     }
/// }
/// ```
pub trait NodeDescriptor {
    /// Get the static metadata for this node type.
    fn descriptor() -> NodeMetadata
    where
        Self: Sized;
}

/// Broad grouping for UI presentation; carries no execution semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Input,
    Output,
    Processing,
    Control,
    Utility,
}

/// Complete static metadata for a node type: everything the registry and an
/// authoring UI need without instantiating the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub node_type: String,
    pub category: NodeCategory,
    pub label: String,
    pub description: String,
    pub ports: Vec<PortTemplate>,
}

impl NodeMetadata {
    pub fn system_ports(&self) -> impl Iterator<Item = &PortTemplate> {
        self.ports.iter().filter(|p| p.kind == PortKind::System)
    }

    pub fn data_ports(&self) -> impl Iterator<Item = &PortTemplate> {
        self.ports.iter().filter(|p| p.kind == PortKind::Data)
    }
}

/// A template for one port on a node type. Concrete [`crate::model::Port`]s
/// are stamped out from these when a flow is authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortTemplate {
    pub key: String,
    pub direction: PortDirection,
    pub kind: PortKind,
    pub config: PortConfig,
    pub required: bool,
}

impl PortTemplate {
    pub fn data(key: impl Into<String>, direction: PortDirection, config: PortConfig, required: bool) -> Self {
        Self {
            key: key.into(),
            direction,
            kind: PortKind::Data,
            config,
            required,
        }
    }

    pub fn system(key: impl Into<String>, direction: PortDirection) -> Self {
        Self {
            key: key.into(),
            direction,
            kind: PortKind::System,
            config: PortConfig::Boolean,
            required: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_port_template_defaults() {
        let port = PortTemplate::data("input", PortDirection::Input, PortConfig::String, true);
        assert_eq!(port.key, "input");
        assert!(port.required);
        assert_eq!(port.kind, PortKind::Data);
    }

    #[test]
    fn system_port_template_is_boolean_and_unrequired() {
        let port = PortTemplate::system("then", PortDirection::Output);
        assert!(!port.required);
        assert!(matches!(port.config, PortConfig::Boolean));
    }

    #[test]
    fn node_metadata_separates_system_and_data_ports() {
        let metadata = NodeMetadata {
            node_type: "add".to_string(),
            category: NodeCategory::Processing,
            label: "Add".to_string(),
            description: "Sums two numbers".to_string(),
            ports: vec![
                PortTemplate::system("start", PortDirection::Input),
                PortTemplate::system("then", PortDirection::Output),
                PortTemplate::data("a", PortDirection::Input, PortConfig::Number, true),
                PortTemplate::data("b", PortDirection::Input, PortConfig::Number, true),
                PortTemplate::data("sum", PortDirection::Output, PortConfig::Number, false),
            ],
        };

        assert_eq!(metadata.system_ports().count(), 2);
        assert_eq!(metadata.data_ports().count(), 3);
    }

    #[test]
    fn node_metadata_serializes_camel_case() {
        let metadata = NodeMetadata {
            node_type: "add".to_string(),
            category: NodeCategory::Processing,
            label: "Add".to_string(),
            description: "Sums two numbers".to_string(),
            ports: vec![PortTemplate::data("a", PortDirection::Input, PortConfig::Number, true)],
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("nodeType"));
    }
}
