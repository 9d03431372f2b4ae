//! Node type registry for dynamic node resolution.
//!
//! Maps `node_type` strings to executors and static metadata. A flow only
//! ever stores the `node_type` string; behavior is looked up here at
//! execution time rather than carried in the flow itself.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{ExecutionContext, NodeCallArgs, NodeOutput};
use crate::descriptor::{NodeCategory, NodeMetadata};
use crate::error::{EngineError, Result};

/// Per-node-type executor. One implementation handles exactly one
/// `node_type`.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeOutput>;
}

/// Factory for creating or returning a shared [`NodeExecutor`].
pub trait NodeExecutorFactory: Send + Sync {
    fn create_executor(&self) -> Arc<dyn NodeExecutor>;
}

struct RegistryEntry {
    metadata: NodeMetadata,
    factory: Option<Arc<dyn NodeExecutorFactory>>,
}

/// Registry of node types with their metadata and executors.
///
/// # Composability
///
/// ```ignore
/// let mut registry = NodeRegistry::new();
/// registry.merge(builtin_nodes());
/// ```
pub struct NodeRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, metadata: NodeMetadata, factory: Arc<dyn NodeExecutorFactory>) {
        self.entries.insert(
            metadata.node_type.clone(),
            RegistryEntry {
                metadata,
                factory: Some(factory),
            },
        );
    }

    /// Register a node type using an async callback (useful for tests and
    /// for bridging FFI callbacks without a dedicated struct per node type).
    /// The callback receives an owned snapshot of the context's inputs and
    /// cannot call `emit_event`; nodes that need to emit events should
    /// implement [`NodeExecutor`] directly.
    pub fn register_callback<F, Fut>(&mut self, metadata: NodeMetadata, callback: F)
    where
        F: Fn(NodeCallArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<NodeOutput>> + Send + 'static,
    {
        let executor = Arc::new(CallbackNodeExecutor {
            callback: Box::new(move |args| Box::pin(callback(args))),
        });
        let factory = Arc::new(SharedExecutorFactory {
            executor: executor as Arc<dyn NodeExecutor>,
        });
        self.register(metadata, factory);
    }

    /// Register metadata with no executor (e.g. for UI palette listing).
    pub fn register_metadata(&mut self, metadata: NodeMetadata) {
        self.entries.insert(
            metadata.node_type.clone(),
            RegistryEntry {
                metadata,
                factory: None,
            },
        );
    }

    pub fn get_metadata(&self, node_type: &str) -> Option<&NodeMetadata> {
        self.entries.get(node_type).map(|e| &e.metadata)
    }

    pub fn all_metadata(&self) -> Vec<&NodeMetadata> {
        self.entries.values().map(|e| &e.metadata).collect()
    }

    pub fn metadata_by_category(&self) -> HashMap<NodeCategory, Vec<&NodeMetadata>> {
        let mut grouped: HashMap<NodeCategory, Vec<&NodeMetadata>> = HashMap::new();
        for entry in self.entries.values() {
            grouped.entry(entry.metadata.category).or_default().push(&entry.metadata);
        }
        grouped
    }

    pub fn get_executor(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>> {
        self.entries
            .get(node_type)
            .and_then(|e| e.factory.as_ref())
            .map(|f| f.create_executor())
            .ok_or_else(|| EngineError::not_found(format!("no executor registered for node type '{node_type}'")))
    }

    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.entries.contains_key(node_type)
    }

    pub fn node_types(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Entries from `other` override entries in `self` that share a node_type.
    pub fn merge(&mut self, other: NodeRegistry) {
        self.entries.extend(other.entries);
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Async callback-based [`NodeExecutor`], used by `register_callback` and
/// for bridging node implementations that live behind an FFI boundary.
pub struct CallbackNodeExecutor {
    callback: Box<dyn Fn(NodeCallArgs) -> Pin<Box<dyn std::future::Future<Output = Result<NodeOutput>> + Send>> + Send + Sync>,
}

#[async_trait]
impl NodeExecutor for CallbackNodeExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeOutput> {
        (self.callback)(ctx.snapshot()).await
    }
}

struct SharedExecutorFactory {
    executor: Arc<dyn NodeExecutor>,
}

impl NodeExecutorFactory for SharedExecutorFactory {
    fn create_executor(&self) -> Arc<dyn NodeExecutor> {
        Arc::clone(&self.executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::CancellationToken;
    use crate::descriptor::PortTemplate;
    use crate::model::PortDirection;
    use crate::value::{PortConfig, PortValue};
    use std::collections::HashMap as StdHashMap;

    fn test_metadata(node_type: &str) -> NodeMetadata {
        NodeMetadata {
            node_type: node_type.to_string(),
            category: NodeCategory::Processing,
            label: format!("Test {node_type}"),
            description: "test node".to_string(),
            ports: vec![PortTemplate::data("input", PortDirection::Input, PortConfig::String, false)],
        }
    }

    #[test]
    fn register_and_lookup_metadata() {
        let mut registry = NodeRegistry::new();
        registry.register_metadata(test_metadata("test-node"));

        assert!(registry.has_node_type("test-node"));
        assert!(!registry.has_node_type("unknown"));
        assert_eq!(registry.get_metadata("test-node").unwrap().label, "Test test-node");
    }

    #[test]
    fn merge_overrides_duplicate_node_types() {
        let mut registry1 = NodeRegistry::new();
        let mut meta1 = test_metadata("node-a");
        meta1.label = "Original".to_string();
        registry1.register_metadata(meta1);

        let mut registry2 = NodeRegistry::new();
        let mut meta2 = test_metadata("node-a");
        meta2.label = "Override".to_string();
        registry2.register_metadata(meta2);

        registry1.merge(registry2);
        assert_eq!(registry1.get_metadata("node-a").unwrap().label, "Override");
    }

    #[test]
    fn metadata_by_category_groups_entries() {
        let mut registry = NodeRegistry::new();
        let mut input_meta = test_metadata("text-input");
        input_meta.category = NodeCategory::Input;
        registry.register_metadata(input_meta);
        registry.register_metadata(test_metadata("add"));

        let grouped = registry.metadata_by_category();
        assert_eq!(grouped.get(&NodeCategory::Input).unwrap().len(), 1);
        assert_eq!(grouped.get(&NodeCategory::Processing).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registered_callback_executes_and_produces_output() {
        let mut registry = NodeRegistry::new();
        registry.register_callback(test_metadata("echo"), |ctx| async move {
            let value = ctx.require_input("input")?.clone();
            Ok(NodeOutput::new().with_data("output", value).activate("then"))
        });

        let executor = registry.get_executor("echo").unwrap();
        let mut inputs = StdHashMap::new();
        inputs.insert("input".to_string(), PortValue::scalar(serde_json::json!("hi")));
        let ctx = ExecutionContext::new(
            "exec-1",
            "node-1",
            inputs,
            Arc::new(EngineConfig::default()),
            CancellationToken::new(),
        );

        let output = executor.execute(&ctx).await.unwrap();
        assert_eq!(output.system_outputs, vec!["then".to_string()]);
        assert!(output.data.contains_key("output"));
    }

    #[test]
    fn get_executor_on_unknown_type_errors() {
        let registry = NodeRegistry::new();
        assert!(registry.get_executor("unknown").is_err());
    }
}
