//! A small built-in node library so a flow JSON file is runnable out of the
//! box, without a separate plugin-loading mechanism. Not part of the core
//! engine: the registry is dependency-injected (`NodeRegistry` is
//! constructed here and handed to `ExecutionEngine::new`), exactly the way
//! the engine's own tests build a local registry instead of relying on a
//! process-wide singleton.

use std::sync::Arc;

use async_trait::async_trait;
use chaingraph_engine::{
    ExecutionContext, NodeCategory, NodeDescriptor, NodeExecutor, NodeExecutorFactory, NodeMetadata,
    NodeOutput, NodeRegistry, PortConfig, PortDirection, PortTemplate, Result,
};

/// Echoes its `value` port straight back out, activating `then`. With a
/// `default_value` set on the port by the flow author this doubles as a
/// constant/literal source; with an incoming edge it's a plain relay.
struct PassthroughNode;

impl NodeDescriptor for PassthroughNode {
    fn descriptor() -> NodeMetadata {
        NodeMetadata {
            node_type: "passthrough".to_string(),
            category: NodeCategory::Utility,
            label: "Passthrough".to_string(),
            description: "Relays its input value, or a configured default, to its output".to_string(),
            ports: vec![
                PortTemplate::system("start", PortDirection::Input),
                PortTemplate::system("then", PortDirection::Output),
                PortTemplate::data("value", PortDirection::Passthrough, PortConfig::Any { adopted: None }, false),
            ],
        }
    }
}

#[async_trait]
impl NodeExecutor for PassthroughNode {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeOutput> {
        let mut output = NodeOutput::new().activate("then");
        if let Some(value) = ctx.input("value") {
            output = output.with_data("value", value.clone());
        }
        Ok(output)
    }
}

/// Sums two numeric inputs.
struct AddNode;

impl NodeDescriptor for AddNode {
    fn descriptor() -> NodeMetadata {
        NodeMetadata {
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
        }
    }
}

#[async_trait]
impl NodeExecutor for AddNode {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeOutput> {
        let a = ctx.require_input("a")?.as_scalar().and_then(|v| v.as_f64()).unwrap_or(0.0);
        let b = ctx.require_input("b")?.as_scalar().and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(NodeOutput::new()
            .with_data("sum", chaingraph_engine::PortValue::scalar(serde_json::json!(a + b)))
            .activate("then"))
    }
}

/// Terminal sink: logs its `value` input at info level. Has no data
/// outputs and activates no system port, so it ends its branch.
struct PrintNode;

impl NodeDescriptor for PrintNode {
    fn descriptor() -> NodeMetadata {
        NodeMetadata {
            node_type: "print".to_string(),
            category: NodeCategory::Output,
            label: "Print".to_string(),
            description: "Logs its input value".to_string(),
            ports: vec![
                PortTemplate::system("start", PortDirection::Input),
                PortTemplate::data("value", PortDirection::Input, PortConfig::Any { adopted: None }, false),
            ],
        }
    }
}

#[async_trait]
impl NodeExecutor for PrintNode {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeOutput> {
        match ctx.input("value").and_then(|v| v.as_scalar()) {
            Some(value) => log::info!("[{}] {value:?}", ctx.node_id),
            None => log::info!("[{}] <no value>", ctx.node_id),
        }
        Ok(NodeOutput::new())
    }
}

/// A no-op system hub: no data ports, just relays `start` to `then`.
struct NoopNode;

impl NodeDescriptor for NoopNode {
    fn descriptor() -> NodeMetadata {
        NodeMetadata {
            node_type: "noop".to_string(),
            category: NodeCategory::Control,
            label: "No-op".to_string(),
            description: "Does nothing; relays flow control onward".to_string(),
            ports: vec![
                PortTemplate::system("start", PortDirection::Input),
                PortTemplate::system("then", PortDirection::Output),
            ],
        }
    }
}

#[async_trait]
impl NodeExecutor for NoopNode {
    async fn execute(&self, _ctx: &ExecutionContext) -> Result<NodeOutput> {
        Ok(NodeOutput::new().activate("then"))
    }
}

struct StaticExecutorFactory<T>(std::marker::PhantomData<T>);

impl<T: NodeExecutor + Default + 'static> NodeExecutorFactory for StaticExecutorFactory<T> {
    fn create_executor(&self) -> Arc<dyn NodeExecutor> {
        Arc::new(T::default())
    }
}

macro_rules! impl_default_unit {
    ($t:ty) => {
        impl Default for $t {
            fn default() -> Self {
                Self
            }
        }
    };
}

impl_default_unit!(PassthroughNode);
impl_default_unit!(AddNode);
impl_default_unit!(PrintNode);
impl_default_unit!(NoopNode);

fn register<T: NodeDescriptor + NodeExecutor + Default + 'static>(registry: &mut NodeRegistry) {
    registry.register(T::descriptor(), Arc::new(StaticExecutorFactory::<T>(std::marker::PhantomData)));
}

/// Build the registry the CLI runs flows against.
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register::<PassthroughNode>(&mut registry);
    register::<AddNode>(&mut registry);
    register::<PrintNode>(&mut registry);
    register::<NoopNode>(&mut registry);
    registry
}
