//! Per-node execution context: the collaborator interface a
//! [`crate::registry::NodeExecutor`] is handed at `execute` time.
//!
//! One `ExecutionContext` is created per node run. It exposes that node's
//! resolved input values, lets the node emit named events (consumed by the
//! scheduler to decide child-execution binding), and carries the
//! cooperative cancellation signal used for graceful stop/pause.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::channel::MultiChannel;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{ExecutionId, NodeId, PortId};
use crate::value::PortValue;

/// A cooperative, clonable cancellation signal. Every clone observes the
/// same underlying flag; `cancel()` is idempotent and wakes every waiter.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Resolves immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A named event emitted by a node while running. The scheduler matches
/// these against a flow's `event_child_flows` binding to decide whether to
/// spawn a child execution.
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

/// The interface a node implementation sees while executing.
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    inputs: HashMap<PortId, PortValue>,
    config: Arc<EngineConfig>,
    cancellation: CancellationToken,
    emitted: Mutex<Vec<EmittedEvent>>,
    output_streams: HashMap<PortId, Arc<MultiChannel<serde_json::Value>>>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: impl Into<ExecutionId>,
        node_id: impl Into<NodeId>,
        inputs: HashMap<PortId, PortValue>,
        config: Arc<EngineConfig>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            inputs,
            config,
            cancellation,
            emitted: Mutex::new(Vec::new()),
            output_streams: HashMap::new(),
        }
    }

    /// Attach the stream-typed output sinks the scheduler wired at
    /// node-start. A node publishes into one with
    /// `ctx.output_stream("port_id")`; consumers are already subscribed to
    /// the same `MultiChannel` before this node's `execute` begins.
    pub fn with_output_streams(mut self, streams: HashMap<PortId, Arc<MultiChannel<serde_json::Value>>>) -> Self {
        self.output_streams = streams;
        self
    }

    pub fn output_stream(&self, port_id: &str) -> Option<Arc<MultiChannel<serde_json::Value>>> {
        self.output_streams.get(port_id).cloned()
    }

    pub fn input(&self, port_id: &str) -> Option<&PortValue> {
        self.inputs.get(port_id)
    }

    /// Like `input`, but a missing port is a `NotFound` error rather than a
    /// silent `None` — most node implementations want this for required
    /// inputs.
    pub fn require_input(&self, port_id: &str) -> Result<&PortValue> {
        self.inputs
            .get(port_id)
            .ok_or_else(|| EngineError::not_found(format!("input port '{port_id}' has no value")))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Record a named event. Node implementations use this to signal
    /// domain events (e.g. "item_rejected") that a flow may bind to a
    /// child execution.
    pub fn emit_event(&self, name: impl Into<String>, payload: serde_json::Value) {
        self.emitted.lock().push(EmittedEvent {
            name: name.into(),
            payload,
        });
    }

    /// Drain the events emitted so far. Called by the scheduler once the
    /// node's `execute` future resolves.
    pub fn take_emitted_events(&self) -> Vec<EmittedEvent> {
        std::mem::take(&mut self.emitted.lock())
    }

    /// An owned, `'static` snapshot of this context's inputs. Used by
    /// callback-registered node executors, whose closures can't borrow a
    /// `&ExecutionContext` across an `await` boxed as `'static`. Callbacks
    /// built this way can't call `emit_event`; nodes that need to emit
    /// events should implement [`crate::registry::NodeExecutor`] directly.
    pub fn snapshot(&self) -> NodeCallArgs {
        NodeCallArgs {
            execution_id: self.execution_id.clone(),
            node_id: self.node_id.clone(),
            inputs: self.inputs.clone(),
            config: Arc::clone(&self.config),
            cancellation: self.cancellation.clone(),
            output_streams: self.output_streams.clone(),
        }
    }
}

/// An owned snapshot of an [`ExecutionContext`]'s inputs, suitable for
/// moving into a `'static` async closure.
#[derive(Clone)]
pub struct NodeCallArgs {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub inputs: HashMap<PortId, PortValue>,
    pub config: Arc<EngineConfig>,
    pub cancellation: CancellationToken,
    output_streams: HashMap<PortId, Arc<MultiChannel<serde_json::Value>>>,
}

impl NodeCallArgs {
    pub fn input(&self, port_id: &str) -> Option<&PortValue> {
        self.inputs.get(port_id)
    }

    pub fn require_input(&self, port_id: &str) -> Result<&PortValue> {
        self.inputs
            .get(port_id)
            .ok_or_else(|| EngineError::not_found(format!("input port '{port_id}' has no value")))
    }

    pub fn output_stream(&self, port_id: &str) -> Option<Arc<MultiChannel<serde_json::Value>>> {
        self.output_streams.get(port_id).cloned()
    }
}

/// What a node produced: resolved data-port values plus the set of system
/// (flow-control) output ports to activate. A node with no system outputs
/// activated effectively dead-ends its branch.
#[derive(Debug, Default)]
pub struct NodeOutput {
    pub data: HashMap<PortId, PortValue>,
    pub system_outputs: Vec<String>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, port_id: impl Into<String>, value: PortValue) -> Self {
        self.data.insert(port_id.into(), value);
        self
    }

    /// Activate a system output port by key (e.g. `"then"`, `"error"`).
    pub fn activate(mut self, port_key: impl Into<String>) -> Self {
        self.system_outputs.push(port_key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_token_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancellation_token_resolves_immediately_if_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn require_input_errors_when_missing() {
        let ctx = ExecutionContext::new(
            "exec-1",
            "node-1",
            HashMap::new(),
            Arc::new(EngineConfig::default()),
            CancellationToken::new(),
        );
        assert!(ctx.require_input("missing").is_err());
    }

    #[test]
    fn emitted_events_drain_once() {
        let ctx = ExecutionContext::new(
            "exec-1",
            "node-1",
            HashMap::new(),
            Arc::new(EngineConfig::default()),
            CancellationToken::new(),
        );
        ctx.emit_event("done", serde_json::json!({"ok": true}));
        let events = ctx.take_emitted_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "done");
        assert!(ctx.take_emitted_events().is_empty());
    }

    #[test]
    fn node_output_builder_collects_data_and_system_ports() {
        let output = NodeOutput::new()
            .with_data("sum", PortValue::scalar(serde_json::json!(3)))
            .activate("then");
        assert_eq!(output.data.len(), 1);
        assert_eq!(output.system_outputs, vec!["then".to_string()]);
    }
}
