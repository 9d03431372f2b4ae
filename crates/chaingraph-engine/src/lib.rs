//! ChainGraph Flow Execution Engine.
//!
//! This crate runs flows: directed graphs of typed nodes connected by system
//! (flow-control) and data edges. A flow is authored and persisted
//! externally; this crate only consumes it, starting from
//! [`FlowGraphSnapshot`] and driving execution with [`ExecutionEngine`].
//!
//! # Architecture
//!
//! - [`model`] — the core data model: `Flow`, `Node`, `Port`, `Edge`.
//! - [`value`] — the port type system (`PortConfig`) and runtime values
//!   (`PortValue`), including stream ports.
//! - [`graph`] — an immutable, indexed snapshot of a flow taken at
//!   execution-creation time.
//! - [`registry`] — maps `node_type` strings to [`NodeExecutor`] impls.
//! - [`context`] — what a running node sees: resolved inputs, cancellation,
//!   event emission.
//! - [`engine`] — the scheduler: readiness, concurrency, timeouts, debug
//!   control, child-execution spawning.
//! - [`store`] — execution/event persistence (in-memory and SQLite).
//! - [`queue`] / [`subscription`] — the event fan-out and resumable
//!   subscription protocol.
//! - [`builder`] — a fluent API for constructing flows in tests and tools.
//! - [`validation`] — static flow validation (dangling edges, type
//!   mismatches, system-edge cycles).
//!
//! # Example
//!
//! ```ignore
//! use chaingraph_engine::{ExecutionEngine, EngineConfig, NodeRegistry, InMemoryExecutionStore, InMemoryFlowStore};
//! use std::sync::Arc;
//!
//! let engine = ExecutionEngine::new(
//!     Arc::new(EngineConfig::default()),
//!     Arc::new(NodeRegistry::new()),
//!     Arc::new(InMemoryExecutionStore::new()),
//!     Arc::new(InMemoryFlowStore::new()),
//! );
//! ```

pub mod builder;
pub mod channel;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod model;
pub mod queue;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod validation;
pub mod value;

pub use builder::FlowBuilder;
pub use channel::{ChannelCursor, MultiChannel};
pub use config::EngineConfig;
pub use context::{CancellationToken, EmittedEvent, ExecutionContext, NodeCallArgs, NodeOutput};
pub use descriptor::{NodeCategory, NodeDescriptor, NodeMetadata, PortTemplate};
pub use engine::ExecutionEngine;
pub use error::{EngineError, Result};
pub use events::{Event, EventData, FlowEvent};
pub use graph::FlowGraphSnapshot;
pub use model::{
    Edge, EdgeId, ExecutionError, ExecutionId, ExecutionOptions, ExecutionState, ExecutionStatus,
    Flow, FlowId, FlowMetadata, Node, NodeId, Port, PortDirection, PortId, PortKind,
};
pub use queue::{EventBus, EventQueue};
pub use registry::{CallbackNodeExecutor, NodeExecutor, NodeExecutorFactory, NodeRegistry};
pub use store::{
    EventPersistor, ExecutionRow, ExecutionStore, FlowStore, InMemoryExecutionStore,
    InMemoryFlowStore, ListExecutionsFilter, SqliteExecutionStore,
};
pub use subscription::{EventSubscription, FlowEventSubscription, IndexedFlowEvent};
pub use validation::{is_system_edge, validate_flow, ValidationError};
pub use value::{PortConfig, PortValue, PropertyConfig};
