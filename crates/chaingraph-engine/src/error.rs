//! Error types for the flow execution engine

use thiserror::Error;

use crate::model::NodeId;

/// Result type alias using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error kinds surfaced by the engine's control API and scheduler.
///
/// Mirrors the error-kind table: every control-plane failure and every
/// node-failure path resolves to one of these variants. `BreakpointHit` is
/// kept here for completeness but the scheduler never returns it as an
/// `Err` — it is informational and is only ever emitted as an event.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown executionId / flowId / nodeId
    #[error("not found: {0}")]
    NotFound(String),

    /// Control op called while the execution was in the wrong status
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Edge carries a value incompatible with the target port's type
    #[error("type mismatch on port '{port}': expected {expected}, got {actual}")]
    TypeMismatch {
        port: String,
        expected: String,
        actual: String,
    },

    /// A node or whole-flow timeout fired
    #[error("timeout: {0}")]
    Timeout(String),

    /// stop() was requested and observed
    #[error("execution cancelled")]
    Cancelled,

    /// Informational: a node hit a configured breakpoint. Never thrown,
    /// only emitted as a `DEBUG_BREAKPOINT_HIT` event.
    #[error("breakpoint hit on node '{0}'")]
    BreakpointHit(NodeId),

    /// A user node implementation returned an error
    #[error("node '{node_id}' failed: {cause}")]
    NodeFailure { node_id: NodeId, cause: String },

    /// A MultiChannel's high-water mark was hit with no consumer progress
    /// for the backpressure grace period
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The execution store rejected an append or query
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Serialization of a port value or event payload failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn node_failure(node_id: impl Into<NodeId>, cause: impl Into<String>) -> Self {
        Self::NodeFailure {
            node_id: node_id.into(),
            cause: cause.into(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::PersistenceFailure(err.to_string())
    }
}
