//! Engine configuration: the knobs named in the environment/CLI surface.
//!
//! The engine itself never reads the environment — only [`EngineConfig::from_env`]
//! does, so embedders that already have their own configuration layer can
//! build an `EngineConfig` directly.

use std::env;
use std::time::Duration;

/// Default bound on simultaneously running nodes.
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
/// Default per-node execution timeout.
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 90_000;
/// Default whole-flow execution timeout.
pub const DEFAULT_FLOW_TIMEOUT_MS: u64 = 300_000;
/// Default bounded event queue capacity, per subscription.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 200;
/// Default write-behind persistence batch size.
pub const DEFAULT_PERSIST_BATCH_SIZE: usize = 64;
/// Default write-behind persistence flush interval.
pub const DEFAULT_PERSIST_FLUSH_MS: u64 = 100;
/// Default grace period before an unresponsive cancelled node is abandoned.
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;
/// Default MultiChannel high-water mark (items) before the producer blocks.
pub const DEFAULT_CHANNEL_HIGH_WATER_MARK: usize = 1_024;
/// Default MultiChannel low-water mark a consumer must fall back under to
/// unblock a backpressured producer.
pub const DEFAULT_CHANNEL_LOW_WATER_MARK: usize = 256;

/// Runtime configuration for an [`ExecutionEngine`](crate::engine::ExecutionEngine).
///
/// Per-execution overrides (see `ExecutionOptions` in the control API) take
/// precedence over these process-wide defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub node_timeout: Duration,
    pub flow_timeout: Duration,
    pub event_queue_capacity: usize,
    pub persist_batch_size: usize,
    pub persist_flush_interval: Duration,
    pub cancel_grace_period: Duration,
    pub channel_high_water_mark: usize,
    pub channel_low_water_mark: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            node_timeout: Duration::from_millis(DEFAULT_NODE_TIMEOUT_MS),
            flow_timeout: Duration::from_millis(DEFAULT_FLOW_TIMEOUT_MS),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            persist_batch_size: DEFAULT_PERSIST_BATCH_SIZE,
            persist_flush_interval: Duration::from_millis(DEFAULT_PERSIST_FLUSH_MS),
            cancel_grace_period: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
            channel_high_water_mark: DEFAULT_CHANNEL_HIGH_WATER_MARK,
            channel_low_water_mark: DEFAULT_CHANNEL_LOW_WATER_MARK,
        }
    }
}

impl EngineConfig {
    /// Build configuration from the six environment variables named in the
    /// CLI/environment surface, falling back to the documented defaults
    /// whenever a variable is absent or fails to parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrency: env_usize("EXECUTION_DEFAULT_CONCURRENCY", defaults.max_concurrency),
            node_timeout: env_duration_ms(
                "EXECUTION_DEFAULT_NODE_TIMEOUT_MS",
                defaults.node_timeout,
            ),
            flow_timeout: env_duration_ms(
                "EXECUTION_DEFAULT_FLOW_TIMEOUT_MS",
                defaults.flow_timeout,
            ),
            event_queue_capacity: env_usize(
                "EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            ),
            persist_batch_size: env_usize("PERSIST_BATCH_SIZE", defaults.persist_batch_size),
            persist_flush_interval: env_duration_ms(
                "PERSIST_FLUSH_MS",
                defaults.persist_flush_interval,
            ),
            ..defaults
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
