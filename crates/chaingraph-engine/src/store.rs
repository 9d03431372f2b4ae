//! Execution Store: durable record of executions and their
//! event logs.
//!
//! The store is append-only for events and idempotent on
//! `(execution_id, index)` so the engine's write-behind batching can
//! retry a batch after a transient failure without producing duplicate log
//! entries. Two implementations are provided: [`InMemoryExecutionStore`]
//! for unit tests and embedders that don't need durability, and
//! [`SqliteExecutionStore`] (the one the CLI and persistence-contract tests
//! use) backed by `rusqlite`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use rusqlite::Connection;
use tokio::sync::{mpsc, Mutex};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::Event;
use crate::model::{ExecutionError, ExecutionId, ExecutionStatus, Flow, FlowId, NodeId};

/// One row of the conceptual `executions` table.
#[derive(Debug, Clone)]
pub struct ExecutionRow {
    pub id: ExecutionId,
    pub flow_id: FlowId,
    pub owner_id: Option<String>,
    pub parent_execution_id: Option<ExecutionId>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub error_node_id: Option<NodeId>,
    pub execution_depth: u32,
    pub metadata: Option<serde_json::Value>,
    pub external_events: Option<serde_json::Value>,
}

impl ExecutionRow {
    pub fn new(id: impl Into<ExecutionId>, flow_id: impl Into<FlowId>, execution_depth: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            flow_id: flow_id.into(),
            owner_id: None,
            parent_execution_id: None,
            status: ExecutionStatus::Created,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            error_message: None,
            error_node_id: None,
            execution_depth,
            metadata: None,
            external_events: None,
        }
    }
}

/// Pagination + owner filter for `listRootsFor`.
#[derive(Debug, Clone, Default)]
pub struct ListExecutionsFilter {
    pub owner_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Durable record of executions and event logs. `append_events` is
/// at-least-once and must be idempotent on `(execution_id, index)`.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, row: ExecutionRow) -> Result<()>;

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        error: Option<ExecutionError>,
    ) -> Result<()>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRow>>;

    /// Idempotent on `(execution_id, event.index)`; a duplicate append is a
    /// silent no-op rather than an error.
    async fn append_events(&self, execution_id: &str, events: &[Event]) -> Result<()>;

    async fn list_events_since(&self, execution_id: &str, last_index: u64) -> Result<Vec<Event>>;

    async fn list_roots_for(&self, filter: ListExecutionsFilter) -> Result<Vec<ExecutionRow>>;

    async fn list_children_of(&self, execution_id: &str) -> Result<Vec<ExecutionRow>>;
}

/// In-memory [`ExecutionStore`]: used by unit tests and by embedders that
/// accept losing the log across a process restart.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: SyncMutex<HashMap<ExecutionId, ExecutionRow>>,
    events: SyncMutex<HashMap<ExecutionId, Vec<Event>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, row: ExecutionRow) -> Result<()> {
        self.executions.lock().insert(row.id.clone(), row);
        Ok(())
    }

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        error: Option<ExecutionError>,
    ) -> Result<()> {
        let mut executions = self.executions.lock();
        let row = executions
            .get_mut(execution_id)
            .ok_or_else(|| EngineError::not_found(format!("execution '{execution_id}'")))?;
        row.status = status;
        if started_at.is_some() {
            row.started_at = started_at;
        }
        if completed_at.is_some() {
            row.completed_at = completed_at;
        }
        if let Some(err) = error {
            row.error_message = Some(err.message);
            row.error_node_id = err.node_id;
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRow>> {
        Ok(self.executions.lock().get(execution_id).cloned())
    }

    async fn append_events(&self, execution_id: &str, events: &[Event]) -> Result<()> {
        let mut log = self.events.lock();
        let entry = log.entry(execution_id.to_string()).or_default();
        let known_max = entry.last().map(|e| e.index);
        for event in events {
            if known_max.is_none_or(|max| event.index > max) || !entry.iter().any(|e| e.index == event.index) {
                entry.push(event.clone());
            }
        }
        entry.sort_by_key(|e| e.index);
        entry.dedup_by_key(|e| e.index);
        Ok(())
    }

    async fn list_events_since(&self, execution_id: &str, last_index: u64) -> Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .get(execution_id)
            .map(|events| events.iter().filter(|e| e.index > last_index).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_roots_for(&self, filter: ListExecutionsFilter) -> Result<Vec<ExecutionRow>> {
        let executions = self.executions.lock();
        let mut matching: Vec<ExecutionRow> = executions
            .values()
            .filter(|row| row.parent_execution_id.is_none())
            .filter(|row| filter.owner_id.is_none() || row.owner_id == filter.owner_id)
            .cloned()
            .collect();
        matching.sort_by_key(|row| std::cmp::Reverse(row.created_at));
        let limit = if filter.limit == 0 { matching.len() } else { filter.limit };
        Ok(matching.into_iter().skip(filter.offset).take(limit).collect())
    }

    async fn list_children_of(&self, execution_id: &str) -> Result<Vec<ExecutionRow>> {
        Ok(self
            .executions
            .lock()
            .values()
            .filter(|row| row.parent_execution_id.as_deref() == Some(execution_id))
            .cloned()
            .collect())
    }
}

/// `rusqlite`-backed [`ExecutionStore`]. Blocking SQLite calls are
/// dispatched via `spawn_blocking` so the store never stalls the tokio
/// scheduler that also drives node execution.
pub struct SqliteExecutionStore {
    conn: Arc<SyncMutex<Connection>>,
}

impl SqliteExecutionStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(SyncMutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(SyncMutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                owner_id TEXT,
                parent_execution_id TEXT,
                status TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                error_message TEXT,
                error_node_id TEXT,
                execution_depth INTEGER NOT NULL,
                metadata TEXT,
                external_events TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_owner_created ON executions(owner_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_executions_parent ON executions(parent_execution_id);
            CREATE INDEX IF NOT EXISTS idx_executions_flow ON executions(flow_id);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_executions_started ON executions(started_at);

            CREATE TABLE IF NOT EXISTS execution_events (
                execution_id TEXT NOT NULL,
                event_index INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (execution_id, event_index)
            );
            CREATE INDEX IF NOT EXISTS idx_events_time ON execution_events(execution_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_type ON execution_events(execution_id, event_type);
            "#,
        )?;
        Ok(())
    }

    fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<ExecutionRow> {
        let status: String = row.get("status")?;
        let metadata: Option<String> = row.get("metadata")?;
        let external_events: Option<String> = row.get("external_events")?;
        Ok(ExecutionRow {
            id: row.get("id")?,
            flow_id: row.get("flow_id")?,
            owner_id: row.get("owner_id")?,
            parent_execution_id: row.get("parent_execution_id")?,
            status: parse_status(&status),
            started_at: parse_timestamp(row.get::<_, Option<String>>("started_at")?),
            completed_at: parse_timestamp(row.get::<_, Option<String>>("completed_at")?),
            created_at: parse_timestamp(Some(row.get::<_, String>("created_at")?)).unwrap_or_else(Utc::now),
            updated_at: parse_timestamp(Some(row.get::<_, String>("updated_at")?)).unwrap_or_else(Utc::now),
            error_message: row.get("error_message")?,
            error_node_id: row.get("error_node_id")?,
            execution_depth: row.get("execution_depth")?,
            metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            external_events: external_events.and_then(|m| serde_json::from_str(&m).ok()),
        })
    }
}

fn parse_status(s: &str) -> ExecutionStatus {
    match s {
        "created" => ExecutionStatus::Created,
        "running" => ExecutionStatus::Running,
        "paused" => ExecutionStatus::Paused,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        "cancelled" => ExecutionStatus::Cancelled,
        _ => ExecutionStatus::Skipped,
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()).map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create_execution(&self, row: ExecutionRow) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO executions (id, flow_id, owner_id, parent_execution_id, status, started_at, completed_at, created_at, updated_at, error_message, error_node_id, execution_depth, metadata, external_events)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                rusqlite::params![
                    row.id,
                    row.flow_id,
                    row.owner_id,
                    row.parent_execution_id,
                    row.status.to_string(),
                    row.started_at.map(|t| t.to_rfc3339()),
                    row.completed_at.map(|t| t.to_rfc3339()),
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                    row.error_message,
                    row.error_node_id,
                    row.execution_depth,
                    row.metadata.map(|m| m.to_string()),
                    row.external_events.map(|m| m.to_string()),
                ],
            )
        })
        .await
        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))??;
        Ok(())
    }

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        error: Option<ExecutionError>,
    ) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let execution_id = execution_id.to_string();
        let status_str = status.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE executions SET status = ?1,
                     started_at = COALESCE(?2, started_at),
                     completed_at = COALESCE(?3, completed_at),
                     error_message = COALESCE(?4, error_message),
                     error_node_id = COALESCE(?5, error_node_id),
                     updated_at = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    status_str,
                    started_at.map(|t| t.to_rfc3339()),
                    completed_at.map(|t| t.to_rfc3339()),
                    error.as_ref().map(|e| e.message.clone()),
                    error.as_ref().and_then(|e| e.node_id.clone()),
                    now,
                    execution_id,
                ],
            )
        })
        .await
        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))??;
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRow>> {
        let conn = Arc::clone(&self.conn);
        let execution_id = execution_id.to_string();
        let row = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.query_row(
                "SELECT * FROM executions WHERE id = ?1",
                rusqlite::params![execution_id],
                Self::row_to_execution,
            )
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })
        })
        .await
        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))??;
        Ok(row)
    }

    async fn append_events(&self, execution_id: &str, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        let execution_id = execution_id.to_string();
        let events = events.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let tx = conn.transaction()?;
            for event in &events {
                tx.execute(
                    "INSERT OR IGNORE INTO execution_events (execution_id, event_index, event_type, timestamp, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        execution_id,
                        event.index as i64,
                        event.type_name(),
                        event.timestamp.to_rfc3339(),
                        serde_json::to_string(&event.data).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                    ],
                )?;
            }
            tx.commit()
        })
        .await
        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))??;
        Ok(())
    }

    async fn list_events_since(&self, execution_id: &str, last_index: u64) -> Result<Vec<Event>> {
        let conn = Arc::clone(&self.conn);
        let execution_id_owned = execution_id.to_string();
        let rows = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<(i64, String, String)>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare(
                "SELECT event_index, timestamp, data FROM execution_events
                 WHERE execution_id = ?1 AND event_index > ?2 ORDER BY event_index ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![execution_id_owned, last_index as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))??;

        rows.into_iter()
            .map(|(index, timestamp, data)| {
                Ok(Event {
                    index: index as u64,
                    execution_id: execution_id.to_string(),
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?
                        .with_timezone(&Utc),
                    data: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }

    async fn list_roots_for(&self, filter: ListExecutionsFilter) -> Result<Vec<ExecutionRow>> {
        let conn = Arc::clone(&self.conn);
        let rows = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<ExecutionRow>> {
            let conn = conn.lock();
            let limit = if filter.limit == 0 { i64::MAX } else { filter.limit as i64 };
            let mut stmt = conn.prepare(
                "SELECT * FROM executions WHERE parent_execution_id IS NULL
                 AND (?1 IS NULL OR owner_id = ?1)
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            stmt.query_map(rusqlite::params![filter.owner_id, limit, filter.offset as i64], Self::row_to_execution)?
                .collect()
        })
        .await
        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))??;
        Ok(rows)
    }

    async fn list_children_of(&self, execution_id: &str) -> Result<Vec<ExecutionRow>> {
        let conn = Arc::clone(&self.conn);
        let execution_id = execution_id.to_string();
        let rows = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<ExecutionRow>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare("SELECT * FROM executions WHERE parent_execution_id = ?1 ORDER BY created_at ASC")?;
            stmt.query_map(rusqlite::params![execution_id], Self::row_to_execution)?.collect()
        })
        .await
        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))??;
        Ok(rows)
    }
}

/// Read-only flow authoring collaborator. The engine never mutates a
/// flow; it only resolves a `flowId` to the current [`Flow`] value at
/// `create()` time and, for the flow-level subscription, asks for the
/// version a synthesized `FlowInit*` sequence should be stamped with.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>>;

    async fn get_flow_version(&self, flow_id: &str) -> Result<Option<u64>>;
}

/// In-memory [`FlowStore`] backed by a plain map; used by unit tests and by
/// the CLI's demo flow file loader.
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: SyncMutex<HashMap<FlowId, Flow>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow: Flow) {
        self.flows.lock().insert(flow.flow_id.clone(), flow);
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>> {
        Ok(self.flows.lock().get(flow_id).cloned())
    }

    async fn get_flow_version(&self, flow_id: &str) -> Result<Option<u64>> {
        Ok(self.flows.lock().get(flow_id).map(|f| f.metadata.version))
    }
}

/// Write-behind batching in front of any [`ExecutionStore`]:
/// amortises append round-trips by flushing every `persist_batch_size`
/// events or `persist_flush_interval`, whichever comes first. A crash
/// before a flush loses at most one batch; the live event stream is
/// authoritative while a subscriber is connected.
pub struct EventPersistor {
    sender: mpsc::UnboundedSender<PersistorMessage>,
    flush_ack: Mutex<mpsc::UnboundedReceiver<()>>,
    last_success_millis: Arc<std::sync::atomic::AtomicI64>,
    /// Timestamp of the first append failure in the current unbroken streak,
    /// or `0` while persistence is healthy. Lets a caller detect a *sustained*
    /// outage rather than failing the execution on one transient error.
    failing_since_millis: Arc<std::sync::atomic::AtomicI64>,
}

enum PersistorMessage {
    Append(Event),
    Flush,
}

impl EventPersistor {
    pub fn spawn(store: Arc<dyn ExecutionStore>, execution_id: ExecutionId, config: Arc<EngineConfig>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<PersistorMessage>();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel::<()>();
        let last_success_millis = Arc::new(std::sync::atomic::AtomicI64::new(Utc::now().timestamp_millis()));
        let last_success_for_task = Arc::clone(&last_success_millis);
        let failing_since_millis = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let failing_since_for_task = Arc::clone(&failing_since_millis);

        tokio::spawn(async move {
            let mut buffer = Vec::with_capacity(config.persist_batch_size);
            loop {
                let deadline = tokio::time::sleep(config.persist_flush_interval);
                tokio::pin!(deadline);
                let mut should_flush = false;
                let mut closed = false;

                tokio::select! {
                    msg = receiver.recv() => match msg {
                        Some(PersistorMessage::Append(event)) => {
                            buffer.push(event);
                            if buffer.len() >= config.persist_batch_size {
                                should_flush = true;
                            }
                        }
                        Some(PersistorMessage::Flush) => should_flush = true,
                        None => { closed = true; should_flush = true; }
                    },
                    _ = &mut deadline => {
                        should_flush = !buffer.is_empty();
                    }
                }

                if should_flush && !buffer.is_empty() {
                    match store.append_events(&execution_id, &buffer).await {
                        Ok(()) => {
                            last_success_for_task.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                            failing_since_for_task.store(0, Ordering::SeqCst);
                        }
                        Err(err) => {
                            log::warn!("execution '{execution_id}': failed to persist {} events: {err}", buffer.len());
                            failing_since_for_task.compare_exchange(
                                0,
                                Utc::now().timestamp_millis(),
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            ).ok();
                        }
                    }
                    buffer.clear();
                }
                let _ = flush_tx.send(());
                if closed {
                    break;
                }
            }
        });

        Self {
            sender,
            flush_ack: Mutex::new(flush_rx),
            last_success_millis,
            failing_since_millis,
        }
    }

    /// Enqueue an event for the next batch. Never blocks the caller.
    pub fn enqueue(&self, event: Event) {
        let _ = self.sender.send(PersistorMessage::Append(event));
    }

    /// Force an immediate flush and wait for it to complete. Used before
    /// reporting a terminal status so `getState` readers observe a
    /// consistent log.
    pub async fn flush(&self) {
        let _ = self.sender.send(PersistorMessage::Flush);
        let mut ack = self.flush_ack.lock().await;
        let _ = ack.recv().await;
    }

    /// Milliseconds since the last successful flush; the observability
    /// metric behind "persistence failures raise observability metrics".
    pub fn millis_since_last_success(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_success_millis.load(Ordering::SeqCst)
    }

    /// True once append failures have been unbroken for at least `threshold`.
    /// A sustained outage beyond this point fails the execution with
    /// `PersistenceFailure`.
    pub fn is_degraded(&self, threshold: Duration) -> bool {
        let since = self.failing_since_millis.load(Ordering::SeqCst);
        since != 0 && Utc::now().timestamp_millis() - since >= threshold.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(index: u64) -> Event {
        Event {
            index,
            execution_id: "exec-1".to_string(),
            timestamp: Utc::now(),
            data: crate::events::EventData::NodeStarted { node_id: "a".to_string() },
        }
    }

    #[tokio::test]
    async fn in_memory_store_append_is_idempotent() {
        let store = InMemoryExecutionStore::new();
        store.create_execution(ExecutionRow::new("exec-1", "flow-1", 0)).await.unwrap();
        store.append_events("exec-1", &[sample_event(1), sample_event(2)]).await.unwrap();
        store.append_events("exec-1", &[sample_event(2), sample_event(3)]).await.unwrap();

        let events = store.list_events_since("exec-1", 0).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn list_events_since_only_returns_newer_events() {
        let store = InMemoryExecutionStore::new();
        store.create_execution(ExecutionRow::new("exec-1", "flow-1", 0)).await.unwrap();
        store.append_events("exec-1", &[sample_event(1), sample_event(2), sample_event(3)]).await.unwrap();

        let since = store.list_events_since("exec-1", 1).await.unwrap();
        assert_eq!(since.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_execution_and_events() {
        let store = SqliteExecutionStore::open_in_memory().unwrap();
        store.create_execution(ExecutionRow::new("exec-1", "flow-1", 0)).await.unwrap();
        store
            .update_status("exec-1", ExecutionStatus::Running, Some(Utc::now()), None, None)
            .await
            .unwrap();
        store.append_events("exec-1", &[sample_event(1), sample_event(2)]).await.unwrap();
        // Idempotent re-append of an already-stored index.
        store.append_events("exec-1", &[sample_event(2)]).await.unwrap();

        let row = store.get_execution("exec-1").await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Running);
        assert!(row.started_at.is_some());

        let events = store.list_events_since("exec-1", 0).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn sqlite_store_lists_children_of_parent() {
        let store = SqliteExecutionStore::open_in_memory().unwrap();
        store.create_execution(ExecutionRow::new("parent", "flow-1", 0)).await.unwrap();
        let mut child = ExecutionRow::new("child", "flow-2", 1);
        child.parent_execution_id = Some("parent".to_string());
        store.create_execution(child).await.unwrap();

        let children = store.list_children_of("parent").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "child");
    }

    #[tokio::test]
    async fn event_persistor_batches_by_size() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        store.create_execution(ExecutionRow::new("exec-1", "flow-1", 0)).await.unwrap();
        let mut config = EngineConfig::default();
        config.persist_batch_size = 2;
        config.persist_flush_interval = std::time::Duration::from_secs(60);

        let persistor = EventPersistor::spawn(Arc::clone(&store), "exec-1".to_string(), Arc::new(config));
        persistor.enqueue(sample_event(1));
        persistor.enqueue(sample_event(2));
        persistor.flush().await;

        let events = store.list_events_since("exec-1", 0).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    /// A store whose every `append_events` call fails, for exercising the
    /// persistor's sustained-outage detection.
    struct AlwaysFailingStore;

    #[async_trait]
    impl ExecutionStore for AlwaysFailingStore {
        async fn create_execution(&self, _row: ExecutionRow) -> Result<()> {
            Ok(())
        }
        async fn update_status(
            &self,
            _execution_id: &str,
            _status: ExecutionStatus,
            _started_at: Option<DateTime<Utc>>,
            _completed_at: Option<DateTime<Utc>>,
            _error: Option<ExecutionError>,
        ) -> Result<()> {
            Ok(())
        }
        async fn get_execution(&self, _execution_id: &str) -> Result<Option<ExecutionRow>> {
            Ok(None)
        }
        async fn append_events(&self, _execution_id: &str, _events: &[Event]) -> Result<()> {
            Err(EngineError::PersistenceFailure("disk full".to_string()))
        }
        async fn list_events_since(&self, _execution_id: &str, _last_index: u64) -> Result<Vec<Event>> {
            Ok(Vec::new())
        }
        async fn list_roots_for(&self, _filter: ListExecutionsFilter) -> Result<Vec<ExecutionRow>> {
            Ok(Vec::new())
        }
        async fn list_children_of(&self, _execution_id: &str) -> Result<Vec<ExecutionRow>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn event_persistor_reports_degraded_after_sustained_failures() {
        let store: Arc<dyn ExecutionStore> = Arc::new(AlwaysFailingStore);
        let mut config = EngineConfig::default();
        config.persist_batch_size = 1;
        config.persist_flush_interval = Duration::from_millis(10);

        let persistor = EventPersistor::spawn(Arc::clone(&store), "exec-1".to_string(), Arc::new(config));
        assert!(!persistor.is_degraded(Duration::from_millis(40)));

        persistor.enqueue(sample_event(1));
        persistor.flush().await;
        assert!(!persistor.is_degraded(Duration::from_millis(200)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        persistor.enqueue(sample_event(2));
        persistor.flush().await;
        assert!(persistor.is_degraded(Duration::from_millis(40)));
        assert!(persistor.millis_since_last_success() >= 60);
    }
}
