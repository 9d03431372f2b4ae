//! Execution Engine: the core scheduler.
//!
//! Readiness computation, concurrency-bounded node launches, value
//! propagation, stream plumbing, debug/step control, timeouts, child-execution
//! spawning and event emission all live here. Everything else in the crate
//! (graph snapshot, port/value model, event queue, store) is a collaborator
//! this module drives.
//!
//! The driver for one execution is a single task spawned by [`ExecutionEngine::start`]
//! (`ExecutionHandle::run`). It alternates between rescanning node readiness
//! and launching as many ready nodes as the concurrency semaphore allows,
//! then waiting for either a node completion or a control-plane wakeup
//! (`ExecutionHandle::wake`). Control API calls (`pause`, `resume`, `stop`,
//! `step`, breakpoint mutation) touch shared, lock-guarded state and notify
//! the driver rather than driving the scheduler themselves: a parallel,
//! multi-task scheduler running cooperatively inside a single process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::channel::MultiChannel;
use crate::config::EngineConfig;
use crate::context::{CancellationToken, EmittedEvent, ExecutionContext, NodeOutput};
use crate::error::{EngineError, Result};
use crate::events::{Event, EventData, FlowEvent};
use crate::graph::FlowGraphSnapshot;
use crate::model::{
    EdgeId, ExecutionError, ExecutionId, ExecutionOptions, ExecutionState, ExecutionStatus, Flow,
    FlowId, NodeId, PortDirection, PortId, PortKind,
};
use crate::queue::{EventBus, EventQueue};
use crate::registry::NodeRegistry;
use crate::store::{EventPersistor, ExecutionRow, ExecutionStore, FlowStore};
use crate::subscription::{EventSubscription, FlowEventSubscription, IndexedFlowEvent};
use crate::validation::validate_flow;

/// Per-execution, per-node scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeRunState {
    Idle,
    Ready,
    Running,
    WaitingBreakpoint,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeRunState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeRunState::Completed | NodeRunState::Failed | NodeRunState::Skipped | NodeRunState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeFire {
    Selected,
    NotSelected,
}

enum ReadyCheck {
    Ready,
    Skip,
    Wait,
}

/// Outcome of one node task, sent back to the driver over an mpsc channel.
enum NodeOutcome {
    Completed { output: NodeOutput, emitted: Vec<EmittedEvent> },
    Failed(EngineError),
    TimedOut,
    CancelledBeforeRun,
}

struct NodeCompletion {
    node_id: NodeId,
    outcome: NodeOutcome,
}

/// Combined event log + live fan-out for one execution. `emit`
/// and `subscribe` share one lock so a subscriber's replay snapshot and its
/// registration as a live listener are atomic with respect to concurrent
/// publication — otherwise a subscriber could miss (or double-see) an event
/// published in the gap between reading the log and registering its queue.
struct EventHub {
    log: Mutex<Vec<Event>>,
    bus: EventBus<Event>,
    next_index: AtomicU64,
}

impl EventHub {
    fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            bus: EventBus::new(),
            next_index: AtomicU64::new(0),
        }
    }

    fn emit(&self, execution_id: &str, data: EventData) -> Event {
        let mut log = self.log.lock();
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            index,
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
            data,
        };
        log.push(event.clone());
        self.bus.publish(event.clone());
        event
    }

    fn subscribe(&self, capacity: usize, after_index: u64) -> (VecDeque<Event>, Arc<EventQueue<Event>>) {
        let log = self.log.lock();
        let replay: VecDeque<Event> = log.iter().filter(|e| e.index > after_index).cloned().collect();
        let queue = self.bus.subscribe(capacity);
        (replay, queue)
    }

    fn close_all(&self) {
        self.bus.close_all();
    }
}

/// Live fan-out for one flow's mutation stream. Unlike [`EventHub`]
/// there is no durable log to replay from: a flow's current shape is
/// already held by its `FlowStore`, so "replay" means synthesizing
/// `FlowInit*` from that snapshot fresh on every subscribe rather than
/// storing history. `next_index` is still shared across subscribers so a
/// synthesized sequence and any mutation notified concurrently never
/// collide on the same index.
struct FlowEventHub {
    next_index: AtomicU64,
    subscribers: Mutex<Vec<Arc<EventQueue<IndexedFlowEvent>>>>,
}

impl FlowEventHub {
    fn new() -> Self {
        Self {
            next_index: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn stamp(&self, event: FlowEvent) -> IndexedFlowEvent {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        IndexedFlowEvent { index, event }
    }

    /// Notify every live subscriber of one flow mutation.
    fn publish(&self, event: FlowEvent) -> IndexedFlowEvent {
        let indexed = self.stamp(event);
        for queue in self.subscribers.lock().iter() {
            queue.publish(indexed.clone());
        }
        indexed
    }

    /// Synthesize the current snapshot as `FlowInitStart, NodeAdded*,
    /// EdgeAdded*, FlowInitEnd` and register a fresh live queue under the
    /// same lock, so a mutation published in the gap can't be missed or
    /// double-counted against the synthesized sequence.
    fn synthesize_and_subscribe(
        &self,
        flow: &Flow,
        capacity: usize,
    ) -> (Vec<IndexedFlowEvent>, Arc<EventQueue<IndexedFlowEvent>>) {
        let mut subscribers = self.subscribers.lock();
        let mut replay = Vec::with_capacity(flow.nodes.len() + flow.edges.len() + 2);
        replay.push(self.stamp(FlowEvent::FlowInitStart { flow_id: flow.flow_id.clone() }));
        for node in &flow.nodes {
            replay.push(self.stamp(FlowEvent::NodeAdded { flow_id: flow.flow_id.clone(), node_id: node.id.clone() }));
        }
        for edge in &flow.edges {
            replay.push(self.stamp(FlowEvent::EdgeAdded { flow_id: flow.flow_id.clone(), edge_id: edge.id.clone() }));
        }
        replay.push(self.stamp(FlowEvent::FlowInitEnd { flow_id: flow.flow_id.clone() }));
        let queue = Arc::new(EventQueue::new(capacity));
        subscribers.push(Arc::clone(&queue));
        (replay, queue)
    }
}

/// All mutable scheduling state for one execution. Held behind `Arc` so the
/// driver task, node tasks and the engine's control-API methods can share it
/// without a single coarse lock serializing unrelated operations.
struct ExecutionHandle {
    execution_id: ExecutionId,
    flow_id: FlowId,
    graph: FlowGraphSnapshot,
    config: Arc<EngineConfig>,
    options: ExecutionOptions,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn ExecutionStore>,
    engine: Weak<EngineInner>,

    status: Mutex<ExecutionStatus>,
    events: EventHub,
    persistor: EventPersistor,

    cancellation: CancellationToken,
    node_states: Mutex<HashMap<NodeId, NodeRunState>>,
    ready_rank: Mutex<HashMap<NodeId, u64>>,
    next_rank: AtomicU64,
    /// Resolved values keyed by `(node_id, port_id)` of the *producing* port.
    outputs: Mutex<HashMap<(NodeId, PortId), crate::value::PortValue>>,
    system_edge_state: Mutex<HashMap<EdgeId, EdgeFire>>,

    breakpoints: Mutex<Arc<HashSet<NodeId>>>,
    parked_order: Mutex<VecDeque<NodeId>>,
    parked_release: Mutex<HashMap<NodeId, oneshot::Sender<()>>>,
    pause_requested: AtomicBool,

    semaphore: Arc<Semaphore>,
    running_count: AtomicUsize,
    running_handles: Mutex<HashMap<NodeId, JoinHandle<()>>>,
    started: AtomicBool,
    wake: tokio::sync::Notify,

    error: Mutex<Option<ExecutionError>>,
}

impl ExecutionHandle {
    fn node_count(&self) -> usize {
        self.graph.nodes().count()
    }

    fn emit(&self, data: EventData) -> Event {
        let event = self.events.emit(&self.execution_id, data);
        self.persistor.enqueue(event.clone());
        event
    }

    fn engine(&self) -> Option<ExecutionEngine> {
        self.engine.upgrade().map(|inner| ExecutionEngine { inner })
    }

    /// Does `node_id` (currently `Idle`) qualify to become
    /// `Ready`, must it be `Skip`ped, or does it still need to `Wait`?
    fn node_is_ready_or_skip(&self, node_id: &str) -> ReadyCheck {
        let incoming = self.graph.incoming_edges(node_id);
        let (sys_edges, data_edges): (Vec<_>, Vec<_>) =
            incoming.into_iter().partition(|e| self.graph.is_system_edge(e));

        let sys_states: Vec<Option<EdgeFire>> = {
            let states = self.system_edge_state.lock();
            sys_edges.iter().map(|e| states.get(&e.id).copied()).collect()
        };
        let sys_all_selected = sys_states.iter().all(|s| *s == Some(EdgeFire::Selected));
        let sys_all_not_selected =
            !sys_edges.is_empty() && sys_states.iter().all(|s| *s == Some(EdgeFire::NotSelected));

        if sys_all_not_selected {
            return ReadyCheck::Skip;
        }
        if !sys_edges.is_empty() && !sys_all_selected {
            return ReadyCheck::Wait;
        }

        let node_states = self.node_states.lock();
        for edge in &data_edges {
            let source_state = node_states.get(&edge.source_node_id).copied().unwrap_or(NodeRunState::Idle);
            let source_is_stream = self
                .graph
                .node(&edge.source_node_id)
                .and_then(|n| n.port(&edge.source_port_id))
                .map(|p| p.is_stream())
                .unwrap_or(false);

            if source_is_stream {
                match source_state {
                    NodeRunState::Idle | NodeRunState::Ready => return ReadyCheck::Wait,
                    NodeRunState::Skipped | NodeRunState::Failed | NodeRunState::Cancelled => {
                        return ReadyCheck::Skip;
                    }
                    _ => {}
                }
            } else {
                match source_state {
                    NodeRunState::Completed => {}
                    NodeRunState::Skipped | NodeRunState::Failed | NodeRunState::Cancelled => {
                        return ReadyCheck::Skip;
                    }
                    _ => return ReadyCheck::Wait,
                }
            }
        }
        ReadyCheck::Ready
    }

    /// Resolve every outgoing system edge of `node_id`: selected iff the
    /// source port's `key` is in `activated`.
    fn mark_system_edges(&self, node_id: &str, activated: &[String]) {
        let node = match self.graph.node(node_id) {
            Some(n) => n,
            None => return,
        };
        let mut state = self.system_edge_state.lock();
        for edge in self.graph.outgoing_edges(node_id) {
            if !self.graph.is_system_edge(edge) {
                continue;
            }
            let selected = node
                .port(&edge.source_port_id)
                .is_some_and(|p| activated.iter().any(|k| k == &p.key));
            state.insert(edge.id.clone(), if selected { EdgeFire::Selected } else { EdgeFire::NotSelected });
        }
    }

    /// Route to a system-error edge if the node has
    /// one, otherwise fail the whole execution.
    fn route_error_or_fail(&self, node_id: &str, error: EngineError) {
        let has_error_edge = self.graph.node(node_id).is_some_and(|n| {
            self.graph
                .outgoing_edges(node_id)
                .iter()
                .any(|e| self.graph.is_system_edge(e) && n.port(&e.source_port_id).is_some_and(|p| p.key == "error"))
        });
        if has_error_edge {
            self.mark_system_edges(node_id, &["error".to_string()]);
        } else {
            self.mark_system_edges(node_id, &[]);
            self.fail_execution(error.to_string(), Some(node_id.to_string()));
        }
    }

    /// Record the execution's terminal error (first one wins) and cancel
    /// every running node so teardown starts immediately. Used both for
    /// node failures with no system-error edge and for engine-level failures
    /// that aren't attributable to a single node, such as a sustained
    /// persistence outage.
    fn fail_execution(&self, message: String, node_id: Option<NodeId>) {
        let mut err = self.error.lock();
        if err.is_none() {
            *err = Some(ExecutionError { message, node_id });
        }
        drop(err);
        self.cancellation.cancel();
        self.cancel_non_terminal_nodes();
    }

    /// Cascade-cancel every node that hasn't reached a terminal state yet
    /// without waiting on them.
    fn cancel_non_terminal_nodes(&self) {
        let idle_or_ready: Vec<NodeId> = self
            .node_states
            .lock()
            .iter()
            .filter(|(_, s)| matches!(s, NodeRunState::Idle | NodeRunState::Ready))
            .map(|(id, _)| id.clone())
            .collect();
        for id in idle_or_ready {
            self.node_states.lock().insert(id.clone(), NodeRunState::Cancelled);
            self.mark_system_edges(&id, &[]);
        }
        // Wake every parked node; its continuation observes cancellation and
        // marks itself Cancelled instead of acquiring a permit to run.
        let parked: Vec<NodeId> = self.parked_order.lock().drain(..).collect();
        let mut releases = self.parked_release.lock();
        for id in parked {
            if let Some(tx) = releases.remove(&id) {
                let _ = tx.send(());
            }
        }
    }

    /// True once every node has reached a terminal run state and nothing is
    /// running or parked. Transitions the execution to its final status and
    /// releases resources.
    async fn try_finish(self: &Arc<Self>) -> bool {
        {
            let states = self.node_states.lock();
            if states.len() < self.node_count() {
                return false;
            }
            if !states.values().all(|s| s.is_terminal()) {
                return false;
            }
        }
        if self.running_count.load(Ordering::SeqCst) > 0 {
            return false;
        }
        if !self.parked_order.lock().is_empty() {
            return false;
        }

        let mut status = self.status.lock();
        if status.is_terminal() {
            return true;
        }

        let (final_status, event) = if let Some(err) = self.error.lock().clone() {
            (
                ExecutionStatus::Failed,
                EventData::FlowFailed { message: err.message, node_id: err.node_id },
            )
        } else if self.cancellation.is_cancelled() {
            (ExecutionStatus::Cancelled, EventData::FlowCancelled)
        } else {
            (ExecutionStatus::Completed, EventData::FlowCompleted)
        };
        *status = final_status;
        drop(status);

        self.emit(event);
        let completed_at = Utc::now();
        let error = self.error.lock().clone();
        let _ = self
            .store
            .update_status(&self.execution_id, final_status, None, Some(completed_at), error)
            .await;
        self.persistor.flush().await;
        self.events.close_all();
        true
    }

    /// The execution transitions to paused when no node is running and
    /// at least one is parked, or when `pause()` is called — already-running
    /// nodes complete but no new nodes launch. The store is written through
    /// synchronously so `get_state` observes `Paused` as soon as this returns.
    async fn maybe_transition_paused(&self) {
        if self.running_count.load(Ordering::SeqCst) > 0 {
            return;
        }
        let any_parked = !self.parked_order.lock().is_empty();
        if !self.pause_requested.load(Ordering::SeqCst) && !any_parked {
            return;
        }
        let flipped = {
            let mut status = self.status.lock();
            if *status == ExecutionStatus::Running {
                *status = ExecutionStatus::Paused;
                true
            } else {
                false
            }
        };
        if flipped {
            self.emit(EventData::FlowPaused);
            let _ = self.store.update_status(&self.execution_id, ExecutionStatus::Paused, None, None, None).await;
        }
    }

    /// Un-pause without emitting an event: used by `step`, which releases a
    /// single parked node without announcing a full `FLOW_RESUMED`, and,
    /// redundantly but harmlessly, right after `resume` (which already
    /// emitted its own event). Writes the resumed status through to the
    /// store, same as `resume` itself.
    async fn mark_running_if_paused(&self) {
        let flipped = {
            let mut status = self.status.lock();
            if *status == ExecutionStatus::Paused {
                *status = ExecutionStatus::Running;
                true
            } else {
                false
            }
        };
        if flipped {
            let _ = self.store.update_status(&self.execution_id, ExecutionStatus::Running, None, None, None).await;
        }
    }

    fn park_for_breakpoint(self: &Arc<Self>, node_id: NodeId, completion_tx: mpsc::UnboundedSender<NodeCompletion>) {
        self.node_states.lock().insert(node_id.clone(), NodeRunState::WaitingBreakpoint);
        self.emit(EventData::DebugBreakpointHit { node_id: node_id.clone() });
        let (tx, rx) = oneshot::channel();
        self.parked_release.lock().insert(node_id.clone(), tx);
        self.parked_order.lock().push_back(node_id.clone());
        self.wake.notify_waiters();

        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let _ = rx.await;
            if handle.cancellation.is_cancelled() {
                handle.node_states.lock().insert(node_id.clone(), NodeRunState::Cancelled);
                handle.mark_system_edges(&node_id, &[]);
                handle.wake.notify_waiters();
                return;
            }
            handle.mark_running_if_paused().await;
            let permit = match Arc::clone(&handle.semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            handle.node_states.lock().insert(node_id.clone(), NodeRunState::Running);
            handle.running_count.fetch_add(1, Ordering::SeqCst);
            let streams = handle.prepare_output_streams(&node_id);
            let jh_handle = Arc::clone(&handle);
            let jh_node = node_id.clone();
            let jh = tokio::spawn(run_node_task(jh_handle, jh_node, permit, streams, completion_tx));
            handle.running_handles.lock().insert(node_id, jh);
        });
    }

    /// Create the `MultiChannel`s for any stream-typed output/passthrough
    /// ports before the node starts, so consumers scheduled alongside it can
    /// subscribe to the exact same channel instance — stream ports are
    /// wired to consumers at node-start.
    fn prepare_output_streams(&self, node_id: &str) -> HashMap<PortId, Arc<MultiChannel<serde_json::Value>>> {
        let mut streams = HashMap::new();
        let Some(node) = self.graph.node(node_id) else { return streams };
        for port in &node.ports {
            if port.kind != PortKind::Data || !port.is_stream() {
                continue;
            }
            if !matches!(port.direction, PortDirection::Output | PortDirection::Passthrough) {
                continue;
            }
            let channel = Arc::new(MultiChannel::new(
                self.config.channel_high_water_mark,
                self.config.channel_low_water_mark,
                self.config.cancel_grace_period,
            ));
            self.outputs
                .lock()
                .insert((node_id.to_string(), port.id.clone()), crate::value::PortValue::Stream(Arc::clone(&channel)));
            streams.insert(port.id.clone(), channel);
        }
        streams
    }

    /// Rescan every `Idle` node for readiness/skip (repeating until a pass
    /// makes no further progress, so skip cascades resolve within one tick),
    /// then launch as many `Ready` nodes as the semaphore allows, in FIFO
    /// order of becoming ready. A stream-sourced data
    /// edge lets its consumer become ready the moment its producer is
    /// `Running`, since stream consumers begin immediately alongside
    /// producers, so launching a node can itself unblock another node's
    /// readiness within the same tick — the whole rescan+launch cycle
    /// repeats until a pass launches nothing, instead of waiting for the
    /// next completion or control-plane wakeup.
    fn rescan_and_launch(self: &Arc<Self>, completion_tx: &mpsc::UnboundedSender<NodeCompletion>) {
        loop {
            self.rescan_idle_nodes();

            if self.pause_requested.load(Ordering::SeqCst) || self.cancellation.is_cancelled() {
                return;
            }

            if !self.launch_ready_nodes(completion_tx) {
                break;
            }
        }
    }

    /// Transition every `Idle` node to `Ready`/`Skipped`, looping until a
    /// pass makes no further progress.
    fn rescan_idle_nodes(&self) {
        loop {
            let idle: Vec<NodeId> = self
                .node_states
                .lock()
                .iter()
                .filter(|(_, s)| **s == NodeRunState::Idle)
                .map(|(id, _)| id.clone())
                .collect();
            let mut changed = false;
            for node_id in idle {
                match self.node_is_ready_or_skip(&node_id) {
                    ReadyCheck::Ready => {
                        self.node_states.lock().insert(node_id.clone(), NodeRunState::Ready);
                        self.ready_rank.lock().insert(node_id, self.next_rank.fetch_add(1, Ordering::SeqCst));
                        changed = true;
                    }
                    ReadyCheck::Skip => {
                        self.node_states.lock().insert(node_id.clone(), NodeRunState::Skipped);
                        self.emit(EventData::NodeSkipped { node_id: node_id.clone() });
                        self.mark_system_edges(&node_id, &[]);
                        changed = true;
                    }
                    ReadyCheck::Wait => {}
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Launch every currently `Ready` node the semaphore allows, in FIFO
    /// order of becoming ready. Returns whether any node was launched
    /// (parked-for-breakpoint counts as a launch for this purpose: it
    /// leaves `Ready`, so the caller must re-run readiness).
    fn launch_ready_nodes(self: &Arc<Self>, completion_tx: &mpsc::UnboundedSender<NodeCompletion>) -> bool {
        let mut ready: Vec<NodeId> = self
            .node_states
            .lock()
            .iter()
            .filter(|(_, s)| **s == NodeRunState::Ready)
            .map(|(id, _)| id.clone())
            .collect();
        let ranks = self.ready_rank.lock();
        ready.sort_by_key(|id| ranks.get(id).copied().unwrap_or(u64::MAX));
        drop(ranks);

        let breakpoints = self.breakpoints.lock().clone();
        let mut launched_any = false;
        for node_id in ready {
            if breakpoints.contains(&node_id) {
                self.park_for_breakpoint(node_id, completion_tx.clone());
                launched_any = true;
                continue;
            }
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => {
                    self.node_states.lock().insert(node_id.clone(), NodeRunState::Running);
                    self.running_count.fetch_add(1, Ordering::SeqCst);
                    let streams = self.prepare_output_streams(&node_id);
                    let handle = Arc::clone(self);
                    let node_for_task = node_id.clone();
                    let jh = tokio::spawn(run_node_task(handle, node_for_task, permit, streams, completion_tx.clone()));
                    self.running_handles.lock().insert(node_id, jh);
                    launched_any = true;
                }
                Err(_) => break,
            }
        }
        launched_any
    }

    async fn handle_completion(self: &Arc<Self>, completion: NodeCompletion) {
        let NodeCompletion { node_id, outcome } = completion;
        self.running_handles.lock().remove(&node_id);

        match outcome {
            NodeOutcome::Completed { output, emitted } => {
                self.node_states.lock().insert(node_id.clone(), NodeRunState::Completed);
                for (port_id, value) in &output.data {
                    self.outputs.lock().insert((node_id.clone(), port_id.clone()), value.transfer_copy());
                }
                let outputs_json = serde_json::to_value(
                    output
                        .data
                        .iter()
                        .map(|(k, v)| (k.clone(), v.as_scalar().cloned().unwrap_or(serde_json::Value::Null)))
                        .collect::<HashMap<_, _>>(),
                )
                .unwrap_or(serde_json::Value::Null);
                self.emit(EventData::NodeCompleted { node_id: node_id.clone(), outputs: outputs_json });

                self.propagate_data_edges(&node_id);
                self.mark_system_edges(&node_id, &output.system_outputs);

                for ev in emitted {
                    self.spawn_child_if_bound(&node_id, ev).await;
                }
            }
            NodeOutcome::Failed(error) => {
                self.node_states.lock().insert(node_id.clone(), NodeRunState::Failed);
                self.emit(EventData::NodeFailed { node_id: node_id.clone(), cause: error.to_string() });
                self.route_error_or_fail(&node_id, error);
            }
            NodeOutcome::TimedOut => {
                self.node_states.lock().insert(node_id.clone(), NodeRunState::Failed);
                self.emit(EventData::NodeTimedOut { node_id: node_id.clone() });
                self.route_error_or_fail(&node_id, EngineError::Timeout(format!("node '{node_id}' timed out")));
            }
            NodeOutcome::CancelledBeforeRun => {
                self.node_states.lock().insert(node_id.clone(), NodeRunState::Cancelled);
                self.mark_system_edges(&node_id, &[]);
            }
        }

        self.running_count.fetch_sub(1, Ordering::SeqCst);
        self.maybe_transition_paused().await;
        self.wake.notify_waiters();
    }

    /// Copy completed non-stream output values across every outgoing data
    /// edge, emitting the paired transfer events.
    /// Stream-typed outputs are wired once at node-start instead.
    fn propagate_data_edges(&self, node_id: &str) {
        let Some(node) = self.graph.node(node_id) else { return };
        for edge in self.graph.outgoing_edges(node_id) {
            if self.graph.is_system_edge(edge) {
                continue;
            }
            let Some(source_port) = node.port(&edge.source_port_id) else { continue };
            if source_port.is_stream() {
                continue;
            }
            let value = self.outputs.lock().get(&(node_id.to_string(), edge.source_port_id.clone())).cloned();
            let Some(value) = value else { continue };

            self.emit(EventData::EdgeTransferStarted {
                edge_id: edge.id.clone(),
                source_node_id: edge.source_node_id.clone(),
                target_node_id: edge.target_node_id.clone(),
            });

            if let Some(target_port) = self.graph.node(&edge.target_node_id).and_then(|n| n.port(&edge.target_port_id)) {
                if let Err(err) = value.validate(&edge.target_port_id, &target_port.config) {
                    self.route_error_or_fail(node_id, err);
                    continue;
                }
            }

            self.outputs
                .lock()
                .insert((edge.target_node_id.clone(), edge.target_port_id.clone()), value);

            self.emit(EventData::EdgeTransferCompleted {
                edge_id: edge.id.clone(),
                source_node_id: edge.source_node_id.clone(),
                target_node_id: edge.target_node_id.clone(),
            });
        }
    }

    /// A node-emitted named event, if bound in the
    /// flow's `event_child_flows`, spawns an independent child execution.
    async fn spawn_child_if_bound(&self, node_id: &str, emitted: EmittedEvent) {
        let child_flow_id = self.graph.child_flow_for_event(&emitted.name).map(|s| s.to_string());
        let child_execution_id = if let (Some(flow_id), Some(engine)) = (&child_flow_id, self.engine()) {
            let depth = self
                .store
                .get_execution(&self.execution_id)
                .await
                .ok()
                .flatten()
                .map(|row| row.execution_depth)
                .unwrap_or(0);
            let options = ExecutionOptions {
                parent_execution_id: Some(self.execution_id.clone()),
                external_event: Some(emitted.payload.clone()),
                ..Default::default()
            };
            match engine.create(flow_id, options).await {
                Ok(child_id) => {
                    let engine2 = engine.clone();
                    let child_id2 = child_id.clone();
                    // Children are independent: start them without
                    // blocking the parent's own scheduling loop.
                    let _ = depth;
                    tokio::spawn(async move {
                        let _ = engine2.start(&child_id2).await;
                    });
                    Some(child_id)
                }
                Err(err) => {
                    log::warn!("failed to spawn child execution for event '{}': {err}", emitted.name);
                    None
                }
            }
        } else {
            None
        };

        self.emit(EventData::UserEvent {
            node_id: node_id.to_string(),
            name: emitted.name,
            payload: emitted.payload,
            child_execution_id,
        });
    }

    async fn run(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<NodeCompletion>();
        loop {
            self.rescan_and_launch(&tx);
            self.maybe_transition_paused().await;
            if self.try_finish().await {
                break;
            }
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(completion) => self.handle_completion(completion).await,
                        None => break,
                    }
                }
                () = self.wake.notified() => {}
            }
        }
    }
}

/// If an execution's event persistence failure is sustained beyond this
/// threshold, the execution is failed with `PersistenceFailure`. Transient
/// append errors are only logged by the persistor itself; this watchdog is
/// what escalates a prolonged outage to a terminal status instead of
/// leaving the execution running against a store that can no longer
/// durably record it.
const SUSTAINED_PERSISTENCE_FAILURE_THRESHOLD: Duration = Duration::from_secs(30);

async fn persistence_watchdog(handle: Arc<ExecutionHandle>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if handle.status.lock().is_terminal() {
            return;
        }
        if handle.persistor.is_degraded(SUSTAINED_PERSISTENCE_FAILURE_THRESHOLD) {
            handle.fail_execution(
                EngineError::PersistenceFailure("no successful event append in over 30s".to_string()).to_string(),
                None,
            );
            handle.wake.notify_waiters();
            return;
        }
    }
}

/// Gather a node's resolved inputs from already-completed upstream values or
/// port defaults.
fn gather_inputs(handle: &ExecutionHandle, node_id: &str) -> HashMap<PortId, crate::value::PortValue> {
    let mut inputs = HashMap::new();
    let Some(node) = handle.graph.node(node_id) else { return inputs };
    for port in &node.ports {
        if port.kind != PortKind::Data || !matches!(port.direction, PortDirection::Input | PortDirection::Passthrough) {
            continue;
        }
        let incoming = handle.graph.edges_to_port(node_id, &port.id);
        let value = incoming.first().and_then(|edge| {
            handle
                .outputs
                .lock()
                .get(&(edge.source_node_id.clone(), edge.source_port_id.clone()))
                .cloned()
        });
        let value = value.or_else(|| port.default_value.clone().map(crate::value::PortValue::Scalar));
        if let Some(v) = value {
            inputs.insert(port.id.clone(), v);
        }
    }
    inputs
}

/// Body of one node's task: resolve inputs, run the registered executor
/// under its timeout, and report the outcome back to the driver. Runs inside
/// its own `tokio::spawn`, holding `permit` for its lifetime so the
/// semaphore accounts for it as one occupied concurrency slot against the
/// execution's configured concurrency bound.
async fn run_node_task(
    handle: Arc<ExecutionHandle>,
    node_id: NodeId,
    permit: tokio::sync::OwnedSemaphorePermit,
    output_streams: HashMap<PortId, Arc<MultiChannel<serde_json::Value>>>,
    completion_tx: mpsc::UnboundedSender<NodeCompletion>,
) {
    let node = match handle.graph.node(&node_id) {
        Some(n) => n.clone(),
        None => {
            let _ = completion_tx.send(NodeCompletion {
                node_id,
                outcome: NodeOutcome::Failed(EngineError::not_found("node missing from snapshot")),
            });
            return;
        }
    };

    handle.emit(EventData::NodeStarted { node_id: node_id.clone() });

    let inputs = gather_inputs(&handle, &node_id);
    let ctx = ExecutionContext::new(
        handle.execution_id.clone(),
        node_id.clone(),
        inputs,
        Arc::clone(&handle.config),
        handle.cancellation.clone(),
    )
    .with_output_streams(output_streams);

    let executor = match handle.registry.get_executor(&node.node_type) {
        Ok(e) => e,
        Err(e) => {
            drop(permit);
            let _ = completion_tx.send(NodeCompletion { node_id, outcome: NodeOutcome::Failed(e) });
            return;
        }
    };

    let timeout = handle.options.node_timeout_ms.map(Duration::from_millis).unwrap_or(handle.config.node_timeout);

    let outcome = tokio::select! {
        res = tokio::time::timeout(timeout, executor.execute(&ctx)) => {
            match res {
                Ok(Ok(output)) => NodeOutcome::Completed { output, emitted: ctx.take_emitted_events() },
                Ok(Err(e)) => NodeOutcome::Failed(e),
                Err(_elapsed) => NodeOutcome::TimedOut,
            }
        }
        () = handle.cancellation.cancelled() => NodeOutcome::CancelledBeforeRun,
    };

    drop(permit);
    let _ = completion_tx.send(NodeCompletion { node_id, outcome });
}

/// Shared engine state: registry, collaborators, and the live executions
/// table. Wrapped by [`ExecutionEngine`] (cheaply `Clone`-able) so control-API
/// calls and child-execution spawning can share one instance without
/// threading `&mut` anywhere.
struct EngineInner {
    config: Arc<EngineConfig>,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn ExecutionStore>,
    flow_store: Arc<dyn FlowStore>,
    executions: Mutex<HashMap<ExecutionId, Arc<ExecutionHandle>>>,
    flow_events: Mutex<HashMap<FlowId, Arc<FlowEventHub>>>,
}

/// The Control API and event subscription protocol entry
/// point. Cheaply cloneable; every clone shares the same execution table.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    pub fn new(
        config: Arc<EngineConfig>,
        registry: Arc<NodeRegistry>,
        store: Arc<dyn ExecutionStore>,
        flow_store: Arc<dyn FlowStore>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                store,
                flow_store,
                executions: Mutex::new(HashMap::new()),
                flow_events: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn flow_event_hub(&self, flow_id: &str) -> Arc<FlowEventHub> {
        self.inner
            .flow_events
            .lock()
            .entry(flow_id.to_string())
            .or_insert_with(|| Arc::new(FlowEventHub::new()))
            .clone()
    }

    fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>> {
        self.inner
            .executions
            .lock()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("execution '{execution_id}'")))
    }

    /// `create(flowId, options)`: snapshot the named flow, validate
    /// it, and register a fresh, not-yet-started execution.
    pub async fn create(&self, flow_id: &str, options: ExecutionOptions) -> Result<ExecutionId> {
        let flow = self
            .inner
            .flow_store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("flow '{flow_id}'")))?;

        let errors = validate_flow(&flow);
        if let Some(first) = errors.first() {
            return Err(EngineError::invalid_state(format!("flow '{flow_id}' failed validation: {first}")));
        }

        let execution_depth = match &options.parent_execution_id {
            Some(parent_id) => {
                let parent = self
                    .inner
                    .store
                    .get_execution(parent_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found(format!("parent execution '{parent_id}'")))?;
                parent.execution_depth + 1
            }
            None => 0,
        };

        let execution_id = uuid::Uuid::new_v4().to_string();
        let mut row = ExecutionRow::new(execution_id.clone(), flow_id.to_string(), execution_depth);
        row.owner_id = options.owner.clone();
        row.parent_execution_id = options.parent_execution_id.clone();
        row.external_events = options.external_event.clone();
        self.inner.store.create_execution(row).await?;

        let mut config = (*self.inner.config).clone();
        if let Some(max_concurrency) = options.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
        let config = Arc::new(config);

        let mut breakpoints = HashSet::new();
        if options.debug {
            breakpoints.extend(options.breakpoints.iter().cloned());
        }

        let handle = Arc::new(ExecutionHandle {
            execution_id: execution_id.clone(),
            flow_id: flow_id.to_string(),
            graph: FlowGraphSnapshot::new(flow),
            registry: Arc::clone(&self.inner.registry),
            store: Arc::clone(&self.inner.store),
            engine: Arc::downgrade(&self.inner),
            status: Mutex::new(ExecutionStatus::Created),
            events: EventHub::new(),
            persistor: EventPersistor::spawn(Arc::clone(&self.inner.store), execution_id.clone(), Arc::clone(&config)),
            cancellation: CancellationToken::new(),
            node_states: Mutex::new(HashMap::new()),
            ready_rank: Mutex::new(HashMap::new()),
            next_rank: AtomicU64::new(0),
            outputs: Mutex::new(HashMap::new()),
            system_edge_state: Mutex::new(HashMap::new()),
            breakpoints: Mutex::new(Arc::new(breakpoints)),
            parked_order: Mutex::new(VecDeque::new()),
            parked_release: Mutex::new(HashMap::new()),
            pause_requested: AtomicBool::new(false),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            running_count: AtomicUsize::new(0),
            running_handles: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            wake: tokio::sync::Notify::new(),
            error: Mutex::new(None),
            options,
            config,
        });

        for node_id in handle.graph.nodes() {
            handle.node_states.lock().insert(node_id.clone(), NodeRunState::Idle);
        }

        self.inner.executions.lock().insert(execution_id.clone(), handle);
        Ok(execution_id)
    }

    /// `start(executionId)`: idempotent once started; errors on a
    /// terminal execution.
    pub async fn start(&self, execution_id: &str) -> Result<()> {
        let handle = self.handle(execution_id)?;
        {
            let status = handle.status.lock();
            if status.is_terminal() {
                return Err(EngineError::invalid_state(format!("execution '{execution_id}' is already {status}")));
            }
        }
        if handle.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *handle.status.lock() = ExecutionStatus::Running;
        let started_at = Utc::now();
        self.inner
            .store
            .update_status(execution_id, ExecutionStatus::Running, Some(started_at), None, None)
            .await?;
        handle.emit(EventData::FlowStarted { flow_id: handle.flow_id.clone() });

        let flow_timeout = handle.options.flow_timeout_ms.map(Duration::from_millis).unwrap_or(handle.config.flow_timeout);
        let engine = self.clone();
        let execution_id_owned = execution_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(flow_timeout).await;
            let _ = engine.stop(&execution_id_owned).await;
        });

        tokio::spawn(persistence_watchdog(Arc::clone(&handle)));
        tokio::spawn(Arc::clone(&handle).run());
        Ok(())
    }

    /// `pause(executionId)`: only legal while running.
    pub async fn pause(&self, execution_id: &str) -> Result<()> {
        let handle = self.handle(execution_id)?;
        {
            let status = handle.status.lock();
            if *status != ExecutionStatus::Running {
                return Err(EngineError::invalid_state(format!("cannot pause execution in state '{status}'")));
            }
        }
        handle.pause_requested.store(true, Ordering::SeqCst);
        handle.maybe_transition_paused().await;
        handle.wake.notify_waiters();
        Ok(())
    }

    /// `resume(executionId)`: only legal while paused; releases every
    /// parked node and clears the pause flag.
    pub async fn resume(&self, execution_id: &str) -> Result<()> {
        let handle = self.handle(execution_id)?;
        {
            let mut status = handle.status.lock();
            if *status != ExecutionStatus::Paused {
                return Err(EngineError::invalid_state(format!("cannot resume execution in state '{status}'")));
            }
            *status = ExecutionStatus::Running;
        }
        handle.pause_requested.store(false, Ordering::SeqCst);
        let _ = self.inner.store.update_status(execution_id, ExecutionStatus::Running, None, None, None).await;
        handle.emit(EventData::FlowResumed);

        let parked: Vec<NodeId> = handle.parked_order.lock().drain(..).collect();
        let mut releases = handle.parked_release.lock();
        for id in parked {
            if let Some(tx) = releases.remove(&id) {
                let _ = tx.send(());
            }
        }
        drop(releases);
        handle.wake.notify_waiters();
        Ok(())
    }

    /// `step(executionId)`: only legal while paused; releases exactly
    /// one parked node.
    pub async fn step(&self, execution_id: &str) -> Result<()> {
        let handle = self.handle(execution_id)?;
        {
            let status = handle.status.lock();
            if *status != ExecutionStatus::Paused {
                return Err(EngineError::invalid_state(format!("cannot step execution in state '{status}'")));
            }
        }
        let node_id = handle
            .parked_order
            .lock()
            .pop_front()
            .ok_or_else(|| EngineError::invalid_state("no parked node to step"))?;
        let tx = handle.parked_release.lock().remove(&node_id);
        handle.emit(EventData::DebugStepTaken { node_id });
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        handle.wake.notify_waiters();
        Ok(())
    }

    /// `stop(executionId)`: legal from any non-terminal state;
    /// idempotent on an already-terminal one. Cascades cancellation and
    /// force-abandons nodes still running after the grace period.
    pub async fn stop(&self, execution_id: &str) -> Result<()> {
        let handle = self.handle(execution_id)?;
        if handle.status.lock().is_terminal() {
            return Ok(());
        }
        handle.cancellation.cancel();
        handle.cancel_non_terminal_nodes();
        handle.wake.notify_waiters();

        let grace = handle.config.cancel_grace_period;
        let handle_for_grace = Arc::clone(&handle);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let unresponsive: Vec<(NodeId, JoinHandle<()>)> = {
                let mut running = handle_for_grace.running_handles.lock();
                running.drain().collect()
            };
            for (node_id, jh) in unresponsive {
                jh.abort();
                handle_for_grace.node_states.lock().insert(node_id.clone(), NodeRunState::Failed);
                handle_for_grace.emit(EventData::NodeFailed {
                    node_id: node_id.clone(),
                    cause: "cancelled-unresponsive".to_string(),
                });
                handle_for_grace.mark_system_edges(&node_id, &[]);
                handle_for_grace.running_count.fetch_sub(1, Ordering::SeqCst);
            }
            handle_for_grace.wake.notify_waiters();
        });
        Ok(())
    }

    /// `addBreakpoint(executionId, nodeId)`: copy-on-write update —
    /// the breakpoint set is replaced with a new `Arc`, never mutated in
    /// place, so the scheduler's concurrent reads never observe a torn set.
    pub fn add_breakpoint(&self, execution_id: &str, node_id: &str) -> Result<()> {
        let handle = self.handle(execution_id)?;
        let mut current = handle.breakpoints.lock();
        if current.contains(node_id) {
            return Ok(());
        }
        let mut next = HashSet::clone(&current);
        next.insert(node_id.to_string());
        *current = Arc::new(next);
        drop(current);
        handle.wake.notify_waiters();
        Ok(())
    }

    pub fn remove_breakpoint(&self, execution_id: &str, node_id: &str) -> Result<()> {
        let handle = self.handle(execution_id)?;
        let mut current = handle.breakpoints.lock();
        if !current.contains(node_id) {
            return Ok(());
        }
        let mut next = HashSet::clone(&current);
        next.remove(node_id);
        *current = Arc::new(next);
        Ok(())
    }

    pub fn get_breakpoints(&self, execution_id: &str) -> Result<Vec<NodeId>> {
        let handle = self.handle(execution_id)?;
        Ok(handle.breakpoints.lock().iter().cloned().collect())
    }

    /// `getState(executionId)`. The store is the source of truth for
    /// status/timings/error — the engine writes through to it synchronously
    /// on every status transition.
    pub async fn get_state(&self, execution_id: &str) -> Result<ExecutionState> {
        let row = self
            .inner
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("execution '{execution_id}'")))?;
        Ok(ExecutionState {
            execution_id: row.id,
            flow_id: row.flow_id,
            status: row.status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error: row.error_message.map(|message| ExecutionError { message, node_id: row.error_node_id }),
            execution_depth: row.execution_depth,
            parent_execution_id: row.parent_execution_id,
        })
    }

    /// `subscribeToEvents(executionId, { eventTypes?, lastEventId? })`:
    /// replay everything since `lastEventId` then stream live.
    pub async fn subscribe_to_events(
        &self,
        execution_id: &str,
        event_types: Option<Vec<String>>,
        last_event_id: Option<String>,
    ) -> Result<EventSubscription> {
        let filter = event_types.map(|types| types.into_iter().collect::<HashSet<_>>());
        let start_index = last_event_id.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        if let Some(handle) = self.inner.executions.lock().get(execution_id).cloned() {
            let (replay, queue) = handle.events.subscribe(handle.config.event_queue_capacity, start_index);
            return Ok(EventSubscription::new(replay, Some(queue), filter, start_index));
        }

        // Historical/unknown-to-this-process execution: serve purely from
        // the durable log.
        self.inner
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("execution '{execution_id}'")))?;
        let events = self.inner.store.list_events_since(execution_id, start_index).await?;
        Ok(EventSubscription::new(events.into(), None, filter, start_index))
    }

    /// Notify the engine of a flow mutation made by the external authoring
    /// system that owns the `FlowStore`. The engine itself never mutates flows; this is
    /// how an editor/API layer feeds `NodeAdded`/`EdgeAdded`/etc. into every
    /// live `subscribeFlowEvents` listener for that `flowId`.
    pub fn notify_flow_changed(&self, event: FlowEvent) {
        let hub = self.flow_event_hub(event.flow_id());
        hub.publish(event);
    }

    /// `subscribeFlowEvents(flowId, { eventTypes?, lastEventId? })`:
    /// synthesizes the current flow snapshot as `FlowInit*` events, then
    /// streams live mutations notified via [`Self::notify_flow_changed`].
    pub async fn subscribe_flow_events(
        &self,
        flow_id: &str,
        event_types: Option<Vec<String>>,
        last_event_id: Option<String>,
    ) -> Result<FlowEventSubscription> {
        let filter = event_types.map(|types| types.into_iter().collect::<HashSet<_>>());
        let start_index = last_event_id.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        let flow = self
            .inner
            .flow_store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("flow '{flow_id}'")))?;

        let hub = self.flow_event_hub(flow_id);
        let (replay, queue) = hub.synthesize_and_subscribe(&flow, self.inner.config.event_queue_capacity);
        let replay: VecDeque<IndexedFlowEvent> = replay.into_iter().collect();
        Ok(FlowEventSubscription::new(replay, queue, filter, start_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowBuilder;
    use crate::context::NodeOutput;
    use crate::descriptor::{NodeCategory, NodeMetadata, PortTemplate};
    use crate::model::PortDirection;
    use crate::registry::NodeRegistry;
    use crate::store::{InMemoryExecutionStore, InMemoryFlowStore};
    use crate::value::{PortConfig, PortValue};
    use std::time::Duration as StdDuration;

    fn metadata(node_type: &str) -> NodeMetadata {
        NodeMetadata {
            node_type: node_type.to_string(),
            category: NodeCategory::Processing,
            label: node_type.to_string(),
            description: String::new(),
            ports: vec![],
        }
    }

    fn test_engine(registry: NodeRegistry) -> (ExecutionEngine, Arc<InMemoryFlowStore>) {
        let flow_store = Arc::new(InMemoryFlowStore::new());
        let engine = ExecutionEngine::new(
            Arc::new(EngineConfig::default()),
            Arc::new(registry),
            Arc::new(InMemoryExecutionStore::new()),
            Arc::clone(&flow_store) as Arc<dyn FlowStore>,
        );
        (engine, flow_store)
    }

    async fn drain_until_terminal(engine: &ExecutionEngine, execution_id: &str) -> ExecutionState {
        for _ in 0..200 {
            let state = engine.get_state(execution_id).await.unwrap();
            if state.status.is_terminal() {
                return state;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("execution '{execution_id}' did not reach a terminal state in time");
    }

    /// Linear addition: `Number(2) -> Add -> Number(3) -> Add -> Output`.
    #[tokio::test]
    async fn linear_addition_flow_completes_with_expected_sum() {
        let mut registry = NodeRegistry::new();
        registry.register_callback(metadata("const"), |ctx| async move {
            let value = ctx.require_input("value")?.clone();
            Ok(NodeOutput::new().with_data("out", value).activate("then"))
        });
        registry.register_callback(metadata("add"), |ctx| async move {
            let a = ctx.require_input("a")?.as_scalar().and_then(|v| v.as_i64()).unwrap_or(0);
            let b = ctx.require_input("b")?.as_scalar().and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(NodeOutput::new().with_data("sum", PortValue::scalar(serde_json::json!(a + b))).activate("then"))
        });

        let (engine, flow_store) = test_engine(registry);

        let flow = FlowBuilder::new("f1", "Linear addition")
            .add_node("two", "const", "Two")
            .add_system_port("two", "then", PortDirection::Output)
            .add_data_port("two", "value", PortDirection::Input, PortConfig::Number)
            .add_data_port("two", "out", PortDirection::Output, PortConfig::Number)
            .with_config(serde_json::json!({}))
            .add_node("three", "const", "Three")
            .add_system_port("three", "start", PortDirection::Input)
            .add_system_port("three", "then", PortDirection::Output)
            .add_data_port("three", "value", PortDirection::Input, PortConfig::Number)
            .add_data_port("three", "out", PortDirection::Output, PortConfig::Number)
            .add_node("sum", "add", "Sum")
            .add_system_port("sum", "start", PortDirection::Input)
            .add_data_port("sum", "a", PortDirection::Input, PortConfig::Number)
            .add_data_port("sum", "b", PortDirection::Input, PortConfig::Number)
            .add_data_port("sum", "sum", PortDirection::Output, PortConfig::Number)
            .add_system_edge("two", "then", "three", "start")
            .add_system_edge("three", "then", "sum", "start")
            .add_data_edge("two", "out", "sum", "a")
            .add_data_edge("three", "out", "sum", "b")
            .build();

        // Stamp default values directly on the ports the const nodes read.
        let mut flow = flow;
        for (node_id, value) in [("two", 2), ("three", 3)] {
            let node = flow.nodes.iter_mut().find(|n| n.id == node_id).unwrap();
            let port = node.ports.iter_mut().find(|p| p.id == "value").unwrap();
            port.default_value = Some(serde_json::json!(value));
        }
        flow_store.insert(flow);

        let execution_id = engine.create("f1", ExecutionOptions::default()).await.unwrap();
        engine.start(&execution_id).await.unwrap();

        let mut sub = engine.subscribe_to_events(&execution_id, None, None).await.unwrap();
        let mut saw_sum_completed = false;
        while let Some(event) = sub.next().await {
            if let EventData::NodeCompleted { node_id, outputs } = &event.data {
                if node_id == "sum" {
                    assert_eq!(outputs["sum"], serde_json::json!(5));
                    saw_sum_completed = true;
                }
            }
            if event.data.is_flow_terminal() {
                break;
            }
        }
        assert!(saw_sum_completed);

        let state = drain_until_terminal(&engine, &execution_id).await;
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    /// Breakpoint + step.
    #[tokio::test]
    async fn breakpoint_pauses_execution_and_step_releases_one_node() {
        let mut registry = NodeRegistry::new();
        registry.register_callback(metadata("noop"), |_ctx| async move { Ok(NodeOutput::new().activate("then")) });

        let (engine, flow_store) = test_engine(registry);
        let flow = FlowBuilder::new("f1", "Breakpoint")
            .add_node("a", "noop", "A")
            .add_system_port("a", "then", PortDirection::Output)
            .add_node("b", "noop", "B")
            .add_system_port("b", "start", PortDirection::Input)
            .add_system_edge("a", "then", "b", "start")
            .build();
        flow_store.insert(flow);

        let options = ExecutionOptions {
            debug: true,
            breakpoints: vec!["a".to_string()],
            ..Default::default()
        };
        let execution_id = engine.create("f1", options).await.unwrap();
        engine.start(&execution_id).await.unwrap();

        let mut sub = engine.subscribe_to_events(&execution_id, None, None).await.unwrap();
        let mut saw_breakpoint = false;
        loop {
            let event = sub.next().await.unwrap();
            if matches!(event.data, EventData::DebugBreakpointHit { .. }) {
                saw_breakpoint = true;
                break;
            }
        }
        assert!(saw_breakpoint);

        for _ in 0..50 {
            if engine.get_state(&execution_id).await.unwrap().status == ExecutionStatus::Paused {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert_eq!(engine.get_state(&execution_id).await.unwrap().status, ExecutionStatus::Paused);

        engine.step(&execution_id).await.unwrap();

        let mut saw_started = false;
        let mut saw_completed = false;
        loop {
            let event = sub.next().await.unwrap();
            match event.data {
                EventData::NodeStarted { ref node_id } if node_id == "a" => saw_started = true,
                EventData::NodeCompleted { ref node_id, .. } if node_id == "a" => saw_completed = true,
                EventData::FlowCompleted => break,
                _ => {}
            }
        }
        assert!(saw_started && saw_completed);

        let state = drain_until_terminal(&engine, &execution_id).await;
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    /// Property 4 — concurrency bound: never more than `maxConcurrency`
    /// nodes run at once.
    #[tokio::test]
    async fn concurrency_bound_is_respected() {
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let observed_peak = Arc::new(AtomicUsize::new(0));

        let mut registry = NodeRegistry::new();
        {
            let max_concurrent = Arc::clone(&max_concurrent);
            let observed_peak = Arc::clone(&observed_peak);
            registry.register_callback(metadata("slow"), move |_ctx| {
                let max_concurrent = Arc::clone(&max_concurrent);
                let observed_peak = Arc::clone(&observed_peak);
                async move {
                    let current = max_concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    observed_peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(30)).await;
                    max_concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(NodeOutput::new())
                }
            });
        }

        let (engine, flow_store) = test_engine(registry);
        let mut builder = FlowBuilder::new("f1", "Fan out");
        for i in 0..4 {
            builder = builder.add_node(&format!("n{i}"), "slow", &format!("N{i}"));
        }
        flow_store.insert(builder.build());

        let options = ExecutionOptions { max_concurrency: Some(2), ..Default::default() };
        let execution_id = engine.create("f1", options).await.unwrap();
        engine.start(&execution_id).await.unwrap();

        let state = drain_until_terminal(&engine, &execution_id).await;
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert!(observed_peak.load(Ordering::SeqCst) <= 2);
    }

    /// Property 6 — a node is skipped iff every incoming system edge is
    /// known not-selected.
    #[tokio::test]
    async fn unselected_branch_skips_the_successor() {
        let mut registry = NodeRegistry::new();
        registry.register_callback(metadata("router"), |_ctx| async move {
            // Only activates "then_a"; "then_b" is never selected.
            Ok(NodeOutput::new().activate("then_a"))
        });
        registry.register_callback(metadata("noop"), |_ctx| async move { Ok(NodeOutput::new().activate("then")) });

        let (engine, flow_store) = test_engine(registry);
        let flow = FlowBuilder::new("f1", "Branch")
            .add_node("router", "router", "Router")
            .add_system_port("router", "then_a", PortDirection::Output)
            .add_system_port("router", "then_b", PortDirection::Output)
            .add_node("a", "noop", "A")
            .add_system_port("a", "start", PortDirection::Input)
            .add_node("b", "noop", "B")
            .add_system_port("b", "start", PortDirection::Input)
            .add_system_edge("router", "then_a", "a", "start")
            .add_system_edge("router", "then_b", "b", "start")
            .build();
        flow_store.insert(flow);

        let execution_id = engine.create("f1", ExecutionOptions::default()).await.unwrap();
        engine.start(&execution_id).await.unwrap();

        let mut sub = engine.subscribe_to_events(&execution_id, None, None).await.unwrap();
        let mut skipped = None;
        loop {
            let event = sub.next().await.unwrap();
            if let EventData::NodeSkipped { node_id } = event.data {
                skipped = Some(node_id);
            }
            if event.data.is_flow_terminal() {
                break;
            }
        }
        assert_eq!(skipped.as_deref(), Some("b"));

        let state = drain_until_terminal(&engine, &execution_id).await;
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    /// A node that outlives its per-node timeout fails the flow.
    #[tokio::test]
    async fn node_timeout_fails_the_flow() {
        let mut registry = NodeRegistry::new();
        registry.register_callback(metadata("sleep_forever"), |ctx| async move {
            loop {
                tokio::time::sleep(StdDuration::from_millis(20)).await;
                if ctx.cancellation.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
            }
        });

        let (engine, flow_store) = test_engine(registry);
        flow_store.insert(FlowBuilder::new("f1", "Timeout").add_node("sleepy", "sleep_forever", "Sleepy").build());

        let options = ExecutionOptions { node_timeout_ms: Some(50), ..Default::default() };
        let execution_id = engine.create("f1", options).await.unwrap();
        engine.start(&execution_id).await.unwrap();

        let state = drain_until_terminal(&engine, &execution_id).await;
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.error.unwrap().node_id.as_deref(), Some("sleepy"));
    }

    /// `stop()` cancels a running execution within its grace period.
    #[tokio::test]
    async fn stop_cancels_running_execution() {
        let mut registry = NodeRegistry::new();
        registry.register_callback(metadata("sleep_forever"), |ctx| async move {
            loop {
                tokio::time::sleep(StdDuration::from_millis(20)).await;
                if ctx.cancellation.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
            }
        });

        let (engine, flow_store) = test_engine(registry);
        flow_store.insert(FlowBuilder::new("f1", "Stop me").add_node("sleepy", "sleep_forever", "Sleepy").build());

        let execution_id = engine.create("f1", ExecutionOptions::default()).await.unwrap();
        engine.start(&execution_id).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        engine.stop(&execution_id).await.unwrap();

        let state = drain_until_terminal(&engine, &execution_id).await;
        assert_eq!(state.status, ExecutionStatus::Cancelled);
    }

    /// A node-emitted event bound to a child flow spawns an independent
    /// child execution linked by `parentExecutionId`/`executionDepth`.
    #[tokio::test]
    async fn emitted_event_spawns_bound_child_execution() {
        struct EmitterExecutor;

        #[async_trait::async_trait]
        impl crate::registry::NodeExecutor for EmitterExecutor {
            async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeOutput> {
                ctx.emit_event("newTask", serde_json::json!({"task": "follow-up"}));
                Ok(NodeOutput::new())
            }
        }

        struct EmitterFactory;
        impl crate::registry::NodeExecutorFactory for EmitterFactory {
            fn create_executor(&self) -> Arc<dyn crate::registry::NodeExecutor> {
                Arc::new(EmitterExecutor)
            }
        }

        let mut registry = NodeRegistry::new();
        registry.register(metadata("emitter"), Arc::new(EmitterFactory));
        registry.register_callback(metadata("noop"), |_ctx| async move { Ok(NodeOutput::new()) });

        let (engine, flow_store) = test_engine(registry);
        flow_store.insert(
            FlowBuilder::new("child", "Child flow").add_node("only", "noop", "Only").build(),
        );
        flow_store.insert(
            FlowBuilder::new("parent", "Parent flow")
                .add_node("emitter", "emitter", "Emitter")
                .bind_child_flow("newTask", "child")
                .build(),
        );

        let execution_id = engine.create("parent", ExecutionOptions::default()).await.unwrap();
        engine.start(&execution_id).await.unwrap();

        let parent_state = drain_until_terminal(&engine, &execution_id).await;
        assert_eq!(parent_state.status, ExecutionStatus::Completed);

        let mut child_id = None;
        for _ in 0..50 {
            let children = engine.inner.store.list_children_of(&execution_id).await.unwrap();
            if let Some(child) = children.into_iter().next() {
                child_id = Some(child.id);
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        let child_id = child_id.expect("child execution was spawned");
        let child_state = drain_until_terminal(&engine, &child_id).await;
        assert_eq!(child_state.status, ExecutionStatus::Completed);
        assert_eq!(child_state.parent_execution_id.as_deref(), Some(execution_id.as_str()));
        assert_eq!(child_state.execution_depth, 1);
    }

    /// Stream consumer: `RangeStream(1..=5) -> Sum`. The consumer must
    /// start alongside the producer (`NODE_STARTED(Sum)` observed before
    /// `NODE_COMPLETED(RangeStream)`), and still see every item despite
    /// starting mid-stream.
    #[tokio::test]
    async fn stream_consumer_starts_before_producer_completes() {
        let mut registry = NodeRegistry::new();
        registry.register_callback(metadata("range_stream"), |args| async move {
            let stream = args.output_stream("items").expect("stream output wired at node-start");
            for i in 1..=5 {
                stream.publish(serde_json::json!(i)).await?;
                tokio::time::sleep(StdDuration::from_millis(20)).await;
            }
            stream.close();
            Ok(NodeOutput::new())
        });
        registry.register_callback(metadata("sum_stream"), |args| async move {
            let stream = match args.require_input("items")? {
                PortValue::Stream(s) => Arc::clone(s),
                PortValue::Scalar(_) => return Err(EngineError::node_failure(args.node_id.clone(), "expected a stream")),
            };
            let mut cursor = stream.subscribe();
            let mut sum = 0i64;
            while let Some(item) = cursor.next().await {
                let item = item.map_err(|e| EngineError::node_failure(args.node_id.clone(), e))?;
                sum += item.as_i64().unwrap_or(0);
            }
            Ok(NodeOutput::new().with_data("sum", PortValue::scalar(serde_json::json!(sum))))
        });

        let (engine, flow_store) = test_engine(registry);
        let stream_cfg = PortConfig::Stream { item: Box::new(PortConfig::Number) };
        let flow = FlowBuilder::new("f-stream", "Stream fan-out")
            .add_node("producer", "range_stream", "RangeStream")
            .add_data_port("producer", "items", PortDirection::Output, stream_cfg.clone())
            .add_node("consumer", "sum_stream", "Sum")
            .add_data_port("consumer", "items", PortDirection::Input, stream_cfg)
            .add_data_edge("producer", "items", "consumer", "items")
            .build();
        flow_store.insert(flow);

        let execution_id = engine.create("f-stream", ExecutionOptions::default()).await.unwrap();
        engine.start(&execution_id).await.unwrap();

        let mut subscription = engine.subscribe_to_events(&execution_id, None, None).await.unwrap();
        let mut consumer_started_index = None;
        let mut producer_completed_index = None;
        let mut consumer_sum = None;
        loop {
            let event = subscription.next().await.expect("subscription ended before termination");
            match &event.data {
                EventData::NodeStarted { node_id } if node_id == "consumer" => {
                    consumer_started_index = Some(event.index);
                }
                EventData::NodeCompleted { node_id, .. } if node_id == "producer" => {
                    producer_completed_index = Some(event.index);
                }
                EventData::NodeCompleted { node_id, outputs } if node_id == "consumer" => {
                    consumer_sum = outputs.get("sum").and_then(|v| v.as_i64());
                }
                _ => {}
            }
            if event.data.is_flow_terminal() {
                break;
            }
        }

        let consumer_started_index = consumer_started_index.expect("consumer never started");
        let producer_completed_index = producer_completed_index.expect("producer never completed");
        assert!(
            consumer_started_index < producer_completed_index,
            "consumer should start alongside the stream producer, not after it completes"
        );
        assert_eq!(consumer_sum, Some(15));

        let state = drain_until_terminal(&engine, &execution_id).await;
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    /// Initial connection synthesizes `FlowInit*` from the current
    /// snapshot, then live mutations notified via `notify_flow_changed` are
    /// streamed to every subscriber.
    #[tokio::test]
    async fn subscribe_flow_events_synthesizes_init_sequence_then_live_mutations() {
        let (engine, flow_store) = test_engine(NodeRegistry::new());
        let flow = FlowBuilder::new("f-ui", "UI flow")
            .add_node("a", "noop", "A")
            .add_node("b", "noop", "B")
            .add_system_port("a", "then", PortDirection::Output)
            .add_system_port("b", "start", PortDirection::Input)
            .add_system_edge("a", "then", "b", "start")
            .build();
        flow_store.insert(flow);

        let mut sub = engine.subscribe_flow_events("f-ui", None, None).await.unwrap();
        let init_start = sub.next().await.unwrap();
        assert!(matches!(init_start.event, crate::events::FlowEvent::FlowInitStart { .. }));

        let mut node_added = 0;
        let mut edge_added = 0;
        let mut last_index = init_start.index;
        loop {
            let event = sub.next().await.unwrap();
            last_index = event.index;
            match event.event {
                crate::events::FlowEvent::NodeAdded { .. } => node_added += 1,
                crate::events::FlowEvent::EdgeAdded { .. } => edge_added += 1,
                crate::events::FlowEvent::FlowInitEnd { .. } => break,
                _ => panic!("unexpected flow event during init replay"),
            }
        }
        assert_eq!(node_added, 2);
        assert_eq!(edge_added, 1);

        engine.notify_flow_changed(crate::events::FlowEvent::NodeUiPositionChanged {
            flow_id: "f-ui".to_string(),
            node_id: "a".to_string(),
            x: 10.0,
            y: 20.0,
        });
        let moved = sub.next().await.unwrap();
        assert!(moved.index > last_index);
        assert!(matches!(moved.event, crate::events::FlowEvent::NodeUiPositionChanged { .. }));

        // A second subscriber connecting later still gets its own full
        // synthesized snapshot, independent of the first subscriber's cursor.
        let mut sub2 = engine.subscribe_flow_events("f-ui", None, None).await.unwrap();
        let first = sub2.next().await.unwrap();
        assert!(matches!(first.event, crate::events::FlowEvent::FlowInitStart { .. }));
    }
}
