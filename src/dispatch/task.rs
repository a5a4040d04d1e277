//! Background task offload.
//!
//! # Responsibilities
//! - Generate task identifiers
//! - Queue offloaded envelopes with bounded capacity
//! - Run them on an independent pool of task workers
//! - Deliver results to the original connection handle
//!
//! # Design Decisions
//! - Capacity is reserved before the caller is told the task ID, so an
//!   accepted ID always refers to a queued task
//! - No cancellation and no retry: a task that panics is logged and lost
//! - Delivery is best-effort and happens at most once

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatch::envelope::RequestEnvelope;
use crate::dispatch::reply;
use crate::lifecycle::crash::panic_message;
use crate::observability::metrics;
use crate::observability::monitor::{Monitor, MonitorRecord, Phase};
use crate::routing::{RouteTarget, Router};

/// Globally unique task identifier (64 hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    /// Hash the owning worker's label with a fresh random nonce.
    pub fn generate(owner: &str) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut hasher = Sha256::new();
        hasher.update(owner.as_bytes());
        hasher.update(nonce);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Enqueued,
    Executing,
    Delivered,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Enqueued => "enqueued",
            Self::Executing => "executing",
            Self::Delivered => "delivered",
        }
    }
}

/// An offloaded request, carrying the full origin envelope so the result
/// can reach the original caller.
#[derive(Debug)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub target: RouteTarget,
    pub origin: RequestEnvelope,
    /// When the task entered the queue.
    pub enqueued_at: Instant,
    state: TaskState,
}

impl TaskDescriptor {
    pub fn new(task_id: TaskId, target: RouteTarget, origin: RequestEnvelope) -> Self {
        metrics::record_task_state(TaskState::Created.as_str());
        Self {
            task_id,
            target,
            origin,
            enqueued_at: Instant::now(),
            state: TaskState::Created,
        }
    }

    fn advance(&mut self, state: TaskState) {
        tracing::trace!(task_id = %self.task_id, from = self.state.as_str(), to = state.as_str(), "Task state change");
        metrics::record_task_state(state.as_str());
        self.state = state;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("task queue is full")]
    Full,

    #[error("task pool has shut down")]
    Closed,
}

/// Submission side of the task pool.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<TaskDescriptor>,
}

impl TaskQueue {
    fn channel(capacity: usize) -> (Self, mpsc::Receiver<TaskDescriptor>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Reserve room for one task without waiting.
    pub fn try_reserve(&self) -> Result<TaskSlot<'_>, SubmitError> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(TaskSlot { permit }),
            Err(mpsc::error::TrySendError::Full(())) => Err(SubmitError::Full),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SubmitError::Closed),
        }
    }

    pub fn submit(&self, task: TaskDescriptor) -> Result<(), SubmitError> {
        self.try_reserve()?.submit(task);
        Ok(())
    }
}

/// Reserved room for exactly one task.
pub struct TaskSlot<'a> {
    permit: mpsc::Permit<'a, TaskDescriptor>,
}

impl TaskSlot<'_> {
    pub fn submit(self, mut task: TaskDescriptor) {
        task.enqueued_at = Instant::now();
        task.advance(TaskState::Enqueued);
        self.permit.send(task);
    }
}

/// Pool of task workers sharing one queue.
pub struct TaskPool {
    queue: TaskQueue,
    stop: CancellationToken,
    workers: JoinSet<()>,
}

impl TaskPool {
    pub fn spawn(workers: usize, capacity: usize, router: Arc<Router>, monitor: Monitor) -> Self {
        let (queue, rx) = TaskQueue::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let stop = CancellationToken::new();

        let mut set = JoinSet::new();
        for index in 0..workers.max(1) {
            set.spawn(run_task_worker(
                index,
                rx.clone(),
                router.clone(),
                monitor.clone(),
                stop.clone(),
            ));
        }

        tracing::info!(workers = set.len(), capacity, "Task pool started");
        Self {
            queue,
            stop,
            workers: set,
        }
    }

    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    /// Let running tasks finish, then stop. Queued tasks are dropped.
    pub async fn shutdown(mut self, grace: Duration) {
        self.stop.cancel();
        let drained = tokio::time::timeout(grace, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = self.workers.len(), "Task workers did not stop in time, aborting");
            self.workers.abort_all();
        }
        tracing::info!("Task pool stopped");
    }
}

async fn run_task_worker(
    index: usize,
    rx: Arc<Mutex<mpsc::Receiver<TaskDescriptor>>>,
    router: Arc<Router>,
    monitor: Monitor,
    stop: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            task = async { rx.lock().await.recv().await } => task,
        };
        match next {
            Some(task) => execute(index, &router, &monitor, task).await,
            None => break,
        }
    }
    tracing::debug!(task_worker = index, "Task worker exiting");
}

async fn execute(index: usize, router: &Router, monitor: &Monitor, mut task: TaskDescriptor) {
    let waited = task.enqueued_at.elapsed();
    metrics::record_task_wait(waited);
    tracing::debug!(task_worker = index, task_id = %task.task_id, waited_ms = waited.as_millis() as u64, "Task picked up");
    task.advance(TaskState::Executing);
    let started = Instant::now();
    let call = task.origin.route_call(task.target.clone());

    let response = match AssertUnwindSafe(router.invoke(call)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            tracing::error!(
                task_worker = index,
                task_id = %task.task_id,
                target_route = %task.target,
                panic = %panic_message(panic.as_ref()),
                "Task panicked, result lost"
            );
            return;
        }
    };

    monitor.record(MonitorRecord {
        target: task.target.clone(),
        transport: task.origin.transport,
        phase: Phase::Task,
        elapsed: started.elapsed(),
        code: response.code,
    });

    if !task.origin.flags.ack_required {
        tracing::debug!(task_id = %task.task_id, "Task result discarded, caller asked for no reply");
        return;
    }
    if reply::deliver(&task.origin.handle, &response).await {
        task.advance(TaskState::Delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestConfig;
    use crate::dispatch::envelope::{EnvelopeBuilder, TransportKind};
    use crate::dispatch::reply::RecordingReply;
    use crate::dispatch::response::ResponseEnvelope;
    use crate::observability::monitor::MemorySink;
    use serde_json::{json, Value};

    fn envelope(payload: &[u8]) -> (RequestEnvelope, Arc<RecordingReply>) {
        let (handle, reply) = RecordingReply::handle(TransportKind::Tcp, json!(1));
        let envelope = EnvelopeBuilder::new(&RequestConfig::default())
            .from_payload(payload, handle)
            .unwrap();
        (envelope, reply)
    }

    async fn settle(reply: &RecordingReply, expected: usize) {
        for _ in 0..100 {
            if reply.sent().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn task_ids_are_unique_hex() {
        let a = TaskId::generate("worker-0");
        let b = TaskId::generate("worker-0");
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn full_queue_rejects_submission() {
        let (queue, _rx) = TaskQueue::channel(1);
        let (first, _) = envelope(b"{}");
        let (second, _) = envelope(b"{}");
        let target = RouteTarget::new("main", "main");

        queue
            .submit(TaskDescriptor::new(TaskId::generate("t"), target.clone(), first))
            .unwrap();
        assert_eq!(queue.try_reserve().err(), Some(SubmitError::Full));
        assert_eq!(
            queue.submit(TaskDescriptor::new(TaskId::generate("t"), target, second)),
            Err(SubmitError::Full)
        );
    }

    #[tokio::test]
    async fn pool_delivers_result_once() {
        let router = Arc::new(Router::new().route(RouteTarget::new("job", "run"), |call| async move {
            Ok(call.params.get("n").cloned().unwrap_or(Value::Null))
        }));
        let sink = MemorySink::new();
        let pool = TaskPool::spawn(2, 8, router, Monitor::new(sink.clone()));

        let (origin, reply) = envelope(br#"{"n": 5}"#);
        pool.queue()
            .submit(TaskDescriptor::new(TaskId::generate("t"), RouteTarget::new("job", "run"), origin))
            .unwrap();

        settle(&reply, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reply.responses(), vec![ResponseEnvelope::success(json!(5))]);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].phase, Phase::Task);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn suppressed_ack_skips_delivery() {
        let router = Arc::new(Router::new().route(RouteTarget::new("job", "run"), |_call| async move {
            Ok(json!("done"))
        }));
        let sink = MemorySink::new();
        let pool = TaskPool::spawn(1, 8, router, Monitor::new(sink.clone()));

        let (origin, reply) = envelope(br#"{"_recv": 0}"#);
        pool.queue()
            .submit(TaskDescriptor::new(TaskId::generate("t"), RouteTarget::new("job", "run"), origin))
            .unwrap();

        for _ in 0..100 {
            if !sink.records().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.records().len(), 1);
        assert!(reply.sent().is_empty());
        pool.shutdown(Duration::from_secs(1)).await;
    }
}
