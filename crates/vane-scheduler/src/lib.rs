// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Priority-ordered request dispatch: a single priority queue, a dispatch
//! loop, per-model and global concurrency limits, and cancellation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use vane_model::{ChatRequest, ChatResponse, ProtocolClient, ServiceError, TaskKind, TaskPriority};

const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("request queue is full")]
    QueueFull,
    #[error("request was cancelled")]
    Cancelled,
    #[error(transparent)]
    Service(#[from] ServiceError),
}

struct RequestItem {
    request_id: String,
    request: ChatRequest,
    #[allow(dead_code)]
    task: TaskKind,
    priority: TaskPriority,
    model_id: String,
    sequence: u64,
    cancel: Arc<AtomicBool>,
    responder: oneshot::Sender<Result<ChatResponse, SchedulerError>>,
}

impl PartialEq for RequestItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for RequestItem {}

impl PartialOrd for RequestItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestItem {
    /// `BinaryHeap` is a max-heap; higher priority (lower `rank()`) and
    /// earlier submission (lower `sequence`) must sort to the top, so both
    /// comparisons are reversed.
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.rank().cmp(&self.priority.rank()).then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseTimeStats {
    pub sum_ms: u64,
    pub count: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl ResponseTimeStats {
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerStatistics {
    pub total_requests: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub response_times: ResponseTimeStats,
    pub queue_size: usize,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStatistics {
    pub current_size: usize,
    pub max_size: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
}

struct Inner {
    queue: Mutex<BinaryHeap<RequestItem>>,
    notify: Notify,
    shutdown: Notify,
    running: AtomicBool,
    max_queue_size: usize,
    next_sequence: AtomicU64,
    global_concurrency: AtomicU32,
    max_global_concurrency: u32,
    per_model_concurrency: Mutex<HashMap<String, Arc<AtomicU32>>>,
    per_model_max: Mutex<HashMap<String, u32>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    counters: Counters,
    response_times: Mutex<ResponseTimeStats>,
    requests_per_model: Mutex<HashMap<String, u64>>,
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
}

/// Owns the priority queue and dispatch loop for outbound chat requests.
pub struct RequestScheduler {
    inner: Arc<Inner>,
    client: Arc<ProtocolClient>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RequestScheduler {
    pub fn new(client: Arc<ProtocolClient>, max_queue_size: usize, max_global_concurrency: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                shutdown: Notify::new(),
                running: AtomicBool::new(false),
                max_queue_size: if max_queue_size == 0 { DEFAULT_MAX_QUEUE_SIZE } else { max_queue_size },
                next_sequence: AtomicU64::new(0),
                global_concurrency: AtomicU32::new(0),
                max_global_concurrency,
                per_model_concurrency: Mutex::new(HashMap::new()),
                per_model_max: Mutex::new(HashMap::new()),
                cancel_flags: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                response_times: Mutex::new(ResponseTimeStats::default()),
                requests_per_model: Mutex::new(HashMap::new()),
                total_enqueued: AtomicU64::new(0),
                total_dequeued: AtomicU64::new(0),
            }),
            client,
            worker: Mutex::new(None),
        }
    }

    pub fn set_model_concurrency_limit(&self, model_id: impl Into<String>, max_concurrent: u32) {
        self.inner.per_model_max.lock().unwrap().insert(model_id.into(), max_concurrent);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(AtomicOrdering::Relaxed)
    }

    /// Launches the dispatch worker. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        self.inner.running.store(true, AtomicOrdering::Relaxed);
        let inner = self.inner.clone();
        let client = self.client.clone();
        *worker = Some(tokio::spawn(dispatch_loop(inner, client)));
    }

    /// Signals shutdown, wakes the worker, and joins it.
    pub async fn stop(&self) {
        self.inner.running.store(false, AtomicOrdering::Relaxed);
        self.inner.shutdown.notify_waiters();
        self.inner.notify.notify_waiters();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Enqueues a request. If the queue is already full, the returned future
    /// resolves immediately with a `QueueFull` error.
    pub fn enqueue_request(
        &self,
        request: ChatRequest,
        task: TaskKind,
        priority: TaskPriority,
        model_id: impl Into<String>,
    ) -> oneshot::Receiver<Result<ChatResponse, SchedulerError>> {
        let model_id = model_id.into();
        let (tx, rx) = oneshot::channel();

        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= self.inner.max_queue_size {
            drop(queue);
            let _ = tx.send(Err(SchedulerError::QueueFull));
            return rx;
        }

        let sequence = self.inner.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let request_id = format!("req_{}_{}", current_millis(), sequence);
        let cancel = Arc::new(AtomicBool::new(false));
        self.inner.cancel_flags.lock().unwrap().insert(request_id.clone(), cancel.clone());

        queue.push(RequestItem { request_id, request, task, priority, model_id: model_id.clone(), sequence, cancel, responder: tx });
        drop(queue);

        self.inner.counters.total_requests.fetch_add(1, AtomicOrdering::Relaxed);
        *self.inner.requests_per_model.lock().unwrap().entry(model_id).or_insert(0) += 1;
        self.inner.total_enqueued.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.notify.notify_one();
        rx
    }

    /// Sets the cancel flag for an in-flight or still-queued request.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        if let Some(flag) = self.inner.cancel_flags.lock().unwrap().get(request_id) {
            flag.store(true, AtomicOrdering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        SchedulerStatistics {
            total_requests: self.inner.counters.total_requests.load(AtomicOrdering::Relaxed),
            completed: self.inner.counters.completed.load(AtomicOrdering::Relaxed),
            failed: self.inner.counters.failed.load(AtomicOrdering::Relaxed),
            cancelled: self.inner.counters.cancelled.load(AtomicOrdering::Relaxed),
            response_times: *self.inner.response_times.lock().unwrap(),
            queue_size: self.inner.queue.lock().unwrap().len(),
            max_queue_size: self.inner.max_queue_size,
        }
    }

    pub fn queue_statistics(&self) -> QueueStatistics {
        QueueStatistics {
            current_size: self.inner.queue.lock().unwrap().len(),
            max_size: self.inner.max_queue_size,
            total_enqueued: self.inner.total_enqueued.load(AtomicOrdering::Relaxed),
            total_dequeued: self.inner.total_dequeued.load(AtomicOrdering::Relaxed),
        }
    }

    pub fn requests_for_model(&self, model_id: &str) -> u64 {
        self.inner.requests_per_model.lock().unwrap().get(model_id).copied().unwrap_or(0)
    }
}

fn current_millis() -> u128 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0)
}

fn model_slot(inner: &Inner, model_id: &str) -> Arc<AtomicU32> {
    inner.per_model_concurrency.lock().unwrap().entry(model_id.to_string()).or_insert_with(|| Arc::new(AtomicU32::new(0))).clone()
}

fn try_acquire(inner: &Arc<Inner>, model_id: &str) -> Option<Arc<AtomicU32>> {
    let max_model = inner.per_model_max.lock().unwrap().get(model_id).copied().unwrap_or(0);
    let slot = model_slot(inner, model_id);

    if inner.max_global_concurrency > 0 {
        let current_global = inner.global_concurrency.load(AtomicOrdering::Relaxed);
        if current_global >= inner.max_global_concurrency {
            return None;
        }
    }
    if max_model > 0 {
        let current_model = slot.load(AtomicOrdering::Relaxed);
        if current_model >= max_model {
            return None;
        }
    }

    slot.fetch_add(1, AtomicOrdering::Relaxed);
    inner.global_concurrency.fetch_add(1, AtomicOrdering::Relaxed);
    Some(slot)
}

fn release(inner: &Arc<Inner>, slot: &Arc<AtomicU32>) {
    slot.fetch_update(AtomicOrdering::Relaxed, AtomicOrdering::Relaxed, |v| Some(v.saturating_sub(1))).ok();
    inner
        .global_concurrency
        .fetch_update(AtomicOrdering::Relaxed, AtomicOrdering::Relaxed, |v| Some(v.saturating_sub(1)))
        .ok();
}

async fn dispatch_loop(inner: Arc<Inner>, client: Arc<ProtocolClient>) {
    loop {
        let item = {
            let mut queue = inner.queue.lock().unwrap();
            queue.pop()
        };

        let Some(item) = item else {
            if !inner.running.load(AtomicOrdering::Relaxed) {
                return;
            }
            tokio::select! {
                _ = inner.notify.notified() => continue,
                _ = inner.shutdown.notified() => return,
            }
        };

        if item.cancel.load(AtomicOrdering::Relaxed) {
            inner.cancel_flags.lock().unwrap().remove(&item.request_id);
            inner.counters.cancelled.fetch_add(1, AtomicOrdering::Relaxed);
            let _ = item.responder.send(Err(SchedulerError::Cancelled));
            continue;
        }

        let Some(slot) = try_acquire(&inner, &item.model_id) else {
            inner.queue.lock().unwrap().push(item);
            tokio::time::sleep(RETRY_BACKOFF).await;
            continue;
        };

        inner.total_dequeued.fetch_add(1, AtomicOrdering::Relaxed);
        let inner_for_worker = inner.clone();
        let client_for_worker = client.clone();
        tokio::spawn(async move {
            run_one(inner_for_worker, client_for_worker, item, slot).await;
        });
    }
}

async fn run_one(inner: Arc<Inner>, client: Arc<ProtocolClient>, item: RequestItem, slot: Arc<AtomicU32>) {
    let RequestItem { request_id, request, priority: _, model_id: _, sequence: _, cancel, responder, task: _ } = item;
    let started = std::time::Instant::now();

    let result = client.chat_async(request, cancel.clone()).await;

    let outcome = if cancel.load(AtomicOrdering::Relaxed) {
        inner.counters.cancelled.fetch_add(1, AtomicOrdering::Relaxed);
        Err(SchedulerError::Cancelled)
    } else {
        match result {
            Ok(response) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let mut times = inner.response_times.lock().unwrap();
                times.sum_ms += elapsed_ms;
                times.count += 1;
                times.min_ms = Some(times.min_ms.map_or(elapsed_ms, |m| m.min(elapsed_ms)));
                times.max_ms = Some(times.max_ms.map_or(elapsed_ms, |m| m.max(elapsed_ms)));
                drop(times);
                inner.counters.completed.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(response)
            }
            Err(err) => {
                if matches!(err.kind, vane_model::ErrorKind::Timeout) {
                    debug!(request_id, "request timed out");
                }
                inner.counters.failed.fetch_add(1, AtomicOrdering::Relaxed);
                Err(SchedulerError::Service(err))
            }
        }
    };

    release(&inner, &slot);
    inner.cancel_flags.lock().unwrap().remove(&request_id);
    if responder.send(outcome).is_err() {
        warn!(request_id, "caller dropped before response delivery");
    }
    inner.notify.notify_one();
}
