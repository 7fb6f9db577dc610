use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{topic, EventBus};
use crate::dispatcher::Dispatcher;
use crate::error::{BuildError, ShutdownError};
use crate::metrics::{MetricsSnapshot, QueueMetrics};
use crate::task::{
  BoxedFetchFn, DownloadPayload, DownloadTask, FetchContext, FetchResult, TaskId, TaskPriority,
  TaskStatus,
};

const DEFAULT_MAX_CONCURRENT: usize = 2;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn box_fetch_fn<F, Fut>(fetch_fn: F) -> Arc<BoxedFetchFn>
where
  F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = FetchResult> + Send + 'static,
{
  Arc::new(Box::new(move |context| {
    Box::pin(fetch_fn(context)) as Pin<Box<dyn Future<Output = FetchResult> + Send + 'static>>
  }))
}

/// Source tag attached to every event the queue publishes.
pub(crate) const EVENT_SOURCE: &str = "download_queue";

/// Entry in the pending priority heap. Ordered by `(priority, created_at,
/// seq)` so that, wrapped in `Reverse`, the binary heap pops the highest
/// priority tier first and FIFO within a tier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct PendingEntry {
  pub priority: TaskPriority,
  pub created_at: DateTime<Utc>,
  pub seq: u64,
  pub task_id: TaskId,
}

/// State shared between the queue handle, the dispatch loop and the
/// per-task execution wrappers. Each collection is guarded by its own lock;
/// locks are never held across await points.
pub(crate) struct QueueShared {
  /// Task table: every task ever enqueued, until a `clear` operation.
  pub tasks: RwLock<HashMap<TaskId, DownloadTask>>,
  /// Pending priority queue. Entries for cancelled/removed or re-prioritized
  /// tasks go stale and are lazily discarded at dispatch time.
  pub pending: Mutex<BinaryHeap<Reverse<PendingEntry>>>,
  /// Join handles of in-flight execution tasks, keyed by task id.
  pub active: Mutex<HashMap<TaskId, JoinHandle<()>>>,
  /// The externally supplied fetch callback. `None` makes every admitted
  /// task fail with a configuration error.
  pub fetch_fn: RwLock<Option<Arc<BoxedFetchFn>>>,

  pub running: AtomicBool,
  pub paused: AtomicBool,
  pub active_count: AtomicUsize,
  next_seq: AtomicU64,

  pub max_concurrent: usize,
  pub poll_interval: Duration,

  /// Wakes the dispatch loop early on enqueue, slot release or resume.
  pub wake: Notify,
  pub bus: EventBus,
  pub metrics: QueueMetrics,
}

impl QueueShared {
  pub(crate) fn count_status(&self, status: TaskStatus) -> usize {
    self
      .tasks
      .read()
      .values()
      .filter(|t| t.status == status)
      .count()
  }

  pub(crate) fn refresh_pending_gauge(&self) {
    self
      .metrics
      .tasks_pending_current
      .store(self.count_status(TaskStatus::Pending), AtomicOrdering::Relaxed);
  }
}

/// Handle for reporting progress from a fetch callback back into the queue.
///
/// Each update mutates the task's `progress`/`speed`/`eta` fields and
/// publishes `download:progress`. Updates for tasks that are no longer
/// `Running` are ignored.
#[derive(Clone)]
pub struct ProgressHandle {
  shared: Arc<QueueShared>,
  task_id: TaskId,
}

impl ProgressHandle {
  pub(crate) fn new(shared: Arc<QueueShared>, task_id: TaskId) -> Self {
    Self { shared, task_id }
  }

  /// Records a progress update. `progress` is clamped to `0.0..=100.0`.
  pub fn update(&self, progress: f64, speed: Option<&str>, eta: Option<&str>) {
    let progress = progress.clamp(0.0, 100.0);
    let accepted = {
      let mut tasks = self.shared.tasks.write();
      match tasks.get_mut(&self.task_id) {
        Some(task) if task.status == TaskStatus::Running => {
          task.progress = progress;
          if let Some(speed) = speed {
            task.speed = Some(speed.to_string());
          }
          if let Some(eta) = eta {
            task.eta = Some(eta.to_string());
          }
          true
        }
        _ => false,
      }
    };

    if accepted {
      self.shared.bus.publish_from(
        topic::DOWNLOAD_PROGRESS,
        json!({
          "task_id": self.task_id,
          "progress": progress,
          "speed": speed,
          "eta": eta,
        }),
        EVENT_SOURCE,
      );
    }
  }
}

impl fmt::Debug for ProgressHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProgressHandle")
      .field("task_id", &self.task_id)
      .finish()
  }
}

/// Counts of tasks per lifecycle state, as returned by
/// [`DownloadQueue::get_statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatistics {
  pub total: usize,
  pub pending: usize,
  pub running: usize,
  pub completed: usize,
  pub failed: usize,
  pub cancelled: usize,
}

/// Builder for configuring and creating a [`DownloadQueue`].
///
/// # Example
///
/// ```no_run
/// use downhaul::{DownloadQueue, EventBus};
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = EventBus::new();
/// let queue = DownloadQueue::builder()
///     .max_concurrent(3)
///     .auto_start(false)
///     .event_bus(bus.clone())
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct QueueBuilder {
  max_concurrent: usize,
  auto_start: bool,
  poll_interval: Duration,
  event_bus: Option<EventBus>,
  fetch_fn: Option<Arc<BoxedFetchFn>>,
}

impl Default for QueueBuilder {
  fn default() -> Self {
    Self {
      max_concurrent: DEFAULT_MAX_CONCURRENT,
      auto_start: true,
      poll_interval: DEFAULT_POLL_INTERVAL,
      event_bus: None,
      fetch_fn: None,
    }
  }
}

impl QueueBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Maximum number of tasks executing concurrently. Must be greater than
  /// zero.
  pub fn max_concurrent(mut self, limit: usize) -> Self {
    self.max_concurrent = limit;
    self
  }

  /// Whether the dispatch loop starts automatically on the first `enqueue`.
  pub fn auto_start(mut self, auto_start: bool) -> Self {
    self.auto_start = auto_start;
    self
  }

  /// Upper bound on how long the dispatch loop idles between checks when
  /// nothing wakes it early.
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// Event bus lifecycle notifications are published on. When not provided,
  /// the queue constructs a private bus, reachable via
  /// [`DownloadQueue::event_bus`].
  pub fn event_bus(mut self, bus: EventBus) -> Self {
    self.event_bus = Some(bus);
    self
  }

  /// The fetch callback invoked once per admitted task. Can also be set (or
  /// replaced) later via [`DownloadQueue::set_fetch_fn`].
  pub fn fetch_fn<F, Fut>(mut self, fetch_fn: F) -> Self
  where
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult> + Send + 'static,
  {
    self.fetch_fn = Some(box_fetch_fn(fetch_fn));
    self
  }

  /// Builds the queue handle. Does not spawn anything yet: the dispatch
  /// loop starts on [`DownloadQueue::start`] (or on the first `enqueue`
  /// when auto-start is enabled), which must happen within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// Returns [`BuildError::ZeroMaxConcurrent`] if the concurrency limit
  /// is zero.
  pub fn build(self) -> Result<DownloadQueue, BuildError> {
    if self.max_concurrent == 0 {
      return Err(BuildError::ZeroMaxConcurrent);
    }

    let shared = Arc::new(QueueShared {
      tasks: RwLock::new(HashMap::new()),
      pending: Mutex::new(BinaryHeap::new()),
      active: Mutex::new(HashMap::new()),
      fetch_fn: RwLock::new(self.fetch_fn),
      running: AtomicBool::new(false),
      paused: AtomicBool::new(false),
      active_count: AtomicUsize::new(0),
      next_seq: AtomicU64::new(0),
      max_concurrent: self.max_concurrent,
      poll_interval: self.poll_interval,
      wake: Notify::new(),
      bus: self.event_bus.unwrap_or_default(),
      metrics: QueueMetrics::new(),
    });

    info!(
      max_concurrent = self.max_concurrent,
      auto_start = self.auto_start,
      "Download queue created."
    );

    Ok(DownloadQueue {
      shared,
      auto_start: self.auto_start,
      shutdown_tx: Mutex::new(None),
      dispatch_handle: Mutex::new(None),
    })
  }
}

/// The priority download-task scheduler.
///
/// Owns the task table, the pending priority queue and the set of in-flight
/// executions. A single dispatch loop admits pending tasks whenever
/// concurrency capacity is free, highest priority first and FIFO within a
/// tier; each admitted task runs on its own Tokio task, executing the
/// configured fetch callback. Lifecycle transitions are announced on the
/// injected [`EventBus`].
///
/// Use [`DownloadQueue::builder`] to create and configure an instance.
pub struct DownloadQueue {
  shared: Arc<QueueShared>,
  auto_start: bool,
  shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
  dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadQueue {
  /// Returns a builder to configure and create a queue.
  pub fn builder() -> QueueBuilder {
    QueueBuilder::new()
  }

  /// The event bus lifecycle notifications are published on.
  pub fn event_bus(&self) -> &EventBus {
    &self.shared.bus
  }

  /// Sets or replaces the fetch callback. Tasks admitted while no callback
  /// is configured fail immediately with a configuration error.
  pub fn set_fetch_fn<F, Fut>(&self, fetch_fn: F)
  where
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult> + Send + 'static,
  {
    *self.shared.fetch_fn.write() = Some(box_fetch_fn(fetch_fn));
  }

  /// Adds a task to the queue and returns its id.
  ///
  /// The task is inserted into the task table and the priority queue,
  /// `queue:task_added` is published, and — when auto-start is enabled and
  /// the dispatch loop is not yet running — the queue is started.
  pub fn enqueue(&self, payload: DownloadPayload, priority: TaskPriority) -> TaskId {
    let seq = self.shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
    let task = DownloadTask::new(payload, priority, seq);
    let task_id = task.id;
    let url = task.payload.url.clone();
    let entry = PendingEntry {
      priority,
      created_at: task.created_at,
      seq,
      task_id,
    };

    {
      self.shared.tasks.write().insert(task_id, task);
      self.shared.pending.lock().push(Reverse(entry));
    }
    self
      .shared
      .metrics
      .tasks_enqueued
      .fetch_add(1, AtomicOrdering::Relaxed);
    self.shared.refresh_pending_gauge();

    info!(%task_id, %url, ?priority, "Task enqueued.");
    self.shared.bus.publish_from(
      topic::QUEUE_TASK_ADDED,
      json!({ "task_id": task_id, "url": url }),
      EVENT_SOURCE,
    );

    if self.auto_start && !self.is_running() {
      self.start();
    }
    self.shared.wake.notify_one();

    task_id
  }

  /// Adds several tasks with the same priority; returns their ids in order.
  pub fn enqueue_batch(
    &self,
    payloads: impl IntoIterator<Item = DownloadPayload>,
    priority: TaskPriority,
  ) -> Vec<TaskId> {
    payloads
      .into_iter()
      .map(|payload| self.enqueue(payload, priority))
      .collect()
  }

  /// Removes a task from the queue. Allowed only while the task is still
  /// `Pending`: the task is marked `Cancelled` and `queue:task_removed` is
  /// published. Returns `false` for running, terminal or unknown tasks.
  pub fn remove(&self, task_id: TaskId) -> bool {
    let removed = {
      let mut tasks = self.shared.tasks.write();
      match tasks.get_mut(&task_id) {
        Some(task) if task.status == TaskStatus::Pending => {
          task.status = TaskStatus::Cancelled;
          task.cancel.cancel();
          true
        }
        Some(task) if task.status == TaskStatus::Running => {
          warn!(%task_id, "Cannot remove a running task; request cancellation instead.");
          false
        }
        _ => false,
      }
    };

    if removed {
      self
        .shared
        .metrics
        .tasks_cancelled
        .fetch_add(1, AtomicOrdering::Relaxed);
      self.shared.refresh_pending_gauge();
      info!(%task_id, "Task removed from queue.");
      self.shared.bus.publish_from(
        topic::QUEUE_TASK_REMOVED,
        json!({ "task_id": task_id }),
        EVENT_SOURCE,
      );
    }
    removed
  }

  /// Requests cancellation of a task.
  ///
  /// A `Pending` task is marked `Cancelled` and lazily discarded when it
  /// reaches the front of the queue. For a `Running` task the transition is
  /// recorded immediately and its cancellation token is set, but the fetch
  /// callback must observe the token to actually stop — the queue never
  /// forcibly kills an execution. Returns `false` for unknown or
  /// already-terminal tasks (idempotent for already-cancelled ones).
  pub fn cancel(&self, task_id: TaskId) -> bool {
    let cancelled = {
      let mut tasks = self.shared.tasks.write();
      match tasks.get_mut(&task_id) {
        None => return false,
        Some(task) if task.status == TaskStatus::Cancelled => return true,
        Some(task) if task.status.is_terminal() => return false,
        Some(task) => {
          task.status = TaskStatus::Cancelled;
          task.cancel.cancel();
          true
        }
      }
    };

    if cancelled {
      self
        .shared
        .metrics
        .tasks_cancelled
        .fetch_add(1, AtomicOrdering::Relaxed);
      self.shared.refresh_pending_gauge();
      info!(%task_id, "Task cancellation requested.");
      self.shared.bus.publish_from(
        topic::DOWNLOAD_CANCELLED,
        json!({ "task_id": task_id }),
        EVENT_SOURCE,
      );
    }
    cancelled
  }

  /// Starts the dispatch loop. Idempotent; publishes `queue:started`.
  /// Must be called within a Tokio runtime.
  pub fn start(&self) {
    if self.shared.running.swap(true, AtomicOrdering::SeqCst) {
      return;
    }
    self.shared.paused.store(false, AtomicOrdering::SeqCst);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shared = self.shared.clone();
    let handle = Handle::current().spawn(async move {
      let mut dispatcher = Dispatcher::new(shared, shutdown_rx);
      dispatcher.run().await;
    });

    *self.shutdown_tx.lock() = Some(shutdown_tx);
    *self.dispatch_handle.lock() = Some(handle);

    info!("Queue processing started.");
    self
      .shared
      .bus
      .publish_from(topic::QUEUE_STARTED, json!({}), EVENT_SOURCE);
  }

  /// Stops the dispatch loop, waiting (bounded by `timeout`, when given)
  /// for it to exit. In-flight executions are not interrupted and keep
  /// running to completion. Publishes `queue:stopped`.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::Timeout`]: the loop did not exit within `timeout`;
  ///   it still winds down on its own, it is never aborted.
  /// - [`ShutdownError::TaskPanic`]: the dispatch loop panicked.
  pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    if !self.shared.running.swap(false, AtomicOrdering::SeqCst) {
      return Ok(());
    }

    if let Some(tx) = self.shutdown_tx.lock().take() {
      let _ = tx.send(true);
    }
    self.shared.wake.notify_one();

    let handle = self.dispatch_handle.lock().take();
    let result = match handle {
      Some(handle) => match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, handle).await {
          Ok(Ok(())) => Ok(()),
          Ok(Err(_)) => Err(ShutdownError::TaskPanic),
          Err(_) => {
            warn!(?timeout, "Timed out waiting for the dispatch loop to exit.");
            Err(ShutdownError::Timeout)
          }
        },
        None => handle.await.map_err(|_| ShutdownError::TaskPanic),
      },
      None => Ok(()),
    };

    info!("Queue processing stopped.");
    self
      .shared
      .bus
      .publish_from(topic::QUEUE_STOPPED, json!({}), EVENT_SOURCE);
    result
  }

  /// Stops admissions like [`DownloadQueue::stop`] and then additionally
  /// waits (bounded by `timeout` per phase, when given) for in-flight
  /// executions to finish.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    self.stop(timeout).await?;

    let handles: Vec<JoinHandle<()>> = {
      let mut active = self.shared.active.lock();
      active.drain().map(|(_, handle)| handle).collect()
    };
    if handles.is_empty() {
      return Ok(());
    }

    debug!(in_flight = handles.len(), "Waiting for in-flight downloads.");
    let join = join_all(handles);
    let results = match timeout {
      Some(timeout) => tokio::time::timeout(timeout, join)
        .await
        .map_err(|_| ShutdownError::Timeout)?,
      None => join.await,
    };
    if results.iter().any(Result::is_err) {
      return Err(ShutdownError::TaskPanic);
    }
    Ok(())
  }

  /// Halts new admissions. In-flight executions continue.
  pub fn pause(&self) {
    self.shared.paused.store(true, AtomicOrdering::SeqCst);
    info!("Queue processing paused.");
  }

  /// Resumes admissions after a pause.
  pub fn resume(&self) {
    self.shared.paused.store(false, AtomicOrdering::SeqCst);
    self.shared.wake.notify_one();
    info!("Queue processing resumed.");
  }

  /// Updates the priority of a `Pending` task. Returns `false` for tasks in
  /// any other state or unknown ids.
  pub fn update_priority(&self, task_id: TaskId, priority: TaskPriority) -> bool {
    let entry = {
      let mut tasks = self.shared.tasks.write();
      match tasks.get_mut(&task_id) {
        Some(task) if task.status == TaskStatus::Pending => {
          task.priority = priority;
          Some(PendingEntry {
            priority,
            created_at: task.created_at,
            seq: task.seq,
            task_id,
          })
        }
        _ => None,
      }
    };

    match entry {
      Some(entry) => {
        // The old heap entry goes stale; dispatch discards entries whose
        // priority no longer matches the task table.
        self.shared.pending.lock().push(Reverse(entry));
        self.shared.wake.notify_one();
        debug!(%task_id, ?priority, "Task priority updated.");
        true
      }
      None => false,
    }
  }

  /// Point-in-time snapshot of a task.
  pub fn get_task(&self, task_id: TaskId) -> Option<DownloadTask> {
    self.shared.tasks.read().get(&task_id).cloned()
  }

  /// Snapshots of every task currently in the table.
  pub fn get_all_tasks(&self) -> Vec<DownloadTask> {
    self.shared.tasks.read().values().cloned().collect()
  }

  fn tasks_with_status(&self, status: TaskStatus) -> Vec<DownloadTask> {
    self
      .shared
      .tasks
      .read()
      .values()
      .filter(|t| t.status == status)
      .cloned()
      .collect()
  }

  pub fn get_pending_tasks(&self) -> Vec<DownloadTask> {
    self.tasks_with_status(TaskStatus::Pending)
  }

  pub fn get_active_tasks(&self) -> Vec<DownloadTask> {
    self.tasks_with_status(TaskStatus::Running)
  }

  pub fn get_completed_tasks(&self) -> Vec<DownloadTask> {
    self.tasks_with_status(TaskStatus::Completed)
  }

  pub fn get_failed_tasks(&self) -> Vec<DownloadTask> {
    self.tasks_with_status(TaskStatus::Failed)
  }

  /// Number of tasks currently pending admission.
  pub fn pending_len(&self) -> usize {
    self.shared.count_status(TaskStatus::Pending)
  }

  /// Number of tasks currently executing.
  pub fn active_count(&self) -> usize {
    self.shared.active_count.load(AtomicOrdering::SeqCst)
  }

  pub fn is_running(&self) -> bool {
    self.shared.running.load(AtomicOrdering::SeqCst)
  }

  pub fn is_paused(&self) -> bool {
    self.shared.paused.load(AtomicOrdering::SeqCst)
  }

  /// Counts of tasks per lifecycle state.
  pub fn get_statistics(&self) -> QueueStatistics {
    let tasks = self.shared.tasks.read();
    let mut stats = QueueStatistics {
      total: tasks.len(),
      ..Default::default()
    };
    for task in tasks.values() {
      match task.status {
        TaskStatus::Pending => stats.pending += 1,
        TaskStatus::Running => stats.running += 1,
        TaskStatus::Completed => stats.completed += 1,
        TaskStatus::Failed => stats.failed += 1,
        TaskStatus::Cancelled => stats.cancelled += 1,
      }
    }
    stats
  }

  /// Drops every terminal task (`Completed`, `Failed`, `Cancelled`) from
  /// the task table; returns how many were dropped.
  pub fn clear_completed(&self) -> usize {
    let removed = {
      let mut tasks = self.shared.tasks.write();
      let before = tasks.len();
      tasks.retain(|_, task| !task.status.is_terminal());
      before - tasks.len()
    };
    info!(removed, "Cleared finished tasks.");
    removed
  }

  /// Clears everything: cancels all running tasks (cooperatively — their
  /// execution contexts are not killed), empties the pending queue and the
  /// task table, and publishes `queue:cleared`.
  pub fn clear_all(&self) {
    let running_ids: Vec<TaskId> = {
      let mut tasks = self.shared.tasks.write();
      let running: Vec<TaskId> = tasks
        .values()
        .filter(|t| t.status == TaskStatus::Running)
        .map(|t| t.id)
        .collect();
      for task in tasks.values_mut() {
        if !task.status.is_terminal() {
          task.status = TaskStatus::Cancelled;
          task.cancel.cancel();
        }
      }
      tasks.clear();
      running
    };
    self.shared.pending.lock().clear();
    self.shared.refresh_pending_gauge();

    for task_id in &running_ids {
      self.shared.bus.publish_from(
        topic::DOWNLOAD_CANCELLED,
        json!({ "task_id": task_id }),
        EVENT_SOURCE,
      );
    }
    info!(
      cancelled_running = running_ids.len(),
      "Cleared all tasks from the queue."
    );
    self
      .shared
      .bus
      .publish_from(topic::QUEUE_CLEARED, json!({}), EVENT_SOURCE);
  }

  /// Point-in-time snapshot of the queue's metrics.
  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }
}

impl fmt::Debug for DownloadQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DownloadQueue")
      .field("max_concurrent", &self.shared.max_concurrent)
      .field("running", &self.is_running())
      .field("paused", &self.is_paused())
      .field("tasks", &self.shared.tasks.read().len())
      .finish()
  }
}
