use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile
/// information. Uses `Relaxed` ordering since strict inter-metric
/// consistency isn't required here.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  /// Gets the total number of observations recorded.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Internal state for tracking queue metrics using atomic counters.
///
/// This struct is cloned and shared between the queue handle, the dispatch
/// loop and the execution wrappers. Cloning only clones the `Arc`s, allowing
/// shared access to the underlying atomic values.
#[derive(Debug, Clone)]
pub(crate) struct QueueMetrics {
  // --- Counters (monotonically increasing) ---
  /// Total number of tasks accepted by `enqueue`.
  pub tasks_enqueued: Arc<AtomicUsize>,
  /// Total number of tasks that finished successfully.
  pub tasks_completed: Arc<AtomicUsize>,
  /// Total number of tasks that finished with a failure (including panics
  /// and missing-callback configuration errors).
  pub tasks_failed: Arc<AtomicUsize>,
  /// Total number of cancellation requests that took effect on a task.
  pub tasks_cancelled: Arc<AtomicUsize>,
  /// Total number of queue entries discarded at the dispatch point because
  /// their task had been cancelled (or removed) while still pending.
  pub tasks_discarded_cancelled: Arc<AtomicUsize>,

  // --- Gauges (current state values) ---
  /// Current number of tasks in `Pending` state.
  pub tasks_pending_current: Arc<AtomicUsize>,
  /// Current number of tasks actively executing.
  pub downloads_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  /// Execution duration of finished tasks.
  pub task_execution_duration: Arc<SimpleHistogram>,
}

impl QueueMetrics {
  pub fn new() -> Self {
    Self {
      tasks_enqueued: Default::default(),
      tasks_completed: Default::default(),
      tasks_failed: Default::default(),
      tasks_cancelled: Default::default(),
      tasks_discarded_cancelled: Default::default(),
      tasks_pending_current: Default::default(),
      downloads_active_current: Default::default(),
      task_execution_duration: Arc::new(SimpleHistogram::default()),
    }
  }

  /// Creates a plain-data snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      tasks_enqueued: self.tasks_enqueued.load(order),
      tasks_completed: self.tasks_completed.load(order),
      tasks_failed: self.tasks_failed.load(order),
      tasks_cancelled: self.tasks_cancelled.load(order),
      tasks_discarded_cancelled: self.tasks_discarded_cancelled.load(order),
      tasks_pending_current: self.tasks_pending_current.load(order),
      downloads_active_current: self.downloads_active_current.load(order),
      task_execution_duration_count: self.task_execution_duration.get_count(),
      task_execution_duration_sum_micros: self.task_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the queue's metrics at a specific point in time.
///
/// Contains plain data types and can be cheaply cloned, serialized, or used
/// for monitoring and analysis.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub tasks_enqueued: usize,
  pub tasks_completed: usize,
  pub tasks_failed: usize,
  pub tasks_cancelled: usize,
  pub tasks_discarded_cancelled: usize,
  // Gauges
  pub tasks_pending_current: usize,
  pub downloads_active_current: usize,
  // Histogram data
  pub task_execution_duration_count: usize,
  pub task_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean task execution duration in microseconds, if any task finished.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.task_execution_duration_count == 0 {
      None
    } else {
      Some(
        self.task_execution_duration_sum_micros as f64
          / self.task_execution_duration_count as f64,
      )
    }
  }

  /// Mean task execution duration, if any task finished.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }
}
