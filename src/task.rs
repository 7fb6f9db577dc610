use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::ProgressHandle;

// --- Public Type Aliases ---

/// Type alias for the unique identifier of a queued download task.
/// Uses UUID v4.
pub type TaskId = Uuid;

/// The result a fetch callback resolves to.
///
/// - `Ok(file_path)`: the download succeeded; the optional path of the
///   produced file is recorded on the task.
/// - `Err(message)`: the download failed; the message is recorded as the
///   task's `error_message` and surfaced via `download:failed`.
pub type FetchResult = Result<Option<String>, String>;

/// The function type that performs the actual download work.
///
/// The function must be asynchronous, `Send + Sync + 'static`, and return a
/// `Future` resolving to [`FetchResult`]. It receives a [`FetchContext`]
/// carrying a snapshot of the task, a [`CancelToken`] it is expected to poll
/// at safe points, and a [`ProgressHandle`] for progress reporting.
/// Panics inside the function are caught by the execution wrapper and
/// converted into a task failure.
pub type BoxedFetchFn = Box<
  dyn Fn(FetchContext) -> Pin<Box<dyn Future<Output = FetchResult> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

// --- Priority & Status ---

/// Scheduling priority of a download task.
///
/// Lower numeric value means higher priority; ties are broken by submission
/// order (earlier first). The derived ordering sorts `High` before `Normal`
/// before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
  High,
  Normal,
  Low,
}

impl TaskPriority {
  /// Numeric value of the priority tier (1 = highest).
  pub fn value(self) -> u8 {
    match self {
      TaskPriority::High => 1,
      TaskPriority::Normal => 2,
      TaskPriority::Low => 3,
    }
  }
}

impl Default for TaskPriority {
  fn default() -> Self {
    TaskPriority::Normal
  }
}

/// Lifecycle state of a download task.
///
/// Transitions are monotonic: `Pending → Running → {Completed | Failed |
/// Cancelled}`, with the additional shortcut `Pending → Cancelled`. A task
/// in a terminal state never re-enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl TaskStatus {
  /// Whether the status is terminal (`Completed`, `Failed` or `Cancelled`).
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
    )
  }
}

// --- Payload ---

/// Caller-defined description of the work a task performs.
///
/// Opaque to the scheduler: it is stored on the task and handed to the fetch
/// callback unchanged. The fields mirror what a downloader needs to run one
/// fetch: source URL, destination, format selection and transport options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
  /// Source URL to fetch.
  pub url: String,
  /// Human-readable title, if already resolved (used in logging and events).
  pub title: String,
  /// Directory the produced file should land in.
  pub output_dir: String,
  /// Selected video format id (`"best"` delegates selection to the fetcher).
  pub video_format_id: String,
  /// Selected audio format id (`"best"` delegates selection to the fetcher).
  pub audio_format_id: String,
  /// Whether the fetcher should send cookies.
  pub use_cookies: bool,
  /// Path of the cookie jar to use, when `use_cookies` is set.
  pub cookies_file: Option<String>,
  /// Prefer an MP4 container when remuxing.
  pub prefer_mp4: bool,
  /// Fetch only the single item, never an enclosing playlist.
  pub no_playlist: bool,
  /// Optional proxy URL for the transfer.
  pub proxy_url: Option<String>,
}

impl DownloadPayload {
  /// Creates a payload for `url` writing into `output_dir`, with default
  /// format selection and transport options.
  pub fn new(url: impl Into<String>, output_dir: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      title: String::new(),
      output_dir: output_dir.into(),
      video_format_id: "best".to_string(),
      audio_format_id: "best".to_string(),
      use_cookies: false,
      cookies_file: None,
      prefer_mp4: true,
      no_playlist: true,
      proxy_url: None,
    }
  }

  /// Combined format selector: `video+audio` when a concrete audio format
  /// was chosen, otherwise just the video format id.
  pub fn format_id(&self) -> String {
    if !self.audio_format_id.is_empty() && self.audio_format_id != "best" {
      format!("{}+{}", self.video_format_id, self.audio_format_id)
    } else {
      self.video_format_id.clone()
    }
  }
}

impl Default for DownloadPayload {
  fn default() -> Self {
    Self::new("", "")
  }
}

// --- Cancellation ---

/// Cooperative cancellation token shared between the scheduler and a running
/// fetch callback.
///
/// The scheduler flips the token when the task is cancelled; the callback is
/// expected to poll [`CancelToken::is_cancelled`] at safe points and wind
/// down. The scheduler never forcibly terminates a running fetch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  flag: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Whether cancellation has been requested.
  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::SeqCst)
  }

  pub(crate) fn cancel(&self) {
    self.flag.store(true, Ordering::SeqCst);
  }
}

// --- Task ---

/// A download task owned by the queue.
///
/// Created by `DownloadQueue::enqueue` and mutated only by the dispatch loop,
/// the execution wrapper and the cancellation path. Query methods hand out
/// clones as point-in-time snapshots.
#[derive(Debug, Clone)]
pub struct DownloadTask {
  /// Unique task id, generated at enqueue time.
  pub id: TaskId,
  /// Scheduling priority.
  pub priority: TaskPriority,
  /// Enqueue timestamp; immutable, used for FIFO ordering within a tier.
  pub created_at: DateTime<Utc>,
  /// The work description, opaque to the scheduler.
  pub payload: DownloadPayload,
  /// Current lifecycle state.
  pub status: TaskStatus,
  /// Progress percentage in `0.0..=100.0`, reported by the fetch callback.
  pub progress: f64,
  /// Last reported transfer speed (e.g. `"1.5 MiB/s"`).
  pub speed: Option<String>,
  /// Last reported time-to-completion estimate (e.g. `"02:30"`).
  pub eta: Option<String>,
  /// Failure message, set when the task reaches `Failed`.
  pub error_message: Option<String>,
  /// Path of the produced file, set on successful completion.
  pub file_path: Option<String>,
  /// When the task was admitted (transitioned to `Running`).
  pub started_at: Option<DateTime<Utc>>,
  /// When the task reached a terminal state via the execution path.
  pub completed_at: Option<DateTime<Utc>>,

  /// Submission sequence number, the FIFO tie-break within a priority tier.
  pub(crate) seq: u64,
  /// Cancellation token handed to the fetch callback.
  pub(crate) cancel: CancelToken,
}

impl DownloadTask {
  pub(crate) fn new(payload: DownloadPayload, priority: TaskPriority, seq: u64) -> Self {
    Self {
      id: Uuid::new_v4(),
      priority,
      created_at: Utc::now(),
      payload,
      status: TaskStatus::Pending,
      progress: 0.0,
      speed: None,
      eta: None,
      error_message: None,
      file_path: None,
      started_at: None,
      completed_at: None,
      seq,
      cancel: CancelToken::new(),
    }
  }

  /// Whether cancellation has been requested for this task.
  pub fn is_cancel_requested(&self) -> bool {
    self.cancel.is_cancelled()
  }
}

// --- Fetch Context ---

/// Everything a fetch callback receives about the task it executes: a
/// snapshot of the task as admitted, the cancellation token to poll, and the
/// progress-reporting handle.
pub struct FetchContext {
  /// Snapshot of the task at admission time.
  pub task: DownloadTask,
  /// Token the callback must poll to honor cooperative cancellation.
  pub cancel: CancelToken,
  /// Handle for reporting progress back into the queue.
  pub progress: ProgressHandle,
}

impl fmt::Debug for FetchContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchContext")
      .field("task", &self.task.id)
      .field("cancelled", &self.cancel.is_cancelled())
      .finish()
  }
}
