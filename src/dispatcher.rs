use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::bus::topic;
use crate::queue::{ProgressHandle, QueueShared, EVENT_SOURCE};
use crate::task::{DownloadTask, FetchContext, FetchResult, TaskStatus};

/// The dispatch loop driving task admission.
///
/// A single instance runs per started queue. It idles with a bounded poll
/// (woken early on enqueue, slot release or resume), and admits the highest
/// priority, earliest-created pending task whenever a concurrency slot is
/// free. Cancelled tasks popped here are simply discarded.
pub(crate) struct Dispatcher {
  shared: Arc<QueueShared>,
  shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
  pub(crate) fn new(shared: Arc<QueueShared>, shutdown_rx: watch::Receiver<bool>) -> Self {
    Self {
      shared,
      shutdown_rx,
    }
  }

  /// Runs the dispatch loop until the stop signal fires.
  pub(crate) async fn run(&mut self) {
    info!("Dispatch loop started.");

    loop {
      if *self.shutdown_rx.borrow() {
        break;
      }

      if !self.shared.paused.load(AtomicOrdering::SeqCst) {
        self.admit_ready();
      }

      tokio::select! {
        biased; // Check the stop signal before the wakeup sources.

        changed = self.shutdown_rx.changed() => {
          match changed {
            Ok(()) => {
              if *self.shutdown_rx.borrow() {
                break;
              }
            }
            // Sender dropped: the queue handle is gone, wind down.
            Err(_) => break,
          }
        }

        _ = self.shared.wake.notified() => {
          trace!("Dispatch loop woken early.");
        }

        _ = sleep(self.shared.poll_interval) => {
          trace!("Dispatch poll interval elapsed.");
        }
      }
    }

    info!("Dispatch loop exiting.");
  }

  /// Admits as many ready tasks as free concurrency slots allow.
  fn admit_ready(&self) {
    loop {
      if self.shared.paused.load(AtomicOrdering::SeqCst) {
        break;
      }
      let active = self.shared.active_count.load(AtomicOrdering::SeqCst);
      if active >= self.shared.max_concurrent {
        trace!(
          active,
          max_concurrent = self.shared.max_concurrent,
          "All concurrency slots busy."
        );
        break;
      }

      let entry = {
        let mut pending = self.shared.pending.lock();
        match pending.pop() {
          Some(std::cmp::Reverse(entry)) => entry,
          None => break,
        }
      };

      // Validate the popped entry against the task table; entries go stale
      // when their task was cancelled, removed, cleared or re-prioritized.
      let snapshot: Option<DownloadTask> = {
        let mut tasks = self.shared.tasks.write();
        match tasks.get_mut(&entry.task_id) {
          None => {
            trace!(task_id = %entry.task_id, "Discarding queue entry for a task no longer in the table.");
            None
          }
          Some(task) if task.status == TaskStatus::Cancelled => {
            debug!(task_id = %entry.task_id, "Discarding cancelled task popped from the queue.");
            self
              .shared
              .metrics
              .tasks_discarded_cancelled
              .fetch_add(1, AtomicOrdering::Relaxed);
            None
          }
          Some(task) if task.status != TaskStatus::Pending => {
            trace!(task_id = %entry.task_id, status = ?task.status, "Discarding stale queue entry.");
            None
          }
          Some(task) if task.priority != entry.priority => {
            trace!(task_id = %entry.task_id, "Discarding queue entry with outdated priority.");
            None
          }
          Some(task) => {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            Some(task.clone())
          }
        }
      };
      let Some(task) = snapshot else {
        continue;
      };

      self.shared.refresh_pending_gauge();
      let prev_active = self.shared.active_count.fetch_add(1, AtomicOrdering::SeqCst);
      self
        .shared
        .metrics
        .downloads_active_current
        .store(prev_active + 1, AtomicOrdering::Relaxed);

      info!(task_id = %task.id, url = %task.payload.url, "Task admitted.");
      self.shared.bus.publish_from(
        topic::DOWNLOAD_STARTED,
        json!({ "task_id": task.id, "url": task.payload.url }),
        EVENT_SOURCE,
      );

      let task_id = task.id;
      let span = tracing::span!(
        tracing::Level::INFO,
        "task_exec",
        task_id = %task_id,
      );
      let handle = tokio::spawn(execute(self.shared.clone(), task).instrument(span));

      {
        let mut active = self.shared.active.lock();
        // Drop handles of executions that already finished; their entries
        // can linger when a task completed before its handle was inserted.
        active.retain(|_, h| !h.is_finished());
        active.insert(task_id, handle);
      }
    }
  }
}

/// How a finished execution is reflected in the task table.
enum Finish {
  Completed(Option<String>),
  Failed(String),
  CancelledLate,
  Gone,
}

/// Executes one admitted task: invokes the fetch callback in its own Tokio
/// task (so panics are contained), records the outcome on the task, publishes
/// the corresponding event, and releases the concurrency slot.
async fn execute(shared: Arc<QueueShared>, task: DownloadTask) {
  let task_id = task.id;
  let started = Instant::now();
  let fetch_fn = { shared.fetch_fn.read().clone() };

  let result: FetchResult = match fetch_fn {
    None => {
      warn!("No fetch callback configured; task cannot execute.");
      Err("no fetch callback configured".to_string())
    }
    Some(fetch_fn) => {
      let context = FetchContext {
        cancel: task.cancel.clone(),
        progress: ProgressHandle::new(shared.clone(), task_id),
        task,
      };
      let future = fetch_fn(context);
      match tokio::spawn(future).await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
          error!("Fetch callback panicked.");
          Err("fetch callback panicked".to_string())
        }
        Err(_) => {
          warn!("Fetch task was aborted during execution.");
          Err("fetch task aborted".to_string())
        }
      }
    }
  };

  let duration = started.elapsed();
  shared.metrics.task_execution_duration.record(duration);

  let finish = {
    let mut tasks = shared.tasks.write();
    match tasks.get_mut(&task_id) {
      None => Finish::Gone,
      Some(task) if task.status == TaskStatus::Cancelled => {
        // Cancellation won the race; the terminal status stands.
        task.completed_at = Some(Utc::now());
        Finish::CancelledLate
      }
      Some(task) => match &result {
        Ok(file_path) => {
          task.status = TaskStatus::Completed;
          task.progress = 100.0;
          task.completed_at = Some(Utc::now());
          task.file_path = file_path.clone();
          Finish::Completed(file_path.clone())
        }
        Err(message) => {
          task.status = TaskStatus::Failed;
          task.error_message = Some(message.clone());
          task.completed_at = Some(Utc::now());
          Finish::Failed(message.clone())
        }
      },
    }
  };

  match &finish {
    Finish::Completed(file_path) => {
      shared
        .metrics
        .tasks_completed
        .fetch_add(1, AtomicOrdering::Relaxed);
      info!(duration_ms = duration.as_millis(), "Download completed.");
      shared.bus.publish_from(
        topic::DOWNLOAD_COMPLETED,
        json!({ "task_id": task_id, "file_path": file_path }),
        EVENT_SOURCE,
      );
    }
    Finish::Failed(message) => {
      shared
        .metrics
        .tasks_failed
        .fetch_add(1, AtomicOrdering::Relaxed);
      warn!(error = %message, "Download failed.");
      shared.bus.publish_from(
        topic::DOWNLOAD_FAILED,
        json!({ "task_id": task_id, "error": message }),
        EVENT_SOURCE,
      );
    }
    Finish::CancelledLate => {
      info!("Download finished after cancellation; keeping cancelled state.");
    }
    Finish::Gone => {
      debug!("Task no longer in the table after execution (queue was cleared).");
    }
  }

  // Release the concurrency slot and wake the dispatch loop.
  shared.active.lock().remove(&task_id);
  let prev_active = shared.active_count.fetch_sub(1, AtomicOrdering::SeqCst);
  shared
    .metrics
    .downloads_active_current
    .store(prev_active.saturating_sub(1), AtomicOrdering::Relaxed);
  shared.wake.notify_one();
}
