//! tests/cancel.rs
//! Removal, cooperative cancellation and clear-all scenarios.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use crate::common::{build_queue, install_counting_fetch, payload, setup_tracing, wait_for};
use downhaul::{topic, CancelToken, EventBus, TaskPriority, TaskStatus};
use uuid::Uuid;

#[tokio::test]
async fn test_remove_pending_task() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());
  let counter = Arc::new(AtomicUsize::new(0));
  install_counting_fetch(&queue, counter.clone(), StdDuration::ZERO, true);

  let removed_events = Arc::new(AtomicUsize::new(0));
  {
    let removed_events = removed_events.clone();
    bus
      .subscribe(topic::QUEUE_TASK_REMOVED, move |_| {
        removed_events.fetch_add(1, Ordering::SeqCst);
      })
      .detach();
  }

  let task_id = queue.enqueue(payload("https://example.com/v/1"), TaskPriority::Normal);
  assert!(queue.remove(task_id));
  assert_eq!(
    queue.get_task(task_id).map(|t| t.status),
    Some(TaskStatus::Cancelled)
  );
  assert_eq!(removed_events.load(Ordering::SeqCst), 1);

  // The stale queue entry is discarded at dispatch; the callback never runs.
  queue.start();
  tokio::time::sleep(StdDuration::from_millis(300)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0);
  assert_eq!(queue.metrics_snapshot().tasks_discarded_cancelled, 1);

  // Removing again (or removing an unknown id) reports failure.
  assert!(!queue.remove(task_id));
  assert!(!queue.remove(Uuid::new_v4()));

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_remove_running_task_returns_false() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());
  let counter = Arc::new(AtomicUsize::new(0));
  install_counting_fetch(&queue, counter.clone(), StdDuration::from_millis(500), true);

  let task_id = queue.enqueue(payload("https://example.com/v/1"), TaskPriority::Normal);
  queue.start();

  assert!(
    wait_for(StdDuration::from_secs(2), || {
      queue.get_task(task_id).map(|t| t.status) == Some(TaskStatus::Running)
    })
    .await
  );

  assert!(!queue.remove(task_id), "Running tasks cannot be removed");
  assert_eq!(
    queue.get_task(task_id).map(|t| t.status),
    Some(TaskStatus::Running),
    "A refused removal must leave status unchanged"
  );

  assert!(
    wait_for(StdDuration::from_secs(2), || {
      queue.get_task(task_id).map(|t| t.status) == Some(TaskStatus::Completed)
    })
    .await
  );

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_cooperative_cancel_of_running_task() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());

  let cancelled_events = Arc::new(AtomicUsize::new(0));
  {
    let cancelled_events = cancelled_events.clone();
    bus
      .subscribe(topic::DOWNLOAD_CANCELLED, move |_| {
        cancelled_events.fetch_add(1, Ordering::SeqCst);
      })
      .detach();
  }

  let observed_cancel = Arc::new(AtomicUsize::new(0));
  {
    let observed_cancel = observed_cancel.clone();
    queue.set_fetch_fn(move |ctx| {
      let observed_cancel = observed_cancel.clone();
      async move {
        // Poll the token at safe points, as a real downloader would.
        for _ in 0..100 {
          if ctx.cancel.is_cancelled() {
            observed_cancel.fetch_add(1, Ordering::SeqCst);
            return Err("cancelled".to_string());
          }
          tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        Ok(None)
      }
    });
  }

  let task_id = queue.enqueue(payload("https://example.com/v/1"), TaskPriority::Normal);
  queue.start();

  assert!(
    wait_for(StdDuration::from_secs(2), || {
      queue.get_task(task_id).map(|t| t.status) == Some(TaskStatus::Running)
    })
    .await
  );

  assert!(queue.cancel(task_id));
  assert_eq!(
    queue.get_task(task_id).map(|t| t.status),
    Some(TaskStatus::Cancelled),
    "Cancellation is recorded immediately"
  );
  assert_eq!(cancelled_events.load(Ordering::SeqCst), 1);

  // The callback notices the token and winds down; the cancelled status
  // stands even though the callback returned afterwards.
  assert!(wait_for(StdDuration::from_secs(2), || {
    observed_cancel.load(Ordering::SeqCst) == 1 && queue.active_count() == 0
  })
  .await);
  assert_eq!(
    queue.get_task(task_id).map(|t| t.status),
    Some(TaskStatus::Cancelled)
  );

  // Cancelling again is idempotent; unknown ids report failure.
  assert!(queue.cancel(task_id));
  assert!(!queue.cancel(Uuid::new_v4()));

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_clear_all_cancels_but_does_not_kill() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());

  let cleared_events = Arc::new(AtomicUsize::new(0));
  {
    let cleared_events = cleared_events.clone();
    bus
      .subscribe(topic::QUEUE_CLEARED, move |_| {
        cleared_events.fetch_add(1, Ordering::SeqCst);
      })
      .detach();
  }

  // The running task parks its cancellation token so the test can observe
  // the flag after the table is cleared.
  let running_token: Arc<Mutex<Option<CancelToken>>> = Arc::new(Mutex::new(None));
  {
    let running_token = running_token.clone();
    queue.set_fetch_fn(move |ctx| {
      let running_token = running_token.clone();
      async move {
        *running_token.lock().unwrap() = Some(ctx.cancel.clone());
        tokio::time::sleep(StdDuration::from_millis(500)).await;
        Ok(None)
      }
    });
  }

  let ids = queue.enqueue_batch(
    (1..=3).map(|i| payload(&format!("https://example.com/v/{i}"))),
    TaskPriority::Normal,
  );
  assert_eq!(ids.len(), 3);
  queue.start();

  assert!(wait_for(StdDuration::from_secs(2), || queue.active_count() == 1).await);
  assert_eq!(queue.get_statistics().pending, 2);
  assert_eq!(queue.get_pending_tasks().len(), 2);

  queue.clear_all();

  assert!(queue.get_all_tasks().is_empty(), "Task table must be emptied");
  assert_eq!(queue.pending_len(), 0);
  assert_eq!(cleared_events.load(Ordering::SeqCst), 1);

  let token = running_token.lock().unwrap().clone().expect("token parked");
  assert!(
    token.is_cancelled(),
    "The running task's cancellation flag must be set"
  );
  // The execution context is not forcibly killed; it finishes on its own.
  assert_eq!(queue.active_count(), 1);
  assert!(wait_for(StdDuration::from_secs(2), || queue.active_count() == 0).await);

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(2, bus.clone());
  let counter = Arc::new(AtomicUsize::new(0));
  install_counting_fetch(&queue, counter.clone(), StdDuration::from_millis(200), true);

  queue.enqueue(payload("https://example.com/v/1"), TaskPriority::Normal);
  queue.enqueue(payload("https://example.com/v/2"), TaskPriority::Normal);
  queue.start();

  assert!(wait_for(StdDuration::from_secs(2), || queue.active_count() == 2).await);
  queue.shutdown(Some(StdDuration::from_secs(5))).await.unwrap();

  assert_eq!(queue.active_count(), 0);
  assert_eq!(counter.load(Ordering::SeqCst), 2);
  assert!(!queue.is_running());
}
