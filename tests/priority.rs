//! tests/priority.rs
//! Ordering and admission-control tests: strict priority, FIFO tie-break,
//! concurrency limit.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use crate::common::{build_queue, install_recording_fetch, payload, setup_tracing, wait_for};
use downhaul::{EventBus, TaskPriority, TaskStatus};

#[tokio::test]
async fn test_strict_priority_order() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());
  let order = Arc::new(Mutex::new(Vec::new()));
  install_recording_fetch(&queue, order.clone(), StdDuration::from_millis(10));

  // Enqueued lowest priority first; admission must still be High, Normal, Low.
  queue.enqueue(payload("low"), TaskPriority::Low);
  queue.enqueue(payload("normal"), TaskPriority::Normal);
  queue.enqueue(payload("high"), TaskPriority::High);
  queue.start();

  assert!(wait_for(StdDuration::from_secs(2), || order.lock().unwrap().len() == 3).await);
  assert_eq!(*order.lock().unwrap(), vec!["high", "normal", "low"]);

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_fifo_within_equal_priority() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());
  let order = Arc::new(Mutex::new(Vec::new()));
  install_recording_fetch(&queue, order.clone(), StdDuration::from_millis(10));

  queue.enqueue(payload("first"), TaskPriority::Normal);
  queue.enqueue(payload("second"), TaskPriority::Normal);
  queue.enqueue(payload("third"), TaskPriority::Normal);
  queue.start();

  assert!(wait_for(StdDuration::from_secs(2), || order.lock().unwrap().len() == 3).await);
  assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_high_then_two_lows_with_limit_one() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());
  let order = Arc::new(Mutex::new(Vec::new()));
  install_recording_fetch(&queue, order.clone(), StdDuration::from_millis(10));

  queue.enqueue(payload("high"), TaskPriority::High);
  queue.enqueue(payload("low-1"), TaskPriority::Low);
  queue.enqueue(payload("low-2"), TaskPriority::Low);
  queue.start();

  assert!(wait_for(StdDuration::from_secs(2), || order.lock().unwrap().len() == 3).await);
  assert_eq!(*order.lock().unwrap(), vec!["high", "low-1", "low-2"]);

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(2, bus.clone());

  let active = Arc::new(AtomicUsize::new(0));
  let max_observed = Arc::new(AtomicUsize::new(0));
  let completed = Arc::new(AtomicUsize::new(0));
  {
    let active = active.clone();
    let max_observed = max_observed.clone();
    let completed = completed.clone();
    queue.set_fetch_fn(move |_ctx| {
      let active = active.clone();
      let max_observed = max_observed.clone();
      let completed = completed.clone();
      async move {
        let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_observed.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        active.fetch_sub(1, Ordering::SeqCst);
        completed.fetch_add(1, Ordering::SeqCst);
        Ok(None)
      }
    });
  }

  for i in 0..5 {
    queue.enqueue(payload(&format!("task-{i}")), TaskPriority::Normal);
  }
  queue.start();

  assert!(wait_for(StdDuration::from_secs(5), || completed.load(Ordering::SeqCst) == 5).await);
  assert!(
    max_observed.load(Ordering::SeqCst) <= 2,
    "No more than two downloads may run at once (observed {})",
    max_observed.load(Ordering::SeqCst)
  );

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_update_priority_reorders_pending() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());
  let order = Arc::new(Mutex::new(Vec::new()));
  install_recording_fetch(&queue, order.clone(), StdDuration::from_millis(10));

  let _a = queue.enqueue(payload("a"), TaskPriority::Low);
  let b = queue.enqueue(payload("b"), TaskPriority::Low);
  assert!(queue.update_priority(b, TaskPriority::High));

  queue.start();
  assert!(wait_for(StdDuration::from_secs(2), || order.lock().unwrap().len() == 2).await);
  assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);

  // Terminal tasks can no longer be re-prioritized.
  assert!(!queue.update_priority(b, TaskPriority::Low));
  assert_eq!(
    queue.get_task(b).map(|t| t.status),
    Some(TaskStatus::Completed)
  );

  queue.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_pause_halts_admissions() {
  setup_tracing();
  let bus = EventBus::new();
  let queue = build_queue(1, bus.clone());
  let order = Arc::new(Mutex::new(Vec::new()));
  install_recording_fetch(&queue, order.clone(), StdDuration::from_millis(10));

  queue.start();
  queue.pause();
  assert!(queue.is_paused());

  queue.enqueue(payload("held"), TaskPriority::Normal);
  tokio::time::sleep(StdDuration::from_millis(300)).await;
  assert!(order.lock().unwrap().is_empty(), "Paused queue must not admit");
  assert_eq!(queue.pending_len(), 1);

  queue.resume();
  assert!(wait_for(StdDuration::from_secs(2), || order.lock().unwrap().len() == 1).await);

  queue.stop(None).await.unwrap();
}
