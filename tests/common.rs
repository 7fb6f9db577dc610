//! tests/common.rs
//! Shared helper functions for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use downhaul::{DownloadPayload, DownloadQueue, EventBus};
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Builds a queue with a short poll interval so tests stay fast. The fetch
// callback is installed separately per test.
pub fn build_queue(max_concurrent: usize, bus: EventBus) -> DownloadQueue {
  DownloadQueue::builder()
    .max_concurrent(max_concurrent)
    .auto_start(false)
    .poll_interval(StdDuration::from_millis(50))
    .event_bus(bus)
    .build()
    .expect("failed to build queue")
}

pub fn payload(url: &str) -> DownloadPayload {
  DownloadPayload::new(url, "/tmp/downloads")
}

// Installs a fetch callback that counts invocations, optionally delays, and
// returns a fixed success/failure result.
pub fn install_counting_fetch(
  queue: &DownloadQueue,
  counter: Arc<AtomicUsize>,
  delay: StdDuration,
  succeeds: bool,
) {
  queue.set_fetch_fn(move |_ctx| {
    let counter = counter.clone();
    async move {
      let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Counting fetch executing (count: {count}, succeeds: {succeeds})");
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      if succeeds {
        Ok(None)
      } else {
        Err("download failed".to_string())
      }
    }
  });
}

// Installs a fetch callback that records the URL of each task it executes,
// in execution order.
pub fn install_recording_fetch(
  queue: &DownloadQueue,
  order: Arc<Mutex<Vec<String>>>,
  delay: StdDuration,
) {
  queue.set_fetch_fn(move |ctx| {
    let order = order.clone();
    async move {
      order.lock().unwrap().push(ctx.task.payload.url.clone());
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      Ok(None)
    }
  });
}

// Polls `cond` until it holds or `timeout` elapses; returns the final result.
pub async fn wait_for(timeout: StdDuration, mut cond: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  while tokio::time::Instant::now() < deadline {
    if cond() {
      return true;
    }
    tokio::time::sleep(StdDuration::from_millis(20)).await;
  }
  cond()
}
