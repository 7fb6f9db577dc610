//! Downhaul: an asynchronous download-job coordinator for Tokio.
//!
//! Provides the coordination core of a download manager: a priority task
//! scheduler with bounded concurrency, a publish/subscribe event bus that
//! decouples producers of state changes from their consumers, and a two-tier
//! cache (bounded in-memory LRU over a durable SQLite store with expiry) for
//! memoizing expensive lookups such as resolved media metadata.
//!
//! # Features
//!
//! - Priority scheduling: strict priority tiers (`High`/`Normal`/`Low`) with
//!   FIFO ordering inside a tier, driven by a single dispatch loop with a
//!   bounded idle poll.
//! - Bounded concurrency: a configurable number of downloads execute at
//!   once, each on its own Tokio task; panics in the fetch callback are
//!   contained and become task failures.
//! - Cooperative cancellation via a [`CancelToken`] polled by the fetch
//!   callback; the queue never forcibly kills a running download.
//! - Lifecycle notifications (`queue:task_added`, `download:started`,
//!   `download:completed`, ...) published on an injected [`EventBus`], with
//!   synchronous or queued-asynchronous delivery.
//! - Progress reporting through a [`ProgressHandle`] handed to the fetch
//!   callback, surfaced as `download:progress` events.
//! - Two-tier memoization ([`TwoTierCache`]): read-through population of the
//!   fast tier, write-through to both tiers, lazy expiry on read plus bulk
//!   `cleanup_expired` maintenance on the durable tier.
//! - Built-in metrics snapshot ([`MetricsSnapshot`]) and `tracing`
//!   integration throughout.
//!
//! # Usage
//!
//! ```no_run
//! use downhaul::{topic, DownloadPayload, DownloadQueue, EventBus, TaskPriority};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::new();
//!
//!     // React to completions without being coupled to the queue.
//!     let completed = bus.subscribe(topic::DOWNLOAD_COMPLETED, |event| {
//!         println!("completed: {}", event.data);
//!     });
//!
//!     let queue = DownloadQueue::builder()
//!         .max_concurrent(2)
//!         .event_bus(bus.clone())
//!         .fetch_fn(|ctx| async move {
//!             // Real implementations invoke the external downloader here,
//!             // polling `ctx.cancel` and reporting progress as they go.
//!             for step in 1..=10u32 {
//!                 if ctx.cancel.is_cancelled() {
//!                     return Err("cancelled".to_string());
//!                 }
//!                 ctx.progress.update(f64::from(step) * 10.0, Some("1.5 MiB/s"), None);
//!                 tokio::time::sleep(Duration::from_millis(50)).await;
//!             }
//!             Ok(Some(format!("{}/video.mp4", ctx.task.payload.output_dir)))
//!         })
//!         .build()?;
//!
//!     let payload = DownloadPayload::new("https://example.com/v/1", "/tmp/downloads");
//!     let task_id = queue.enqueue(payload, TaskPriority::High);
//!
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     println!("status: {:?}", queue.get_task(task_id).map(|t| t.status));
//!     println!("stats: {:?}", queue.get_statistics());
//!
//!     queue.shutdown(Some(Duration::from_secs(5))).await?;
//!     completed.unsubscribe();
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use [`QueueBuilder`] to configure the scheduler:
//! - `max_concurrent`: the concurrency limit (must be positive).
//! - `auto_start`: start the dispatch loop on the first `enqueue`.
//! - `poll_interval`: upper bound on the dispatch loop's idle wait.
//! - `event_bus` / `fetch_fn`: injected collaborators.
//!
//! [`TwoTierCacheBuilder`] configures a cache namespace: fast-tier capacity,
//! default TTL, and the durable tier's database path.
//!
//! # Task Lifecycle & State
//!
//! - Tasks are created by [`DownloadQueue::enqueue`] from a
//!   [`DownloadPayload`] (opaque to the scheduler) and a [`TaskPriority`].
//! - Status moves `Pending → Running → {Completed | Failed | Cancelled}`,
//!   with a `Pending → Cancelled` shortcut; terminal tasks stay in the table
//!   for inspection until `clear_completed`/`clear_all`.
//! - The fetch callback reports success or failure; configuration errors
//!   (no callback set) and panics also surface as `Failed` tasks, never as
//!   crashes of the dispatch loop.
//!
//! # Observability
//!
//! - Subscribe to the event catalogue in [`topic`] for lifecycle changes.
//! - Retrieve metrics with [`DownloadQueue::metrics_snapshot`].
//! - Integrate with the `tracing` crate for detailed logs.

// Declare modules within the crate
pub mod bus;
pub mod cache;
mod dispatcher;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod task;

// --- Public Re-exports ---

// Event bus
pub use bus::{topic, Event, EventBus, Subscription};

// Cache
pub use cache::{make_cache_key, CacheEntry, MemoryCache, SqliteCache, TwoTierCache, TwoTierCacheBuilder};

// Scheduler
pub use queue::{DownloadQueue, ProgressHandle, QueueBuilder, QueueStatistics};

// Task types
pub use task::{
  BoxedFetchFn, CancelToken, DownloadPayload, DownloadTask, FetchContext, FetchResult, TaskId,
  TaskPriority, TaskStatus,
};

// Errors
pub use error::{BuildError, CacheError, ShutdownError};

// Metrics
pub use metrics::MetricsSnapshot;
