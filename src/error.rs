use thiserror::Error;

/// Errors that can occur while building a `DownloadQueue` via `QueueBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("`max_concurrent` must be greater than zero")]
  ZeroMaxConcurrent,
}

/// Errors related to stopping the queue (`stop`, `shutdown`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Timed out waiting for queue tasks to wind down.")]
  Timeout,
  #[error("The dispatch loop or an execution task panicked while winding down.")]
  TaskPanic,
}

/// Errors surfaced when opening or initializing the durable cache tier.
///
/// Runtime read/write failures on an already-open tier are not reported
/// through this type: they are logged and degrade to a miss or no-op, so the
/// fast tier keeps functioning standalone.
#[derive(Error, Debug)]
pub enum CacheError {
  #[error("cache table name must be a plain identifier, got {0:?}")]
  InvalidTable(String),
  #[error("durable cache storage error: {0}")]
  Storage(#[from] rusqlite::Error),
}
