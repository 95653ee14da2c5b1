//! Centralized default constants for outpost.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section.

// =============================================================================
// EVENT QUEUE
// =============================================================================

/// Maximum attempts before an event stops being claimable.
pub const EVENT_MAX_ATTEMPTS: i32 = 3;

/// Base delay for the reclaim backoff in seconds.
///
/// The reclaim window is `base_delay * attempts^exponent`.
pub const EVENT_BASE_DELAY_SECS: u64 = 60;

/// Exponent for the reclaim backoff.
pub const EVENT_BACKOFF_EXPONENT: i32 = 5;

/// Batch size used when a caller asks for zero events.
pub const EVENT_BATCH_SIZE: usize = 1;

/// Postgres channel that producers `NOTIFY` after inserting into `event_queue`.
pub const EVENT_NOTIFY_CHANNEL: &str = "event_queue_updates";

// =============================================================================
// CONSUMERS
// =============================================================================

/// Default number of concurrent consumer workers.
pub const NUM_CONSUMERS: usize = 1;

/// Safety-net wake-up interval in seconds when no notification arrives.
///
/// Notifications are not guaranteed across reconnects, so this bounds the
/// worst-case latency of a queued event.
pub const NOTIFY_TIMEOUT_SECS: u64 = 60;

/// Delay applied by the default error handler before retrying, in milliseconds.
pub const CONSUMER_ERROR_DELAY_MS: u64 = 1_000;

/// Batch size for the async push-queue consumer.
pub const PUSH_QUEUE_BATCH_SIZE: usize = 50;

/// Maximum reconnect delay for the notification listener in seconds.
pub const LISTENER_MAX_RECONNECT_SECS: u64 = 60;

// =============================================================================
// STATUS RINGS
// =============================================================================

/// Ring size for recorded events. Zero disables recording.
pub const EVENT_RING_SIZE: usize = 0;

/// Ring size per `(agent, name, resource)` key in the job history manager.
pub const JOB_HISTORY_RING_SIZE: usize = 10;

// =============================================================================
// UPSTREAM
// =============================================================================

/// HTTP timeout for upstream requests in seconds.
pub const UPSTREAM_TIMEOUT_SECS: u64 = 60;

/// Page size used by the reconciler.
pub const RECONCILE_PAGE_SIZE: i64 = 500;

/// Interval between full reconciliation sweeps in seconds.
pub const RECONCILE_INTERVAL_SECS: u64 = 3_600;

/// Recency window for incremental reconciliation sweeps in seconds.
pub const RECONCILE_RECENT_WINDOW_SECS: u64 = 6 * 3_600;

/// Batch size when pushing rows that are flagged as not yet pushed.
pub const PUSH_UNPUSHED_BATCH_SIZE: i64 = 200;

/// Number of batch-then-degrade cycles before giving up on FK conflicts.
pub const FK_MAX_RETRIES: usize = 3;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port for the upstream server.
pub const SERVER_PORT: u16 = 8080;

/// Maximum request body size in bytes for push payloads (64 MB).
pub const MAX_BODY_SIZE_BYTES: usize = 64 * 1024 * 1024;
