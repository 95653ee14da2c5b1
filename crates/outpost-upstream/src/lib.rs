//! # outpost-upstream
//!
//! Agent-side link to the upstream server.
//!
//! This crate provides:
//! - [`UpstreamClient`]: push, delete, ping, artifacts and page digests over HTTP
//! - [`Reconciler`]: page-by-page anti-entropy between the agent and upstream
//! - [`PushQueueHandler`]: forwards row change events to upstream as they happen
//! - Request and reconciliation metrics via the `metrics` facade
//!
//! ## Example
//!
//! ```ignore
//! use outpost_upstream::{Reconciler, UpstreamClient};
//!
//! let client = UpstreamClient::from_env()?;
//! let reconciler = Reconciler::new(db.sync.clone(), client);
//! reconciler.sync_all(&db.context()).await?;
//! ```

pub mod client;
pub mod error;
pub mod metrics;
pub mod push_queue;
pub mod reconcile;

pub use client::{parse_labels, UpstreamApi, UpstreamClient, UpstreamConfig};
pub use error::{UpstreamError, UpstreamResult};
pub use metrics::register_metrics;
pub use push_queue::{
    push_queue_events, PushQueueHandler, EVENT_PUSH_QUEUE_CREATE, EVENT_PUSH_QUEUE_DELETE,
};
pub use reconcile::{LocalSource, Reconciler};
