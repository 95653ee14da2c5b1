//! # outpost-queue
//!
//! Event queue consumers for outpost.
//!
//! This crate provides:
//! - [`SyncEventConsumer`]: one event per transaction, handlers run inside it
//! - [`AsyncEventConsumer`]: batches handed to a handler outside the database
//! - [`PgConsumer`]: a worker pool woken by notifications or a poll timeout
//! - [`PgNotifyListener`]: bridges Postgres `NOTIFY` to the worker pool
//!
//! ## Example
//!
//! ```ignore
//! use outpost_queue::{ConsumerConfig, PgConsumer, PgNotifyListener, SyncEventConsumer};
//!
//! let consumer = SyncEventConsumer::new(db.events.clone(), vec!["check.failed".into()])
//!     .with_handler(MyHandler);
//! let pg = PgConsumer::new("checks", consumer).with_config(ConsumerConfig::from_env());
//! PgNotifyListener::new(db.pool.clone(), pg.notifier()).spawn(ctx.cancel_token().clone());
//! let handle = pg.start(&ctx);
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod consumer;
pub mod event_consumer;
pub mod handler;
pub mod listener;

pub use consumer::{default_error_handler, ConsumerConfig, ConsumerHandle, ErrorHandler, PgConsumer};
pub use event_consumer::{AsyncEventConsumer, Consume, SyncEventConsumer};
pub use handler::{AsyncEventHandler, SyncEventHandler};
pub use listener::PgNotifyListener;
