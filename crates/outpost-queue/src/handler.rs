//! Event handlers.

use async_trait::async_trait;
use sqlx::PgConnection;

use outpost_core::{Event, FailedEvent, Result};
use outpost_db::OpContext;

/// Handles one event inside the transaction that claimed it.
///
/// Writes made through `tx` commit together with the removal of the event
/// and roll back with it when any handler fails.
#[async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &OpContext, tx: &mut PgConnection, event: &Event) -> Result<()>;
}

/// Handles a claimed batch and reports the events that failed.
///
/// Events not returned are considered done.
#[async_trait]
pub trait AsyncEventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn handle_batch(&self, ctx: &OpContext, events: Vec<Event>) -> Vec<FailedEvent>;
}
