//! Batch handler forwarding row change events to upstream.
//!
//! Producers enqueue `push_queue.create` or `push_queue.delete` events with
//! the properties `table` (a synced table name) and `id` (the primary key;
//! composite keys joined with `:`). Creates are pushed with the current
//! local row, deletes carry only the key columns.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use outpost_core::{Event, FailedEvent, PushData, Result, Row, SyncTable};
use outpost_db::OpContext;
use outpost_queue::AsyncEventHandler;

use crate::client::UpstreamApi;
use crate::reconcile::{push_rows, LocalSource};

/// Event name for inserted or updated rows.
pub const EVENT_PUSH_QUEUE_CREATE: &str = "push_queue.create";

/// Event name for deleted rows.
pub const EVENT_PUSH_QUEUE_DELETE: &str = "push_queue.delete";

/// Event names consumed by [`PushQueueHandler`].
pub fn push_queue_events() -> Vec<String> {
    vec![
        EVENT_PUSH_QUEUE_CREATE.to_string(),
        EVENT_PUSH_QUEUE_DELETE.to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Op {
    Upsert,
    Delete,
}

/// Rebuild the key columns of `table` from a `:`-joined key.
fn key_row(table: SyncTable, key: &str) -> Option<Row> {
    let columns = table.primary_key();
    let parts: Vec<&str> = key.splitn(columns.len(), ':').collect();
    if parts.len() != columns.len() || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(
        columns
            .iter()
            .zip(parts)
            .map(|(col, part)| (col.to_string(), JsonValue::String(part.to_string())))
            .collect(),
    )
}

/// Pushes changed rows to upstream as events arrive.
///
/// A foreign-key rejection is not an event failure: the rows are flagged
/// unpushed locally and the next push of pending rows carries them with
/// their parents.
pub struct PushQueueHandler<L, U> {
    local: L,
    upstream: U,
}

impl<L, U> PushQueueHandler<L, U>
where
    L: LocalSource,
    U: UpstreamApi,
{
    pub fn new(local: L, upstream: U) -> Self {
        Self { local, upstream }
    }

    async fn upsert(&self, ctx: &OpContext, table: SyncTable, keys: Vec<String>) -> Result<()> {
        let rows = self.local.rows_by_keys(table, &keys).await?;
        if rows.len() < keys.len() {
            debug!(
                subsystem = "upstream",
                component = "push_queue",
                db_table = %table,
                requested = keys.len(),
                found = rows.len(),
                "Some queued rows no longer exist locally"
            );
        }
        match push_rows(ctx, &self.local, &self.upstream, table, rows).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, ctx: &OpContext, table: SyncTable, keys: Vec<String>) -> Result<()> {
        let mut data = PushData::new(self.upstream.agent_name());
        data.add_rows(table, keys.iter().filter_map(|k| key_row(table, k)));
        self.upstream.delete(ctx, &data).await?;
        Ok(())
    }
}

#[async_trait]
impl<L, U> AsyncEventHandler for PushQueueHandler<L, U>
where
    L: LocalSource,
    U: UpstreamApi,
{
    fn name(&self) -> &str {
        "push_queue"
    }

    async fn handle_batch(&self, ctx: &OpContext, events: Vec<Event>) -> Vec<FailedEvent> {
        let mut failed = Vec::new();
        let mut groups: BTreeMap<(Op, SyncTable), Vec<Event>> = BTreeMap::new();

        for event in events {
            let op = match event.name.as_str() {
                EVENT_PUSH_QUEUE_CREATE => Op::Upsert,
                EVENT_PUSH_QUEUE_DELETE => Op::Delete,
                other => {
                    let error = format!("unexpected event {other}");
                    failed.push(FailedEvent::new(event, error));
                    continue;
                }
            };
            let table = match event.property("table").map(str::parse::<SyncTable>) {
                Some(Ok(table)) => table,
                Some(Err(e)) => {
                    failed.push(FailedEvent::new(event, e.to_string()));
                    continue;
                }
                None => {
                    failed.push(FailedEvent::new(event, "missing table property"));
                    continue;
                }
            };
            let valid_key = event
                .property("id")
                .is_some_and(|id| op == Op::Upsert || key_row(table, id).is_some());
            if !valid_key {
                failed.push(FailedEvent::new(event, "missing or malformed id property"));
                continue;
            }
            groups.entry((op, table)).or_default().push(event);
        }

        for ((op, table), events) in groups {
            let mut keys: Vec<String> = events
                .iter()
                .filter_map(|e| e.property("id").map(str::to_string))
                .collect();
            keys.sort();
            keys.dedup();

            let result = match op {
                Op::Upsert => self.upsert(ctx, table, keys).await,
                Op::Delete => self.delete(ctx, table, keys).await,
            };

            if let Err(e) = result {
                warn!(
                    subsystem = "upstream",
                    component = "push_queue",
                    db_table = %table,
                    events = events.len(),
                    error = %e,
                    "Push queue batch failed"
                );
                let error = e.to_string();
                failed.extend(events.into_iter().map(|ev| FailedEvent::new(ev, error.clone())));
            }
        }

        failed
    }
}
