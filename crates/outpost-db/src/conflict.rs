//! Degrade-on-foreign-key-violation saving.
//!
//! A batch that contains rows whose parent is not there yet fails as a whole.
//! Rather than rejecting the batch, rows are retried one at a time so that
//! everything that can be saved is saved, and the residual is retried as a
//! batch again (their parents may have arrived in the meantime). Whatever
//! still fails is reported as a [`PushFkError`] listing its primary keys.

use async_trait::async_trait;
use tracing::{debug, warn};

use outpost_core::{Error, PushFkError, Result, Row, SyncTable};

/// Persists rows of one table.
#[async_trait]
pub trait RowWriter: Send + Sync {
    /// Upsert every row in one statement.
    async fn save_batch(&self, table: SyncTable, rows: &[Row]) -> Result<()>;

    /// Upsert a single row.
    async fn save_one(&self, table: SyncTable, row: &Row) -> Result<()>;
}

/// Save `rows`, degrading to per-row saves on foreign-key violations.
///
/// Runs up to `max_retries` batch-then-degrade cycles (at least one). Errors
/// outside the foreign-key class abort immediately. When rows still fail
/// after the last cycle, returns [`Error::Conflict`] with exactly their keys.
pub async fn save_with_degradation<W>(
    writer: &W,
    table: SyncTable,
    rows: Vec<Row>,
    max_retries: usize,
) -> Result<()>
where
    W: RowWriter + ?Sized,
{
    if rows.is_empty() {
        return Ok(());
    }

    let mut pending = rows;
    let cycles = max_retries.max(1);

    for cycle in 1..=cycles {
        match writer.save_batch(table, &pending).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(
                    subsystem = "db",
                    component = "conflict",
                    op = "save_with_degradation",
                    db_table = %table,
                    cycle,
                    batch_size = pending.len(),
                    error = %e,
                    "Batch hit a foreign key violation, degrading to single rows"
                );
            }
            Err(e) => return Err(e),
        }

        let mut failed = Vec::new();
        for row in pending {
            match writer.save_one(table, &row).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => failed.push(row),
                Err(e) => return Err(e),
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        pending = failed;
    }

    let ids: Vec<String> = pending.iter().filter_map(|r| table.row_key(r)).collect();
    warn!(
        subsystem = "db",
        component = "conflict",
        op = "save_with_degradation",
        db_table = %table,
        failed = ids.len(),
        "Rows still violate a foreign key after retries"
    );
    Err(Error::Conflict(PushFkError { ids }))
}
