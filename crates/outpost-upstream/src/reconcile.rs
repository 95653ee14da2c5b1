//! Anti-entropy between the agent database and upstream.
//!
//! The reconciler walks a table in pages ordered by id. For each page both
//! sides compute a digest over `id || updated_at`; equal digests skip the
//! page, otherwise the agent fetches upstream's ids for the page and pushes
//! the local rows upstream lacks. When every id is present (only timestamps
//! differ) the whole page is pushed, which the upsert makes idempotent.
//!
//! Rows rejected for a missing parent are flagged as not yet pushed together
//! with their parents, so a later [`Reconciler::push_unpushed`] retries them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, info_span, warn};

use outpost_core::{
    defaults, Error, JobHistory, PaginateRequest, PaginateResponse, PushData, Result, Row,
    StatusRingManager, SyncTable,
};
use outpost_db::{OpContext, PgSyncStore};

use crate::client::UpstreamApi;
use crate::error::UpstreamError;
use crate::metrics;

/// Agent-side rows as the reconciler needs them.
#[async_trait]
pub trait LocalSource: Send + Sync {
    async fn digest(&self, req: &PaginateRequest) -> Result<PaginateResponse>;

    async fn rows_in_window(&self, req: &PaginateRequest) -> Result<Vec<Row>>;

    async fn rows_by_keys(&self, table: SyncTable, keys: &[String]) -> Result<Vec<Row>>;

    async fn unpushed_rows(&self, table: SyncTable, limit: i64) -> Result<Vec<Row>>;

    async fn mark_pushed(&self, table: SyncTable, ids: &[String]) -> Result<u64>;

    /// Flag rows, and their parents, for another push.
    async fn mark_unpushed(&self, table: SyncTable, ids: &[String]) -> Result<u64>;

    async fn sync_after_cursor(&self, table: SyncTable, window: Duration) -> Result<String>;
}

#[async_trait]
impl LocalSource for PgSyncStore {
    async fn digest(&self, req: &PaginateRequest) -> Result<PaginateResponse> {
        self.local_digest(req).await
    }

    async fn rows_in_window(&self, req: &PaginateRequest) -> Result<Vec<Row>> {
        PgSyncStore::rows_in_window(self, req).await
    }

    async fn rows_by_keys(&self, table: SyncTable, keys: &[String]) -> Result<Vec<Row>> {
        PgSyncStore::rows_by_keys(self, table, keys).await
    }

    async fn unpushed_rows(&self, table: SyncTable, limit: i64) -> Result<Vec<Row>> {
        PgSyncStore::unpushed_rows(self, table, limit).await
    }

    async fn mark_pushed(&self, table: SyncTable, ids: &[String]) -> Result<u64> {
        PgSyncStore::mark_pushed(self, table, ids).await
    }

    async fn mark_unpushed(&self, table: SyncTable, ids: &[String]) -> Result<u64> {
        PgSyncStore::mark_unpushed(self, table, ids).await
    }

    async fn sync_after_cursor(&self, table: SyncTable, window: Duration) -> Result<String> {
        PgSyncStore::sync_after_cursor(self, table, window).await
    }
}

/// Push `rows` of `table` and update the local flags from the outcome.
///
/// On a foreign-key answer the rejected keys (and their parents) are flagged
/// unpushed, the rest are marked pushed and the conflict is returned.
pub(crate) async fn push_rows<L, U>(
    ctx: &OpContext,
    local: &L,
    upstream: &U,
    table: SyncTable,
    rows: Vec<Row>,
) -> Result<usize>
where
    L: LocalSource + ?Sized,
    U: UpstreamApi + ?Sized,
{
    if rows.is_empty() {
        return Ok(0);
    }

    let mut data = PushData::new(upstream.agent_name());
    data.add_rows(table, rows);
    let ids = data.ids(table);

    match upstream.push(ctx, &data).await {
        Ok(()) => {
            local.mark_pushed(table, &ids).await?;
            metrics::record_rows_pushed(table.table_name(), ids.len() as u64);
            Ok(ids.len())
        }
        Err(UpstreamError::ForeignKey(fk)) => {
            local.mark_unpushed(table, &fk.ids).await?;
            let rejected: HashSet<&str> = fk.ids.iter().map(String::as_str).collect();
            let saved: Vec<String> = ids
                .into_iter()
                .filter(|id| !rejected.contains(id.as_str()))
                .collect();
            local.mark_pushed(table, &saved).await?;
            metrics::record_rows_pushed(table.table_name(), saved.len() as u64);
            warn!(
                subsystem = "upstream",
                component = "reconciler",
                db_table = %table,
                saved = saved.len(),
                rejected = fk.ids.len(),
                "Upstream rejected rows with missing parents"
            );
            Err(Error::Conflict(fk))
        }
        Err(e) => Err(e.into()),
    }
}

/// Reconciles agent-owned rows against upstream.
pub struct Reconciler<L, U> {
    local: L,
    upstream: U,
    page_size: i64,
    history: Option<Arc<StatusRingManager>>,
}

impl<L, U> Reconciler<L, U>
where
    L: LocalSource,
    U: UpstreamApi,
{
    pub fn new(local: L, upstream: U) -> Self {
        Self {
            local,
            upstream,
            page_size: defaults::RECONCILE_PAGE_SIZE,
            history: None,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Record one [`JobHistory`] per table swept by [`Reconciler::sync_all`].
    pub fn with_history(mut self, history: Arc<StatusRingManager>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Sweep `table` from the start. Returns the number of rows pushed.
    pub async fn sync(&self, ctx: &OpContext, table: SyncTable) -> Result<usize> {
        self.sweep(ctx, table, String::new()).await
    }

    /// Sweep `table`, skipping the leading pages up to the latest row that
    /// has been quiet for at least `window`.
    pub async fn sync_after(
        &self,
        ctx: &OpContext,
        table: SyncTable,
        window: Duration,
    ) -> Result<usize> {
        let cursor = self.local.sync_after_cursor(table, window).await?;
        self.sweep(ctx, table, cursor).await
    }

    /// Sweep every reconcilable table. Errors from individual tables are
    /// gathered into one [`Error::Reconcile`]; cancellation stops the run.
    pub async fn sync_all(&self, ctx: &OpContext) -> Result<usize> {
        let mut pushed = 0;
        let mut errors = Vec::new();

        for table in SyncTable::reconcilable() {
            let mut history = JobHistory::start("reconcile", "table", table.table_name());
            match self.sync(ctx, table).await {
                Ok(n) => {
                    pushed += n;
                    history.increment_success();
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::Reconcile(page_errors)) => {
                    for e in page_errors {
                        history.add_error(e.clone());
                        errors.push(e);
                    }
                }
                Err(e) => {
                    let msg = format!("{table}: {e}");
                    history.add_error(msg.clone());
                    errors.push(msg);
                }
            }
            history.end();
            if let Some(manager) = &self.history {
                manager.add(history);
            }
        }

        if errors.is_empty() {
            Ok(pushed)
        } else {
            Err(Error::Reconcile(errors))
        }
    }

    /// Push rows of `table` flagged as not yet pushed, `batch` at a time.
    ///
    /// Stops at the first foreign-key conflict; the rejected rows stay
    /// flagged for the next run.
    pub async fn push_unpushed(
        &self,
        ctx: &OpContext,
        table: SyncTable,
        batch: i64,
    ) -> Result<usize> {
        let batch = batch.max(1);
        let mut total = 0;

        loop {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let rows = self.local.unpushed_rows(table, batch).await?;
            let fetched = rows.len();
            if fetched == 0 {
                break;
            }

            match push_rows(ctx, &self.local, &self.upstream, table, rows).await {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.is_conflict() => break,
                Err(e) => return Err(e),
            }
            if (fetched as i64) < batch {
                break;
            }
        }

        if total > 0 {
            debug!(
                subsystem = "upstream",
                component = "reconciler",
                op = "push_unpushed",
                db_table = %table,
                total,
                "Pushed pending rows"
            );
        }
        Ok(total)
    }

    /// [`Reconciler::push_unpushed`] over every table in insert order.
    pub async fn push_all_unpushed(&self, ctx: &OpContext) -> Result<usize> {
        let mut total = 0;
        for table in SyncTable::ALL {
            total += self
                .push_unpushed(ctx, table, defaults::PUSH_UNPUSHED_BATCH_SIZE)
                .await?;
        }
        Ok(total)
    }

    async fn sweep(&self, ctx: &OpContext, table: SyncTable, from: String) -> Result<usize> {
        let ctx = ctx.child(info_span!("reconcile", db_table = %table));
        ctx.run(self.sweep_pages(&ctx, table, from)).await
    }

    async fn sweep_pages(&self, ctx: &OpContext, table: SyncTable, from: String) -> Result<usize> {
        let mut cursor = from;
        let mut pushed = 0;
        let mut pages = 0;
        let mut errors = Vec::new();

        loop {
            let req = PaginateRequest::new(table.table_name(), cursor.clone(), self.page_size);
            let local = self.local.digest(&req).await?;
            if local.total == 0 {
                break;
            }
            pages += 1;

            match self.reconcile_page(ctx, table, &req, &local).await {
                Ok(n) => pushed += n,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(
                        subsystem = "upstream",
                        component = "reconciler",
                        db_table = %table,
                        from = %req.from,
                        error = %e,
                        "Reconciliation page failed"
                    );
                    errors.push(format!("{table} page after '{}': {e}", req.from));
                }
            }

            if local.total < self.page_size || local.next <= cursor {
                break;
            }
            cursor = local.next;
        }

        info!(
            subsystem = "upstream",
            component = "reconciler",
            op = "sync",
            db_table = %table,
            pages,
            pushed,
            failed_pages = errors.len(),
            "Reconciliation sweep finished"
        );

        if errors.is_empty() {
            Ok(pushed)
        } else {
            Err(Error::Reconcile(errors))
        }
    }

    async fn reconcile_page(
        &self,
        ctx: &OpContext,
        table: SyncTable,
        req: &PaginateRequest,
        local: &PaginateResponse,
    ) -> Result<usize> {
        let remote = self.upstream.status(ctx, req).await?;
        if remote.hash == local.hash {
            metrics::record_page_skipped(table.table_name());
            return Ok(0);
        }

        let remote_ids: HashSet<String> = self.upstream.pull_ids(ctx, req).await?.into_iter().collect();
        let rows = self.local.rows_in_window(req).await?;
        let missing: Vec<Row> = rows
            .iter()
            .filter(|row| {
                table
                    .row_key(row)
                    .is_some_and(|key| !remote_ids.contains(&key))
            })
            .cloned()
            .collect();

        debug!(
            subsystem = "upstream",
            component = "reconciler",
            db_table = %table,
            from = %req.from,
            local_rows = rows.len(),
            missing = missing.len(),
            "Page digests differ"
        );

        let to_push = if missing.is_empty() { rows } else { missing };
        push_rows(ctx, &self.local, &self.upstream, table, to_push).await
    }
}
