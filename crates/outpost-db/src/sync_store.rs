//! Row access for the synced tables.
//!
//! Both sides of a sync speak about the same pages: rows of one agent ordered
//! by `id::text COLLATE "C"`, starting after a cursor. [`page_digest`] and
//! [`ids_in_window`] are shared by the agent ([`PgSyncStore`]) and upstream
//! ([`crate::PgUpstreamStore`]) so the two hashes are computed identically.

use std::time::Duration;

use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use tracing::debug;
use uuid::Uuid;

use outpost_core::{Error, PaginateRequest, PaginateResponse, Result, Row, SyncTable};

/// `agent_id` of rows produced by this database rather than received from an
/// agent.
pub const LOCAL_AGENT_ID: Uuid = Uuid::nil();

/// SQL expression rendering the primary key of `alias` the way
/// [`SyncTable::row_key`] renders it from JSON.
pub(crate) fn key_expr(table: SyncTable, alias: &str) -> String {
    table
        .primary_key()
        .iter()
        .map(|col| format!("(to_jsonb({alias}.{col}) #>> '{{}}')"))
        .collect::<Vec<_>>()
        .join(" || ':' || ")
}

fn require_reconcilable(table: SyncTable) -> Result<()> {
    if table.is_reconcilable() {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "table {table} cannot be reconciled"
        )))
    }
}

/// SHA-256 over `id || updated_at` of up to `size` rows of `agent_id` whose
/// id sorts after `from`. An empty page has `total == 0`, an empty hash and
/// `next == ""`.
pub async fn page_digest<'e, E>(
    executor: E,
    table: SyncTable,
    agent_id: Uuid,
    req: &PaginateRequest,
) -> Result<PaginateResponse>
where
    E: PgExecutor<'e>,
{
    require_reconcilable(table)?;

    let query = format!(
        r#"WITH page AS (
               SELECT id::text AS id, updated_at
               FROM {table}
               WHERE agent_id = $1 AND id::text COLLATE "C" > $2
               ORDER BY id::text COLLATE "C"
               LIMIT $3
           )
           SELECT
               COALESCE(encode(sha256(convert_to(
                   string_agg(
                       id || to_char(updated_at AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US'),
                       '' ORDER BY id COLLATE "C"),
                   'UTF8')), 'hex'), '') AS sha256sum,
               COALESCE(MAX(id COLLATE "C"), '') AS last_id,
               COUNT(*) AS total
           FROM page"#
    );

    let (hash, next, total): (String, String, i64) = sqlx::query_as(&query)
        .bind(agent_id)
        .bind(&req.from)
        .bind(req.size.max(1))
        .fetch_one(executor)
        .await
        .map_err(Error::Database)?;

    Ok(PaginateResponse { hash, next, total })
}

/// Ids of the same window [`page_digest`] hashes.
pub async fn ids_in_window<'e, E>(
    executor: E,
    table: SyncTable,
    agent_id: Uuid,
    req: &PaginateRequest,
) -> Result<Vec<String>>
where
    E: PgExecutor<'e>,
{
    require_reconcilable(table)?;

    let query = format!(
        r#"SELECT id::text FROM {table}
           WHERE agent_id = $1 AND id::text COLLATE "C" > $2
           ORDER BY id::text COLLATE "C"
           LIMIT $3"#
    );
    sqlx::query_scalar(&query)
        .bind(agent_id)
        .bind(&req.from)
        .bind(req.size.max(1))
        .fetch_all(executor)
        .await
        .map_err(Error::Database)
}

/// Agent-side view of the synced tables.
///
/// Rows handed out by this store never carry `is_pushed`; it is bookkeeping
/// local to the agent.
#[derive(Clone)]
pub struct PgSyncStore {
    pool: PgPool,
    agent_id: Uuid,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            agent_id: LOCAL_AGENT_ID,
        }
    }

    /// Treat rows of `agent_id` as the ones this store owns.
    pub fn with_agent_id(mut self, agent_id: Uuid) -> Self {
        self.agent_id = agent_id;
        self
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub async fn local_digest(&self, req: &PaginateRequest) -> Result<PaginateResponse> {
        let table: SyncTable = req.table.parse()?;
        page_digest(&self.pool, table, self.agent_id, req).await
    }

    /// Full rows of the window described by `req`.
    pub async fn rows_in_window(&self, req: &PaginateRequest) -> Result<Vec<Row>> {
        let table: SyncTable = req.table.parse()?;
        require_reconcilable(table)?;

        let query = format!(
            r#"SELECT to_jsonb(t) - 'is_pushed' FROM {table} t
               WHERE t.agent_id = $1 AND t.id::text COLLATE "C" > $2
               ORDER BY t.id::text COLLATE "C"
               LIMIT $3"#
        );
        let rows: Vec<Json<Row>> = sqlx::query_scalar(&query)
            .bind(self.agent_id)
            .bind(&req.from)
            .bind(req.size.max(1))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Rows not yet acknowledged by upstream, oldest first.
    pub async fn unpushed_rows(&self, table: SyncTable, limit: i64) -> Result<Vec<Row>> {
        let owner = if table.has_agent_id() {
            "AND t.agent_id = $2"
        } else {
            ""
        };
        let query = format!(
            "SELECT to_jsonb(t) - 'is_pushed' FROM {table} t
             WHERE NOT t.is_pushed {owner}
             ORDER BY t.created_at
             LIMIT $1"
        );

        let mut q = sqlx::query_scalar::<_, Json<Row>>(&query).bind(limit.max(1));
        if table.has_agent_id() {
            q = q.bind(self.agent_id);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(Error::Database)?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Rows whose primary key text is in `keys`. Missing keys are skipped.
    pub async fn rows_by_keys(&self, table: SyncTable, keys: &[String]) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT to_jsonb(t) - 'is_pushed' FROM {table} t WHERE {} = ANY($1)",
            key_expr(table, "t")
        );
        let rows: Vec<Json<Row>> = sqlx::query_scalar(&query)
            .bind(keys)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    pub async fn count_unpushed(&self, table: SyncTable) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {table} WHERE NOT is_pushed");
        sqlx::query_scalar(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    /// Flag rows with the given keys as acknowledged.
    pub async fn mark_pushed(&self, table: SyncTable, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let query = format!(
            "UPDATE {table} t SET is_pushed = TRUE WHERE {} = ANY($1)",
            key_expr(table, "t")
        );
        let result = sqlx::query(&query)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    /// Flag rows as not yet pushed, together with their parent rows so the
    /// parent travels in the same retry.
    pub async fn mark_unpushed(&self, table: SyncTable, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let query = format!(
            "UPDATE {table} t SET is_pushed = FALSE WHERE {} = ANY($1)",
            key_expr(table, "t")
        );
        let mut affected = sqlx::query(&query)
            .bind(ids)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        if let Some(parent) = table.parent_column() {
            let query = format!(
                "UPDATE {table} p SET is_pushed = FALSE
                 WHERE p.id IN (
                     SELECT c.{parent} FROM {table} c
                     WHERE {} = ANY($1) AND c.{parent} IS NOT NULL
                 )",
                key_expr(table, "c")
            );
            affected += sqlx::query(&query)
                .bind(ids)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?
                .rows_affected();
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "sync_store",
            op = "mark_unpushed",
            db_table = %table,
            requested = ids.len(),
            affected,
            "Rows flagged for retry"
        );
        Ok(affected)
    }

    /// Cursor for a sweep that skips rows changed within `window`: the id of
    /// the most recently updated owned row older than `now - window`, or `""`
    /// when every row is recent (or there are none).
    pub async fn sync_after_cursor(&self, table: SyncTable, window: Duration) -> Result<String> {
        require_reconcilable(table)?;

        let query = format!(
            "SELECT id::text FROM {table}
             WHERE agent_id = $1 AND updated_at < NOW() - make_interval(secs => $2)
             ORDER BY updated_at DESC
             LIMIT 1"
        );
        let cursor: Option<String> = sqlx::query_scalar(&query)
            .bind(self.agent_id)
            .bind(window.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(cursor.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_expr_single() {
        assert_eq!(
            key_expr(SyncTable::Checks, "t"),
            "(to_jsonb(t.id) #>> '{}')"
        );
    }

    #[test]
    fn test_key_expr_composite_matches_row_key_order() {
        assert_eq!(
            key_expr(SyncTable::ConfigRelationships, "c"),
            "(to_jsonb(c.config_id) #>> '{}') || ':' || (to_jsonb(c.related_id) #>> '{}') || ':' || (to_jsonb(c.relation) #>> '{}')"
        );
    }

    #[test]
    fn test_non_reconcilable_rejected() {
        assert!(require_reconcilable(SyncTable::CheckStatuses).is_err());
        assert!(require_reconcilable(SyncTable::ConfigItems).is_ok());
    }
}
