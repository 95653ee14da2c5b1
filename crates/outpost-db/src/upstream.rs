//! Upstream-side storage of rows received from agents.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use outpost_core::{
    defaults, Error, PaginateRequest, PaginateResponse, PushData, PushFkError, Result, Row,
    SyncTable,
};

use crate::conflict::{save_with_degradation, RowWriter};
use crate::sync_store::{ids_in_window, key_expr, page_digest};

/// Stores pushed rows on the upstream database.
///
/// Column lists are read from `information_schema` on first use and cached
/// for the life of the store.
pub struct PgUpstreamStore {
    pool: PgPool,
    columns: Mutex<HashMap<SyncTable, Vec<String>>>,
    max_retries: usize,
}

impl PgUpstreamStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            columns: Mutex::new(HashMap::new()),
            max_retries: defaults::FK_MAX_RETRIES,
        }
    }

    /// Batch-then-degrade cycles per table before giving up on a row.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Forget cached column lists, e.g. after a migration.
    pub fn clear_column_cache(&self) {
        self.columns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn table_columns(&self, table: SyncTable) -> Result<Vec<String>> {
        let cached = self
            .columns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&table)
            .cloned();
        if let Some(cols) = cached {
            return Ok(cols);
        }

        let cols: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table.table_name())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        if cols.is_empty() {
            return Err(Error::Internal(format!("table {table} has no columns")));
        }

        self.columns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table, cols.clone());
        Ok(cols)
    }

    /// Id of the agent called `name`, registering it on first sight.
    pub async fn get_or_create_agent(&self, name: &str) -> Result<Uuid> {
        if name.is_empty() {
            return Err(Error::InvalidInput("agent name is required".into()));
        }
        sqlx::query_scalar(
            "INSERT INTO agents (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }

    /// Register the agent if needed and record that it was seen now.
    pub async fn touch_agent(&self, name: &str) -> Result<Uuid> {
        if name.is_empty() {
            return Err(Error::InvalidInput("agent name is required".into()));
        }
        sqlx::query_scalar(
            "INSERT INTO agents (name, last_seen) VALUES ($1, NOW())
             ON CONFLICT (name) DO UPDATE SET last_seen = NOW(), updated_at = NOW()
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }

    pub async fn find_agent(&self, name: &str) -> Result<Uuid> {
        sqlx::query_scalar("SELECT id FROM agents WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::NotFound(format!("agent {name}")))
    }

    /// Upsert every row of `data` for its agent, parents first.
    ///
    /// Tables are saved independently with degradation on foreign-key
    /// violations. Keys that never succeed are returned together as
    /// [`Error::Conflict`] after every table has been tried.
    pub async fn insert_push_data(&self, mut data: PushData) -> Result<usize> {
        let agent_id = self.get_or_create_agent(&data.agent_name).await?;
        data.populate_agent_id(agent_id);

        let mut saved = 0;
        let mut conflicts = Vec::new();

        for table in SyncTable::ALL {
            let rows = std::mem::take(data.rows_mut(table));
            if rows.is_empty() {
                continue;
            }
            let count = rows.len();

            match save_with_degradation(self, table, rows, self.max_retries).await {
                Ok(()) => saved += count,
                Err(Error::Conflict(fk)) => {
                    saved += count.saturating_sub(fk.ids.len());
                    conflicts.extend(fk.ids);
                }
                Err(e) => return Err(e),
            }
        }

        if !conflicts.is_empty() {
            warn!(
                subsystem = "db",
                component = "upstream_store",
                op = "insert_push_data",
                agent = %data.agent_name,
                saved,
                conflicts = conflicts.len(),
                "Push saved with foreign key conflicts"
            );
            return Err(Error::Conflict(PushFkError { ids: conflicts }));
        }

        info!(
            subsystem = "db",
            component = "upstream_store",
            op = "insert_push_data",
            agent = %data.agent_name,
            saved,
            "Push saved"
        );
        Ok(saved)
    }

    /// Delete the rows named in `data`, children first. Rows owned by other
    /// agents are never touched.
    pub async fn delete_push_data(&self, data: &PushData) -> Result<u64> {
        let agent_id = self.find_agent(&data.agent_name).await?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut deleted = 0;

        for table in SyncTable::ALL.into_iter().rev() {
            let ids = data.ids(table);
            if ids.is_empty() {
                continue;
            }

            let result = if table.has_agent_id() {
                let query = format!(
                    "DELETE FROM {table} t WHERE t.agent_id = $1 AND {} = ANY($2)",
                    key_expr(table, "t")
                );
                sqlx::query(&query)
                    .bind(agent_id)
                    .bind(&ids)
                    .execute(&mut *tx)
                    .await
            } else {
                let query = format!(
                    "DELETE FROM {table} t WHERE {} = ANY($1)",
                    key_expr(table, "t")
                );
                sqlx::query(&query).bind(&ids).execute(&mut *tx).await
            };
            deleted += result.map_err(Error::Database)?.rows_affected();
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "upstream_store",
            op = "delete_push_data",
            agent = %data.agent_name,
            deleted,
            "Rows deleted"
        );
        Ok(deleted)
    }

    /// Digest of one page of the named agent's rows.
    pub async fn page_digest(&self, agent_name: &str, req: &PaginateRequest) -> Result<PaginateResponse> {
        let table: SyncTable = req.table.parse()?;
        let agent_id = self.find_agent(agent_name).await?;
        page_digest(&self.pool, table, agent_id, req).await
    }

    /// Ids in the same window [`Self::page_digest`] hashes.
    pub async fn ids_in_window(&self, agent_name: &str, req: &PaginateRequest) -> Result<Vec<String>> {
        let table: SyncTable = req.table.parse()?;
        let agent_id = self.find_agent(agent_name).await?;
        ids_in_window(&self.pool, table, agent_id, req).await
    }
}

/// Columns present in at least one row and in the table, in table order.
/// `is_pushed` is agent bookkeeping and never written here.
fn insert_columns(table_columns: &[String], rows: &[Row]) -> Vec<String> {
    let present: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.keys().map(String::as_str))
        .collect();
    table_columns
        .iter()
        .filter(|c| c.as_str() != "is_pushed" && present.contains(c.as_str()))
        .cloned()
        .collect()
}

fn upsert_sql(table: SyncTable, columns: &[String]) -> String {
    let cols = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let pk = table.primary_key().join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !table.primary_key().contains(&c.as_str()))
        .map(|c| format!("\"{c}\" = EXCLUDED.\"{c}\""))
        .collect();
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {table} ({cols})
         SELECT {cols} FROM jsonb_populate_recordset(NULL::{table}, $1)
         ON CONFLICT ({pk}) {on_conflict}"
    )
}

#[async_trait]
impl RowWriter for PgUpstreamStore {
    async fn save_batch(&self, table: SyncTable, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let table_columns = self.table_columns(table).await?;
        let columns = insert_columns(&table_columns, rows);
        if columns.is_empty() {
            return Err(Error::InvalidInput(format!(
                "rows for {table} share no columns with the table"
            )));
        }

        sqlx::query(&upsert_sql(table, &columns))
            .bind(Json(rows))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn save_one(&self, table: SyncTable, row: &Row) -> Result<()> {
        self.save_batch(table, std::slice::from_ref(row)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_columns_keeps_table_order_and_drops_is_pushed() {
        let table = cols(&["id", "agent_id", "name", "updated_at", "is_pushed"]);
        let rows = vec![
            json!({"name": "a", "id": "1", "is_pushed": true, "bogus": 1})
                .as_object()
                .cloned()
                .unwrap(),
            json!({"id": "2", "updated_at": "2026-01-01T00:00:00Z"})
                .as_object()
                .cloned()
                .unwrap(),
        ];
        assert_eq!(
            insert_columns(&table, &rows),
            cols(&["id", "name", "updated_at"])
        );
    }

    #[test]
    fn test_upsert_sql_updates_non_key_columns() {
        let sql = upsert_sql(SyncTable::Checks, &cols(&["id", "name"]));
        assert!(sql.contains("jsonb_populate_recordset(NULL::checks, $1)"));
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET \"name\" = EXCLUDED.\"name\""));
    }

    #[test]
    fn test_upsert_sql_key_only_does_nothing() {
        let sql = upsert_sql(
            SyncTable::ConfigRelationships,
            &cols(&["config_id", "related_id", "relation"]),
        );
        assert!(sql.contains("ON CONFLICT (config_id, related_id, relation) DO NOTHING"));
    }
}
