//! Event queue storage and the atomic claim operation.

use std::collections::HashMap;

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use outpost_core::{defaults, Error, Event, Result, RetryPolicy};

const EVENT_COLUMNS: &str =
    "id, name, properties, priority, delay, attempts, last_attempt, error, created_at";

/// Claims batches of events for a fixed set of queue names.
///
/// The claim is a single `DELETE ... RETURNING` over a `FOR UPDATE SKIP LOCKED`
/// sub-select, run on the caller's transaction. Two fetchers never block on
/// each other and never receive the same row; the rows are gone for everyone
/// else once the caller commits, and come back if it rolls back.
#[derive(Debug, Clone)]
pub struct EventFetcher {
    watch_events: Vec<String>,
    batch_size: usize,
    policy: RetryPolicy,
}

impl EventFetcher {
    pub fn new(watch_events: Vec<String>) -> Self {
        Self {
            watch_events,
            batch_size: defaults::EVENT_BATCH_SIZE,
            policy: RetryPolicy::default(),
        }
    }

    /// Maximum events per claim; zero falls back to one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = if batch_size == 0 {
            defaults::EVENT_BATCH_SIZE
        } else {
            batch_size
        };
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn watch_events(&self) -> &[String] {
        &self.watch_events
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claim up to `batch_size` visible events, highest priority then oldest
    /// first.
    pub async fn fetch(&self, conn: &mut PgConnection) -> Result<Vec<Event>> {
        fetch_batch(conn, &self.watch_events, self.batch_size, &self.policy).await
    }
}

/// Claim up to `batch_size` events named in `watch_events`.
///
/// An event is visible when it has not exceeded `max_attempts`, its `delay`
/// has elapsed since creation, and `base_delay * attempts^exponent` has passed
/// since its last attempt.
pub async fn fetch_batch(
    conn: &mut PgConnection,
    watch_events: &[String],
    batch_size: usize,
    policy: &RetryPolicy,
) -> Result<Vec<Event>> {
    let batch_size = if batch_size == 0 {
        defaults::EVENT_BATCH_SIZE
    } else {
        batch_size
    };

    let query = format!(
        "DELETE FROM event_queue
         WHERE id IN (
             SELECT id FROM event_queue
             WHERE name = ANY($1)
               AND attempts <= $2
               AND created_at + make_interval(secs => delay) <= NOW()
               AND (last_attempt IS NULL
                    OR last_attempt <= NOW() - make_interval(
                           secs => $3::float8 * POWER(attempts::float8, $4::float8)))
             ORDER BY priority DESC, created_at ASC
             LIMIT $5
             FOR UPDATE SKIP LOCKED
         )
         RETURNING {EVENT_COLUMNS}"
    );

    let rows = sqlx::query(&query)
        .bind(watch_events)
        .bind(policy.max_attempts)
        .bind(policy.base_delay.as_secs_f64())
        .bind(policy.exponent as f64)
        .bind(batch_size as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;

    if rows.len() > batch_size {
        warn!(
            subsystem = "db",
            component = "fetcher",
            op = "fetch_batch",
            batch_size,
            returned = rows.len(),
            "Claim returned more events than requested"
        );
    }

    let mut events = rows
        .into_iter()
        .map(parse_event_row)
        .collect::<Result<Vec<_>>>()?;

    // RETURNING does not preserve the sub-select order.
    events.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });

    if !events.is_empty() {
        debug!(
            subsystem = "db",
            component = "fetcher",
            op = "fetch_batch",
            claimed = events.len(),
            "Claimed events"
        );
    }

    Ok(events)
}

/// Put failed events back after a batch claim, inside the claiming
/// transaction. Callers bump `attempts`/`error`/`last_attempt` first.
pub async fn requeue(conn: &mut PgConnection, events: &[Event]) -> Result<()> {
    for event in events {
        sqlx::query(
            "INSERT INTO event_queue
                 (id, name, properties, priority, delay, attempts, last_attempt, error, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE
             SET attempts = EXCLUDED.attempts,
                 last_attempt = EXCLUDED.last_attempt,
                 error = EXCLUDED.error",
        )
        .bind(event.id)
        .bind(&event.name)
        .bind(Json(&event.properties))
        .bind(event.priority)
        .bind(event.delay)
        .bind(event.attempts)
        .bind(event.last_attempt)
        .bind(&event.error)
        .bind(event.created_at)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;
    }
    Ok(())
}

fn parse_event_row(row: PgRow) -> Result<Event> {
    let properties: Json<HashMap<String, String>> =
        row.try_get("properties").map_err(Error::Database)?;
    Ok(Event {
        id: row.try_get("id").map_err(Error::Database)?,
        name: row.try_get("name").map_err(Error::Database)?,
        properties: properties.0,
        priority: row.try_get("priority").map_err(Error::Database)?,
        delay: row.try_get("delay").map_err(Error::Database)?,
        attempts: row.try_get("attempts").map_err(Error::Database)?,
        last_attempt: row.try_get("last_attempt").map_err(Error::Database)?,
        error: row.try_get("error").map_err(Error::Database)?,
        created_at: row.try_get("created_at").map_err(Error::Database)?,
    })
}

/// PostgreSQL-backed event store.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert an event. The table trigger notifies listening consumers.
    pub async fn enqueue(&self, event: &Event) -> Result<Uuid> {
        sqlx::query(
            "INSERT INTO event_queue
                 (id, name, properties, priority, delay, attempts, last_attempt, error, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(event.id)
        .bind(&event.name)
        .bind(Json(&event.properties))
        .bind(event.priority)
        .bind(event.delay)
        .bind(event.attempts)
        .bind(event.last_attempt)
        .bind(&event.error)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(event.id)
    }

    /// Record a handler failure directly on the stored row, outside any
    /// claiming transaction, so the bookkeeping survives a rollback.
    pub async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE event_queue
             SET attempts = attempts + 1, error = $2, last_attempt = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            warn!(
                subsystem = "db",
                component = "event_store",
                op = "record_failure",
                event_id = %id,
                "Failed event no longer in queue"
            );
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Event>> {
        let query = format!("SELECT {EVENT_COLUMNS} FROM event_queue WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(parse_event_row).transpose()
    }

    /// Number of stored events with one of `names`, claimable or not.
    pub async fn pending_count(&self, names: &[String]) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM event_queue WHERE name = ANY($1)")
            .bind(names)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    /// Events that ran out of attempts. They are never claimed again; what
    /// happens to them is up to the caller.
    pub async fn list_exhausted(&self, policy: &RetryPolicy, limit: i64) -> Result<Vec<Event>> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM event_queue
             WHERE attempts > $1
             ORDER BY last_attempt DESC NULLS LAST
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(policy.max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter().map(parse_event_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetcher_defaults() {
        let fetcher = EventFetcher::new(vec!["x".into()]);
        assert_eq!(fetcher.batch_size(), 1);
        assert_eq!(fetcher.policy(), &RetryPolicy::default());
        assert_eq!(fetcher.watch_events(), ["x".to_string()]);
    }

    #[test]
    fn test_fetcher_zero_batch_size_falls_back() {
        let fetcher = EventFetcher::new(vec![]).with_batch_size(0);
        assert_eq!(fetcher.batch_size(), 1);
        let fetcher = fetcher.with_batch_size(25);
        assert_eq!(fetcher.batch_size(), 25);
    }
}
