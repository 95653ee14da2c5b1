//! # outpost-db
//!
//! PostgreSQL layer for outpost.
//!
//! This crate provides:
//! - Connection pool management
//! - The event queue with its `SKIP LOCKED` claim
//! - Agent-side access to the synced tables (digests, unpushed rows)
//! - Upstream-side storage of pushed rows with foreign-key degradation
//! - [`OpContext`], the pool/cancellation/span bundle passed to long calls
//!
//! ## Example
//!
//! ```rust,ignore
//! use outpost_db::{Database, Event};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/outpost").await?;
//!     db.events.enqueue(&Event::new("push_queue.create", Default::default())).await?;
//!     Ok(())
//! }
//! ```

pub mod conflict;
pub mod context;
pub mod events;
pub mod pool;
pub mod sync_store;
pub mod upstream;

// Always compiled so integration tests (in tests/) can use it
pub mod test_fixtures;

// Re-export core types
pub use outpost_core::*;

pub use conflict::{save_with_degradation, RowWriter};
pub use context::OpContext;
pub use events::{fetch_batch, requeue, EventFetcher, PgEventStore};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use sync_store::{ids_in_window, page_digest, PgSyncStore, LOCAL_AGENT_ID};
pub use upstream::PgUpstreamStore;

use std::sync::Arc;

/// Combined database context with every store.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Event queue.
    pub events: PgEventStore,
    /// Agent-side synced table access.
    pub sync: PgSyncStore,
    /// Upstream-side storage of pushed rows.
    pub upstream: Arc<PgUpstreamStore>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            events: PgEventStore::new(pool.clone()),
            sync: PgSyncStore::new(pool.clone()),
            upstream: Arc::new(PgUpstreamStore::new(pool.clone())),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        self.upstream.clear_column_cache();
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// A fresh operation context over this pool.
    pub fn context(&self) -> OpContext {
        OpContext::new(self.pool.clone())
    }
}
