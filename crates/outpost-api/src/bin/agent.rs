//! Agent: forwards queued row changes to upstream and periodically
//! reconciles every synced table.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use outpost_api::{shutdown_signal, telemetry};
use outpost_core::{defaults, Error, RetryPolicy, StatusRing, StatusRingManager};
use outpost_db::{Database, OpContext, PgSyncStore, PoolConfig};
use outpost_queue::{AsyncEventConsumer, ConsumerConfig, PgConsumer, PgNotifyListener};
use outpost_upstream::{
    push_queue_events, PushQueueHandler, Reconciler, UpstreamApi, UpstreamClient,
};

/// Reconciliation schedule.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `RECONCILE_PAGE_SIZE` | `500` | Rows per digest page |
/// | `RECONCILE_INTERVAL_SECS` | `3600` | Pause between sweeps |
/// | `RECONCILE_RECENT_WINDOW_SECS` | `21600` | Quiet window skipped by incremental sweeps |
struct ReconcileSchedule {
    page_size: i64,
    interval: Duration,
    recent_window: Duration,
}

impl ReconcileSchedule {
    fn from_env() -> Self {
        let page_size = std::env::var("RECONCILE_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults::RECONCILE_PAGE_SIZE);
        let interval = std::env::var("RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RECONCILE_INTERVAL_SECS);
        let recent_window = std::env::var("RECONCILE_RECENT_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RECONCILE_RECENT_WINDOW_SECS);

        Self {
            page_size,
            interval: Duration::from_secs(interval.max(1)),
            recent_window: Duration::from_secs(recent_window),
        }
    }
}

/// Ping, push pending rows, then sweep. The first sweep after start covers
/// whole tables; later ones skip rows that have been quiet for the recent
/// window.
async fn reconcile_loop(
    ctx: OpContext,
    reconciler: Reconciler<PgSyncStore, UpstreamClient>,
    schedule: ReconcileSchedule,
) {
    let mut full_sweep = true;

    loop {
        if let Err(e) = reconciler.upstream().ping(&ctx).await {
            warn!(subsystem = "agent", op = "ping", error = %e, "Upstream ping failed");
        }

        match reconciler.push_all_unpushed(&ctx).await {
            Ok(0) => {}
            Ok(pushed) => info!(subsystem = "agent", op = "push_unpushed", pushed, "Pending rows pushed"),
            Err(Error::Cancelled) => break,
            Err(e) => warn!(subsystem = "agent", op = "push_unpushed", error = %e, "Pushing pending rows failed"),
        }

        let result = if full_sweep {
            reconciler.sync_all(&ctx).await
        } else {
            sync_recent(&ctx, &reconciler, schedule.recent_window).await
        };
        match result {
            Ok(pushed) => {
                full_sweep = false;
                info!(subsystem = "agent", op = "reconcile", pushed, "Reconciliation finished");
            }
            Err(Error::Cancelled) => break,
            Err(e) => warn!(subsystem = "agent", op = "reconcile", error = %e, "Reconciliation failed"),
        }

        tokio::select! {
            _ = ctx.cancel_token().cancelled() => break,
            _ = tokio::time::sleep(schedule.interval) => {}
        }
    }

    info!(subsystem = "agent", "Reconcile loop stopped");
}

async fn sync_recent(
    ctx: &OpContext,
    reconciler: &Reconciler<PgSyncStore, UpstreamClient>,
    window: Duration,
) -> outpost_core::Result<usize> {
    let mut pushed = 0;
    let mut errors = Vec::new();
    for table in outpost_core::SyncTable::reconcilable() {
        match reconciler.sync_after(ctx, table, window).await {
            Ok(n) => pushed += n,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(Error::Reconcile(page_errors)) => errors.extend(page_errors),
            Err(e) => errors.push(format!("{table}: {e}")),
        }
    }
    if errors.is_empty() {
        Ok(pushed)
    } else {
        Err(Error::Reconcile(errors))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _file_guard = telemetry::init(
        "outpost_agent=debug,outpost_queue=info,outpost_upstream=info,outpost_db=info",
        "outpost-agent.log",
    );
    outpost_upstream::register_metrics();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/outpost".to_string());
    let consumer_config = ConsumerConfig::from_env();
    let schedule = ReconcileSchedule::from_env();
    let client = UpstreamClient::from_env()?;

    info!("Connecting to database...");
    let pool_config = PoolConfig::from_env().for_consumers(consumer_config.num_consumers);
    let db = Database::connect_with_config(&database_url, pool_config).await?;
    db.migrate().await?;
    info!("Database ready");

    let ctx = db.context();

    // Push queue: row change events forwarded as they arrive
    let handler = PushQueueHandler::new(db.sync.clone(), client.clone());
    let mut consumer = AsyncEventConsumer::new(db.events.clone(), push_queue_events(), handler)
        .with_policy(RetryPolicy::from_env());
    let event_ring_size = std::env::var("EVENT_RING_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults::EVENT_RING_SIZE);
    if event_ring_size > 0 {
        consumer = consumer.with_status_ring(Arc::new(StatusRing::new(event_ring_size)));
    }
    let push_queue = PgConsumer::new("push_queue", consumer).with_config(consumer_config);
    let listener =
        PgNotifyListener::new(db.pool.clone(), push_queue.notifier()).spawn(ctx.cancel_token().clone());
    let push_queue = push_queue.start(&ctx);

    // Anti-entropy
    let history = Arc::new(StatusRingManager::new(defaults::JOB_HISTORY_RING_SIZE));
    let reconciler = Reconciler::new(db.sync.clone(), client)
        .with_page_size(schedule.page_size)
        .with_history(history);
    let reconcile = tokio::spawn(reconcile_loop(ctx.clone(), reconciler, schedule));

    info!("Agent started");
    shutdown_signal().await;
    info!("Shutting down...");

    push_queue.shutdown().await?;
    ctx.cancel();
    if let Err(e) = listener.await {
        warn!(error = %e, "Listener task failed");
    }
    if let Err(e) = reconcile.await {
        warn!(error = %e, "Reconcile task failed");
    }

    info!("Agent stopped");
    Ok(())
}
