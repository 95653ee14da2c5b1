//! Postgres `LISTEN` bridge that wakes consumer workers.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use outpost_core::defaults;

/// Listens on a notification channel and calls `notify_one` for every
/// payload received.
///
/// The connection is re-established with exponential backoff (1s doubling,
/// capped at `max_reconnect_delay`). Workers still poll on their timeout, so
/// a dropped listener only delays work.
pub struct PgNotifyListener {
    pool: PgPool,
    channel: String,
    notify: Arc<Notify>,
    max_reconnect_delay: Duration,
}

impl PgNotifyListener {
    pub fn new(pool: PgPool, notify: Arc<Notify>) -> Self {
        Self {
            pool,
            channel: defaults::EVENT_NOTIFY_CHANNEL.to_string(),
            notify,
            max_reconnect_delay: Duration::from_secs(defaults::LISTENER_MAX_RECONNECT_SECS),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut listener: Option<PgListener> = None;
        let mut reconnect_delay = Duration::from_secs(1);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if listener.is_none() {
                match self.connect().await {
                    Ok(l) => {
                        reconnect_delay = Duration::from_secs(1);
                        listener = Some(l);
                        // Anything inserted while disconnected was missed.
                        self.notify.notify_one();
                    }
                    Err(e) => {
                        error!(
                            subsystem = "queue",
                            component = "listener",
                            channel = %self.channel,
                            error = %e,
                            retry_in_secs = reconnect_delay.as_secs(),
                            "Failed to listen for notifications"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(reconnect_delay) => {}
                        }
                        reconnect_delay = (reconnect_delay * 2).min(self.max_reconnect_delay);
                        continue;
                    }
                }
            }
            let Some(active) = listener.as_mut() else {
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                received = active.recv() => match received {
                    Ok(notification) => {
                        debug!(
                            subsystem = "queue",
                            component = "listener",
                            channel = %self.channel,
                            payload = notification.payload(),
                            "Notification received"
                        );
                        self.notify.notify_one();
                    }
                    Err(e) => {
                        warn!(
                            subsystem = "queue",
                            component = "listener",
                            channel = %self.channel,
                            error = %e,
                            "Notification stream failed, reconnecting"
                        );
                        listener = None;
                    }
                },
            }
        }

        info!(
            subsystem = "queue",
            component = "listener",
            channel = %self.channel,
            "Listener stopped"
        );
    }

    async fn connect(&self) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        info!(
            subsystem = "queue",
            component = "listener",
            channel = %self.channel,
            "Listening for notifications"
        );
        Ok(listener)
    }
}
