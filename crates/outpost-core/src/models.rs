//! Core data models for the event queue and reconciliation.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults;

// =============================================================================
// EVENT QUEUE
// =============================================================================

/// A pending unit of work stored in `event_queue`.
///
/// `properties` is an opaque bag; its meaning (for example which table and
/// row changed) is a contract between producers and handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Logical queue / topic.
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    /// Seconds after `created_at` before the event becomes visible.
    #[serde(default)]
    pub delay: i32,
    #[serde(default)]
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build a fresh event with a time-ordered id.
    pub fn new(name: impl Into<String>, properties: HashMap<String, String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            properties,
            priority: 0,
            delay: 0,
            attempts: 0,
            last_attempt: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Set the priority (higher is claimed first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the visibility delay in seconds.
    pub fn with_delay(mut self, delay_secs: i32) -> Self {
        self.delay = delay_secs;
        self
    }

    /// Look up a property by key.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Record a failed attempt on this event.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.attempts += 1;
        self.error = Some(error.into());
        self.last_attempt = Some(now);
    }
}

/// An event a batch handler could not process, with the reason.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event: Event,
    pub error: String,
}

impl FailedEvent {
    pub fn new(event: Event, error: impl Into<String>) -> Self {
        Self {
            event,
            error: error.into(),
        }
    }
}

/// Claim-time retry policy for events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Events with more attempts than this are never claimed again.
    pub max_attempts: i32,
    /// Base of the reclaim backoff.
    pub base_delay: Duration,
    /// Exponent applied to the attempt count.
    pub exponent: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::EVENT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(defaults::EVENT_BASE_DELAY_SECS),
            exponent: defaults::EVENT_BACKOFF_EXPONENT,
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `EVENT_MAX_ATTEMPTS` | `3` | Attempts before an event is left alone |
    /// | `EVENT_BASE_DELAY_SECS` | `60` | Backoff base |
    /// | `EVENT_BACKOFF_EXPONENT` | `5` | Backoff exponent |
    pub fn from_env() -> Self {
        let default = Self::default();
        let max_attempts = std::env::var("EVENT_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(default.max_attempts);
        let base_delay = std::env::var("EVENT_BASE_DELAY_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(default.base_delay);
        let exponent = std::env::var("EVENT_BACKOFF_EXPONENT")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(default.exponent);

        Self {
            max_attempts,
            base_delay,
            exponent,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_exponent(mut self, exponent: i32) -> Self {
        self.exponent = exponent;
        self
    }

    /// Minimum time since `last_attempt` before an event with `attempts`
    /// failures may be claimed again: `base_delay * attempts^exponent`.
    pub fn backoff(&self, attempts: i32) -> Duration {
        if attempts <= 0 {
            return Duration::ZERO;
        }
        let factor = (attempts as u64).saturating_pow(self.exponent.max(0) as u32);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis)
    }

    /// Whether `event` is visible to a fetch at `now`.
    ///
    /// Mirrors the claim query in the event store so callers can reason about
    /// eligibility without a round trip.
    pub fn is_claimable(&self, event: &Event, now: DateTime<Utc>) -> bool {
        if event.attempts > self.max_attempts {
            return false;
        }
        let visible_at = event.created_at + chrono::Duration::seconds(event.delay as i64);
        if visible_at > now {
            return false;
        }
        match event.last_attempt {
            None => true,
            Some(last) => match chrono::Duration::from_std(self.backoff(event.attempts)) {
                Ok(window) => last + window <= now,
                Err(_) => false,
            },
        }
    }
}

// =============================================================================
// JOB HISTORY
// =============================================================================

/// Outcome of a recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Success,
    Warning,
    Failed,
    Skipped,
}

/// A recently processed item, kept in a status ring for introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistory {
    pub id: Uuid,
    pub name: String,
    pub resource_id: String,
    pub resource_type: String,
    pub agent_id: Uuid,
    pub status: JobStatus,
    pub success_count: i32,
    pub error_count: i32,
    #[serde(default)]
    pub errors: Vec<String>,
    pub time_start: DateTime<Utc>,
    pub time_end: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl JobHistory {
    /// Start a running record for `name` on `resource_id`.
    pub fn start(
        name: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            agent_id: Uuid::nil(),
            status: JobStatus::Running,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
            time_start: Utc::now(),
            time_end: None,
            duration_ms: None,
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = agent_id;
        self
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.error_count += 1;
        self.errors.push(error.into());
    }

    pub fn increment_success(&mut self) {
        self.success_count += 1;
    }

    /// Close the record and derive the final status from the counters.
    pub fn end(&mut self) {
        let now = Utc::now();
        self.time_end = Some(now);
        self.duration_ms = Some((now - self.time_start).num_milliseconds());
        self.status = match (self.success_count, self.error_count) {
            (_, 0) => JobStatus::Success,
            (0, _) => JobStatus::Failed,
            _ => JobStatus::Warning,
        };
    }
}

// =============================================================================
// RECONCILIATION
// =============================================================================

/// Page parameters for a reconciliation digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginateRequest {
    pub table: String,
    /// Last primary key of the previous page; empty for the start of the table.
    #[serde(default)]
    pub from: String,
    pub size: i64,
}

impl PaginateRequest {
    pub fn new(table: impl Into<String>, from: impl Into<String>, size: i64) -> Self {
        Self {
            table: table.into(),
            from: from.into(),
            size,
        }
    }
}

/// Digest of one page of rows.
///
/// `hash` is an equality oracle over `id || updated_at` for the page, not an
/// integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaginateResponse {
    #[serde(rename = "sha256sum")]
    pub hash: String,
    #[serde(rename = "last_id")]
    pub next: String,
    pub total: i64,
}
