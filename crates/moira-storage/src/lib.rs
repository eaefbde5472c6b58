//! Retention store for the alerting pipeline.
//!
//! Everything the pipeline stages share lives behind [`Database`]: metric
//! series and the pattern inverted index, triggers with their last check,
//! subscriptions and contacts, the event and notification queues, throttling
//! counters, the notifier state and lightweight TTL locks.
//!
//! Two backends are provided. [`memory::MemoryDatabase`] keeps everything in
//! process and is what tests and single-node setups use.
//! [`sqlite::SqliteDatabase`] persists to one SQLite file in WAL mode so the
//! queues survive restarts.

pub mod error;
pub mod lock;
pub mod memory;
pub mod retry;
pub mod sqlite;


use async_trait::async_trait;
use moira_common::state::{NotifierState, SelfState, StateActor};
use moira_common::types::{
    CheckData, Contact, MatchedMetric, MetricEvent, MetricValue, NotificationEvent,
    NotificationHistoryEntry, ScheduledNotification, Subscription, Trigger,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub use error::{Result, StorageError};
pub use lock::Lock;

/// Shared handle used by every pipeline stage.
pub type DynDatabase = Arc<dyn Database>;

/// Capacity of the pattern-hit broadcast channel. Lagging receivers lose
/// the oldest events, which only delays a trigger until its next scheduled
/// check.
pub const METRIC_EVENTS_CAPACITY: usize = 16_384;

/// Counter names used by the self-state heartbeats.
pub mod counters {
    pub const METRICS_RECEIVED: &str = "selfstate:metrics-heartbeat";
    pub const LOCAL_CHECKS: &str = "selfstate:checks-counter";
    pub const REMOTE_CHECKS: &str = "selfstate:remote-checks-counter";
}

/// Persistence contract the pipeline depends on.
///
/// Implementations must be `Send + Sync`; the filter, checker and notifier
/// all hold the same [`DynDatabase`].
#[async_trait]
pub trait Database: Send + Sync {
    /// Fails when the backend is unreachable.
    async fn ping(&self) -> Result<()>;

    /// Writes matched points. A point whose retention bucket already exists
    /// replaces the stored value. Every `(metric, pattern)` pair is added to
    /// the pattern inverted index and published to metric-event subscribers.
    async fn save_metrics(&self, metrics: &[MatchedMetric]) -> Result<()>;

    /// Points of each metric whose retention timestamp lies in
    /// `[from, until]`, ordered by retention timestamp. Metrics with no
    /// stored points map to an empty vector.
    async fn get_metrics_values(
        &self,
        metrics: &[String],
        from: i64,
        until: i64,
    ) -> Result<HashMap<String, Vec<MetricValue>>>;

    /// Retention step the metric was last written with.
    async fn get_metric_retention(&self, metric: &str) -> Result<Option<i64>>;

    /// Drops points with a retention timestamp before `to`.
    async fn remove_metrics_values(&self, metrics: &[String], to: i64) -> Result<()>;

    /// Metrics that were written under `pattern`.
    async fn get_pattern_metrics(&self, pattern: &str) -> Result<Vec<String>>;

    /// Every pattern used by at least one trigger.
    async fn get_patterns(&self) -> Result<Vec<String>>;

    fn subscribe_metric_events(&self) -> broadcast::Receiver<MetricEvent>;

    /// Stores the trigger and reindexes its patterns and tags.
    async fn save_trigger(&self, trigger: &Trigger) -> Result<()>;
    async fn get_trigger(&self, id: &str) -> Result<Option<Trigger>>;
    /// IDs of local (`remote == false`) or remote triggers.
    async fn get_trigger_ids(&self, remote: bool) -> Result<Vec<String>>;
    async fn get_pattern_triggers(&self, pattern: &str) -> Result<Vec<String>>;
    /// Removes the trigger, its check data and patterns no other trigger
    /// uses, together with their metrics index.
    async fn remove_trigger(&self, id: &str) -> Result<()>;

    async fn get_trigger_last_check(&self, id: &str) -> Result<Option<CheckData>>;
    async fn set_trigger_last_check(&self, id: &str, data: &CheckData) -> Result<()>;
    /// Queues `events` and stores `data` as one unit: either both land or
    /// neither does.
    async fn commit_trigger_check(
        &self,
        id: &str,
        data: &CheckData,
        events: &[NotificationEvent],
    ) -> Result<()>;

    async fn save_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>>;
    /// Subscriptions carrying at least one of `tags`, plus every `any_tags`
    /// subscription. Each subscription appears once.
    async fn get_tags_subscriptions(&self, tags: &[String]) -> Result<Vec<Subscription>>;

    async fn save_contact(&self, contact: &Contact) -> Result<()>;
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>>;
    /// Contacts for the given IDs; unknown IDs are skipped.
    async fn get_contacts(&self, ids: &[String]) -> Result<Vec<Contact>>;

    /// Appends to the `notifier-events` queue.
    async fn push_notification_event(&self, event: &NotificationEvent) -> Result<()>;
    /// Pops the oldest event, waiting up to `timeout` for one to arrive.
    async fn fetch_notification_event(
        &self,
        timeout: Duration,
    ) -> Result<Option<NotificationEvent>>;

    async fn add_notifications(&self, notifications: &[ScheduledNotification]) -> Result<()>;
    /// Atomically removes and returns up to `limit` notifications with
    /// `timestamp <= to`, in non-decreasing `timestamp` order.
    async fn fetch_notifications(&self, to: i64, limit: usize)
        -> Result<Vec<ScheduledNotification>>;
    /// Queued notifications without removing them.
    async fn get_notifications(&self) -> Result<Vec<ScheduledNotification>>;

    /// Records one delivery slot used by the throttling `key`.
    async fn add_throttling_hit(&self, key: &str, timestamp: i64) -> Result<()>;
    /// Hits recorded for `key` at or after `since`.
    async fn count_throttling_hits(&self, key: &str, since: i64) -> Result<usize>;
    /// Earliest time the next notification for `key` may be delivered.
    async fn get_throttling_next(&self, key: &str) -> Result<i64>;
    async fn set_throttling_next(&self, key: &str, next: i64) -> Result<()>;

    async fn get_notifier_state(&self) -> Result<NotifierState>;
    /// Writes the notifier state unless [`NotifierState::accepts`] refuses
    /// the transition. Returns the state in effect afterwards.
    async fn set_notifier_state(&self, state: SelfState, actor: StateActor)
        -> Result<NotifierState>;

    /// Takes `name` for `owner` when free or expired.
    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Pushes the expiry of a lock `owner` still holds. `false` when the
    /// lock was lost.
    async fn extend_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Releases the lock if `owner` holds it.
    async fn release_lock(&self, name: &str, owner: &str) -> Result<()>;

    async fn increment_counter(&self, name: &str, delta: i64) -> Result<i64>;
    async fn get_counter(&self, name: &str) -> Result<i64>;

    async fn push_notification_history(&self, entry: &NotificationHistoryEntry) -> Result<()>;
    /// Most recent entries for a contact, newest first.
    async fn get_notification_history(
        &self,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<NotificationHistoryEntry>>;
}

/// Distinct patterns a trigger is indexed under.
pub(crate) fn trigger_patterns(trigger: &Trigger) -> Vec<String> {
    let mut patterns = trigger.patterns.clone();
    patterns.sort();
    patterns.dedup();
    patterns
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
