use crate::error::{Result, StorageError};
use crate::{now_millis, trigger_patterns, Database, METRIC_EVENTS_CAPACITY};
use async_trait::async_trait;
use moira_common::state::{NotifierState, SelfState, StateActor};
use moira_common::types::{
    CheckData, Contact, MatchedMetric, MetricEvent, MetricValue, NotificationEvent,
    NotificationHistoryEntry, ScheduledNotification, Subscription, Trigger,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Entries kept per contact in the notification history.
const HISTORY_LIMIT: usize = 1_000;

#[derive(Default)]
struct Inner {
    series: HashMap<String, BTreeMap<i64, MetricValue>>,
    retentions: HashMap<String, i64>,
    pattern_metrics: HashMap<String, BTreeSet<String>>,
    triggers: HashMap<String, Trigger>,
    pattern_triggers: HashMap<String, BTreeSet<String>>,
    last_checks: HashMap<String, CheckData>,
    subscriptions: HashMap<String, Subscription>,
    tag_subscriptions: HashMap<String, BTreeSet<String>>,
    any_tags_subscriptions: BTreeSet<String>,
    contacts: HashMap<String, Contact>,
    events: VecDeque<NotificationEvent>,
    notifications: BTreeMap<(i64, u64), ScheduledNotification>,
    notification_seq: u64,
    throttling_hits: HashMap<String, Vec<i64>>,
    throttling_next: HashMap<String, i64>,
    notifier_state: NotifierState,
    locks: HashMap<String, (String, i64)>,
    counters: HashMap<String, i64>,
    history: HashMap<String, VecDeque<NotificationHistoryEntry>>,
}

impl Inner {
    fn unindex_trigger(&mut self, id: &str) -> Vec<String> {
        let Some(old) = self.triggers.get(id) else {
            return Vec::new();
        };
        let mut orphaned = Vec::new();
        for pattern in trigger_patterns(old) {
            if let Some(ids) = self.pattern_triggers.get_mut(&pattern) {
                ids.remove(id);
                if ids.is_empty() {
                    self.pattern_triggers.remove(&pattern);
                    orphaned.push(pattern);
                }
            }
        }
        orphaned
    }

    fn unindex_subscription(&mut self, id: &str) {
        self.any_tags_subscriptions.remove(id);
        for ids in self.tag_subscriptions.values_mut() {
            ids.remove(id);
        }
        self.tag_subscriptions.retain(|_, ids| !ids.is_empty());
    }
}

/// Process-local store.
///
/// All state sits behind one mutex that is never held across an `.await`.
/// The event queue wakes blocked consumers through a [`Notify`].
pub struct MemoryDatabase {
    inner: Mutex<Inner>,
    events_ready: Notify,
    metric_events: broadcast::Sender<MetricEvent>,
    unavailable: AtomicBool,
    rejecting_metrics: AtomicBool,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let (metric_events, _) = broadcast::channel(METRIC_EVENTS_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events_ready: Notify::new(),
            metric_events,
            unavailable: AtomicBool::new(false),
            rejecting_metrics: AtomicBool::new(false),
        }
    }

    /// Makes [`Database::ping`] fail, simulating a lost connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes [`Database::save_metrics`] fail while set.
    pub fn set_rejecting_metrics(&self, rejecting: bool) {
        self.rejecting_metrics.store(rejecting, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn save_metrics(&self, metrics: &[MatchedMetric]) -> Result<()> {
        if self.rejecting_metrics.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("metric write refused".to_string()));
        }
        let mut published = Vec::new();
        {
            let mut inner = self.lock();
            for m in metrics {
                inner.series.entry(m.metric.clone()).or_default().insert(
                    m.retention_timestamp,
                    MetricValue {
                        retention_timestamp: m.retention_timestamp,
                        timestamp: m.timestamp,
                        value: m.value,
                    },
                );
                inner.retentions.insert(m.metric.clone(), m.retention);
                for pattern in &m.patterns {
                    inner
                        .pattern_metrics
                        .entry(pattern.clone())
                        .or_default()
                        .insert(m.metric.clone());
                    published.push(MetricEvent {
                        metric: m.metric.clone(),
                        pattern: pattern.clone(),
                    });
                }
            }
        }
        for event in published {
            // No receivers is fine: nobody is checking yet.
            let _ = self.metric_events.send(event);
        }
        Ok(())
    }

    async fn get_metrics_values(
        &self,
        metrics: &[String],
        from: i64,
        until: i64,
    ) -> Result<HashMap<String, Vec<MetricValue>>> {
        let inner = self.lock();
        let mut result = HashMap::with_capacity(metrics.len());
        for metric in metrics {
            let values = match inner.series.get(metric) {
                Some(series) if from <= until => {
                    series.range(from..=until).map(|(_, v)| *v).collect()
                }
                _ => Vec::new(),
            };
            result.insert(metric.clone(), values);
        }
        Ok(result)
    }

    async fn get_metric_retention(&self, metric: &str) -> Result<Option<i64>> {
        Ok(self.lock().retentions.get(metric).copied())
    }

    async fn remove_metrics_values(&self, metrics: &[String], to: i64) -> Result<()> {
        let mut inner = self.lock();
        for metric in metrics {
            if let Some(series) = inner.series.get_mut(metric) {
                *series = series.split_off(&to);
            }
        }
        Ok(())
    }

    async fn get_pattern_metrics(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .pattern_metrics
            .get(pattern)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_patterns(&self) -> Result<Vec<String>> {
        Ok(self.lock().pattern_triggers.keys().cloned().collect())
    }

    fn subscribe_metric_events(&self) -> broadcast::Receiver<MetricEvent> {
        self.metric_events.subscribe()
    }

    async fn save_trigger(&self, trigger: &Trigger) -> Result<()> {
        let mut inner = self.lock();
        inner.unindex_trigger(&trigger.id);
        for pattern in trigger_patterns(trigger) {
            inner
                .pattern_triggers
                .entry(pattern)
                .or_default()
                .insert(trigger.id.clone());
        }
        inner.triggers.insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        Ok(self.lock().triggers.get(id).cloned())
    }

    async fn get_trigger_ids(&self, remote: bool) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut ids: Vec<String> = inner
            .triggers
            .values()
            .filter(|t| t.is_remote == remote)
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_pattern_triggers(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .pattern_triggers
            .get(pattern)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_trigger(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        let orphaned = inner.unindex_trigger(id);
        for pattern in orphaned {
            if let Some(metrics) = inner.pattern_metrics.remove(&pattern) {
                for metric in metrics {
                    inner.series.remove(&metric);
                    inner.retentions.remove(&metric);
                }
            }
        }
        inner.triggers.remove(id);
        inner.last_checks.remove(id);
        Ok(())
    }

    async fn get_trigger_last_check(&self, id: &str) -> Result<Option<CheckData>> {
        Ok(self.lock().last_checks.get(id).cloned())
    }

    async fn set_trigger_last_check(&self, id: &str, data: &CheckData) -> Result<()> {
        self.lock().last_checks.insert(id.to_string(), data.clone());
        Ok(())
    }

    async fn commit_trigger_check(
        &self,
        id: &str,
        data: &CheckData,
        events: &[NotificationEvent],
    ) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.events.extend(events.iter().cloned());
            inner.last_checks.insert(id.to_string(), data.clone());
        }
        for _ in events {
            self.events_ready.notify_one();
        }
        Ok(())
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut inner = self.lock();
        inner.unindex_subscription(&subscription.id);
        if subscription.any_tags {
            inner.any_tags_subscriptions.insert(subscription.id.clone());
        }
        for tag in &subscription.tags {
            inner
                .tag_subscriptions
                .entry(tag.clone())
                .or_default()
                .insert(subscription.id.clone());
        }
        inner
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>> {
        Ok(self.lock().subscriptions.get(id).cloned())
    }

    async fn get_tags_subscriptions(&self, tags: &[String]) -> Result<Vec<Subscription>> {
        let inner = self.lock();
        let mut ids: BTreeSet<&String> = inner.any_tags_subscriptions.iter().collect();
        for tag in tags {
            if let Some(set) = inner.tag_subscriptions.get(tag) {
                ids.extend(set.iter());
            }
        }
        Ok(ids
            .into_iter()
            .filter_map(|id| inner.subscriptions.get(id).cloned())
            .collect())
    }

    async fn save_contact(&self, contact: &Contact) -> Result<()> {
        self.lock()
            .contacts
            .insert(contact.id.clone(), contact.clone());
        Ok(())
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>> {
        Ok(self.lock().contacts.get(id).cloned())
    }

    async fn get_contacts(&self, ids: &[String]) -> Result<Vec<Contact>> {
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.contacts.get(id).cloned())
            .collect())
    }

    async fn push_notification_event(&self, event: &NotificationEvent) -> Result<()> {
        self.lock().events.push_back(event.clone());
        self.events_ready.notify_one();
        Ok(())
    }

    async fn fetch_notification_event(
        &self,
        timeout: Duration,
    ) -> Result<Option<NotificationEvent>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ready = self.events_ready.notified();
            let popped = self.lock().events.pop_front();
            if let Some(event) = popped {
                return Ok(Some(event));
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn add_notifications(&self, notifications: &[ScheduledNotification]) -> Result<()> {
        let mut inner = self.lock();
        for n in notifications {
            inner.notification_seq += 1;
            let key = (n.timestamp, inner.notification_seq);
            inner.notifications.insert(key, n.clone());
        }
        Ok(())
    }

    async fn fetch_notifications(
        &self,
        to: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledNotification>> {
        let mut inner = self.lock();
        let keys: Vec<(i64, u64)> = inner
            .notifications
            .range(..=(to, u64::MAX))
            .take(limit)
            .map(|(k, _)| *k)
            .collect();
        Ok(keys
            .into_iter()
            .filter_map(|k| inner.notifications.remove(&k))
            .collect())
    }

    async fn get_notifications(&self) -> Result<Vec<ScheduledNotification>> {
        Ok(self.lock().notifications.values().cloned().collect())
    }

    async fn add_throttling_hit(&self, key: &str, timestamp: i64) -> Result<()> {
        self.lock()
            .throttling_hits
            .entry(key.to_string())
            .or_default()
            .push(timestamp);
        Ok(())
    }

    async fn count_throttling_hits(&self, key: &str, since: i64) -> Result<usize> {
        let mut inner = self.lock();
        let Some(hits) = inner.throttling_hits.get_mut(key) else {
            return Ok(0);
        };
        // Nothing older than a day before the newest hit is ever asked for.
        if let Some(newest) = hits.iter().copied().max() {
            hits.retain(|ts| *ts >= newest - 86_400);
        }
        Ok(hits.iter().filter(|ts| **ts >= since).count())
    }

    async fn get_throttling_next(&self, key: &str) -> Result<i64> {
        Ok(self.lock().throttling_next.get(key).copied().unwrap_or(0))
    }

    async fn set_throttling_next(&self, key: &str, next: i64) -> Result<()> {
        self.lock().throttling_next.insert(key.to_string(), next);
        Ok(())
    }

    async fn get_notifier_state(&self) -> Result<NotifierState> {
        Ok(self.lock().notifier_state)
    }

    async fn set_notifier_state(
        &self,
        state: SelfState,
        actor: StateActor,
    ) -> Result<NotifierState> {
        let mut inner = self.lock();
        if inner.notifier_state.accepts(state, actor) {
            inner.notifier_state = NotifierState { state, actor };
        }
        Ok(inner.notifier_state)
    }

    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        let mut inner = self.lock();
        match inner.locks.get(name) {
            Some((holder, expires)) if *expires > now && holder != owner => Ok(false),
            _ => {
                inner.locks.insert(
                    name.to_string(),
                    (owner.to_string(), now + ttl.as_millis() as i64),
                );
                Ok(true)
            }
        }
    }

    async fn extend_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        let mut inner = self.lock();
        match inner.locks.get_mut(name) {
            Some((holder, expires)) if holder == owner && *expires > now => {
                *expires = now + ttl.as_millis() as i64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.locks.get(name).is_some_and(|(holder, _)| holder == owner) {
            inner.locks.remove(name);
        }
        Ok(())
    }

    async fn increment_counter(&self, name: &str, delta: i64) -> Result<i64> {
        let mut inner = self.lock();
        let value = inner.counters.entry(name.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn get_counter(&self, name: &str) -> Result<i64> {
        Ok(self.lock().counters.get(name).copied().unwrap_or(0))
    }

    async fn push_notification_history(&self, entry: &NotificationHistoryEntry) -> Result<()> {
        let mut inner = self.lock();
        let list = inner.history.entry(entry.contact_id.clone()).or_default();
        list.push_front(entry.clone());
        list.truncate(HISTORY_LIMIT);
        Ok(())
    }

    async fn get_notification_history(
        &self,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<NotificationHistoryEntry>> {
        Ok(self
            .lock()
            .history
            .get(contact_id)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
