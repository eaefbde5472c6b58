use crate::checker::{CheckOutcome, TriggerChecker};
use crate::delay::DelaySet;
use crate::error::Result;
use moira_common::types::MetricEvent;
use moira_storage::retry::with_backoff;
use moira_storage::{counters, DynDatabase, Lock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_parallel_checks: usize,
    pub lock_ttl: Duration,
    /// How often the trigger list is reloaded from the store.
    pub trigger_refresh_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_parallel_checks: 8,
            lock_ttl: Duration::from_secs(30),
            trigger_refresh_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What happened to one claimed trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// Checked and committed; check again at the given time.
    Done(i64),
    /// Another worker holds the trigger lock.
    Busy,
    /// The lock expired before the result could be committed.
    LockLost,
    /// The trigger no longer exists or belongs to the other scheduler.
    Missing,
}

/// Runs checks for every local (or every remote) trigger.
pub struct TriggerScheduler {
    db: DynDatabase,
    checker: Arc<TriggerChecker>,
    remote: bool,
    settings: SchedulerSettings,
}

impl TriggerScheduler {
    pub fn new(
        db: DynDatabase,
        checker: Arc<TriggerChecker>,
        remote: bool,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            db,
            checker,
            remote,
            settings,
        }
    }

    fn kind(&self) -> &'static str {
        if self.remote {
            "remote"
        } else {
            "local"
        }
    }

    /// Claims `id`, checks it and commits the outcome while the lock is
    /// still held.
    pub async fn check_trigger(&self, id: &str, now: i64) -> Result<CheckResult> {
        let mut lock = Lock::new(
            self.db.clone(),
            format!("trigger-check:{id}"),
            self.settings.lock_ttl,
        );
        if !lock.try_acquire().await? {
            return Ok(CheckResult::Busy);
        }
        let result = self.check_locked(id, &mut lock, now).await;
        if let Err(e) = lock.release().await {
            tracing::warn!(trigger_id = %id, error = %e, "Failed to release trigger lock");
        }
        result
    }

    async fn check_locked(&self, id: &str, lock: &mut Lock, now: i64) -> Result<CheckResult> {
        let Some(trigger) = self.db.get_trigger(id).await? else {
            return Ok(CheckResult::Missing);
        };
        if trigger.is_remote != self.remote {
            return Ok(CheckResult::Missing);
        }
        let last = self.db.get_trigger_last_check(id).await?;

        let check = self.checker.check(&trigger, last, now);
        tokio::pin!(check);
        let period = (self.settings.lock_ttl / 3).max(Duration::from_millis(10));
        let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let outcome = loop {
            tokio::select! {
                outcome = &mut check => break outcome,
                _ = refresh.tick() => {
                    if !lock.refresh().await? {
                        tracing::warn!(trigger_id = %id, "Trigger lock lost during check");
                        return Ok(CheckResult::LockLost);
                    }
                }
            }
        };

        if !lock.refresh().await? {
            tracing::warn!(trigger_id = %id, "Trigger lock lost, abandoning check result");
            return Ok(CheckResult::LockLost);
        }
        self.commit(id, &outcome).await?;

        let counter = if self.remote {
            counters::REMOTE_CHECKS
        } else {
            counters::LOCAL_CHECKS
        };
        self.db.increment_counter(counter, 1).await?;

        let next = outcome.check_data.timestamp + self.checker.settings().check_interval;
        Ok(CheckResult::Done(next.max(now)))
    }

    async fn commit(&self, id: &str, outcome: &CheckOutcome) -> Result<()> {
        with_backoff("commit_trigger_check", 3, Duration::from_millis(100), || {
            self.db
                .commit_trigger_check(id, &outcome.check_data, &outcome.events)
        })
        .await?;
        if !outcome.events.is_empty() {
            tracing::debug!(trigger_id = %id, events = outcome.events.len(), "Trigger events queued");
        }
        Ok(())
    }

    async fn run_one(self: Arc<Self>, id: String) -> (String, Option<i64>) {
        let now = chrono::Utc::now().timestamp();
        let interval = self.checker.settings().check_interval;
        let next = match self.check_trigger(&id, now).await {
            Ok(CheckResult::Done(next)) => Some(next),
            Ok(CheckResult::Busy) => Some(now + interval),
            Ok(CheckResult::LockLost) => Some(now + 1),
            Ok(CheckResult::Missing) => None,
            Err(e) => {
                tracing::error!(trigger_id = %id, error = %e, "Trigger check failed");
                Some(now + interval)
            }
        };
        (id, next)
    }

    /// Adds new triggers as due now and forgets removed ones.
    async fn refresh(&self, delay: &mut DelaySet, in_flight: &HashSet<String>) {
        let ids = match self.db.get_trigger_ids(self.remote).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(kind = self.kind(), error = %e, "Failed to load trigger list");
                return;
            }
        };
        let now = chrono::Utc::now().timestamp();
        let current: HashSet<&String> = ids.iter().collect();
        let stale: Vec<String> = delay
            .ids()
            .filter(|id| !current.contains(id))
            .cloned()
            .collect();
        for id in stale {
            delay.remove(&id);
        }
        for id in &ids {
            if !delay.contains(id) && !in_flight.contains(id) {
                delay.schedule(id, now);
            }
        }
    }

    /// Pulls forward triggers that use a pattern which just received data.
    async fn wake_patterns(
        &self,
        patterns: &mut HashSet<String>,
        delay: &mut DelaySet,
        in_flight: &HashSet<String>,
        dirty: &mut HashSet<String>,
        now: i64,
    ) {
        for pattern in patterns.drain() {
            match self.db.get_pattern_triggers(&pattern).await {
                Ok(ids) => {
                    for id in ids {
                        if in_flight.contains(&id) {
                            dirty.insert(id);
                        } else {
                            delay.schedule_earlier(&id, now);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Failed to resolve pattern triggers");
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(kind = self.kind(), "Trigger scheduler started");
        let mut delay = DelaySet::new();
        let mut in_flight = HashSet::new();
        let mut dirty = HashSet::new();
        let mut hit_patterns = HashSet::new();
        let mut running = JoinSet::new();
        let mut metric_events = (!self.remote).then(|| self.db.subscribe_metric_events());

        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.settings.trigger_refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => self.refresh(&mut delay, &in_flight).await,
                _ = poll.tick() => {
                    let now = chrono::Utc::now().timestamp();
                    self.wake_patterns(&mut hit_patterns, &mut delay, &in_flight, &mut dirty, now).await;
                    let free = self.settings.max_parallel_checks.max(1).saturating_sub(running.len());
                    for id in delay.pop_ready(now, free) {
                        in_flight.insert(id.clone());
                        running.spawn(self.clone().run_one(id));
                    }
                }
                Some(joined) = running.join_next() => match joined {
                    Ok((id, next)) => {
                        in_flight.remove(&id);
                        let now = chrono::Utc::now().timestamp();
                        match next {
                            Some(_) if dirty.remove(&id) => delay.schedule(&id, now),
                            Some(next) => delay.schedule(&id, next),
                            None => {
                                dirty.remove(&id);
                            }
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Check task panicked"),
                },
                event = next_metric_event(&mut metric_events) => match event {
                    Ok(event) => {
                        hit_patterns.insert(event.pattern);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Metric events lagged, affected triggers wait for their next check");
                    }
                    Err(broadcast::error::RecvError::Closed) => metric_events = None,
                },
            }
        }

        while running.join_next().await.is_some() {}
        tracing::info!(kind = self.kind(), "Trigger scheduler stopped");
    }
}

async fn next_metric_event(
    rx: &mut Option<broadcast::Receiver<MetricEvent>>,
) -> std::result::Result<MetricEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
