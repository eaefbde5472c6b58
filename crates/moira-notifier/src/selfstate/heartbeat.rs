//! Liveness probes run by the self-state monitor.

use async_trait::async_trait;
use moira_common::state::SelfState;
use moira_storage::{counters, DynDatabase};
use std::sync::Mutex;

/// Result of one probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Seconds the probed condition has been bad (or stale).
    pub value: i64,
    pub has_errors: bool,
    pub error: Option<String>,
}

impl HeartbeatReport {
    fn ok(value: i64) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    fn failed(value: i64, error: String) -> Self {
        Self {
            value,
            has_errors: true,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait Heartbeat: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, now: i64) -> HeartbeatReport;

    /// A failure closes the notification gate.
    fn need_turn_off_notifier(&self) -> bool;

    /// `false` puts the heartbeat in its own layer; when it fails the
    /// remaining layers are not run.
    fn need_to_check_others(&self) -> bool;
}

/// Fails once the store has been unreachable for `delay` seconds.
pub struct DatabaseHeartbeat {
    db: DynDatabase,
    delay: i64,
    first_failure: Mutex<Option<i64>>,
}

impl DatabaseHeartbeat {
    pub fn new(db: DynDatabase, delay: i64) -> Self {
        Self {
            db,
            delay,
            first_failure: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Heartbeat for DatabaseHeartbeat {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self, now: i64) -> HeartbeatReport {
        let result = self.db.ping().await;
        let mut first = self
            .first_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match result {
            Ok(()) => {
                *first = None;
                HeartbeatReport::ok(0)
            }
            Err(e) => {
                let since = *first.get_or_insert(now);
                let down = now - since;
                if down >= self.delay {
                    HeartbeatReport::failed(
                        down,
                        format!("Database has been unreachable for {down}s: {e}"),
                    )
                } else {
                    HeartbeatReport::ok(down)
                }
            }
        }
    }

    fn need_turn_off_notifier(&self) -> bool {
        true
    }

    fn need_to_check_others(&self) -> bool {
        false
    }
}

/// Tracks how long a monotonic counter has not moved.
#[derive(Debug, Default)]
struct CounterWatch {
    last_value: Option<i64>,
    last_change: i64,
}

impl CounterWatch {
    /// Seconds since the counter last changed.
    fn observe(&mut self, value: i64, now: i64) -> i64 {
        if self.last_value != Some(value) {
            self.last_value = Some(value);
            self.last_change = now;
        }
        now - self.last_change
    }
}

/// Fails when `counter` stalls for `delay` seconds while triggers of the
/// watched kind exist.
pub struct CounterHeartbeat {
    name: &'static str,
    db: DynDatabase,
    counter: &'static str,
    remote_triggers: bool,
    delay: i64,
    turn_off: bool,
    watch: Mutex<CounterWatch>,
}

impl CounterHeartbeat {
    /// Metrics written by the filter. Only local triggers read them.
    pub fn filter(db: DynDatabase, delay: i64) -> Self {
        Self::new("filter", db, counters::METRICS_RECEIVED, false, delay, true)
    }

    pub fn local_checker(db: DynDatabase, delay: i64, turn_off: bool) -> Self {
        Self::new("local-checker", db, counters::LOCAL_CHECKS, false, delay, turn_off)
    }

    pub fn remote_checker(db: DynDatabase, delay: i64, turn_off: bool) -> Self {
        Self::new("remote-checker", db, counters::REMOTE_CHECKS, true, delay, turn_off)
    }

    fn new(
        name: &'static str,
        db: DynDatabase,
        counter: &'static str,
        remote_triggers: bool,
        delay: i64,
        turn_off: bool,
    ) -> Self {
        Self {
            name,
            db,
            counter,
            remote_triggers,
            delay,
            turn_off,
            watch: Mutex::new(CounterWatch::default()),
        }
    }
}

#[async_trait]
impl Heartbeat for CounterHeartbeat {
    fn name(&self) -> &str {
        self.name
    }

    async fn check(&self, now: i64) -> HeartbeatReport {
        let value = match self.db.get_counter(self.counter).await {
            Ok(value) => value,
            Err(e) => {
                return HeartbeatReport::failed(0, format!("Failed to read {}: {e}", self.counter))
            }
        };
        let stale = self
            .watch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .observe(value, now);
        if stale < self.delay {
            return HeartbeatReport::ok(stale);
        }
        match self.db.get_trigger_ids(self.remote_triggers).await {
            Ok(ids) if ids.is_empty() => HeartbeatReport::ok(stale),
            Ok(_) => HeartbeatReport::failed(
                stale,
                format!("{} has not made progress for {stale}s", self.name),
            ),
            Err(e) => HeartbeatReport::failed(stale, format!("Failed to list triggers: {e}")),
        }
    }

    fn need_turn_off_notifier(&self) -> bool {
        self.turn_off
    }

    fn need_to_check_others(&self) -> bool {
        true
    }
}

/// Reports a notifier that is already switched off.
pub struct NotifierHeartbeat {
    db: DynDatabase,
}

impl NotifierHeartbeat {
    pub fn new(db: DynDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Heartbeat for NotifierHeartbeat {
    fn name(&self) -> &str {
        "notifier"
    }

    async fn check(&self, _now: i64) -> HeartbeatReport {
        match self.db.get_notifier_state().await {
            Ok(state) if state.state == SelfState::Error => HeartbeatReport::failed(
                1,
                format!("Notifier is switched off ({:?})", state.actor),
            ),
            Ok(_) => HeartbeatReport::ok(0),
            Err(e) => HeartbeatReport::failed(0, format!("Failed to read notifier state: {e}")),
        }
    }

    fn need_turn_off_notifier(&self) -> bool {
        false
    }

    fn need_to_check_others(&self) -> bool {
        true
    }
}
