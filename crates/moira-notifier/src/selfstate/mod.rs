//! Pipeline self-monitoring.
//!
//! Heartbeats are arranged in layers: every heartbeat that does not need
//! the others checked gets a layer of its own and runs first, the rest run
//! together in a final layer. A failure in a singleton layer skips every
//! later layer, so a dead store does not also report a stalled filter.

pub mod heartbeat;

use crate::dispatcher::Dispatcher;
use futures::future::join_all;
use heartbeat::{Heartbeat, HeartbeatReport};
use moira_common::state::{SelfState, State, StateActor};
use moira_common::types::{
    Contact, NotificationEvent, NotificationPackage, TriggerData, SELFSTATE_TAG,
    SELFSTATE_TRIGGER_ID,
};
use moira_storage::DynDatabase;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub use heartbeat::{CounterHeartbeat, DatabaseHeartbeat, NotifierHeartbeat};

/// Trigger summary attached to self-state events and admin alerts.
pub fn trigger_data() -> TriggerData {
    TriggerData {
        id: SELFSTATE_TRIGGER_ID.to_string(),
        name: "Moira self-state".to_string(),
        tags: vec![SELFSTATE_TAG.to_string()],
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct SelfStateSettings {
    pub check_interval: Duration,
    /// Seconds between two alerts for the same failing heartbeat.
    pub notice_interval: i64,
    /// Receive alerts directly, bypassing subscriptions.
    pub admin_contacts: Vec<Contact>,
}

impl Default for SelfStateSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            notice_interval: 300,
            admin_contacts: Vec::new(),
        }
    }
}

/// What one monitoring round observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfStateReport {
    /// Heartbeats failing in this round.
    pub failed: Vec<String>,
    /// Heartbeats that failed before and passed in this round.
    pub recovered: Vec<String>,
    /// Heartbeats not run because an earlier layer failed.
    pub skipped: Vec<String>,
    /// Notifier state after the round.
    pub notifier_state: SelfState,
}

pub struct SelfStateMonitor {
    db: DynDatabase,
    dispatcher: Arc<Dispatcher>,
    heartbeats: Vec<Box<dyn Heartbeat>>,
    layers: Vec<Vec<usize>>,
    settings: SelfStateSettings,
    /// Failing heartbeat name to whether it turns the notifier off.
    failing: HashMap<String, bool>,
    last_notice: HashMap<String, i64>,
}

/// Singleton layers for heartbeats that stop the round on failure, in
/// registration order, then one layer with everything else.
pub fn build_layers(heartbeats: &[Box<dyn Heartbeat>]) -> Vec<Vec<usize>> {
    let mut layers: Vec<Vec<usize>> = heartbeats
        .iter()
        .enumerate()
        .filter(|(_, h)| !h.need_to_check_others())
        .map(|(i, _)| vec![i])
        .collect();
    let rest: Vec<usize> = heartbeats
        .iter()
        .enumerate()
        .filter(|(_, h)| h.need_to_check_others())
        .map(|(i, _)| i)
        .collect();
    if !rest.is_empty() {
        layers.push(rest);
    }
    layers
}

impl SelfStateMonitor {
    pub fn new(
        db: DynDatabase,
        dispatcher: Arc<Dispatcher>,
        heartbeats: Vec<Box<dyn Heartbeat>>,
        settings: SelfStateSettings,
    ) -> Self {
        let layers = build_layers(&heartbeats);
        Self {
            db,
            dispatcher,
            heartbeats,
            layers,
            settings,
            failing: HashMap::new(),
            last_notice: HashMap::new(),
        }
    }

    async fn run_layers(&self, now: i64) -> (Vec<(usize, HeartbeatReport)>, Vec<String>) {
        let mut reports = Vec::new();
        let mut skipped = Vec::new();
        let mut stop = false;
        for layer in &self.layers {
            if stop {
                skipped.extend(layer.iter().map(|&i| self.heartbeats[i].name().to_string()));
                continue;
            }
            let results = join_all(layer.iter().map(|&i| self.heartbeats[i].check(now))).await;
            for (&i, report) in layer.iter().zip(results) {
                if report.has_errors && !self.heartbeats[i].need_to_check_others() {
                    stop = true;
                }
                reports.push((i, report));
            }
        }
        (reports, skipped)
    }

    /// Runs every layer once and reacts to the outcome.
    pub async fn check(&mut self, now: i64) -> SelfStateReport {
        let (reports, skipped) = self.run_layers(now).await;
        let mut report = SelfStateReport {
            skipped,
            ..Default::default()
        };

        let mut alerts = Vec::new();
        let mut recoveries = Vec::new();
        for (i, hb_report) in reports {
            let heartbeat = &self.heartbeats[i];
            let name = heartbeat.name().to_string();
            if hb_report.has_errors {
                let error = hb_report.error.unwrap_or_else(|| format!("{name} failed"));
                tracing::warn!(heartbeat = %name, value = hb_report.value, error = %error, "Heartbeat failed");
                self.failing
                    .insert(name.clone(), heartbeat.need_turn_off_notifier());
                let due = self
                    .last_notice
                    .get(&name)
                    .is_none_or(|last| now - last >= self.settings.notice_interval);
                if due {
                    self.last_notice.insert(name.clone(), now);
                    let mut event = self_state_event(&name, State::Nodata, State::Error, now);
                    event.message = Some(error);
                    alerts.push(event);
                }
                report.failed.push(name);
            } else if self.failing.remove(&name).is_some() {
                tracing::info!(heartbeat = %name, "Heartbeat recovered");
                self.last_notice.remove(&name);
                recoveries.push(self_state_event(&name, State::Error, State::Ok, now));
                report.recovered.push(name);
            }
        }

        let current = match self.db.get_notifier_state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read notifier state");
                report.notifier_state = SelfState::Error;
                return report;
            }
        };
        let turn_off = self.failing.values().any(|t| *t);
        let mut state = current.state;

        if !alerts.is_empty() {
            if state == SelfState::Ok {
                self.notify_admins(&alerts, now).await;
            }
            self.push_events(&alerts).await;
        }

        if turn_off && state == SelfState::Ok {
            match self.db.set_notifier_state(SelfState::Error, StateActor::Auto).await {
                Ok(s) => {
                    state = s.state;
                    tracing::error!(failing = ?self.failing.keys().collect::<Vec<_>>(), "Notifier turned off");
                }
                Err(e) => tracing::error!(error = %e, "Failed to turn the notifier off"),
            }
        } else if !turn_off && state == SelfState::Error && current.actor == StateActor::Auto {
            match self.db.set_notifier_state(SelfState::Ok, StateActor::Auto).await {
                Ok(s) => {
                    state = s.state;
                    tracing::info!("Notifier turned back on");
                }
                Err(e) => tracing::error!(error = %e, "Failed to turn the notifier on"),
            }
        }

        if !recoveries.is_empty() {
            if state == SelfState::Ok {
                self.notify_admins(&recoveries, now).await;
            }
            self.push_events(&recoveries).await;
        }

        report.notifier_state = state;
        report
    }

    async fn notify_admins(&self, events: &[NotificationEvent], now: i64) {
        for contact in &self.settings.admin_contacts {
            let package = NotificationPackage {
                events: events.to_vec(),
                trigger: trigger_data(),
                contact: contact.clone(),
                plotting: false,
                throttled: false,
                fail_count: 0,
                dont_resend: true,
            };
            self.dispatcher.deliver(&package, now).await;
        }
    }

    async fn push_events(&self, events: &[NotificationEvent]) {
        for event in events {
            if let Err(e) = self.db.push_notification_event(event).await {
                tracing::warn!(heartbeat = %event.metric, error = %e, "Failed to queue self-state event");
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            heartbeats = self.heartbeats.len(),
            layers = self.layers.len(),
            "Self-state monitor started"
        );
        let mut ticker = tokio::time::interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check(chrono::Utc::now().timestamp()).await;
                }
            }
        }
        tracing::info!("Self-state monitor stopped");
    }
}

fn self_state_event(heartbeat: &str, old_state: State, state: State, now: i64) -> NotificationEvent {
    let mut event =
        NotificationEvent::transition(SELFSTATE_TRIGGER_ID, heartbeat, old_state, state, now);
    event.is_trigger_event = true;
    event.tags = vec![SELFSTATE_TAG.to_string(), heartbeat.to_string()];
    event
}
