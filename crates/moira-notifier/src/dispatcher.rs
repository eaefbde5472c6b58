use crate::error::Result;
use crate::planner::resend_time;
use crate::plugin::Senders;
use crate::NotifierSettings;
use futures::future::join_all;
use indexmap::IndexMap;
use moira_common::id::next_id;
use moira_common::state::SelfState;
use moira_common::types::{
    EventSummary, NotificationHistoryEntry, NotificationPackage, ScheduledNotification,
};
use moira_storage::retry::with_backoff;
use moira_storage::DynDatabase;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counts from one dispatcher poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Notifications popped from the queue.
    pub fetched: usize,
    pub packages: usize,
    pub sent: usize,
    pub failed: usize,
    /// Failed packages queued again.
    pub rescheduled: usize,
    /// Notifications discarded because the notifier was off.
    pub dropped: usize,
}

struct Pending {
    package: NotificationPackage,
    created_at: i64,
}

/// Pops due notifications, groups them into packages and sends them.
pub struct Dispatcher {
    db: DynDatabase,
    senders: Senders,
    settings: NotifierSettings,
}

impl Dispatcher {
    pub fn new(db: DynDatabase, senders: Senders, settings: NotifierSettings) -> Self {
        Self {
            db,
            senders,
            settings,
        }
    }

    pub fn settings(&self) -> &NotifierSettings {
        &self.settings
    }

    /// One poll: everything due at `now`, up to the read batch size.
    pub async fn dispatch_once(&self, now: i64) -> Result<DispatchReport> {
        let notifications = self
            .db
            .fetch_notifications(now, self.settings.read_batch_size.max(1))
            .await?;
        let mut report = DispatchReport {
            fetched: notifications.len(),
            ..Default::default()
        };
        if notifications.is_empty() {
            return Ok(report);
        }

        let state = self.db.get_notifier_state().await?;
        if state.state == SelfState::Error {
            tracing::warn!(
                count = notifications.len(),
                actor = ?state.actor,
                "Notifier is off, dropping due notifications"
            );
            report.dropped = notifications.len();
            return Ok(report);
        }

        let pending = group(notifications);
        report.packages = pending.len();
        let results = join_all(pending.iter().map(|p| self.deliver(&p.package, now))).await;

        let mut retry = Vec::new();
        for (p, ok) in pending.into_iter().zip(results) {
            if ok {
                report.sent += 1;
                continue;
            }
            report.failed += 1;
            if self.may_resend(&p, now) {
                retry.extend(reschedule(p, now, &self.settings));
                report.rescheduled += 1;
            }
        }
        if !retry.is_empty() {
            with_backoff("add_notifications", 3, Duration::from_millis(100), || {
                self.db.add_notifications(&retry)
            })
            .await?;
        }
        Ok(report)
    }

    fn may_resend(&self, pending: &Pending, now: i64) -> bool {
        let package = &pending.package;
        if package.dont_resend {
            return false;
        }
        if package.fail_count + 1 >= self.settings.max_fail_attempts {
            tracing::warn!(
                contact_id = %package.contact.id,
                trigger_id = %package.trigger.id,
                attempts = package.fail_count + 1,
                "Giving up on notification package"
            );
            return false;
        }
        now - pending.created_at < self.settings.resending_timeout.as_secs() as i64
    }

    /// Sends `package` once and records the attempt in the contact history.
    /// Returns whether the sender succeeded.
    pub async fn deliver(&self, package: &NotificationPackage, now: i64) -> bool {
        let result = match self.senders.get(&package.contact.contact_type) {
            None => Err(format!(
                "no sender for contact type '{}'",
                package.contact.contact_type
            )),
            Some(sender) => {
                match tokio::time::timeout(self.settings.sending_timeout, sender.send(package))
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(_) => Err(format!(
                        "timed out after {}s",
                        self.settings.sending_timeout.as_secs()
                    )),
                }
            }
        };

        match &result {
            Ok(()) => tracing::info!(
                contact_id = %package.contact.id,
                contact_type = %package.contact.contact_type,
                trigger_id = %package.trigger.id,
                events = package.events.len(),
                "Notification sent"
            ),
            Err(e) => tracing::warn!(
                contact_id = %package.contact.id,
                contact_type = %package.contact.contact_type,
                trigger_id = %package.trigger.id,
                error = %e,
                "Notification send failed"
            ),
        }

        let entry = NotificationHistoryEntry {
            id: next_id(),
            contact_id: package.contact.id.clone(),
            trigger_id: package.trigger.id.clone(),
            timestamp: now,
            events: package.events.iter().map(EventSummary::from).collect(),
            success: result.is_ok(),
            error: result.as_ref().err().cloned(),
        };
        if let Err(e) = self.db.push_notification_history(&entry).await {
            tracing::warn!(contact_id = %entry.contact_id, error = %e, "Failed to record notification history");
        }
        result.is_ok()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Notification dispatcher started");
        let mut ticker = tokio::time::interval(self.settings.fetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = chrono::Utc::now().timestamp();
                    match self.dispatch_once(now).await {
                        Ok(report) if report.packages > 0 => tracing::debug!(
                            sent = report.sent,
                            failed = report.failed,
                            rescheduled = report.rescheduled,
                            "Dispatch round finished"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Dispatch round failed"),
                    }
                }
            }
        }
        tracing::info!("Notification dispatcher stopped");
    }
}

/// Groups notifications by `(contact type, contact value, trigger)` in
/// arrival order.
fn group(notifications: Vec<ScheduledNotification>) -> Vec<Pending> {
    let mut packages: IndexMap<String, Pending> = IndexMap::new();
    for n in notifications {
        let key = n.package_key();
        match packages.get_mut(&key) {
            Some(p) => {
                p.package.events.push(n.event);
                p.package.throttled |= n.throttled;
                p.package.plotting |= n.plotting;
                p.package.fail_count = p.package.fail_count.max(n.send_fail);
                p.created_at = p.created_at.min(n.created_at);
            }
            None => {
                packages.insert(
                    key,
                    Pending {
                        package: NotificationPackage {
                            events: vec![n.event],
                            trigger: n.trigger,
                            contact: n.contact,
                            plotting: n.plotting,
                            throttled: n.throttled,
                            fail_count: n.send_fail,
                            dont_resend: false,
                        },
                        created_at: n.created_at,
                    },
                );
            }
        }
    }
    packages.into_values().collect()
}

fn reschedule(pending: Pending, now: i64, settings: &NotifierSettings) -> Vec<ScheduledNotification> {
    let package = pending.package;
    let timestamp = resend_time(now, package.fail_count, settings);
    package
        .events
        .into_iter()
        .map(|event| ScheduledNotification {
            event,
            trigger: package.trigger.clone(),
            contact: package.contact.clone(),
            plotting: package.plotting,
            throttled: package.throttled,
            send_fail: package.fail_count + 1,
            timestamp,
            created_at: pending.created_at,
        })
        .collect()
}
