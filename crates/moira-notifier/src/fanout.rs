use crate::error::{NotifyError, Result};
use crate::planner::Planner;
use crate::selfstate;
use moira_common::state::State;
use moira_common::types::{
    Contact, NotificationEvent, ScheduledNotification, Subscription, TriggerData,
    SELFSTATE_TRIGGER_ID,
};
use moira_storage::retry::with_backoff;
use moira_storage::DynDatabase;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Turns queued events into scheduled notifications.
pub struct EventWorker {
    db: DynDatabase,
    planner: Planner,
    fetch_timeout: Duration,
}

impl EventWorker {
    pub fn new(db: DynDatabase, fetch_timeout: Duration) -> Self {
        Self {
            planner: Planner::new(db.clone()),
            db,
            fetch_timeout,
        }
    }

    async fn trigger_data(&self, event: &NotificationEvent) -> Result<TriggerData> {
        if event.trigger_id == SELFSTATE_TRIGGER_ID {
            return Ok(selfstate::trigger_data());
        }
        if event.state == State::Test && event.trigger_id.is_empty() {
            return Ok(TriggerData {
                name: "Test notification".to_string(),
                ..Default::default()
            });
        }
        match self.db.get_trigger(&event.trigger_id).await? {
            Some(trigger) => Ok(trigger.to_data()),
            None => Err(NotifyError::Missing {
                entity: "trigger",
                id: event.trigger_id.clone(),
            }),
        }
    }

    /// Resolves the recipients of `event` and queues one notification per
    /// distinct contact. Returns how many were queued.
    pub async fn process_event(&self, event: &NotificationEvent, now: i64) -> Result<usize> {
        let trigger = self.trigger_data(event).await?;

        let mut targets: Vec<(Option<Subscription>, Contact)> = Vec::new();
        if let Some(contact_id) = &event.contact_id {
            let contact = self.db.get_contact(contact_id).await?.ok_or_else(|| {
                NotifyError::Missing {
                    entity: "contact",
                    id: contact_id.clone(),
                }
            })?;
            targets.push((None, contact));
        } else if event.state == State::Test {
            let Some(subscription_id) = &event.subscription_id else {
                tracing::warn!(trigger_id = %event.trigger_id, "Test event without a recipient dropped");
                return Ok(0);
            };
            let subscription = self.db.get_subscription(subscription_id).await?.ok_or_else(|| {
                NotifyError::Missing {
                    entity: "subscription",
                    id: subscription_id.clone(),
                }
            })?;
            if !subscription.enabled {
                tracing::debug!(subscription_id = %subscription.id, "Test event for a disabled subscription dropped");
                return Ok(0);
            }
            for contact in self.db.get_contacts(&subscription.contacts).await? {
                targets.push((Some(subscription.clone()), contact));
            }
        } else {
            let mut tags: Vec<String> = trigger.tags.clone();
            for tag in &event.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
            for subscription in self.db.get_tags_subscriptions(&tags).await? {
                if !subscription_matches(&subscription, event, &tags) {
                    continue;
                }
                for contact in self.db.get_contacts(&subscription.contacts).await? {
                    targets.push((Some(subscription.clone()), contact));
                }
            }
        }

        let fingerprint = event.fingerprint();
        let mut seen = HashSet::new();
        let mut notifications: Vec<ScheduledNotification> = Vec::new();
        for (subscription, contact) in &targets {
            let key = format!(
                "{}:{}:{}:{}",
                contact.contact_type, contact.value, trigger.id, fingerprint
            );
            if !seen.insert(key) {
                continue;
            }
            let notification = self
                .planner
                .plan(event, &trigger, contact, subscription.as_ref(), now)
                .await?;
            notifications.push(notification);
        }

        if notifications.is_empty() {
            tracing::debug!(trigger_id = %trigger.id, metric = %event.metric, "Event matched no subscription");
            return Ok(0);
        }
        with_backoff("add_notifications", 3, Duration::from_millis(100), || {
            self.db.add_notifications(&notifications)
        })
        .await?;
        tracing::debug!(
            trigger_id = %trigger.id,
            metric = %event.metric,
            count = notifications.len(),
            "Notifications scheduled"
        );
        Ok(notifications.len())
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Event worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.db.fetch_notification_event(self.fetch_timeout) => match fetched {
                    Ok(Some(event)) => {
                        let now = chrono::Utc::now().timestamp();
                        if let Err(e) = self.process_event(&event, now).await {
                            tracing::warn!(
                                trigger_id = %event.trigger_id,
                                metric = %event.metric,
                                error = %e,
                                "Dropping event"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to fetch notification event");
                        tokio::time::sleep(self.fetch_timeout).await;
                    }
                },
            }
        }
        tracing::info!("Event worker stopped");
    }
}

/// Routing rules for a non-test event: the subscription is enabled, its
/// tags are all present (or it takes any tags), the schedule admits the
/// event time and neither ignore flag applies.
pub fn subscription_matches(
    subscription: &Subscription,
    event: &NotificationEvent,
    tags: &[String],
) -> bool {
    if !subscription.enabled {
        return false;
    }
    if !subscription.any_tags && !subscription.tags.iter().all(|t| tags.contains(t)) {
        return false;
    }
    if !subscription.schedule_allows(event.timestamp) {
        return false;
    }
    !subscription.must_ignore(event)
}
