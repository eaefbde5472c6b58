use crate::error::Result;
use crate::NotifierSettings;
use moira_common::state::State;
use moira_common::types::{
    Contact, NotificationEvent, ScheduledNotification, Subscription, TriggerData,
};
use moira_storage::DynDatabase;
use rand::Rng;

/// One sliding-window throttling rule: more than `max_hits` deliveries to
/// a contact within `window` seconds push the next one `delay` seconds out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleLevel {
    pub window: i64,
    pub max_hits: usize,
    pub delay: i64,
}

/// Checked in order; the first level that trips wins.
pub const THROTTLE_LEVELS: [ThrottleLevel; 2] = [
    ThrottleLevel {
        window: 3 * 60 * 60,
        max_hits: 20,
        delay: 60 * 60,
    },
    ThrottleLevel {
        window: 60 * 60,
        max_hits: 10,
        delay: 30 * 60,
    },
];

/// Computes due times for new notifications.
pub struct Planner {
    db: DynDatabase,
}

impl Planner {
    pub fn new(db: DynDatabase) -> Self {
        Self { db }
    }

    /// Builds the notification for `event` to `contact`, due immediately
    /// unless the subscription throttles and the contact had too many
    /// recent deliveries.
    pub async fn plan(
        &self,
        event: &NotificationEvent,
        trigger: &TriggerData,
        contact: &Contact,
        subscription: Option<&Subscription>,
        now: i64,
    ) -> Result<ScheduledNotification> {
        let mut timestamp = now;
        let mut throttled = false;

        let throttling = subscription.is_some_and(|s| s.throttling);
        if throttling && event.state != State::Test {
            let key = throttling_key(contact);
            let next = self.db.get_throttling_next(&key).await?;
            if next > now {
                timestamp = next;
                throttled = true;
            } else {
                for level in THROTTLE_LEVELS {
                    let hits = self.db.count_throttling_hits(&key, now - level.window).await?;
                    if hits >= level.max_hits {
                        timestamp = now + level.delay;
                        throttled = true;
                        self.db.set_throttling_next(&key, timestamp).await?;
                        break;
                    }
                }
            }
            if throttled {
                if let Some(next) = subscription
                    .and_then(|s| s.schedule.as_ref())
                    .and_then(|s| s.next_allowed(timestamp))
                {
                    timestamp = next;
                }
                tracing::debug!(contact_id = %contact.id, due = timestamp, "Notification throttled");
            }
            self.db.add_throttling_hit(&key, timestamp).await?;
        }

        Ok(ScheduledNotification {
            event: event.clone(),
            trigger: trigger.clone(),
            contact: contact.clone(),
            plotting: subscription.is_some_and(|s| s.plotting),
            throttled,
            send_fail: 0,
            timestamp,
            created_at: now,
        })
    }
}

fn throttling_key(contact: &Contact) -> String {
    format!("contact:{}", contact.id)
}

/// Due time of the next attempt after `fail_count` failed ones: the
/// rescheduling delay doubled per failure, capped by the resending timeout,
/// plus jitter below one rescheduling delay.
pub fn resend_time(now: i64, fail_count: u32, settings: &NotifierSettings) -> i64 {
    let delay = settings.rescheduling_delay.as_secs() as i64;
    let cap = settings.resending_timeout.as_secs() as i64;
    let backoff = delay
        .saturating_mul(1i64 << fail_count.min(30))
        .min(cap.max(delay));
    let jitter = if delay > 0 {
        rand::thread_rng().gen_range(0..delay)
    } else {
        0
    };
    now + backoff + jitter
}
