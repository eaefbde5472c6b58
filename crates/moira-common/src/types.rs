use crate::schedule::Schedule;
use crate::state::{State, TtlState};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Trigger ID carried by events the self-state monitor pushes into the
/// pipeline.
pub const SELFSTATE_TRIGGER_ID: &str = "moira-selfstate";
/// Tag carried by self-state events; subscribe to it to receive them.
pub const SELFSTATE_TAG: &str = "moira-selfstate";

/// A single point received on the ingest port.
///
/// `labels` holds the tag tail of a tag-labeled metric (`name;k=v`). The
/// synthetic `name` label is served by [`MetricPoint::label`] rather than
/// stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
}

impl MetricPoint {
    /// Canonical series name: the metric name followed by the labels in
    /// lexicographic order.
    ///
    /// # Examples
    ///
    /// ```
    /// use moira_common::types::MetricPoint;
    /// use std::collections::BTreeMap;
    ///
    /// let mut labels = BTreeMap::new();
    /// labels.insert("dc".to_string(), "ams".to_string());
    /// labels.insert("az".to_string(), "1".to_string());
    /// let point = MetricPoint { name: "cpu.load".into(), labels, value: 1.0, timestamp: 0 };
    /// assert_eq!(point.full_name(), "cpu.load;az=1;dc=ams");
    /// ```
    pub fn full_name(&self) -> String {
        let mut out = self.name.clone();
        for (k, v) in &self.labels {
            out.push(';');
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    /// Looks up a label, treating `name` as the metric name.
    pub fn label(&self, key: &str) -> Option<&str> {
        if key == "name" {
            return Some(&self.name);
        }
        self.labels.get(key).map(String::as_str)
    }

    /// Canonical wire form `name[;k=v...] value timestamp`.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.full_name(), self.value, self.timestamp)
    }
}

/// Rounds `timestamp` to the nearest point of the retention grid.
///
/// # Examples
///
/// ```
/// use moira_common::types::retention_timestamp;
///
/// assert_eq!(retention_timestamp(89, 60), 60);
/// assert_eq!(retention_timestamp(90, 60), 120);
/// ```
pub fn retention_timestamp(timestamp: i64, retention: i64) -> i64 {
    if retention <= 0 {
        return timestamp;
    }
    (timestamp + retention / 2).div_euclid(retention) * retention
}

/// A point that matched at least one trigger pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedMetric {
    pub metric: String,
    pub patterns: Vec<String>,
    pub value: f64,
    pub timestamp: i64,
    pub retention: i64,
    pub retention_timestamp: i64,
}

impl MatchedMetric {
    pub fn new(point: &MetricPoint, patterns: Vec<String>, retention: i64) -> Self {
        Self {
            metric: point.full_name(),
            patterns,
            value: point.value,
            timestamp: point.timestamp,
            retention,
            retention_timestamp: retention_timestamp(point.timestamp, retention),
        }
    }
}

/// One stored entry of a metric series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub retention_timestamp: i64,
    pub timestamp: i64,
    pub value: f64,
}

/// Published whenever a matched metric is written, so the checker can wake
/// up triggers that use `pattern`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricEvent {
    pub metric: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Rising,
    Falling,
    Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub targets: Vec<String>,
    #[serde(default)]
    pub warn_value: Option<f64>,
    #[serde(default)]
    pub error_value: Option<f64>,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub expression: Option<String>,
    /// Seconds without data before a metric key switches to `ttl_state`.
    /// Zero disables the check.
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub ttl_state: TtlState,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Patterns extracted from `targets`; maintained by whoever saves the
    /// trigger.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Keyed by target name (`t2`, `t3`, ...).
    #[serde(default)]
    pub alone_metrics: HashMap<String, bool>,
    #[serde(default)]
    pub mute_new_metrics: bool,
    #[serde(default)]
    pub is_remote: bool,
}

impl Trigger {
    /// Checks the structural invariants a trigger must satisfy before it can
    /// be evaluated.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("trigger id is empty".to_string());
        }
        if self.targets.is_empty() {
            return Err(format!("trigger {} has no targets", self.id));
        }
        match self.trigger_type {
            TriggerType::Expression => {
                if self.expression.as_deref().is_none_or(|e| e.trim().is_empty()) {
                    return Err(format!(
                        "trigger {} has expression type but no expression",
                        self.id
                    ));
                }
            }
            TriggerType::Rising | TriggerType::Falling => {
                if self.warn_value.is_none() && self.error_value.is_none() {
                    return Err(format!(
                        "trigger {} needs at least one of warn_value and error_value",
                        self.id
                    ));
                }
            }
        }
        if self.ttl < 0 {
            return Err(format!("trigger {} has a negative ttl", self.id));
        }
        Ok(())
    }

    /// Whether target `name` (`t2`, ...) is shared by every metric key.
    pub fn is_alone(&self, target: &str) -> bool {
        self.alone_metrics.get(target).copied().unwrap_or(false)
    }

    pub fn to_data(&self) -> TriggerData {
        TriggerData {
            id: self.id.clone(),
            name: self.name.clone(),
            desc: self.desc.clone(),
            targets: self.targets.clone(),
            warn_value: self.warn_value,
            error_value: self.error_value,
            is_remote: self.is_remote,
            tags: self.tags.clone(),
        }
    }
}

/// Trigger summary embedded in notifications, so delivery never needs to
/// re-read the trigger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggerData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub warn_value: Option<f64>,
    #[serde(default)]
    pub error_value: Option<f64>,
    #[serde(default)]
    pub is_remote: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricState {
    pub state: State,
    /// Time of the most recent evaluated point.
    pub timestamp: i64,
    /// Time of the last state change.
    pub event_timestamp: i64,
    #[serde(default)]
    pub suppressed: bool,
    /// State the metric was in when suppression began.
    #[serde(default)]
    pub suppressed_state: Option<State>,
    #[serde(default)]
    pub values: HashMap<String, f64>,
    /// Events up to this unix time are suppressed.
    #[serde(default)]
    pub maintenance: i64,
}

impl MetricState {
    /// Points at or before the returned time were already evaluated.
    pub fn check_point(&self, gap: i64) -> i64 {
        (self.timestamp - gap).max(self.event_timestamp)
    }
}

/// Result of the most recent check of a trigger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckData {
    pub state: State,
    pub timestamp: i64,
    pub event_timestamp: i64,
    pub last_successful_check_timestamp: i64,
    /// Trigger-wide maintenance: events up to this unix time are suppressed.
    #[serde(default)]
    pub suppressed_until: i64,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default)]
    pub suppressed_state: Option<State>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub metrics: HashMap<String, MetricState>,
    #[serde(default)]
    pub metrics_to_target_relation: HashMap<String, String>,
}

impl CheckData {
    pub fn update_score(&mut self) {
        self.score = self.state.score()
            + self
                .metrics
                .values()
                .map(|m| m.state.score())
                .sum::<i64>();
    }

    /// Most severe of the trigger state and every metric state.
    pub fn aggregated_state(&self) -> State {
        State::aggregate(
            std::iter::once(self.state).chain(self.metrics.values().map(|m| m.state)),
        )
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub any_tags: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub throttling: bool,
    #[serde(default)]
    pub ignore_warnings: bool,
    #[serde(default)]
    pub ignore_recoverings: bool,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub plotting: bool,
}

impl Subscription {
    pub fn validate(&self) -> Result<(), String> {
        match (&self.user, &self.team_id) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(format!(
                "subscription {} must belong to exactly one of user or team",
                self.id
            )),
        }
    }

    /// Whether the subscription's schedule admits `ts`.
    pub fn schedule_allows(&self, ts: i64) -> bool {
        self.schedule.as_ref().is_none_or(|s| s.is_allowed(ts))
    }

    /// Whether `event` must be skipped because of `ignore_warnings` or
    /// `ignore_recoverings`.
    ///
    /// A recovery from `WARN` straight to `OK` counts as a warning
    /// transition too, since the warning itself was never delivered.
    pub fn must_ignore(&self, event: &NotificationEvent) -> bool {
        if self.ignore_warnings
            && (event.state == State::Warn
                || (event.state == State::Ok && event.old_state == State::Warn))
        {
            return true;
        }
        self.ignore_recoverings && event.state == State::Ok && event.old_state.is_bad()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(rename = "type")]
    pub contact_type: String,
    pub value: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
}

/// A state transition flowing from the checker to the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(default)]
    pub is_trigger_event: bool,
    pub timestamp: i64,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub values: HashMap<String, f64>,
    pub state: State,
    pub old_state: State,
    #[serde(default)]
    pub trigger_id: String,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Extra tags matched against subscriptions alongside the trigger tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NotificationEvent {
    /// Stable hash of `(trigger_id, metric, old_state, state)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use moira_common::state::State;
    /// use moira_common::types::NotificationEvent;
    ///
    /// let mut event = NotificationEvent::transition("t1", "cpu", State::Ok, State::Warn, 100);
    /// let fp = event.fingerprint();
    /// event.timestamp = 200;
    /// assert_eq!(fp, event.fingerprint());
    /// ```
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.trigger_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.metric.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.old_state.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.state.to_string().as_bytes());
        hasher
            .finalize()
            .iter()
            .take(16)
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Plain metric transition with no value attached.
    pub fn transition(
        trigger_id: &str,
        metric: &str,
        old_state: State,
        state: State,
        timestamp: i64,
    ) -> Self {
        Self {
            is_trigger_event: false,
            timestamp,
            metric: metric.to_string(),
            value: None,
            values: HashMap::new(),
            state,
            old_state,
            trigger_id: trigger_id.to_string(),
            subscription_id: None,
            contact_id: None,
            message: None,
            tags: Vec::new(),
        }
    }
}

/// A notification waiting in the due-time queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub event: NotificationEvent,
    pub trigger: TriggerData,
    pub contact: Contact,
    #[serde(default)]
    pub plotting: bool,
    #[serde(default)]
    pub throttled: bool,
    #[serde(default)]
    pub send_fail: u32,
    pub timestamp: i64,
    pub created_at: i64,
}

impl ScheduledNotification {
    /// Grouping key of the package this notification belongs to.
    pub fn package_key(&self) -> String {
        package_key(&self.contact, &self.trigger.id)
    }

    /// Deduplication key within a single event.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.package_key(), self.event.fingerprint())
    }
}

fn package_key(contact: &Contact, trigger_id: &str) -> String {
    format!("{}:{}:{}", contact.contact_type, contact.value, trigger_id)
}

/// A burst of events for one contact and trigger, delivered in one send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPackage {
    pub events: Vec<NotificationEvent>,
    pub trigger: TriggerData,
    pub contact: Contact,
    #[serde(default)]
    pub plotting: bool,
    #[serde(default)]
    pub throttled: bool,
    #[serde(default)]
    pub fail_count: u32,
    /// Failed deliveries of this package are never rescheduled.
    #[serde(default)]
    pub dont_resend: bool,
}

impl NotificationPackage {
    pub fn key(&self) -> String {
        package_key(&self.contact, &self.trigger.id)
    }

    /// Most severe state among the package's events.
    pub fn worst_state(&self) -> State {
        State::aggregate(self.events.iter().map(|e| e.state))
    }

    pub fn is_test(&self) -> bool {
        self.events.iter().any(|e| e.state == State::Test)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub metric: String,
    pub old_state: State,
    pub state: State,
    pub timestamp: i64,
}

impl From<&NotificationEvent> for EventSummary {
    fn from(event: &NotificationEvent) -> Self {
        Self {
            metric: event.metric.clone(),
            old_state: event.old_state,
            state: event.state,
            timestamp: event.timestamp,
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationHistoryEntry {
    pub id: String,
    pub contact_id: String,
    pub trigger_id: String,
    pub timestamp: i64,
    pub events: Vec<EventSummary>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}
