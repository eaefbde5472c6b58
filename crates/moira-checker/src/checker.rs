use crate::error::{CheckError, Result};
use crate::rule::Rule;
use crate::series::Series;
use crate::source::{MetricSource, DEFAULT_STEP};
use moira_common::state::State;
use moira_common::types::{CheckData, MetricState, NotificationEvent, Trigger};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A metric stuck in `ERROR` or `NODATA` re-notifies this often.
pub const REMIND_INTERVAL: i64 = 24 * 60 * 60;

const REMIND_MESSAGE: &str = "This metric has been in bad state for more than 24 hours";
const SUPPRESSED_MESSAGE: &str = "Summary of changes made while notifications were suppressed";

#[derive(Debug, Clone)]
pub struct CheckSettings {
    /// Seconds between two checks of the same trigger.
    pub check_interval: i64,
    /// Already evaluated points this close to the newest one are evaluated
    /// again, so late writes into recent buckets are seen.
    pub check_point_gap: i64,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            check_interval: 60,
            check_point_gap: 120,
        }
    }
}

/// Result of one check. Nothing is written until the caller commits it.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub check_data: CheckData,
    /// Events to enqueue, oldest first per metric.
    pub events: Vec<NotificationEvent>,
}

/// Evaluates one trigger against its metric source.
pub struct TriggerChecker {
    source: Arc<dyn MetricSource>,
    settings: CheckSettings,
}

struct MetricsOutcome {
    metrics: HashMap<String, MetricState>,
    relation: HashMap<String, String>,
    events: Vec<NotificationEvent>,
}

impl TriggerChecker {
    pub fn new(source: Arc<dyn MetricSource>, settings: CheckSettings) -> Self {
        Self { source, settings }
    }

    pub fn settings(&self) -> &CheckSettings {
        &self.settings
    }

    /// Checks `trigger` at wall time `now` starting from its previous check
    /// data. Failures become a trigger-level `EXCEPTION`.
    pub async fn check(&self, trigger: &Trigger, last: Option<CheckData>, now: i64) -> CheckOutcome {
        let mut data = last.unwrap_or_else(|| CheckData {
            state: State::Ok,
            timestamp: now,
            event_timestamp: now,
            last_successful_check_timestamp: now,
            ..Default::default()
        });
        let until = now - self.settings.check_interval / 2;

        let mut events = Vec::new();
        let new_state = match self.check_metrics(trigger, &data, now, until).await {
            Ok(outcome) => {
                data.metrics = outcome.metrics;
                data.metrics_to_target_relation = outcome.relation;
                data.last_successful_check_timestamp = now;
                data.message = None;
                events.extend(outcome.events);
                if data.metrics.is_empty()
                    && trigger.ttl > 0
                    && (data.state != State::Ok || now - data.event_timestamp >= trigger.ttl)
                {
                    trigger.ttl_state.to_trigger_state()
                } else {
                    State::Ok
                }
            }
            Err(e) => {
                tracing::warn!(trigger_id = %trigger.id, error = %e, "Trigger check failed");
                data.message = Some(e.to_string());
                State::Exception
            }
        };

        if new_state != data.state {
            let suppressed = !trigger
                .schedule
                .as_ref()
                .is_none_or(|s| s.is_allowed(now))
                || data.suppressed_until >= now;
            if !suppressed {
                let mut event = NotificationEvent::transition(
                    &trigger.id,
                    &trigger.name,
                    data.state,
                    new_state,
                    now,
                );
                event.is_trigger_event = true;
                event.message = data.message.clone();
                events.push(event);
            }
            data.state = new_state;
            data.event_timestamp = now;
        }
        data.timestamp = now;
        data.update_score();

        CheckOutcome {
            check_data: data,
            events,
        }
    }

    async fn check_metrics(
        &self,
        trigger: &Trigger,
        data: &CheckData,
        now: i64,
        until: i64,
    ) -> Result<MetricsOutcome> {
        trigger.validate().map_err(CheckError::InvalidTrigger)?;
        let rule = Rule::from_trigger(trigger)?;
        let window = if trigger.ttl > 0 {
            trigger.ttl
        } else {
            self.settings.check_point_gap
        };
        let from = until - window - DEFAULT_STEP;

        let mut fetched = Vec::with_capacity(trigger.targets.len());
        for target in &trigger.targets {
            fetched.push(self.source.fetch(target, from, until).await?);
        }

        let mut alone: HashMap<String, Option<Series>> = HashMap::new();
        let mut relation = HashMap::new();
        for (i, series) in fetched.iter().enumerate().skip(1) {
            let name = target_name(i);
            if !trigger.is_alone(&name) {
                continue;
            }
            if series.len() > 1 {
                return Err(CheckError::AloneTarget {
                    target: name,
                    count: series.len(),
                });
            }
            let single = series.first().cloned();
            if let Some(s) = &single {
                relation.insert(name.clone(), s.name.clone());
            }
            alone.insert(name, single);
        }

        let mut ctx = Context {
            trigger,
            suppressed_until: data.suppressed_until,
            events: Vec::new(),
        };
        let gap = self.settings.check_point_gap;
        let mut metrics = HashMap::new();
        let mut seen = HashSet::new();

        for series in &fetched[0] {
            seen.insert(series.name.clone());
            let known = data.metrics.get(&series.name);
            let mut state = known.cloned().unwrap_or_else(|| MetricState {
                state: State::Nodata,
                ..Default::default()
            });
            let check_from = known.map(|m| m.check_point(gap));
            let mut muted = known.is_none() && trigger.mute_new_metrics;

            for (ts, t1) in series.points() {
                if check_from.is_some_and(|cp| ts <= cp) {
                    continue;
                }
                let mut values = HashMap::from([(target_name(0), t1)]);
                let mut missing = false;
                for (i, other) in fetched.iter().enumerate().skip(1) {
                    let name = target_name(i);
                    let value = match alone.get(&name) {
                        Some(single) => single.as_ref().and_then(|s| s.value_at(ts)),
                        None => other
                            .iter()
                            .find(|s| s.name == series.name)
                            .and_then(|s| s.value_at(ts)),
                    };
                    match value {
                        Some(v) => {
                            values.insert(name, v);
                        }
                        None => missing = true,
                    }
                }
                let computed = if missing {
                    State::Nodata
                } else {
                    rule.state(&values, state.state)?
                };
                state.timestamp = state.timestamp.max(ts);
                state.values = values;
                ctx.apply(&series.name, &mut state, computed, ts, Some(t1), &mut muted);
            }

            if let Some(state) = ctx.expire(&series.name, state, now, &mut muted) {
                metrics.insert(series.name.clone(), state);
            }
        }

        for (name, state) in &data.metrics {
            if seen.contains(name) {
                continue;
            }
            let mut muted = false;
            if let Some(state) = ctx.expire(name, state.clone(), now, &mut muted) {
                metrics.insert(name.clone(), state);
            }
        }

        Ok(MetricsOutcome {
            metrics,
            relation,
            events: ctx.events,
        })
    }
}

/// `t1`, `t2`, ... for the target at `index`.
fn target_name(index: usize) -> String {
    format!("t{}", index + 1)
}

struct Context<'a> {
    trigger: &'a Trigger,
    suppressed_until: i64,
    events: Vec<NotificationEvent>,
}

impl Context<'_> {
    fn is_suppressed(&self, state: &MetricState, ts: i64) -> bool {
        let outside_schedule = self
            .trigger
            .schedule
            .as_ref()
            .is_some_and(|s| !s.is_allowed(ts));
        outside_schedule || state.maintenance >= ts || self.suppressed_until >= ts
    }

    /// Moves `state` to `new` at `ts`, emitting at most one event.
    fn apply(
        &mut self,
        metric: &str,
        state: &mut MetricState,
        new: State,
        ts: i64,
        value: Option<f64>,
        muted: &mut bool,
    ) {
        let old = state.state;
        if self.is_suppressed(state, ts) {
            if new != old {
                if !state.suppressed {
                    state.suppressed = true;
                    state.suppressed_state = Some(old);
                }
                state.state = new;
                state.event_timestamp = ts;
            }
            return;
        }

        if state.suppressed {
            let before = state.suppressed_state.take().unwrap_or(old);
            state.suppressed = false;
            state.state = new;
            if new != old {
                state.event_timestamp = ts;
            }
            if before != new {
                state.event_timestamp = ts;
                self.emit(metric, state, before, value, Some(SUPPRESSED_MESSAGE), muted);
            }
            return;
        }

        if new != old {
            state.state = new;
            state.event_timestamp = ts;
            self.emit(metric, state, old, value, None, muted);
        } else if matches!(new, State::Error | State::Nodata)
            && ts - state.event_timestamp >= REMIND_INTERVAL
        {
            state.event_timestamp = ts;
            self.emit(metric, state, old, value, Some(REMIND_MESSAGE), muted);
        }
    }

    /// Applies the TTL rule to a metric after its points were evaluated.
    /// Returns `None` when the metric must be dropped.
    fn expire(
        &mut self,
        metric: &str,
        mut state: MetricState,
        now: i64,
        muted: &mut bool,
    ) -> Option<MetricState> {
        let ttl = self.trigger.ttl;
        if ttl <= 0 || now - state.timestamp < ttl {
            return Some(state);
        }
        match self.trigger.ttl_state.to_metric_state() {
            None => {
                tracing::debug!(trigger_id = %self.trigger.id, metric, "Dropping metric without data");
                None
            }
            Some(ttl_state) => {
                self.apply(metric, &mut state, ttl_state, now, None, muted);
                Some(state)
            }
        }
    }

    fn emit(
        &mut self,
        metric: &str,
        state: &MetricState,
        old_state: State,
        value: Option<f64>,
        message: Option<&str>,
        muted: &mut bool,
    ) {
        if std::mem::take(muted) {
            tracing::debug!(trigger_id = %self.trigger.id, metric, "Muting first event of new metric");
            return;
        }
        let mut event = NotificationEvent::transition(
            &self.trigger.id,
            metric,
            old_state,
            state.state,
            state.event_timestamp,
        );
        event.value = value;
        event.values = state.values.clone();
        event.message = message.map(str::to_string);
        self.events.push(event);
    }
}
