use crate::schedule::{Schedule, ScheduleDay};
use crate::state::{NotifierState, SelfState, State, StateActor, TtlState};
use crate::types::*;
use std::collections::{BTreeMap, HashMap};

fn subscription() -> Subscription {
    Subscription {
        id: "sub-1".into(),
        user: Some("alice".into()),
        team_id: None,
        contacts: vec!["c1".into()],
        tags: vec!["db".into()],
        any_tags: false,
        enabled: true,
        throttling: false,
        ignore_warnings: false,
        ignore_recoverings: false,
        schedule: None,
        plotting: false,
    }
}

fn trigger() -> Trigger {
    Trigger {
        id: "t1".into(),
        name: "cpu".into(),
        desc: None,
        tags: vec!["db".into()],
        targets: vec!["cpu.*".into()],
        warn_value: Some(10.0),
        error_value: Some(20.0),
        trigger_type: TriggerType::Rising,
        expression: None,
        ttl: 600,
        ttl_state: TtlState::Nodata,
        schedule: None,
        patterns: vec!["cpu.*".into()],
        alone_metrics: HashMap::new(),
        mute_new_metrics: false,
        is_remote: false,
    }
}

#[test]
fn state_ordering_and_aggregation() {
    assert!(State::Ok.rank() < State::Warn.rank());
    assert!(State::Warn.rank() < State::Nodata.rank());
    assert!(State::Nodata.rank() < State::Error.rank());
    assert!(State::Error.rank() < State::Exception.rank());
    assert_eq!(State::Test.rank(), None);

    assert_eq!(State::aggregate([State::Test]), State::Ok);
    assert_eq!(
        State::aggregate([State::Warn, State::Error, State::Nodata]),
        State::Error
    );
}

#[test]
fn state_parse_and_display() {
    for s in ["OK", "WARN", "NODATA", "ERROR", "EXCEPTION", "TEST"] {
        let parsed: State = s.parse().unwrap();
        assert_eq!(parsed.to_string(), s);
    }
    assert_eq!("warning".parse::<State>().unwrap(), State::Warn);
    assert!("bogus".parse::<State>().is_err());

    let json = serde_json::to_string(&State::Nodata).unwrap();
    assert_eq!(json, "\"NODATA\"");
}

#[test]
fn ttl_state_mapping() {
    assert_eq!(TtlState::Del.to_metric_state(), None);
    assert_eq!(TtlState::Del.to_trigger_state(), State::Ok);
    assert_eq!(TtlState::Error.to_metric_state(), Some(State::Error));
    assert_eq!(TtlState::default(), TtlState::Nodata);
}

#[test]
fn manual_error_blocks_auto_recovery() {
    let manual = NotifierState {
        state: SelfState::Error,
        actor: StateActor::Manual,
    };
    assert!(!manual.accepts(SelfState::Ok, StateActor::Auto));
    assert!(manual.accepts(SelfState::Ok, StateActor::Manual));

    let auto = NotifierState {
        state: SelfState::Error,
        actor: StateActor::Auto,
    };
    assert!(auto.accepts(SelfState::Ok, StateActor::Auto));
}

#[test]
fn schedule_days_and_timezone() {
    // 1970-01-01 was a Thursday.
    let mut schedule = Schedule::default();
    assert!(schedule.is_allowed(0));

    schedule.days = schedule
        .days
        .iter()
        .map(|d| ScheduleDay {
            name: d.name.clone(),
            enabled: d.name != "Thu",
        })
        .collect();
    assert!(!schedule.is_allowed(3600));
    assert!(schedule.is_allowed(86_400 + 3600));

    // UTC+3: 22:00 UTC Thursday is 01:00 local Friday.
    schedule.tz_offset = -180;
    assert!(schedule.is_allowed(22 * 3600));
}

#[test]
fn schedule_overnight_window_and_next_allowed() {
    let schedule = Schedule {
        start_offset: 22 * 60,
        end_offset: 6 * 60,
        ..Default::default()
    };
    assert!(schedule.is_allowed(23 * 3600));
    assert!(schedule.is_allowed(3 * 3600));
    assert!(!schedule.is_allowed(12 * 3600));

    assert_eq!(schedule.next_allowed(12 * 3600), Some(22 * 3600));
    assert_eq!(schedule.next_allowed(3 * 3600), Some(3 * 3600));

    let closed = Schedule {
        days: Vec::new(),
        ..Default::default()
    };
    assert_eq!(closed.next_allowed(0), None);
}

#[test]
fn metric_point_names() {
    let mut labels = BTreeMap::new();
    labels.insert("host".to_string(), "a".to_string());
    let point = MetricPoint {
        name: "cpu.user".into(),
        labels,
        value: 1.5,
        timestamp: 100,
    };
    assert_eq!(point.full_name(), "cpu.user;host=a");
    assert_eq!(point.label("name"), Some("cpu.user"));
    assert_eq!(point.label("host"), Some("a"));
    assert_eq!(point.label("dc"), None);
    assert_eq!(point.to_line(), "cpu.user;host=a 1.5 100");
}

#[test]
fn matched_metric_rounds_to_retention() {
    let point = MetricPoint {
        name: "m".into(),
        labels: BTreeMap::new(),
        value: 1.0,
        timestamp: 1_000_031,
    };
    let matched = MatchedMetric::new(&point, vec!["m".into()], 60);
    assert_eq!(matched.retention_timestamp, 1_000_020);
    assert_eq!(retention_timestamp(29, 60), 0);
    assert_eq!(retention_timestamp(30, 60), 60);
    assert_eq!(retention_timestamp(5, 0), 5);
}

#[test]
fn trigger_validation() {
    assert!(trigger().validate().is_ok());

    let mut no_thresholds = trigger();
    no_thresholds.warn_value = None;
    no_thresholds.error_value = None;
    assert!(no_thresholds.validate().is_err());

    let mut expr = trigger();
    expr.trigger_type = TriggerType::Expression;
    expr.expression = Some("  ".into());
    assert!(expr.validate().is_err());
    expr.expression = Some("t1 > 10 ? ERROR : OK".into());
    assert!(expr.validate().is_ok());

    let mut no_targets = trigger();
    no_targets.targets.clear();
    assert!(no_targets.validate().is_err());
}

#[test]
fn trigger_deserializes_with_defaults() {
    let json = r#"{"id":"t9","name":"n","targets":["a.b"],"warn_value":1}"#;
    let t: Trigger = serde_json::from_str(json).unwrap();
    assert_eq!(t.trigger_type, TriggerType::Rising);
    assert_eq!(t.ttl_state, TtlState::Nodata);
    assert!(!t.is_alone("t2"));
    assert_eq!(t.to_data().id, "t9");
}

#[test]
fn subscription_owner_is_exclusive() {
    assert!(subscription().validate().is_ok());

    let mut both = subscription();
    both.team_id = Some("ops".into());
    assert!(both.validate().is_err());

    let mut neither = subscription();
    neither.user = None;
    assert!(neither.validate().is_err());
}

#[test]
fn subscription_ignore_rules() {
    let warn = NotificationEvent::transition("t1", "m", State::Ok, State::Warn, 0);
    let warn_recovery = NotificationEvent::transition("t1", "m", State::Warn, State::Ok, 0);
    let error_recovery = NotificationEvent::transition("t1", "m", State::Error, State::Ok, 0);
    let error = NotificationEvent::transition("t1", "m", State::Ok, State::Error, 0);

    let mut sub = subscription();
    sub.ignore_warnings = true;
    assert!(sub.must_ignore(&warn));
    assert!(sub.must_ignore(&warn_recovery));
    assert!(!sub.must_ignore(&error_recovery));
    assert!(!sub.must_ignore(&error));

    let mut sub = subscription();
    sub.ignore_recoverings = true;
    assert!(!sub.must_ignore(&warn));
    assert!(sub.must_ignore(&warn_recovery));
    assert!(sub.must_ignore(&error_recovery));
    assert!(!sub.must_ignore(&error));
}

#[test]
fn subscription_defaults_to_enabled() {
    let sub: Subscription =
        serde_json::from_str(r#"{"id":"s","team_id":"ops","tags":["x"]}"#).unwrap();
    assert!(sub.enabled);
    assert!(sub.schedule_allows(12_345));
}

#[test]
fn fingerprint_depends_on_transition_only() {
    let a = NotificationEvent::transition("t1", "m", State::Ok, State::Error, 1);
    let mut b = a.clone();
    b.timestamp = 99;
    b.value = Some(3.0);
    assert_eq!(a.fingerprint(), b.fingerprint());

    let c = NotificationEvent::transition("t1", "m", State::Warn, State::Error, 1);
    assert_ne!(a.fingerprint(), c.fingerprint());
    assert_eq!(a.fingerprint().len(), 32);
}

#[test]
fn check_data_score_and_aggregate() {
    let mut data = CheckData::default();
    data.metrics.insert(
        "a".into(),
        MetricState {
            state: State::Error,
            ..Default::default()
        },
    );
    data.metrics.insert(
        "b".into(),
        MetricState {
            state: State::Warn,
            ..Default::default()
        },
    );
    data.update_score();
    assert_eq!(data.score, 101);
    assert_eq!(data.aggregated_state(), State::Error);
}

#[test]
fn metric_state_check_point() {
    let state = MetricState {
        timestamp: 1000,
        event_timestamp: 500,
        ..Default::default()
    };
    assert_eq!(state.check_point(120), 880);
    assert_eq!(state.check_point(600), 500);
}

#[test]
fn package_keys_group_by_contact_and_trigger() {
    let contact = Contact {
        id: "c1".into(),
        contact_type: "webhook".into(),
        value: "http://x".into(),
        user: None,
        team_id: None,
    };
    let notification = ScheduledNotification {
        event: NotificationEvent::transition("t1", "m", State::Ok, State::Error, 1),
        trigger: trigger().to_data(),
        contact: contact.clone(),
        plotting: false,
        throttled: false,
        send_fail: 0,
        timestamp: 1,
        created_at: 1,
    };
    assert_eq!(notification.package_key(), "webhook:http://x:t1");
    assert!(notification.dedup_key().starts_with("webhook:http://x:t1:"));

    let package = NotificationPackage {
        events: vec![notification.event.clone()],
        trigger: notification.trigger.clone(),
        contact,
        plotting: false,
        throttled: false,
        fail_count: 0,
        dont_resend: false,
    };
    assert_eq!(package.key(), notification.package_key());
    assert_eq!(package.worst_state(), State::Error);
    assert!(!package.is_test());
}

#[test]
fn contact_type_field_is_renamed() {
    let c: Contact =
        serde_json::from_str(r#"{"id":"c","type":"mail","value":"a@b.c"}"#).unwrap();
    assert_eq!(c.contact_type, "mail");
}
