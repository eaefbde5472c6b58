use crate::checker::{CheckOutcome, CheckSettings, TriggerChecker, REMIND_INTERVAL};
use crate::delay::DelaySet;
use crate::expression::{Env, Expression};
use crate::scheduler::{CheckResult, SchedulerSettings, TriggerScheduler};
use crate::series::Series;
use crate::source::{parse_render, LocalSource, MetricSource};
use crate::target::{patterns_of, Target};
use moira_common::state::{State, TtlState};
use moira_common::types::*;
use moira_storage::memory::MemoryDatabase;
use moira_storage::{counters, Database, DynDatabase};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Aligned on the 60 s grid.
const BASE: i64 = 6_000_000;

fn setup() -> DynDatabase {
    moira_common::id::init(1, 1);
    Arc::new(MemoryDatabase::new())
}

fn rising(id: &str, target: &str) -> Trigger {
    Trigger {
        id: id.to_string(),
        name: format!("{id} name"),
        desc: None,
        tags: vec!["web".to_string()],
        targets: vec![target.to_string()],
        warn_value: Some(60.0),
        error_value: Some(90.0),
        trigger_type: TriggerType::Rising,
        expression: None,
        ttl: 0,
        ttl_state: TtlState::Nodata,
        schedule: None,
        patterns: patterns_of(&[target.to_string()]).unwrap(),
        alone_metrics: HashMap::new(),
        mute_new_metrics: false,
        is_remote: false,
    }
}

fn checker(db: &DynDatabase) -> TriggerChecker {
    TriggerChecker::new(
        Arc::new(LocalSource::new(db.clone(), 0)),
        CheckSettings::default(),
    )
}

async fn feed(db: &DynDatabase, metric: &str, pattern: &str, value: f64, ts: i64) {
    db.save_metrics(&[MatchedMetric {
        metric: metric.to_string(),
        patterns: vec![pattern.to_string()],
        value,
        timestamp: ts,
        retention: 60,
        retention_timestamp: retention_timestamp(ts, 60),
    }])
    .await
    .unwrap();
}

fn transitions(outcome: &CheckOutcome) -> Vec<(State, State, i64)> {
    outcome
        .events
        .iter()
        .map(|e| (e.old_state, e.state, e.timestamp))
        .collect()
}

fn series(name: &str, values: &[Option<f64>]) -> Series {
    Series::new(name, BASE, 60, values.to_vec())
}

// --- target language ---

#[test]
fn target_parses_nested_functions() {
    let target = Target::parse("alias(sumSeries(a.*.rps, b.{x,y}.rps), \"total\")").unwrap();
    assert_eq!(
        target.patterns(),
        vec!["a.*.rps".to_string(), "b.{x,y}.rps".to_string()]
    );
    assert_eq!(
        target.to_string(),
        "alias(sumSeries(a.*.rps,b.{x,y}.rps),\"total\")"
    );
}

#[test]
fn target_keeps_series_by_tag_verbatim() {
    let text = "seriesByTag('name=cpu.load', 'dc=ams')";
    let target = Target::parse(&format!("scale({text}, 2)")).unwrap();
    assert_eq!(target.patterns(), vec![text.to_string()]);
}

#[test]
fn target_rejects_bad_input() {
    assert!(Target::parse("unknownFn(a.b)").is_err());
    assert!(Target::parse("sumSeries(a.b").is_err());
    assert!(Target::parse("a.{b,c").is_err());
    assert!(Target::parse("").is_err());
    assert!(patterns_of(&["a.b".to_string(), "bogus(a)".to_string()]).is_err());
}

#[test]
fn sum_and_diff_skip_gaps() {
    let mut resolved = HashMap::new();
    resolved.insert(
        "a.*".to_string(),
        vec![
            series("a.x", &[Some(1.0), None, Some(3.0)]),
            series("a.y", &[Some(10.0), None, None]),
        ],
    );
    let sum = Target::parse("sumSeries(a.*)")
        .unwrap()
        .evaluate(&resolved)
        .unwrap();
    assert_eq!(sum.len(), 1);
    assert_eq!(sum[0].name, "sumSeries(a.*)");
    assert_eq!(sum[0].values, vec![Some(11.0), None, Some(3.0)]);

    let diff = Target::parse("diffSeries(a.*)")
        .unwrap()
        .evaluate(&resolved)
        .unwrap();
    assert_eq!(diff[0].values, vec![Some(-9.0), None, Some(3.0)]);

    let avg = Target::parse("averageSeries(a.*)")
        .unwrap()
        .evaluate(&resolved)
        .unwrap();
    assert_eq!(avg[0].values, vec![Some(5.5), None, Some(3.0)]);
}

#[test]
fn per_series_functions_keep_one_series_each() {
    let mut resolved = HashMap::new();
    resolved.insert(
        "srv.*.cpu".to_string(),
        vec![
            series("srv.web1.cpu", &[Some(-2.0), None]),
            series("srv.web2.cpu", &[Some(4.0), Some(1.0)]),
        ],
    );
    let out = Target::parse("aliasByNode(scale(absolute(srv.*.cpu), 10), 1)")
        .unwrap()
        .evaluate(&resolved)
        .unwrap();
    let names: Vec<&str> = out.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["web1", "web2"]);
    assert_eq!(out[0].values, vec![Some(20.0), None]);

    let filled = Target::parse("transformNull(srv.*.cpu, -1)")
        .unwrap()
        .evaluate(&resolved)
        .unwrap();
    assert_eq!(filled[0].values, vec![Some(-2.0), Some(-1.0)]);

    let last = Target::parse("aliasByNode(srv.*.cpu, -1)")
        .unwrap()
        .evaluate(&resolved)
        .unwrap();
    assert_eq!(last[0].name, "cpu");
}

#[test]
fn series_lookup_by_timestamp() {
    let s = Series::empty("m", BASE + 1, BASE + 180, 60);
    assert_eq!(s.start, BASE + 60);
    assert_eq!(s.values.len(), 3);
    let s = series("m", &[Some(1.0), None, Some(3.0)]);
    assert_eq!(s.value_at(BASE + 130), Some(3.0));
    assert_eq!(s.value_at(BASE - 1), None);
    assert_eq!(s.last_point(), Some(BASE + 120));
}

// --- expression language ---

#[test]
fn expression_precedence_and_ternary() {
    let values = HashMap::from([("t1".to_string(), 5.0), ("t2".to_string(), 2.0)]);
    let env = Env {
        values: Some(&values),
        warn_value: Some(8.0),
        error_value: Some(12.0),
        prev_state: State::Ok,
    };
    let expr = Expression::parse(
        "t1 + t2 * 3 >= ERROR_VALUE ? ERROR : (t1 + t2 * 3 >= WARN_VALUE ? WARN : OK)",
    )
    .unwrap();
    assert_eq!(expr.eval_state(&env).unwrap(), State::Warn);

    let expr = Expression::parse("!(t1 > 1 && t2 > 1) || PREV_STATE == WARN ? NODATA : OK").unwrap();
    assert_eq!(expr.eval_state(&env).unwrap(), State::Ok);
    let warned = Env {
        prev_state: State::Warn,
        ..env.clone()
    };
    assert_eq!(expr.eval_state(&warned).unwrap(), State::Nodata);

    let expr = Expression::parse("t1 % 2 == 1 && -t2 < 0 ? ERROR : OK").unwrap();
    assert_eq!(expr.eval_state(&env).unwrap(), State::Error);
}

#[test]
fn expression_errors() {
    let values = HashMap::from([("t1".to_string(), 5.0)]);
    let env = Env {
        values: Some(&values),
        ..Default::default()
    };
    assert!(Expression::parse("t1 +").is_err());
    assert!(Expression::parse("t1 $ 2").is_err());
    assert!(Expression::parse("(t1 > 2 ? OK : WARN").is_err());
    assert!(Expression::parse("t1 * 2").unwrap().eval_state(&env).is_err());
    assert!(Expression::parse("t3 > 1 ? OK : WARN")
        .unwrap()
        .eval_state(&env)
        .is_err());
    assert!(Expression::parse("WARN_VALUE > 1 ? OK : WARN")
        .unwrap()
        .eval_state(&env)
        .is_err());
    assert!(Expression::parse("OK > 1 ? OK : WARN")
        .unwrap()
        .eval_state(&env)
        .is_err());
}

// --- checker ---

#[tokio::test]
async fn rising_trigger_walks_through_states() {
    let db = setup();
    let checker = checker(&db);
    let trigger = rising("t-rise", "app.*.load");
    let mut last = None;
    let mut all = Vec::new();
    for (i, value) in [10.0, 70.0, 95.0, 80.0, 40.0].into_iter().enumerate() {
        let ts = BASE + 60 * i as i64;
        feed(&db, "app.web.load", "app.*.load", value, ts).await;
        let outcome = checker.check(&trigger, last.take(), ts + 60).await;
        all.extend(transitions(&outcome));
        last = Some(outcome.check_data);
    }
    assert_eq!(
        all,
        vec![
            (State::Nodata, State::Ok, BASE),
            (State::Ok, State::Warn, BASE + 60),
            (State::Warn, State::Error, BASE + 120),
            (State::Error, State::Warn, BASE + 180),
            (State::Warn, State::Ok, BASE + 240),
        ]
    );
    let data = last.unwrap();
    assert_eq!(data.state, State::Ok);
    assert_eq!(data.metrics["app.web.load"].state, State::Ok);
    assert_eq!(data.metrics["app.web.load"].values["t1"], 40.0);
    assert_eq!(data.score, 0);
}

#[tokio::test]
async fn points_in_one_window_are_walked_in_order() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-batch", "app.*.load");
    trigger.ttl = 600;
    for (i, value) in [10.0, 70.0, 95.0, 80.0, 40.0].into_iter().enumerate() {
        feed(&db, "app.web.load", "app.*.load", value, BASE + 60 * i as i64).await;
    }
    let outcome = checker.check(&trigger, None, BASE + 300).await;
    let events = transitions(&outcome);
    assert_eq!(events.len(), 5);
    assert!(events.windows(2).all(|w| w[0].2 < w[1].2));
    let event = &outcome.events[1];
    assert_eq!(event.value, Some(70.0));
    assert_eq!(event.trigger_id, "t-batch");
    assert!(!event.is_trigger_event);
}

#[tokio::test]
async fn falling_trigger_mirrors_rising() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-fall", "disk.*.free");
    trigger.trigger_type = TriggerType::Falling;
    trigger.warn_value = Some(20.0);
    trigger.error_value = Some(5.0);
    feed(&db, "disk.sda.free", "disk.*.free", 10.0, BASE).await;
    let outcome = checker.check(&trigger, None, BASE + 60).await;
    assert_eq!(transitions(&outcome), vec![(State::Nodata, State::Warn, BASE)]);
}

#[tokio::test]
async fn silent_metric_goes_nodata_after_ttl() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-ttl", "app.*.load");
    trigger.ttl = 120;
    feed(&db, "app.web.load", "app.*.load", 5.0, BASE).await;

    let outcome = checker.check(&trigger, None, BASE + 130).await;
    assert_eq!(
        transitions(&outcome),
        vec![
            (State::Nodata, State::Ok, BASE),
            (State::Ok, State::Nodata, BASE + 130),
        ]
    );
    assert_eq!(outcome.check_data.metrics["app.web.load"].state, State::Nodata);

    let again = checker
        .check(&trigger, Some(outcome.check_data), BASE + 190)
        .await;
    assert!(again.events.is_empty());
}

#[tokio::test]
async fn del_ttl_state_drops_the_metric() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-del", "app.*.load");
    trigger.ttl = 120;
    trigger.ttl_state = TtlState::Del;
    feed(&db, "app.web.load", "app.*.load", 5.0, BASE).await;
    let outcome = checker.check(&trigger, None, BASE + 130).await;
    assert!(outcome.check_data.metrics.is_empty());
    assert_eq!(transitions(&outcome), vec![(State::Nodata, State::Ok, BASE)]);
}

#[tokio::test]
async fn trigger_without_metrics_goes_to_ttl_state() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-empty", "nothing.*");
    trigger.ttl = 120;
    let first = checker.check(&trigger, None, BASE).await;
    assert_eq!(first.check_data.state, State::Ok);
    assert!(first.events.is_empty());

    let later = checker
        .check(&trigger, Some(first.check_data), BASE + 180)
        .await;
    assert_eq!(later.check_data.state, State::Nodata);
    assert_eq!(later.events.len(), 1);
    assert!(later.events[0].is_trigger_event);
    assert_eq!(later.events[0].metric, "t-empty name");
}

#[tokio::test]
async fn new_metrics_can_be_muted() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-mute", "app.*.load");
    trigger.mute_new_metrics = true;
    trigger.ttl = 600;
    feed(&db, "app.web.load", "app.*.load", 10.0, BASE).await;
    feed(&db, "app.web.load", "app.*.load", 70.0, BASE + 60).await;
    let outcome = checker.check(&trigger, None, BASE + 120).await;
    assert_eq!(
        transitions(&outcome),
        vec![(State::Ok, State::Warn, BASE + 60)]
    );
}

#[tokio::test]
async fn alone_target_is_shared_across_metrics() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-alone", "app.*.rps");
    trigger.targets.push("limits.rps".to_string());
    trigger.patterns = patterns_of(&trigger.targets).unwrap();
    trigger.trigger_type = TriggerType::Expression;
    trigger.expression = Some("t1 > t2 ? ERROR : OK".to_string());
    trigger.alone_metrics.insert("t2".to_string(), true);

    feed(&db, "app.a.rps", "app.*.rps", 5.0, BASE).await;
    feed(&db, "app.b.rps", "app.*.rps", 15.0, BASE).await;
    feed(&db, "limits.rps", "limits.rps", 10.0, BASE).await;

    let outcome = checker.check(&trigger, None, BASE + 60).await;
    let data = &outcome.check_data;
    assert_eq!(data.metrics["app.a.rps"].state, State::Ok);
    assert_eq!(data.metrics["app.b.rps"].state, State::Error);
    assert_eq!(data.metrics["app.b.rps"].values["t2"], 10.0);
    assert_eq!(data.metrics_to_target_relation["t2"], "limits.rps");
    assert_eq!(outcome.events.len(), 2);
}

#[tokio::test]
async fn missing_secondary_value_means_nodata() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-pair", "app.*.rps");
    trigger.targets.push("other.*.rps".to_string());
    trigger.patterns = patterns_of(&trigger.targets).unwrap();
    feed(&db, "app.a.rps", "app.*.rps", 95.0, BASE).await;
    feed(&db, "other.a.rps", "other.*.rps", 1.0, BASE).await;

    let outcome = checker.check(&trigger, None, BASE + 60).await;
    assert_eq!(outcome.check_data.metrics["app.a.rps"].state, State::Nodata);
    assert!(outcome.events.is_empty());
}

#[tokio::test]
async fn failures_raise_trigger_exception_and_recover() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-broken", "app.*.rps");
    trigger.trigger_type = TriggerType::Expression;
    trigger.expression = Some("t1 * 2".to_string());
    feed(&db, "app.a.rps", "app.*.rps", 5.0, BASE).await;

    let broken = checker.check(&trigger, None, BASE + 60).await;
    assert_eq!(broken.check_data.state, State::Exception);
    assert!(broken.check_data.message.is_some());
    assert!(broken.check_data.metrics.is_empty());
    assert_eq!(broken.events.len(), 1);
    let event = &broken.events[0];
    assert!(event.is_trigger_event);
    assert_eq!((event.old_state, event.state), (State::Ok, State::Exception));
    assert_eq!(broken.check_data.score, State::Exception.score());

    trigger.expression = Some("t1 > 10 ? ERROR : OK".to_string());
    let fixed = checker
        .check(&trigger, Some(broken.check_data), BASE + 120)
        .await;
    assert_eq!(fixed.check_data.state, State::Ok);
    assert!(fixed.check_data.message.is_none());
    assert!(fixed
        .events
        .iter()
        .any(|e| e.is_trigger_event && e.old_state == State::Exception && e.state == State::Ok));
}

#[tokio::test]
async fn too_many_series_for_alone_target_is_an_exception() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-many", "app.a.rps");
    trigger.targets.push("app.*.limit".to_string());
    trigger.patterns = patterns_of(&trigger.targets).unwrap();
    trigger.alone_metrics.insert("t2".to_string(), true);
    feed(&db, "app.a.rps", "app.a.rps", 1.0, BASE).await;
    feed(&db, "app.a.limit", "app.*.limit", 1.0, BASE).await;
    feed(&db, "app.b.limit", "app.*.limit", 1.0, BASE).await;

    let outcome = checker.check(&trigger, None, BASE + 60).await;
    assert_eq!(outcome.check_data.state, State::Exception);
    assert!(outcome.check_data.message.unwrap().contains("t2"));
}

#[tokio::test]
async fn maintenance_suppresses_then_summarises() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-maint", "app.*.load");
    trigger.ttl = 600;
    let mut last = CheckData {
        timestamp: BASE,
        event_timestamp: BASE,
        last_successful_check_timestamp: BASE,
        ..Default::default()
    };
    last.metrics.insert(
        "app.web.load".to_string(),
        MetricState {
            state: State::Ok,
            timestamp: BASE,
            event_timestamp: BASE,
            maintenance: BASE + 120,
            ..Default::default()
        },
    );

    feed(&db, "app.web.load", "app.*.load", 95.0, BASE + 60).await;
    let quiet = checker.check(&trigger, Some(last), BASE + 120).await;
    assert!(quiet.events.is_empty());
    let metric = &quiet.check_data.metrics["app.web.load"];
    assert_eq!(metric.state, State::Error);
    assert!(metric.suppressed);
    assert_eq!(metric.suppressed_state, Some(State::Ok));

    feed(&db, "app.web.load", "app.*.load", 95.0, BASE + 180).await;
    let loud = checker
        .check(&trigger, Some(quiet.check_data), BASE + 240)
        .await;
    assert_eq!(
        transitions(&loud),
        vec![(State::Ok, State::Error, BASE + 180)]
    );
    assert!(loud.events[0].message.is_some());
    assert!(!loud.check_data.metrics["app.web.load"].suppressed);
}

#[tokio::test]
async fn bad_state_is_reminded_daily() {
    let db = setup();
    let checker = checker(&db);
    let trigger = rising("t-remind", "app.*.load");
    let mut last = CheckData::default();
    last.metrics.insert(
        "app.web.load".to_string(),
        MetricState {
            state: State::Error,
            timestamp: BASE,
            event_timestamp: BASE,
            ..Default::default()
        },
    );
    let ts = BASE + REMIND_INTERVAL + 60;
    feed(&db, "app.web.load", "app.*.load", 95.0, ts).await;
    let outcome = checker.check(&trigger, Some(last), ts + 60).await;
    assert_eq!(transitions(&outcome), vec![(State::Error, State::Error, ts)]);
    assert_eq!(
        outcome.check_data.metrics["app.web.load"].event_timestamp,
        ts
    );
}

#[tokio::test]
async fn event_timestamps_never_go_backwards() {
    let db = setup();
    let checker = checker(&db);
    let mut trigger = rising("t-mono", "app.*.load");
    trigger.ttl = 180;
    let values = [10.0, 95.0, 95.0, 65.0, 10.0, 99.0, 61.0, 61.0, 5.0, 91.0];
    let mut last = None;
    let mut stamps = Vec::new();
    for (i, value) in values.into_iter().enumerate() {
        let ts = BASE + 60 * i as i64;
        if i % 4 != 3 {
            feed(&db, "app.web.load", "app.*.load", value, ts).await;
        }
        let outcome = checker.check(&trigger, last.take(), ts + 60).await;
        stamps.extend(outcome.events.iter().map(|e| e.timestamp));
        last = Some(outcome.check_data);
    }
    assert!(!stamps.is_empty());
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{stamps:?}");
}

// --- scheduler ---

fn scheduler(db: &DynDatabase) -> TriggerScheduler {
    TriggerScheduler::new(
        db.clone(),
        Arc::new(checker(db)),
        false,
        SchedulerSettings::default(),
    )
}

#[tokio::test]
async fn scheduler_commits_check_and_events() {
    let db = setup();
    let trigger = rising("t-sched", "app.*.load");
    db.save_trigger(&trigger).await.unwrap();
    feed(&db, "app.web.load", "app.*.load", 95.0, BASE).await;

    let result = scheduler(&db).check_trigger("t-sched", BASE + 60).await.unwrap();
    assert_eq!(result, CheckResult::Done(BASE + 120));

    let data = db.get_trigger_last_check("t-sched").await.unwrap().unwrap();
    assert_eq!(data.metrics["app.web.load"].state, State::Error);
    let event = db
        .fetch_notification_event(Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.state, State::Error);
    assert_eq!(db.get_counter(counters::LOCAL_CHECKS).await.unwrap(), 1);
}

#[tokio::test]
async fn scheduler_skips_locked_and_missing_triggers() {
    let db = setup();
    let trigger = rising("t-locked", "app.*.load");
    db.save_trigger(&trigger).await.unwrap();
    assert!(db
        .acquire_lock("trigger-check:t-locked", "someone-else", Duration::from_secs(30))
        .await
        .unwrap());

    let scheduler = scheduler(&db);
    assert_eq!(
        scheduler.check_trigger("t-locked", BASE).await.unwrap(),
        CheckResult::Busy
    );
    assert_eq!(
        scheduler.check_trigger("t-gone", BASE).await.unwrap(),
        CheckResult::Missing
    );

    let mut remote = rising("t-remote", "app.*.load");
    remote.is_remote = true;
    db.save_trigger(&remote).await.unwrap();
    assert_eq!(
        scheduler.check_trigger("t-remote", BASE).await.unwrap(),
        CheckResult::Missing
    );
    assert!(db.get_trigger_last_check("t-locked").await.unwrap().is_none());
}

/// Local source that takes its time, like a loaded remote Graphite.
struct SlowSource {
    inner: LocalSource,
    delay: Duration,
}

#[async_trait::async_trait]
impl MetricSource for SlowSource {
    async fn fetch(&self, target: &str, from: i64, until: i64) -> crate::Result<Vec<Series>> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(target, from, until).await
    }
}

#[tokio::test]
async fn slow_check_keeps_its_lock_and_commits() {
    let db = setup();
    db.save_trigger(&rising("slow", "app.*.load")).await.unwrap();
    feed(&db, "app.web.load", "app.*.load", 95.0, BASE).await;

    let source = SlowSource {
        inner: LocalSource::new(db.clone(), 0),
        delay: Duration::from_millis(1500),
    };
    let scheduler = Arc::new(TriggerScheduler::new(
        db.clone(),
        Arc::new(TriggerChecker::new(Arc::new(source), CheckSettings::default())),
        false,
        SchedulerSettings {
            lock_ttl: Duration::from_millis(300),
            ..Default::default()
        },
    ));

    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.check_trigger("slow", BASE + 60).await })
    };
    // Well past one TTL: the lock is still held by the running check.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!db
        .acquire_lock("trigger-check:slow", "someone-else", Duration::from_secs(30))
        .await
        .unwrap());

    let result = running.await.unwrap().unwrap();
    assert_eq!(result, CheckResult::Done(BASE + 120));
    let data = db.get_trigger_last_check("slow").await.unwrap().unwrap();
    assert_eq!(data.metrics["app.web.load"].state, State::Error);
    assert!(db
        .acquire_lock("trigger-check:slow", "someone-else", Duration::from_secs(30))
        .await
        .unwrap());
}

#[test]
fn delay_set_orders_by_due_time() {
    let mut set = DelaySet::new();
    set.schedule("c", 30);
    set.schedule("a", 10);
    set.schedule("b", 20);
    assert_eq!(set.pop_ready(5, 10), Vec::<String>::new());
    assert_eq!(set.pop_ready(20, 10), vec!["a".to_string(), "b".to_string()]);

    set.schedule_earlier("c", 40);
    set.schedule_earlier("d", 25);
    assert_eq!(set.len(), 2);
    assert_eq!(set.pop_ready(30, 1), vec!["d".to_string()]);

    set.schedule("c", 100);
    assert!(set.pop_ready(50, 10).is_empty());
    assert!(set.remove("c"));
    assert!(set.is_empty());
}

#[test]
fn delay_set_pops_each_id_once() {
    let mut set = DelaySet::new();
    for i in 0..50 {
        set.schedule(&format!("t{i}"), 7);
    }
    set.schedule("t3", 7);
    let mut popped = set.pop_ready(7, 100);
    assert_eq!(popped.len(), 50);
    popped.sort();
    popped.dedup();
    assert_eq!(popped.len(), 50);
}

#[test]
fn render_response_is_decoded() {
    let body = br#"[{"target":"web.rps","datapoints":[[1.5,600],[null,660],[3,720]]},
                    {"target":"empty","datapoints":[]}]"#;
    let series = parse_render(body).unwrap();
    assert_eq!(series.len(), 2);
    assert_eq!(series[0].name, "web.rps");
    assert_eq!(series[0].start, 600);
    assert_eq!(series[0].step, 60);
    assert_eq!(series[0].values, vec![Some(1.5), None, Some(3.0)]);
    assert!(series[1].values.is_empty());
    assert!(parse_render(b"{not json").is_err());
}
