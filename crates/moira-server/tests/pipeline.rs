mod common;

use common::{
    any_tags_subscription, contact, memory_db, quiet_config, rising_trigger, senders_with,
    states, wait_for, RecordingSender, BASE,
};
use moira_checker::{CheckResult, CheckSettings, LocalSource, TriggerChecker, TriggerScheduler};
use moira_common::state::State;
use moira_filter::listener::LineHandler;
use moira_filter::{
    FilterSettings, FilterStats, MetricFilter, PatternStorage, RegexTreatment, RetentionConfig,
};
use moira_notifier::{Dispatcher, EventWorker, NotifierSettings};
use moira_server::app;
use moira_storage::DynDatabase;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

async fn stored_points(db: &DynDatabase, metric: &str) -> usize {
    db.get_metrics_values(&[metric.to_string()], 0, i64::MAX)
        .await
        .unwrap()
        .get(metric)
        .map_or(0, Vec::len)
}

async fn drain_events(db: &DynDatabase, worker: &EventWorker, now: i64) -> usize {
    let mut scheduled = 0;
    while let Some(event) = db
        .fetch_notification_event(Duration::from_millis(10))
        .await
        .unwrap()
    {
        scheduled += worker.process_event(&event, now).await.unwrap();
    }
    scheduled
}

#[tokio::test]
async fn rising_trigger_flows_from_line_to_delivery() {
    let db = memory_db();
    let trigger = rising_trigger("t-rise", "app.*.load", &["web"]);
    db.save_trigger(&trigger).await.unwrap();
    db.save_subscription(&any_tags_subscription("s1", &["c1"]))
        .await
        .unwrap();
    db.save_contact(&contact("c1", "ops@example.com")).await.unwrap();

    let cancel = CancellationToken::new();
    let patterns = Arc::new(PatternStorage::new(db.clone(), RegexTreatment::Strict, 100));
    assert_eq!(patterns.refresh().await.unwrap(), 1);
    let (filter, workers) = MetricFilter::spawn(
        db.clone(),
        patterns,
        Arc::new(RetentionConfig::default()),
        FilterSettings {
            workers: 2,
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        },
        Arc::new(FilterStats::default()),
        cancel.clone(),
    );
    let handler = LineHandler::new(filter, 4096);

    let checker = Arc::new(TriggerChecker::new(
        Arc::new(LocalSource::new(db.clone(), 0)),
        CheckSettings::default(),
    ));
    let scheduler = TriggerScheduler::new(db.clone(), checker, false, Default::default());

    for (i, value) in [10, 70, 95, 80, 40].into_iter().enumerate() {
        let ts = BASE + 60 * i as i64;
        let line = format!("app.web.load {value} {ts}");
        assert!(handler.handle_line(line.as_bytes()).await);
        wait_for("point to be stored", || async {
            stored_points(&db, "app.web.load").await == i + 1
        })
        .await;
        let result = scheduler.check_trigger("t-rise", ts + 60).await.unwrap();
        assert_eq!(result, CheckResult::Done(ts + 120));
    }

    let worker = EventWorker::new(db.clone(), Duration::from_millis(10));
    let now = BASE + 300;
    assert_eq!(drain_events(&db, &worker, now).await, 5);

    let sender = Arc::new(RecordingSender::default());
    let dispatcher = Dispatcher::new(
        db.clone(),
        senders_with(sender.clone()),
        NotifierSettings::default(),
    );
    let report = dispatcher.dispatch_once(now).await.unwrap();
    assert_eq!(report.fetched, 5);
    assert_eq!(report.sent, 1);

    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].trigger.id, "t-rise");
    assert_eq!(sent[0].contact.value, "ops@example.com");
    assert_eq!(
        states(&sent[0]),
        vec![
            (State::Nodata, State::Ok),
            (State::Ok, State::Warn),
            (State::Warn, State::Error),
            (State::Error, State::Warn),
            (State::Warn, State::Ok),
        ]
    );
    let history = db.get_notification_history("c1", 10).await.unwrap();
    assert_eq!(history.len(), 1);

    cancel.cancel();
    for handle in workers {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn ignored_warning_schedules_nothing() {
    let db = memory_db();
    let trigger = rising_trigger("t-warn", "app.*.load", &["web"]);
    db.save_trigger(&trigger).await.unwrap();
    let mut subscription = any_tags_subscription("s1", &["c1"]);
    subscription.ignore_warnings = true;
    db.save_subscription(&subscription).await.unwrap();
    db.save_contact(&contact("c1", "ops@example.com")).await.unwrap();

    let checker = Arc::new(TriggerChecker::new(
        Arc::new(LocalSource::new(db.clone(), 0)),
        CheckSettings::default(),
    ));
    let scheduler = TriggerScheduler::new(db.clone(), checker, false, Default::default());
    let worker = EventWorker::new(db.clone(), Duration::from_millis(10));

    let feed = |value: f64, ts: i64| {
        let db = db.clone();
        async move {
            db.save_metrics(&[moira_common::types::MatchedMetric {
                metric: "app.web.load".to_string(),
                patterns: vec!["app.*.load".to_string()],
                value,
                timestamp: ts,
                retention: 60,
                retention_timestamp: ts,
            }])
            .await
            .unwrap();
        }
    };

    feed(10.0, BASE).await;
    scheduler.check_trigger("t-warn", BASE + 60).await.unwrap();
    assert_eq!(drain_events(&db, &worker, BASE + 60).await, 1);

    feed(70.0, BASE + 60).await;
    scheduler.check_trigger("t-warn", BASE + 120).await.unwrap();
    assert_eq!(drain_events(&db, &worker, BASE + 120).await, 0);
    assert_eq!(db.get_notifications().await.unwrap().len(), 1);
}

#[tokio::test]
async fn started_filter_accepts_tcp_lines() {
    let db = memory_db();
    db.save_trigger(&rising_trigger("t-tcp", "app.*.load", &["web"]))
        .await
        .unwrap();

    let mut config = quiet_config();
    config.filter.enabled = true;
    let cancel = CancellationToken::new();
    let running = app::start(
        &config,
        db.clone(),
        senders_with(Arc::new(RecordingSender::default())),
        cancel.clone(),
    )
    .await
    .unwrap();
    let addr = running.tcp_addr.expect("filter should listen on tcp");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("app.web.load 12 {BASE}\napp.db.load 7 {BASE}\nignored.metric 1 {BASE}\n").as_bytes())
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    wait_for("tcp points to be stored", || async {
        stored_points(&db, "app.web.load").await == 1 && stored_points(&db, "app.db.load").await == 1
    })
    .await;
    assert_eq!(stored_points(&db, "ignored.metric").await, 0);
    let mut metrics = db.get_pattern_metrics("app.*.load").await.unwrap();
    metrics.sort();
    assert_eq!(metrics, vec!["app.db.load", "app.web.load"]);

    cancel.cancel();
    assert!(app::wait_stopped(running.handles, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn disabled_stages_start_nothing() {
    let running = app::start(
        &quiet_config(),
        memory_db(),
        senders_with(Arc::new(RecordingSender::default())),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(running.handles.is_empty());
    assert!(running.tcp_addr.is_none());
}
