use crate::filter::{FilterSettings, MetricFilter};
use crate::index::tags::{parse_series_by_tag, RegexTreatment, TagOp};
use crate::index::tree::expand_braces;
use crate::index::{MatcherCache, PatternIndex};
use crate::line::parse_line;
use crate::listener::{serve_tcp, serve_udp, LineHandler};
use crate::patterns::PatternStorage;
use crate::retention::{parse_duration, RetentionConfig};
use crate::stats::FilterStats;
use moira_common::types::{MetricPoint, Trigger, TriggerType};
use moira_storage::memory::MemoryDatabase;
use moira_storage::{counters, Database, DynDatabase};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

fn point(name: &str, labels: &[(&str, &str)]) -> MetricPoint {
    MetricPoint {
        name: name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        value: 1.0,
        timestamp: 0,
    }
}

fn build(patterns: &[&str], treatment: RegexTreatment) -> PatternIndex {
    let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
    PatternIndex::build(&patterns, &mut MatcherCache::new(16), treatment)
}

fn trigger_with(id: &str, patterns: &[&str]) -> Trigger {
    Trigger {
        id: id.to_string(),
        name: id.to_string(),
        desc: None,
        tags: Vec::new(),
        targets: patterns.iter().map(|p| p.to_string()).collect(),
        warn_value: Some(1.0),
        error_value: None,
        trigger_type: TriggerType::Rising,
        expression: None,
        ttl: 0,
        ttl_state: Default::default(),
        schedule: None,
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        alone_metrics: HashMap::new(),
        mute_new_metrics: false,
        is_remote: false,
    }
}

#[test]
fn parse_plain_and_tagged_lines() {
    let p = parse_line(b"a.b.c 12.5 1500000000", 0).unwrap();
    assert_eq!(p.name, "a.b.c");
    assert!(p.labels.is_empty());
    assert_eq!(p.value, 12.5);
    assert_eq!(p.timestamp, 1_500_000_000);

    let p = parse_line(b"cpu;dc=ams;host=web1 -3e2 1500000000.75", 0).unwrap();
    assert_eq!(p.label("dc"), Some("ams"));
    assert_eq!(p.value, -300.0);
    assert_eq!(p.timestamp, 1_500_000_000);

    let p = parse_line(b"a 1 -1", 777).unwrap();
    assert_eq!(p.timestamp, 777);
}

#[test]
fn parse_rejects_malformed_lines() {
    for bad in [
        &b""[..],
        b"a.b 1",
        b"a.b 1 2 3",
        b"a.b  1 2",
        b" 1 2",
        b"a.b x 2",
        b"a.b 1 y",
        b"a.b NaN 2",
        b"a.b inf 2",
        b"a.b 1 2\r",
        b"a\tb 1 2",
        b"a;dc 1 2",
        b"a;=x 1 2",
        b"a;dc= 1 2",
        b";dc=x 1 2",
        b"a;name=x 1 2",
        "a\u{e9} 1 2".as_bytes(),
    ] {
        assert!(
            parse_line(bad, 0).is_err(),
            "should reject {:?}",
            String::from_utf8_lossy(bad)
        );
    }
}

#[test]
fn reserialised_line_is_canonical() {
    let p = parse_line(b"m;z=1;a=2 1.5 10", 0).unwrap();
    assert_eq!(p.to_line(), "m;a=2;z=1 1.5 10");
    let again = parse_line(p.to_line().as_bytes(), 0).unwrap();
    assert_eq!(again, p);
}

#[test]
fn retention_sections_first_match_wins() {
    let config = RetentionConfig::parse(
        "# comment\n[carbon]\npattern = ^carbon\\.\nretentions = 10s:6h,1m:7d\n\n\
         [hourly]\npattern = \\.hourly$\nretentions = 1h:1y\n\n\
         [catchall]\npattern = .*\nretentions = 2min:1d\nxFilesFactor = 0.5\n",
    )
    .unwrap();
    assert_eq!(config.sections.len(), 3);
    assert_eq!(config.resolve("carbon.agents.x"), 10);
    assert_eq!(config.resolve("app.hourly"), 3600);
    assert_eq!(config.resolve("anything"), 120);
    assert_eq!(RetentionConfig::default().resolve("x"), 60);
}

#[test]
fn retention_config_errors() {
    assert!(RetentionConfig::parse("[a]\nretentions = 1m:1d\n").is_err());
    assert!(RetentionConfig::parse("[a]\npattern = .*\n").is_err());
    assert!(RetentionConfig::parse("[a]\npattern = (\nretentions = 1m:1d\n").is_err());
    assert!(RetentionConfig::parse("pattern = .*\n").is_err());
    assert!(RetentionConfig::parse("[a]\npattern = .*\nretentions = 1q:1d\n").is_err());
}

#[test]
fn retention_units() {
    assert_eq!(parse_duration("60"), Ok(60));
    assert_eq!(parse_duration("10s"), Ok(10));
    assert_eq!(parse_duration("5m"), Ok(300));
    assert_eq!(parse_duration("5min"), Ok(300));
    assert_eq!(parse_duration("2h"), Ok(7200));
    assert_eq!(parse_duration("1d"), Ok(86_400));
    assert_eq!(parse_duration("1w"), Ok(604_800));
    assert_eq!(parse_duration("1y"), Ok(31_536_000));
    assert!(parse_duration("m").is_err());
}

#[test]
fn brace_expansion() {
    assert_eq!(expand_braces("a{b,c}d").unwrap(), vec!["abd", "acd"]);
    assert_eq!(
        expand_braces("{x,y}{1,2}").unwrap(),
        vec!["x1", "x2", "y1", "y2"]
    );
    assert_eq!(expand_braces("a{b,{c,d}}").unwrap(), vec!["ab", "ac", "ad"]);
    assert!(expand_braces("a{b").is_err());
    assert!(expand_braces("a}b").is_err());
}

#[test]
fn wildcard_and_brace_patterns() {
    let index = build(
        &["Complex.*.*", "Complex.*{one,two}suf*.pattern"],
        RegexTreatment::Strict,
    );
    assert_eq!(
        index.match_point(&point("Complex.prefixonesuffix.pattern", &[])),
        vec!["Complex.*.*", "Complex.*{one,two}suf*.pattern"]
    );
    assert!(index
        .match_point(&point("Complex.prefixnosuf", &[]))
        .is_empty());
}

#[test]
fn prefix_tree_literal_and_glob_parts() {
    let index = build(
        &["a.b.c", "a.?.c", "a.[xy]z.c", "a.*", "b.{c,d}.e", "bad.{x"],
        RegexTreatment::Strict,
    );
    assert_eq!(index.len(), 5);
    assert_eq!(
        index.match_point(&point("a.b.c", &[])),
        vec!["a.?.c", "a.b.c"]
    );
    assert_eq!(index.match_point(&point("a.xz.c", &[])), vec!["a.[xy]z.c"]);
    assert_eq!(index.match_point(&point("a.anything", &[])), vec!["a.*"]);
    assert_eq!(index.match_point(&point("b.d.e", &[])), vec!["b.{c,d}.e"]);
    assert!(index.match_point(&point("b.f.e", &[])).is_empty());
    assert!(index.match_point(&point("a.b.c.d", &[])).is_empty());
}

#[test]
fn wildcards_cross_punctuation_in_metric_parts() {
    let index = build(
        &["Complex.pre*", "Complex.{pre,x}*fix", "Complex.pre[/_]fix", "Complex.pre?fix"],
        RegexTreatment::Strict,
    );
    assert_eq!(
        index.match_point(&point("Complex.pre/fix", &[])),
        vec![
            "Complex.pre*",
            "Complex.pre?fix",
            "Complex.pre[/_]fix",
            "Complex.{pre,x}*fix"
        ]
    );
    assert_eq!(
        index.match_point(&point("Complex.pre:fix", &[])),
        vec!["Complex.pre*", "Complex.pre?fix", "Complex.{pre,x}*fix"]
    );
}

#[test]
fn series_by_tag_parsing() {
    let specs =
        parse_series_by_tag(r#"seriesByTag('name=cpu', "dc!=ams", 'host=~web.*', 'env!=~dev')"#)
            .unwrap();
    let ops: Vec<TagOp> = specs.iter().map(|s| s.op).collect();
    assert_eq!(
        ops,
        vec![TagOp::Equal, TagOp::NotEqual, TagOp::Match, TagOp::NotMatch]
    );
    assert_eq!(specs[2].key, "host");
    assert_eq!(specs[2].value, "web.*");

    assert!(parse_series_by_tag("seriesByTag()").is_err());
    assert!(parse_series_by_tag("seriesByTag('name=a'").is_err());
    assert!(parse_series_by_tag("seriesByTag(name=a)").is_err());
    assert!(parse_series_by_tag("seriesByTag('a=1' 'b=2')").is_err());
    assert!(parse_series_by_tag("seriesByTag('nokey')").is_err());
}

#[test]
fn tag_index_name_tree_and_residuals() {
    let index = build(
        &[
            "seriesByTag('name=cpu.*', 'dc=ams')",
            "seriesByTag('name=mem', 'dc!=ams')",
            "seriesByTag('dc=~fr')",
            "seriesByTag('host={a,b}*')",
            "seriesByTag('rack=')",
        ],
        RegexTreatment::Strict,
    );
    assert_eq!(
        index.match_point(&point("cpu.user", &[("dc", "ams")])),
        vec!["seriesByTag('name=cpu.*', 'dc=ams')", "seriesByTag('rack=')"]
    );
    // Absent label compares as "".
    assert_eq!(
        index.match_point(&point("mem", &[])),
        vec!["seriesByTag('name=mem', 'dc!=ams')", "seriesByTag('rack=')"]
    );
    assert_eq!(
        index.match_point(&point("disk", &[("dc", "fra"), ("rack", "r1")])),
        vec!["seriesByTag('dc=~fr')"]
    );
    assert_eq!(
        index.match_point(&point("disk", &[("host", "a1"), ("rack", "r1")])),
        vec!["seriesByTag('host={a,b}*')"]
    );
}

#[test]
fn labelled_points_skip_dotted_patterns() {
    let index = build(&["cpu", "seriesByTag('name=cpu')"], RegexTreatment::Strict);
    assert_eq!(
        index.match_point(&point("cpu", &[])),
        vec!["cpu", "seriesByTag('name=cpu')"]
    );
    assert_eq!(
        index.match_point(&point("cpu", &[("dc", "x")])),
        vec!["seriesByTag('name=cpu')"]
    );
}

#[test]
fn regex_treatment_anchoring() {
    let pattern = ["seriesByTag('dc=~ms')"];
    let strict = build(&pattern, RegexTreatment::Strict);
    let loose = build(&pattern, RegexTreatment::Loose);
    let p = point("m", &[("dc", "ams")]);
    assert!(strict.match_point(&p).is_empty());
    assert_eq!(loose.match_point(&p).len(), 1);
    assert_eq!("LOOSE".parse::<RegexTreatment>(), Ok(RegexTreatment::Loose));
}

#[test]
fn rebuild_is_deterministic_and_uses_cache() {
    let patterns: Vec<String> = ["seriesByTag('a=1')", "x.*", "x.y"]
        .iter()
        .map(|p| p.to_string())
        .collect();
    let mut reversed = patterns.clone();
    reversed.reverse();

    let mut cache = MatcherCache::new(8);
    let first = PatternIndex::build(&patterns, &mut cache, RegexTreatment::Strict);
    assert_eq!(cache.len(), 1);
    let second = PatternIndex::build(&reversed, &mut cache, RegexTreatment::Strict);
    assert_eq!(cache.len(), 1);

    for p in [point("x.y", &[]), point("q", &[("a", "1")]), point("x.z", &[])] {
        assert_eq!(first.match_point(&p), second.match_point(&p));
    }
}

async fn spawn_filter(
    db: DynDatabase,
    cancel: &CancellationToken,
) -> (MetricFilter, Vec<tokio::task::JoinHandle<()>>) {
    let patterns = Arc::new(PatternStorage::new(db.clone(), RegexTreatment::Strict, 64));
    patterns.refresh().await.unwrap();
    MetricFilter::spawn(
        db,
        patterns,
        Arc::new(RetentionConfig::default()),
        FilterSettings {
            workers: 2,
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        },
        Arc::new(FilterStats::default()),
        cancel.clone(),
    )
}

#[tokio::test]
async fn filter_writes_matched_points_once() {
    let db: DynDatabase = Arc::new(MemoryDatabase::new());
    db.save_trigger(&trigger_with("t1", &["app.*.rps"])).await.unwrap();
    let mut events = db.subscribe_metric_events();
    let cancel = CancellationToken::new();
    let (filter, handles) = spawn_filter(db.clone(), &cancel).await;

    for line in [
        "app.web.rps 10 1000",
        "app.web.rps 10 1000",
        "app.web.rps 11 1010",
        "other.metric 5 1000",
    ] {
        assert!(filter.submit(parse_line(line.as_bytes(), 0).unwrap()).await);
    }
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    let values = db
        .get_metrics_values(&["app.web.rps".to_string()], 0, 2000)
        .await
        .unwrap();
    assert_eq!(values["app.web.rps"].len(), 1);
    assert_eq!(values["app.web.rps"][0].retention_timestamp, 1020);
    assert_eq!(values["app.web.rps"][0].value, 11.0);

    let stats = filter.stats().snapshot();
    assert_eq!(stats.matched, 3);
    assert_eq!(stats.saved, 2);
    assert_eq!(db.get_counter(counters::METRICS_RECEIVED).await.unwrap(), 4);

    let event = events.recv().await.unwrap();
    assert_eq!(event.pattern, "app.*.rps");
    assert_eq!(db.get_pattern_metrics("app.*.rps").await.unwrap(), vec!["app.web.rps"]);
}

#[tokio::test]
async fn pattern_storage_swaps_index() {
    let db: DynDatabase = Arc::new(MemoryDatabase::new());
    let storage = PatternStorage::new(db.clone(), RegexTreatment::Strict, 16);
    let before = storage.load();
    assert!(before.is_empty());

    db.save_trigger(&trigger_with("t1", &["a.*"])).await.unwrap();
    assert_eq!(storage.refresh().await.unwrap(), 1);
    assert!(before.is_empty());
    assert_eq!(storage.load().match_point(&point("a.b", &[])), vec!["a.*"]);
}

#[tokio::test]
async fn tcp_listener_counts_lines() {
    let db: DynDatabase = Arc::new(MemoryDatabase::new());
    db.save_trigger(&trigger_with("t1", &["net.*"])).await.unwrap();
    let cancel = CancellationToken::new();
    let (filter, handles) = spawn_filter(db.clone(), &cancel).await;
    let stats = filter.stats().clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(LineHandler::new(filter, 1024));
    let server = tokio::spawn(serve_tcp(listener, handler, cancel.clone()));

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"net.rx 1 100\nbroken line\nnet.tx 2 100\n")
        .await
        .unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stats.snapshot().saved < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    server.await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.received, 3);
    assert_eq!(snapshot.invalid, 1);
    assert_eq!(snapshot.saved, 2);
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn failed_save_does_not_swallow_resent_point() {
    let memory = Arc::new(MemoryDatabase::new());
    let db: DynDatabase = memory.clone();
    db.save_trigger(&trigger_with("t1", &["app.*.rps"])).await.unwrap();
    let cancel = CancellationToken::new();
    let (filter, handles) = spawn_filter(db.clone(), &cancel).await;
    let names = ["app.web.rps".to_string()];

    memory.set_rejecting_metrics(true);
    assert!(filter.submit(parse_line(b"app.web.rps 10 1000", 0).unwrap()).await);
    let mut received = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received == 0 {
        assert!(tokio::time::Instant::now() < deadline, "worker never flushed");
        tokio::time::sleep(Duration::from_millis(10)).await;
        received = db.get_counter(counters::METRICS_RECEIVED).await.unwrap();
    }
    // Outlast the save retries of that flush.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(db.get_metrics_values(&names, 0, 2000).await.unwrap()["app.web.rps"].is_empty());
    assert_eq!(filter.stats().snapshot().saved, 0);

    memory.set_rejecting_metrics(false);
    assert!(filter.submit(parse_line(b"app.web.rps 10 1000", 0).unwrap()).await);
    let stats = filter.stats().clone();
    wait_until("resent point to be saved", || stats.snapshot().saved == 1).await;

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    let values = db.get_metrics_values(&names, 0, 2000).await.unwrap();
    assert_eq!(values["app.web.rps"].len(), 1);
    assert_eq!(values["app.web.rps"][0].value, 10.0);
}

#[tokio::test]
async fn udp_listener_counts_lines_of_one_datagram() {
    let db: DynDatabase = Arc::new(MemoryDatabase::new());
    db.save_trigger(&trigger_with("t1", &["net.*"])).await.unwrap();
    let cancel = CancellationToken::new();
    let (filter, handles) = spawn_filter(db.clone(), &cancel).await;
    let stats = filter.stats().clone();

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let handler = Arc::new(LineHandler::new(filter, 1024));
    let server = tokio::spawn(serve_udp(socket, handler, cancel.clone()));

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"net.rx 1 100\nbroken line\nnet.tx 2 100\nother.metric 3 100\n", addr)
        .await
        .unwrap();

    wait_until("datagram lines to be saved", || stats.snapshot().saved == 2).await;
    cancel.cancel();
    server.await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.received, 4);
    assert_eq!(snapshot.invalid, 1);
    assert_eq!(snapshot.matched, 2);
    let mut metrics = db.get_pattern_metrics("net.*").await.unwrap();
    metrics.sort();
    assert_eq!(metrics, vec!["net.rx", "net.tx"]);
}
