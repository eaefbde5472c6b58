use crate::config::{DatabaseBackend, DatabaseConfig, NotifierConfig, ServerConfig};
use moira_checker::{LocalSource, MetricSource, RemoteSource, TriggerChecker, TriggerScheduler};
use moira_filter::listener::{serve_tcp, serve_udp, LineHandler};
use moira_filter::{FilterStats, MetricFilter, PatternStorage, RetentionConfig};
use moira_notifier::selfstate::heartbeat::Heartbeat;
use moira_notifier::selfstate::{CounterHeartbeat, DatabaseHeartbeat, NotifierHeartbeat};
use moira_notifier::{
    Dispatcher, EventWorker, SelfStateMonitor, SenderContext, SenderRegistry, Senders,
};
use moira_storage::memory::MemoryDatabase;
use moira_storage::sqlite::SqliteDatabase;
use moira_storage::DynDatabase;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens the configured backend and makes sure it answers within the
/// configured timeout.
pub async fn open_database(config: &DatabaseConfig) -> anyhow::Result<DynDatabase> {
    let db: DynDatabase = match config.backend {
        DatabaseBackend::Memory => Arc::new(MemoryDatabase::new()),
        DatabaseBackend::Sqlite => Arc::new(SqliteDatabase::new(Path::new(&config.data_dir))?),
    };
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    tokio::time::timeout(timeout, db.ping())
        .await
        .map_err(|_| anyhow::anyhow!("Database did not answer within {}s", timeout.as_secs()))??;
    Ok(db)
}

/// Builds one sender per `[[notifier.senders]]` entry.
pub fn build_senders(config: &NotifierConfig) -> anyhow::Result<Senders> {
    let registry = SenderRegistry::default();
    let ctx = SenderContext {
        front_uri: config.front_uri.clone(),
    };
    let senders = registry.build(&config.senders, &ctx)?;
    tracing::info!(contact_types = ?senders.contact_types(), "Senders ready");
    Ok(senders)
}

/// Handles of a started pipeline.
pub struct Running {
    pub handles: Vec<JoinHandle<()>>,
    /// Bound plaintext ingest address, when the filter runs.
    pub tcp_addr: Option<SocketAddr>,
    pub udp_addr: Option<SocketAddr>,
}

/// Starts every enabled stage on `db`. All tasks stop once `cancel` fires.
pub async fn start(
    config: &ServerConfig,
    db: DynDatabase,
    senders: Senders,
    cancel: CancellationToken,
) -> anyhow::Result<Running> {
    let mut running = Running {
        handles: Vec::new(),
        tcp_addr: None,
        udp_addr: None,
    };

    if config.filter.enabled {
        start_filter(config, db.clone(), &cancel, &mut running).await?;
    }

    if config.checker.enabled {
        let source: Arc<dyn MetricSource> =
            Arc::new(LocalSource::new(db.clone(), config.checker.metrics_ttl_secs));
        let checker = Arc::new(TriggerChecker::new(source, config.checker.check_settings()));
        let scheduler = Arc::new(TriggerScheduler::new(
            db.clone(),
            checker,
            false,
            config.checker.scheduler_settings(),
        ));
        running.handles.push(tokio::spawn(scheduler.run(cancel.clone())));
    }

    if config.remote.enabled {
        let source: Arc<dyn MetricSource> = Arc::new(RemoteSource::new(config.remote.settings())?);
        let mut settings = config.checker.check_settings();
        settings.check_interval = config.remote.check_interval_secs;
        let checker = Arc::new(TriggerChecker::new(source, settings));
        let scheduler = Arc::new(TriggerScheduler::new(
            db.clone(),
            checker,
            true,
            config.checker.scheduler_settings(),
        ));
        running.handles.push(tokio::spawn(scheduler.run(cancel.clone())));
    }

    if !config.notifier.enabled && !config.selfstate.enabled {
        return Ok(running);
    }

    let settings = config.notifier.settings();
    let dispatcher = Arc::new(Dispatcher::new(db.clone(), senders, settings.clone()));

    if config.notifier.enabled {
        for _ in 0..config.notifier.event_workers.max(1) {
            let worker = EventWorker::new(db.clone(), settings.fetch_interval);
            let cancel = cancel.clone();
            running
                .handles
                .push(tokio::spawn(async move { worker.run(cancel).await }));
        }
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        running
            .handles
            .push(tokio::spawn(async move { dispatcher.run(cancel).await }));
    }

    if config.selfstate.enabled {
        let monitor = SelfStateMonitor::new(
            db.clone(),
            dispatcher,
            heartbeats(config, &db),
            config.selfstate.settings(),
        );
        running.handles.push(tokio::spawn(monitor.run(cancel.clone())));
    }

    Ok(running)
}

async fn start_filter(
    config: &ServerConfig,
    db: DynDatabase,
    cancel: &CancellationToken,
    running: &mut Running,
) -> anyhow::Result<()> {
    let filter_config = &config.filter;
    let retentions = match &filter_config.retention_file {
        Some(path) => RetentionConfig::load(Path::new(path))?,
        None => RetentionConfig::default(),
    };
    let patterns = Arc::new(PatternStorage::new(
        db.clone(),
        filter_config.treatment()?,
        filter_config.matcher_cache_size,
    ));
    let loaded = patterns.refresh().await?;
    tracing::info!(patterns = loaded, "Pattern index loaded");
    running.handles.push(tokio::spawn(patterns.clone().run(
        Duration::from_secs(filter_config.pattern_refresh_secs.max(1)),
        cancel.clone(),
    )));

    let (filter, workers) = MetricFilter::spawn(
        db,
        patterns,
        Arc::new(retentions),
        filter_config.settings(),
        Arc::new(FilterStats::default()),
        cancel.clone(),
    );
    running.handles.extend(workers);
    let handler = Arc::new(LineHandler::new(filter, filter_config.max_line_length));

    let listener = TcpListener::bind(&filter_config.listen_tcp)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {e}", filter_config.listen_tcp))?;
    running.tcp_addr = Some(listener.local_addr()?);
    running
        .handles
        .push(tokio::spawn(serve_tcp(listener, handler.clone(), cancel.clone())));

    if let Some(addr) = &filter_config.listen_udp {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;
        running.udp_addr = Some(socket.local_addr()?);
        running
            .handles
            .push(tokio::spawn(serve_udp(socket, handler, cancel.clone())));
    }
    Ok(())
}

/// Heartbeats for the stages this process runs. The store check always
/// comes first.
fn heartbeats(config: &ServerConfig, db: &DynDatabase) -> Vec<Box<dyn Heartbeat>> {
    let selfstate = &config.selfstate;
    let mut heartbeats: Vec<Box<dyn Heartbeat>> = vec![Box::new(DatabaseHeartbeat::new(
        db.clone(),
        selfstate.database_delay_secs,
    ))];
    if config.filter.enabled {
        heartbeats.push(Box::new(CounterHeartbeat::filter(
            db.clone(),
            selfstate.filter_delay_secs,
        )));
    }
    if config.checker.enabled {
        heartbeats.push(Box::new(CounterHeartbeat::local_checker(
            db.clone(),
            selfstate.checker_delay_secs,
            selfstate.checker_turns_off_notifier,
        )));
    }
    if config.remote.enabled {
        heartbeats.push(Box::new(CounterHeartbeat::remote_checker(
            db.clone(),
            selfstate.remote_checker_delay_secs,
            selfstate.checker_turns_off_notifier,
        )));
    }
    if config.notifier.enabled {
        heartbeats.push(Box::new(NotifierHeartbeat::new(db.clone())));
    }
    heartbeats
}

/// Waits for every task to finish, giving up after `timeout`.
pub async fn wait_stopped(handles: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    let joined = tokio::time::timeout(timeout, join_handles(handles)).await;
    if joined.is_err() {
        tracing::warn!(timeout_secs = timeout.as_secs(), "Tasks did not stop in time");
    }
    joined.is_ok()
}

async fn join_handles(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Task panicked during shutdown");
        }
    }
}
