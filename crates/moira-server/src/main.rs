use anyhow::Result;
use moira_filter::RetentionConfig;
use moira_server::config::ServerConfig;
use moira_server::{app, logging, seed};
use std::path::Path;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  moira [config.toml]                              Start the pipeline");
    eprintln!("  moira init-seed <config.toml> <seed.json>        Import triggers, subscriptions and contacts");
    eprintln!("  moira check-retentions <storage-schemas.conf>    Validate a retention file");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("init-seed") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-seed requires <config.toml> and <seed.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-seed requires <seed.json> argument")
            })?;
            run_init_seed(config_path, seed_path).await
        }
        Some("check-retentions") => {
            let path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("check-retentions requires <storage-schemas.conf> argument")
            })?;
            run_check_retentions(path)
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/moira.toml");
            run_server(config_path).await
        }
    }
}

async fn run_init_seed(config_path: &str, seed_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    logging::init(&config.log)?;
    moira_common::id::init(1, config.node_id);

    let db = app::open_database(&config.database).await?;
    let seed_file = seed::read_seed_file(seed_path)?;
    let report = seed::apply(&db, seed_file).await?;
    tracing::info!(
        triggers = report.triggers,
        subscriptions = report.subscriptions,
        contacts = report.contacts,
        skipped = report.skipped,
        "init-seed completed"
    );
    Ok(())
}

#[allow(clippy::print_stdout)]
fn run_check_retentions(path: &str) -> Result<()> {
    let retentions = RetentionConfig::load(Path::new(path))?;
    for section in &retentions.sections {
        println!(
            "{:<24} {:<40} step={}s retentions={}",
            section.name,
            section.pattern.as_str(),
            section.step,
            section.retentions
        );
    }
    println!("{} section(s) OK", retentions.sections.len());
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    logging::init(&config.log)?;
    moira_common::id::init(1, config.node_id);

    tracing::info!(
        config = config_path,
        backend = ?config.database.backend,
        filter = config.filter.enabled,
        checker = config.checker.enabled,
        remote = config.remote.enabled,
        notifier = config.notifier.enabled,
        selfstate = config.selfstate.enabled,
        "Starting moira"
    );

    let db = app::open_database(&config.database).await?;
    let senders = app::build_senders(&config.notifier)?;
    let cancel = CancellationToken::new();
    let running = app::start(&config, db, senders, cancel.clone()).await?;

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    cancel.cancel();

    app::wait_stopped(
        running.handles,
        Duration::from_secs(config.shutdown_timeout_secs),
    )
    .await;
    tracing::info!("Server stopped");
    Ok(())
}
