use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use sensor_monitor::services::dispatch::{DispatchUnit, MemoryUnitQueue, PgUnitQueue, UnitQueue};
use sensor_monitor::services::scheduler::Scheduler;
use sensor_monitor::{cli, config, db, state};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::MonitorConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url, config.db_max_connections)?;
    if args.ensure_schema {
        db::ensure_dispatch_schema(&pool).await?;
        tracing::info!("dispatch schema ensured");
    }
    let services = state::MonitorServices::build(config.clone(), pool.clone())?;

    if let Some(profile) = args.run_profile {
        let queue: Arc<dyn UnitQueue> = if args.inline {
            Arc::new(MemoryUnitQueue::new())
        } else {
            Arc::new(PgUnitQueue::new(pool.clone()))
        };
        let dispatcher = services.dispatcher(queue);
        let now = Utc::now();
        let scheduled_for = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        let unit = DispatchUnit::RunProfile {
            profile,
            scheduled_for,
            run_date: config.schedule_zone()?.run_date(scheduled_for),
        };
        let outcome = dispatcher
            .client()
            .enqueue(&unit)
            .await
            .context("failed to enqueue manual profile run")?;
        tracing::info!(
            profile = %profile,
            unit_id = %outcome.id,
            created = outcome.created,
            "manual profile run enqueued"
        );
        if args.inline {
            let summary = dispatcher.drain().await?;
            tracing::info!(
                completed = summary.completed,
                retried = summary.retried,
                failed = summary.failed,
                "inline run finished"
            );
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let queue: Arc<dyn UnitQueue> = Arc::new(PgUnitQueue::new(pool.clone()));
    let mut tasks = Vec::new();
    if args.role.runs_worker() {
        tasks.push(services.dispatcher(queue.clone()).start(cancel.clone()));
    }
    if args.role.runs_scheduler() {
        let scheduler = Scheduler::from_config(services.client(queue.clone()), &config)?;
        tasks.push(scheduler.start(cancel.clone()));
    }

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "background task ended abnormally");
        }
    }
    pool.close().await;
    Ok(())
}
