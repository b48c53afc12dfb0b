use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logrelay_core::{load_dotenv, Config};
use logrelay_queue::{run_worker, JobQueue, Lane, PgJobQueue, WorkerOptions};
use logrelay_server::credentials::{load_or_generate_key, AesCredentialProvider};
use logrelay_server::db::init_pg_pool;
use logrelay_server::delivery::HttpDeliveryClient;
use logrelay_server::fetch::FetchHandler;
use logrelay_server::forward::ForwardHandler;
use logrelay_server::metrics::LogMetricsSink;
use logrelay_server::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "logrelay-server", about = "Audit-event ingestion and delivery pipeline")]
struct Cli {
    /// Run database migrations and exit.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let config = Config::from_env();
    config.log_summary();

    let pool = init_pg_pool(&config.postgres).await?;
    if cli.migrate_only {
        info!("Migrations applied, exiting (--migrate-only)");
        return Ok(());
    }

    let key = load_or_generate_key(&config.encryption)?;

    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(
        pool.clone(),
        Duration::from_secs(config.workers.lease_secs),
    ));

    let metrics = Arc::new(LogMetricsSink);
    let credentials = Arc::new(AesCredentialProvider::new(key, &config.upstream));
    let remote = Arc::new(logrelay_server::remote::HttpLogClient::new(&config.upstream));
    let delivery = Arc::new(HttpDeliveryClient::new());

    let fetch_handler = Arc::new(FetchHandler::new(
        pool.clone(),
        queue.clone(),
        credentials,
        remote,
        metrics.clone(),
    ));
    let forward_handler = Arc::new(ForwardHandler::new(pool.clone(), delivery, metrics));

    let scheduler = Arc::new(Scheduler::new(pool.clone(), queue.clone()));

    // One Notify per task: notify_one stores a permit, so no shutdown
    // signal is lost to a task that happens to be mid-poll.
    let scheduler_shutdown = Arc::new(Notify::new());
    let fetch_shutdown = Arc::new(Notify::new());
    let forward_shutdown = Arc::new(Notify::new());

    let scheduler_task = {
        let scheduler = scheduler.clone();
        let shutdown = scheduler_shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let fetch_task = tokio::spawn(run_worker(
        queue.clone(),
        Lane::Fetch,
        fetch_handler,
        WorkerOptions::new(
            config.workers.fetch_concurrency,
            config.workers.fetch_rate_per_sec,
        ),
        fetch_shutdown.clone(),
    ));

    let forward_task = tokio::spawn(run_worker(
        queue.clone(),
        Lane::Forward,
        forward_handler,
        WorkerOptions::new(
            config.workers.forward_concurrency,
            config.workers.forward_rate_per_sec,
        ),
        forward_shutdown.clone(),
    ));

    info!("logrelay-server started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    scheduler_shutdown.notify_one();
    fetch_shutdown.notify_one();
    forward_shutdown.notify_one();

    for (name, task) in [
        ("scheduler", scheduler_task),
        ("fetch worker", fetch_task),
        ("forward worker", forward_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "task panicked during shutdown");
        }
    }

    info!("logrelay-server stopped");
    Ok(())
}
