//! Worker example: enqueue a few jobs, process them, record the outcome.
//!
//! # Prerequisites
//!
//! A reachable PostgreSQL database. The schema is created on first run.
//!
//! # Running the Example
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/harbor_example"
//! RUST_LOG=harbor=debug,worker=info cargo run --example worker
//! ```

use std::env;
use std::time::Duration;

use harbor::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const QUEUES: [&str; 2] = ["critical", "default"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url = env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/harbor_example".to_string());
    let pool = PersistenceConfig::new(database_url).connect().await?;

    let options = StorageOptions::default()
        .with_schema_name("harbor_example")
        .with_queue_poll_interval(Duration::from_millis(200))
        .with_prepare_schema(true);
    let storage = Storage::open(ConnectionProvider::pooled(pool), options).await?;
    let connection = storage.connection()?;

    let shutdown = CancelToken::new();
    let reaper = storage.lock_reaper()?.spawn(shutdown.clone());

    connection
        .announce_server(
            "example-worker",
            &ServerContext {
                worker_count: 1,
                queues: QUEUES.iter().map(|q| q.to_string()).collect(),
            },
        )
        .await?;

    for (n, queue) in ["default", "critical", "default"].into_iter().enumerate() {
        let job_id = connection
            .create_expired_job(
                NewJob::new(
                    serde_json::json!({"type": "Mailer", "method": "Send"}),
                    serde_json::json!([format!("user-{n}@example.com")]),
                )
                .with_parameter("CurrentCulture", "en-US"),
            )
            .await?;
        let mut batch = connection.create_write_batch();
        batch
            .set_job_state(job_id, StateData::new("Enqueued").with_data("Queue", queue))?
            .enqueue(queue, job_id)?;
        batch.commit().await?;
        info!(%job_id, queue, "job enqueued");
    }

    let queues: Vec<String> = QUEUES.iter().map(|q| q.to_string()).collect();
    for _ in 0..3 {
        let cancel = CancelToken::with_timeout(Duration::from_secs(5));
        let mut lease = match connection.fetch_next_job(&queues, &cancel).await {
            Ok(lease) => lease,
            Err(Error::Canceled) => {
                warn!("no job arrived in time");
                break;
            }
            Err(err) => return Err(err.into()),
        };

        let job_id = lease.job_id();
        let Some(job) = connection.get_job_data(job_id).await? else {
            lease.confirm().await?;
            continue;
        };
        info!(%job_id, queue = lease.queue(), arguments = %job.arguments, "processing job");

        let mut batch = connection.create_write_batch();
        batch
            .set_job_state(job_id, StateData::new("Succeeded"))?
            .expire_job(job_id, Duration::from_secs(86_400))?
            .increment_counter("stats:succeeded")?
            .insert_to_list("succeeded", &job_id.to_string())?
            .trim_list("succeeded", 0, 99)?;
        batch.commit().await?;
        lease.confirm().await?;
    }

    connection.heartbeat("example-worker").await?;
    info!(
        succeeded = connection.get_counter("stats:succeeded").await?,
        "run finished"
    );

    connection.remove_server("example-worker").await?;
    shutdown.cancel();
    reaper.await?;
    Ok(())
}
