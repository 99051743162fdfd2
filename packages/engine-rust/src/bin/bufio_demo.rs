#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Demo: a paced producer feeds jobs into a batch engine whose worker fails
//! any batch containing a `"fail"` payload. Failed batches are logged and
//! dead-lettered; the final metrics are printed on exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bufio_engine::telemetry;
use bufio_engine::{
    simulate_producer, BatchEngine, CompositeFailureHandler, DeadLetterHandler, FailureHandler,
    FileStorage, LoggingFailureHandler, MemoryStorage, Storage, Worker,
};
use clap::{Parser, ValueEnum};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageKind {
    Memory,
    File,
}

#[derive(Debug, Parser)]
#[command(name = "bufio-demo", about = "Run a batch engine against a simulated job producer")]
struct Args {
    /// Maximum jobs per batch.
    #[arg(long, env = "BUFIO_BATCH_SIZE", default_value_t = 5)]
    batch_size: i64,

    #[arg(long, env = "BUFIO_FLUSH_INTERVAL_MS", default_value_t = 10_000)]
    flush_interval_ms: u64,

    /// Number of jobs to produce.
    #[arg(long, env = "BUFIO_COUNT", default_value_t = 25)]
    count: usize,

    #[arg(long, env = "BUFIO_PRODUCE_INTERVAL_MS", default_value_t = 300)]
    produce_interval_ms: u64,

    /// Every n-th job carries a failing payload. 0 disables failures.
    #[arg(long, env = "BUFIO_FAIL_EVERY", default_value_t = 10)]
    fail_every: u64,

    /// Upper bound of the simulated per-batch work time.
    #[arg(long, env = "BUFIO_MAX_WORK_MS", default_value_t = 50)]
    max_work_ms: u64,

    #[arg(long, env = "BUFIO_STORAGE", value_enum, default_value_t = StorageKind::Memory)]
    storage: StorageKind,

    /// Buffer file used with `--storage file`. Truncated on start.
    #[arg(long, env = "BUFIO_STORAGE_PATH", default_value = "buffer.json")]
    storage_path: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, env = "BUFIO_LOG_JSON")]
    log_json: bool,

    /// Serve Prometheus metrics on this address, e.g. 127.0.0.1:9000.
    #[arg(long, env = "BUFIO_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Job {
    id: u64,
    payload: String,
}

struct JobWorker {
    max_work_ms: u64,
}

#[async_trait]
impl Worker<Job, usize> for JobWorker {
    async fn process(&self, batch: &[Job]) -> anyhow::Result<usize> {
        let ids: Vec<u64> = batch.iter().map(|job| job.id).collect();
        info!(?ids, "processing jobs");

        let work_ms = rand::rng().random_range(0..=self.max_work_ms);
        tokio::time::sleep(Duration::from_millis(work_ms)).await;

        if let Some(job) = batch.iter().find(|job| job.payload == "fail") {
            anyhow::bail!("job {} carries a failing payload", job.id);
        }
        Ok(batch.len())
    }
}

fn job_generator(fail_every: u64) -> impl FnMut() -> Job + Send + 'static {
    let mut next = 0u64;
    move || {
        next += 1;
        let payload = if fail_every > 0 && next % fail_every == 0 {
            "fail".to_string()
        } else {
            format!("data-{next}")
        };
        Job { id: next, payload }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.log_json)?;
    if let Some(addr) = args.metrics_addr {
        telemetry::install_prometheus(addr)?;
        info!(%addr, "serving Prometheus metrics");
    }

    let dead_letters: Arc<dyn Storage<Job>> = Arc::new(MemoryStorage::new());
    let on_error = CompositeFailureHandler::new(vec![
        Arc::new(LoggingFailureHandler) as Arc<dyn FailureHandler<Job>>,
        Arc::new(DeadLetterHandler::new(Arc::clone(&dead_letters))),
    ]);

    let builder = BatchEngine::<Job, usize>::builder()
        .name("demo")
        .worker(JobWorker {
            max_work_ms: args.max_work_ms,
        })
        .batch_size(args.batch_size)
        .flush_interval(Duration::from_millis(args.flush_interval_ms))
        .on_error(on_error);
    let builder = match args.storage {
        StorageKind::Memory => builder,
        StorageKind::File => builder.storage(FileStorage::<Job>::create(&args.storage_path)?),
    };
    let engine = Arc::new(builder.build()?);

    engine.start()?;
    let producer = simulate_producer(
        Arc::clone(&engine),
        job_generator(args.fail_every),
        args.count,
        Duration::from_millis(args.produce_interval_ms),
    );
    let abort = producer.abort_handle();

    tokio::select! {
        joined = producer => {
            let produced = joined??;
            info!(produced, "producer finished");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            abort.abort();
            warn!("interrupted, shutting down");
        }
    }

    let drained = engine.shutdown().await?;
    info!(
        batches = drained.batches,
        records = drained.records,
        "drained remaining jobs"
    );

    let metrics = serde_json::to_string(&engine.metrics())?;
    info!(%metrics, dead_letters = dead_letters.len()?, "final metrics");
    Ok(())
}
