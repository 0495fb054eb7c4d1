mod cli;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Command, EngineKind};
use graphbridge_core::{f32_to_bytes, DType, IOName, Shape, Tensor};
use graphbridge_runtime::{
    BatchPolicy, Batcher, InferResult, InferenceRequest, ModelConfig, Scheduler, StatsRecorder,
    Worker,
};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use registry::ModelRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            model_repo,
            engine,
            requests,
            rows,
            max_delay_ms,
            log,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_new(&log).context("invalid --log filter")?)
                .init();
            run(
                model_repo,
                engine,
                requests,
                rows,
                Duration::from_millis(max_delay_ms),
            )
            .await
        }
    }
}

async fn run(
    model_repo: std::path::PathBuf,
    engine: EngineKind,
    requests: u64,
    rows: usize,
    max_delay: Duration,
) -> Result<()> {
    let stats = Arc::new(StatsRecorder::new());
    let mut registry = ModelRegistry::new(stats.clone());
    let name = registry.load_repository(&model_repo, engine)?;
    let loaded = registry
        .take(&name)
        .with_context(|| format!("model '{name}' missing from registry"))?;
    let config = loaded.config;

    // ---- Channels: requests -> batcher -> scheduler -> worker(s)
    let (batcher_tx, batcher_rx) = mpsc::channel(1024);
    let (sched_tx, sched_rx) = mpsc::channel(1024);

    let mut worker_txs = Vec::with_capacity(loaded.instances.len());
    let mut worker_threads = Vec::with_capacity(loaded.instances.len());
    for (id, model) in loaded.instances.into_iter().enumerate() {
        let (w_tx, w_rx) = mpsc::channel(128);
        let worker = Worker {
            id: id as u32,
            inbox: w_rx,
            model,
        };
        worker_threads.push(worker.spawn()?);
        worker_txs.push(w_tx);
    }

    let scheduler = Scheduler::new(sched_rx, worker_txs);
    let policy = BatchPolicy {
        max_batch_size: config.max_batch_size,
        max_delay,
    };
    let batcher = Batcher::new(name.clone(), policy, batcher_rx, Scheduler::handle(sched_tx));

    let scheduler_task = tokio::spawn(async move {
        if let Err(e) = scheduler.run().await {
            tracing::error!(error = ?e, "scheduler exited");
        }
    });
    let batcher_task = tokio::spawn(async move {
        if let Err(e) = batcher.run().await {
            tracing::error!(error = ?e, "batcher exited");
        }
    });

    tracing::info!(model = %name, requests, rows, "sending synthetic requests");
    let mut pending = Vec::with_capacity(requests as usize);
    for id in 0..requests {
        let (req, rx) = synthetic_request(id, &config, rows)?;
        batcher_tx
            .send(req)
            .await
            .map_err(|e| anyhow::anyhow!("batcher is closed: {e}"))?;
        pending.push(rx);
    }
    drop(batcher_tx);

    let (ok, failed) = collect(pending).await;

    batcher_task.await?;
    scheduler_task.await?;
    for thread in worker_threads {
        if thread.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }

    let snapshot = stats.snapshot();
    println!(
        "model {name}: {ok} ok, {failed} failed, {} batches, {} rows, {:?} compute",
        snapshot.batches, snapshot.batched_rows, snapshot.compute_time
    );
    if failed > 0 {
        bail!("{failed} of {requests} requests failed");
    }
    Ok(())
}

async fn collect(pending: Vec<oneshot::Receiver<InferResult>>) -> (usize, usize) {
    let (mut ok, mut failed) = (0, 0);
    for rx in pending {
        match rx.await {
            Ok(Ok(_)) => ok += 1,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "request failed");
                failed += 1;
            }
            Err(_) => {
                tracing::warn!("request dropped without a response");
                failed += 1;
            }
        }
    }
    (ok, failed)
}

/// A request filling every configured input. FP32 inputs carry `id` in each
/// element; other dtypes are zero-filled.
fn synthetic_request(
    id: u64,
    config: &ModelConfig,
    rows: usize,
) -> Result<(InferenceRequest, oneshot::Receiver<InferResult>)> {
    let mut inputs = Vec::with_capacity(config.input.len());
    for io in &config.input {
        let dtype = io.dtype()?;
        let mut dims = Vec::with_capacity(io.dims.len() + 1);
        if config.supports_batching() {
            dims.push(rows);
        }
        // dynamic dims get a single element
        dims.extend(io.dims.iter().map(|d| usize::try_from(*d).unwrap_or(1)));
        let shape = Shape::from_slice(&dims);
        let numel = shape.numel();
        let data = match dtype {
            DType::F32 => f32_to_bytes(&vec![id as f32; numel]),
            other => Bytes::from(vec![0u8; numel * other.byte_size()]),
        };
        inputs.push((IOName::new(io.name.clone()), Tensor::from_cpu_bytes(dtype, shape, data)));
    }
    Ok(InferenceRequest::new(id, config.name.clone(), inputs))
}
