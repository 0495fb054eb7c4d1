use anyhow::Result;
use graphbridge_core::BridgeError;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{requests_respond_with_error, BatchJob};

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<BatchJob>,
}

impl SchedulerHandle {
    pub async fn submit(&self, job: BatchJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|e| anyhow::anyhow!("scheduler is closed: {e}"))
    }
}

/// Hands windows to workers round robin.
pub struct Scheduler {
    rx: mpsc::Receiver<BatchJob>,
    worker_txs: Vec<mpsc::Sender<BatchJob>>,
    rr: usize,
}

impl Scheduler {
    pub fn new(rx: mpsc::Receiver<BatchJob>, worker_txs: Vec<mpsc::Sender<BatchJob>>) -> Self {
        Self {
            rx,
            worker_txs,
            rr: 0,
        }
    }

    pub fn handle(tx: mpsc::Sender<BatchJob>) -> SchedulerHandle {
        SchedulerHandle { tx }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(job) = self.rx.recv().await {
            if self.worker_txs.is_empty() {
                let mut requests = job.requests;
                requests_respond_with_error(
                    &mut requests,
                    &BridgeError::Unavailable(format!("no instance of model '{}' is running", job.model)),
                );
                continue;
            }
            let idx = self.rr % self.worker_txs.len();
            self.rr += 1;
            if let Err(mpsc::error::SendError(job)) = self.worker_txs[idx].send(job).await {
                warn!(worker = idx, model = %job.model, "worker is gone, failing window");
                let mut requests = job.requests;
                requests_respond_with_error(
                    &mut requests,
                    &BridgeError::Unavailable(format!("worker {idx} of model '{}' is not running", job.model)),
                );
            }
        }
        Ok(())
    }
}
