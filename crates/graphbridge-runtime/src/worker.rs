use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{BatchJob, WorkerModel};

/// Runs windows on one model instance, on its own OS thread, since
/// inference blocks.
pub struct Worker {
    pub id: u32,
    pub inbox: mpsc::Receiver<BatchJob>,
    pub model: Box<dyn WorkerModel>,
}

impl Worker {
    pub fn run(mut self) {
        info!(worker_id = self.id, instance = %self.model.name(), "worker started");
        while let Some(job) = self.inbox.blocking_recv() {
            let waited = job.created_at.elapsed();
            let summary = self.model.execute(job.requests);
            if let Some(err) = &summary.error {
                warn!(worker_id = self.id, error = %err, "window failed");
            } else {
                info!(
                    worker_id = self.id,
                    batch = summary.total_batch_size,
                    pad = summary.batch_pad_size,
                    waited_us = waited.as_micros() as u64,
                    "window done"
                );
            }
        }
        info!(worker_id = self.id, "worker stopped");
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("graphbridge-worker-{}", self.id))
            .spawn(move || self.run())
            .context("failed to spawn worker thread")
    }
}
