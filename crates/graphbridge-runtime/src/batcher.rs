use anyhow::Result;
use graphbridge_core::BridgeError;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, warn};

use crate::{BatchAccumulator, InferenceRequest, SchedulerHandle};

#[derive(Clone, Debug)]
pub struct BatchPolicy {
    /// Model maximum; 0 means one request per window.
    pub max_batch_size: usize,
    pub max_delay: Duration,
}

impl BatchPolicy {
    /// Rows a window may hold.
    pub fn capacity(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

/// A window of requests ready to run on a worker.
#[derive(Debug)]
pub struct BatchJob {
    pub model: String,
    pub requests: Vec<InferenceRequest>,
    /// Rows the requests contribute.
    pub rows: usize,
    pub created_at: std::time::Instant,
}

/// Fixed-window batcher for one model. A window is flushed when its rows
/// reach the model maximum or its delay expires, and never holds more rows
/// than the maximum.
pub struct Batcher {
    model: String,
    policy: BatchPolicy,
    accumulator: BatchAccumulator,
    rx: mpsc::Receiver<InferenceRequest>,
    scheduler: SchedulerHandle,
}

impl Batcher {
    pub fn new(
        model: impl Into<String>,
        policy: BatchPolicy,
        rx: mpsc::Receiver<InferenceRequest>,
        scheduler: SchedulerHandle,
    ) -> Self {
        let model = model.into();
        // padding is decided by the instance; only contributions matter here
        let accumulator = BatchAccumulator::new(model.clone(), policy.max_batch_size, false);
        Self {
            model,
            policy,
            accumulator,
            rx,
            scheduler,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut pending: Vec<InferenceRequest> = Vec::new();
        let mut rows = 0usize;
        let mut first_seen: Option<Instant> = None;
        let capacity = self.policy.capacity();
        let max_delay = self.policy.max_delay;

        loop {
            let deadline = first_seen.map(|t0| t0 + max_delay);
            tokio::select! {
                maybe_req = self.rx.recv() => {
                    let Some(mut req) = maybe_req else { break };
                    let contribution = match self.accumulator.contribution(&req) {
                        Ok(c) if c <= capacity => c,
                        Ok(c) => {
                            warn!(model = %self.model, request_id = req.id, rows = c, "request exceeds the batch window");
                            req.respond_with_error(BridgeError::InvalidArgument(format!(
                                "batch size {c} for '{}', max allowed is {}",
                                self.model, self.policy.max_batch_size
                            )));
                            continue;
                        }
                        Err(err) => {
                            req.respond_with_error(err);
                            continue;
                        }
                    };
                    if rows + contribution > capacity {
                        self.flush(&mut pending, &mut rows).await?;
                        first_seen = None;
                    }
                    if pending.is_empty() { first_seen = Some(Instant::now()); }
                    pending.push(req);
                    rows += contribution;
                    if rows >= capacity {
                        self.flush(&mut pending, &mut rows).await?;
                        first_seen = None;
                    }
                }
                _ = async {
                    if let Some(deadline) = deadline {
                        sleep_until(deadline).await;
                    }
                }, if deadline.is_some() => {
                    self.flush(&mut pending, &mut rows).await?;
                    first_seen = None;
                }
            }
        }

        self.flush(&mut pending, &mut rows).await
    }

    async fn flush(&self, pending: &mut Vec<InferenceRequest>, rows: &mut usize) -> Result<()> {
        let requests = std::mem::take(pending);
        let window_rows = std::mem::take(rows);
        if requests.is_empty() {
            return Ok(());
        }

        debug!(model = %self.model, requests = requests.len(), batch = window_rows, "dispatching window");
        let job = BatchJob {
            model: self.model.clone(),
            requests,
            rows: window_rows,
            created_at: std::time::Instant::now(),
        };
        self.scheduler.submit(job).await
    }
}
