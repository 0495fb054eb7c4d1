use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// The four instants bracketing one execution call.
#[derive(Clone, Copy, Debug)]
pub struct ExecTimestamps {
    pub exec_start: Instant,
    pub compute_start: Instant,
    pub compute_end: Instant,
    pub exec_end: Instant,
}

impl ExecTimestamps {
    pub fn compute(&self) -> Duration {
        self.compute_end.saturating_duration_since(self.compute_start)
    }

    pub fn total(&self) -> Duration {
        self.exec_end.saturating_duration_since(self.exec_start)
    }
}

/// Receives execution statistics. Purely observational.
pub trait StatsReporter: Send + Sync {
    fn report_request(&self, instance: &str, request_id: u64, success: bool, ts: &ExecTimestamps);

    /// Called once per execution whose batch did not fail as a whole.
    fn report_batch(&self, instance: &str, batch_size: usize, ts: &ExecTimestamps);
}

/// Logs statistics at debug level.
#[derive(Debug, Default)]
pub struct TracingStats;

impl StatsReporter for TracingStats {
    fn report_request(&self, instance: &str, request_id: u64, success: bool, ts: &ExecTimestamps) {
        debug!(
            instance,
            request_id,
            success,
            exec_us = ts.total().as_micros() as u64,
            "request statistics"
        );
    }

    fn report_batch(&self, instance: &str, batch_size: usize, ts: &ExecTimestamps) {
        debug!(
            instance,
            batch = batch_size,
            compute_us = ts.compute().as_micros() as u64,
            "batch statistics"
        );
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_ok: u64,
    pub requests_failed: u64,
    pub batches: u64,
    pub batched_rows: u64,
    pub compute_time: Duration,
}

/// Accumulates statistics in memory.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    inner: Mutex<StatsSnapshot>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut StatsSnapshot)) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

impl StatsReporter for StatsRecorder {
    fn report_request(&self, _instance: &str, _request_id: u64, success: bool, _ts: &ExecTimestamps) {
        self.update(|s| {
            if success {
                s.requests_ok += 1;
            } else {
                s.requests_failed += 1;
            }
        });
    }

    fn report_batch(&self, _instance: &str, batch_size: usize, ts: &ExecTimestamps) {
        self.update(|s| {
            s.batches += 1;
            s.batched_rows += batch_size as u64;
            s.compute_time += ts.compute();
        });
    }
}
