//! The worker pool.
//!
//! N symmetric workers share the operation channel; each owns its batches,
//! its known-database set, and its committed resume position, so the hot
//! path never crosses a lock. A worker's loop reacts to whichever fires
//! first: an operation, a source error, the flush tick, or the checkpoint
//! tick. When the source closes the channel the worker flushes and
//! checkpoints one last time and returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{Bson, Timestamp};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, warn};

use mongoflux_core::{
    ErrRx, MeasurementSet, Namespace, OpRx, Operation, ResumeStrategy, RunStatus, TransformInput,
};
use mongoflux_io::{Batcher, InfluxWriter, LineBatch, ResumeStore};
use mongoflux_tx::Projector;

const FLUSH_PERIOD: Duration = Duration::from_secs(1);
const CHECKPOINT_PERIOD: Duration = Duration::from_secs(10);

/// Everything a worker shares with its siblings. Cheap to clone; per-worker
/// state lives in [`Worker`].
#[derive(Clone)]
pub struct WorkerContext {
    pub measurements: Arc<MeasurementSet>,
    pub projector: Arc<Projector>,
    pub writer: Arc<InfluxWriter>,
    pub resume: Arc<ResumeStore>,
    pub status: Arc<RunStatus>,
    pub strategy: ResumeStrategy,
    /// Whether checkpoints are persisted at all (`--resume`).
    pub checkpoints: bool,
    pub batch_limit: usize,
}

pub struct Worker {
    id: usize,
    ctx: WorkerContext,
    batches: Batcher,
    known_dbs: HashSet<String>,
    last_ts: Option<Timestamp>,
    pending_tokens: HashMap<String, Bson>,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self {
            id,
            ctx,
            batches: Batcher::new(),
            known_dbs: HashSet::new(),
            last_ts: None,
            pending_tokens: HashMap::new(),
        }
    }

    pub async fn run(mut self, ops: OpRx, errors: ErrRx) {
        let mut flush_tick = interval_at(Instant::now() + FLUSH_PERIOD, FLUSH_PERIOD);
        let mut checkpoint_tick =
            interval_at(Instant::now() + CHECKPOINT_PERIOD, CHECKPOINT_PERIOD);
        let mut errors_open = true;

        loop {
            tokio::select! {
                op = ops.recv() => match op {
                    Ok(op) => self.handle_op(op).await,
                    Err(_) => break,
                },
                err = errors.recv(), if errors_open => match err {
                    Ok(e) => {
                        error!(worker = self.id, error = %format!("{e:#}"), "source error");
                        self.ctx.status.set_failed();
                    }
                    Err(_) => errors_open = false,
                },
                _ = flush_tick.tick() => self.flush_all().await,
                _ = checkpoint_tick.tick() => self.checkpoint().await,
            }
        }

        // Source closed: final flush and checkpoint.
        self.checkpoint().await;
        debug!(worker = self.id, "worker exited");
    }

    async fn handle_op(&mut self, op: Operation) {
        let measurements = Arc::clone(&self.ctx.measurements);
        let Some(measurement) = measurements.get(&op.ns) else {
            return;
        };

        if let Some(filter) = &measurement.filter {
            let input = TransformInput {
                data: &op.doc,
                ns: &op.ns,
                operation: op.kind,
            };
            if !filter.accept(&input) {
                return;
            }
        }

        let points = match self.ctx.projector.project(&op, measurement) {
            Ok(points) => points,
            Err(e) => {
                warn!(worker = self.id, ns = %op.ns, error = %e, "projection failed, dropping operation");
                return;
            }
        };
        if points.is_empty() {
            return;
        }

        if self.known_dbs.insert(measurement.database.clone()) {
            if let Err(e) = self.ctx.writer.ensure_database(&measurement.database).await {
                error!(worker = self.id, database = %measurement.database, error = %format!("{e:#}"), "database create failed");
                self.ctx.status.set_failed();
                // Retry on the next point for this database.
                self.known_dbs.remove(&measurement.database);
            }
        }

        for point in points {
            let size = self
                .batches
                .add(measurement, op.ts, op.cursor.as_ref(), point);
            if size >= self.ctx.batch_limit {
                self.flush_namespace(&op.ns).await;
            }
        }
    }

    async fn flush_namespace(&mut self, ns: &Namespace) {
        if let Some(batch) = self.batches.take(ns) {
            self.write_batch(ns, batch).await;
        }
    }

    async fn flush_all(&mut self) {
        for (ns, batch) in self.batches.drain() {
            self.write_batch(&ns, batch).await;
        }
    }

    async fn write_batch(&mut self, ns: &Namespace, batch: LineBatch) {
        if batch.is_empty() {
            return;
        }
        match self.ctx.writer.write(&batch).await {
            Ok(()) => {
                // The resume position may only advance past flushed
                // operations.
                if let Some(ts) = batch.max_timestamp() {
                    if self.last_ts.map_or(true, |cur| ts_after(ts, cur)) {
                        self.last_ts = Some(ts);
                    }
                }
                for (stream_id, token) in batch.tokens() {
                    self.pending_tokens
                        .insert(stream_id.clone(), token.clone());
                }
                debug!(worker = self.id, ns = %ns, points = batch.len(), "batch flushed");
            }
            Err(e) => {
                error!(worker = self.id, ns = %ns, points = batch.len(), error = %format!("{e:#}"), "batch write failed, discarding");
                self.ctx.status.set_failed();
            }
        }
    }

    /// Flush everything, then persist the committed position and clear it.
    /// A failed checkpoint write keeps the position for the next tick.
    async fn checkpoint(&mut self) {
        self.flush_all().await;
        if !self.ctx.checkpoints {
            return;
        }
        match self.ctx.strategy {
            ResumeStrategy::Timestamp => {
                if let Some(ts) = self.last_ts {
                    match self.ctx.resume.save_timestamp(ts).await {
                        Ok(()) => {
                            debug!(worker = self.id, ts = ?ts, "checkpoint saved");
                            self.last_ts = None;
                        }
                        Err(e) => {
                            error!(worker = self.id, error = %format!("{e:#}"), "checkpoint write failed");
                            self.ctx.status.set_failed();
                        }
                    }
                }
            }
            ResumeStrategy::Token => {
                if !self.pending_tokens.is_empty() {
                    match self.ctx.resume.save_tokens(&self.pending_tokens).await {
                        Ok(()) => {
                            debug!(worker = self.id, streams = self.pending_tokens.len(), "checkpoint saved");
                            self.pending_tokens.clear();
                        }
                        Err(e) => {
                            error!(worker = self.id, error = %format!("{e:#}"), "checkpoint write failed");
                            self.ctx.status.set_failed();
                        }
                    }
                }
            }
        }
    }
}

fn ts_after(a: Timestamp, b: Timestamp) -> bool {
    (a.time, a.increment) > (b.time, b.increment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_order_compares_seconds_then_ordinal() {
        let t = |time, increment| Timestamp { time, increment };
        assert!(ts_after(t(2, 0), t(1, 9)));
        assert!(ts_after(t(1, 2), t(1, 1)));
        assert!(!ts_after(t(1, 1), t(1, 1)));
        assert!(!ts_after(t(1, 0), t(2, 0)));
    }
}
