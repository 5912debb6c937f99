//! Request tracker — concurrent, append-only request log.
//!
//! Recording never blocks: each `record` pushes onto an unbounded channel
//! owned by the run's `RequestCollector`. Freezing closes the channel, so
//! a caller still holding a tracker clone from a finished run gets
//! `RecordError::Closed` instead of leaking into the next run.
//!
//! Records naming an instance that the run has already seen die are
//! rejected; the liveness flags are shared with the sampler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use shardline_core::{epoch_millis, InstanceId, RequestRecord, ShardAssignment, ShardId};

use crate::liveness::InstanceLiveness;

/// Reasons a request cannot be recorded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("request log is closed; the run has stopped")]
    Closed,

    #[error("instance `{0}` is not part of this run")]
    UnknownInstance(InstanceId),

    #[error("instance `{instance_id}` belongs to shard {expected}, not shard {actual}")]
    ShardMismatch {
        instance_id: InstanceId,
        expected: ShardId,
        actual: ShardId,
    },

    #[error("instance `{0}` is no longer alive")]
    InstanceDead(InstanceId),

    #[error("latency must be a finite, non-negative number of milliseconds, got {0}")]
    InvalidLatency(f64),
}

struct TrackerInner {
    assignment: ShardAssignment,
    liveness: InstanceLiveness,
    tx: mpsc::UnboundedSender<RequestRecord>,
    next_id: AtomicU64,
    accepted: AtomicU64,
}

/// Cloneable recording side of a run's request log.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

impl RequestTracker {
    /// Open a fresh request log for one run.
    pub fn open(assignment: ShardAssignment) -> (RequestTracker, RequestCollector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = RequestTracker {
            inner: Arc::new(TrackerInner {
                liveness: InstanceLiveness::from(&assignment),
                assignment,
                tx,
                next_id: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
            }),
        };
        (tracker, RequestCollector { rx })
    }

    /// Append one completed request.
    pub fn record(
        &self,
        shard_id: ShardId,
        instance_id: &str,
        latency_ms: f64,
    ) -> Result<(), RecordError> {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Err(RecordError::InvalidLatency(latency_ms));
        }
        let owner = self
            .inner
            .assignment
            .shard_of(instance_id)
            .ok_or_else(|| RecordError::UnknownInstance(instance_id.to_string()))?;
        if owner != shard_id {
            return Err(RecordError::ShardMismatch {
                instance_id: instance_id.to_string(),
                expected: owner,
                actual: shard_id,
            });
        }
        if !self.inner.liveness.is_alive(instance_id) {
            return Err(RecordError::InstanceDead(instance_id.to_string()));
        }

        let record = RequestRecord {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            shard_id,
            instance_id: instance_id.to_string(),
            dispatched_at_ms: epoch_millis(),
            latency_ms,
        };
        self.inner.tx.send(record).map_err(|_| RecordError::Closed)?;
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of records accepted into the log. Ids are unique but may
    /// skip values taken by records that were rejected as `Closed`.
    pub fn recorded(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    /// Whether the log still accepts records.
    pub fn is_open(&self) -> bool {
        !self.inner.tx.is_closed()
    }

    /// Completes once the log has been frozen.
    pub async fn closed(&self) {
        self.inner.tx.closed().await
    }

    pub fn assignment(&self) -> &ShardAssignment {
        &self.inner.assignment
    }

    /// Liveness flags of this run's instances.
    pub fn liveness(&self) -> &InstanceLiveness {
        &self.inner.liveness
    }
}

/// Receiving side of a run's request log. Exactly one per run.
pub struct RequestCollector {
    rx: mpsc::UnboundedReceiver<RequestRecord>,
}

impl RequestCollector {
    /// Close the log and drain everything recorded before the close.
    pub fn freeze(mut self) -> RequestLog {
        self.rx.close();
        let mut records = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            records.push(record);
        }
        debug!(records = records.len(), "request log frozen");
        RequestLog { records }
    }
}

/// Frozen request log of one run.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    records: Vec<RequestRecord>,
}

impl RequestLog {
    pub fn records(&self) -> &[RequestRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
