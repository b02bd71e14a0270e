//! Fire-and-forget observation sink plus cheap atomic counters.
//!
//! Every pipeline component reports through [`Observability::record`]. The call updates the
//! matching [`RuntimeStats`] counter and forwards to the configured [`Observer`]; a panicking
//! observer is swallowed so observation can never stall or fail the pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationKind {
    CommandSent,
    QueueFull,
    CommandCancelled,
    ResponseReceived,
    DeviceError,
    TransferChunkIssued,
    StagingExhausted,
    AbortIssued,
}

impl ObservationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommandSent => "command_sent",
            Self::QueueFull => "queue_full",
            Self::CommandCancelled => "command_cancelled",
            Self::ResponseReceived => "response_received",
            Self::DeviceError => "device_error",
            Self::TransferChunkIssued => "transfer_chunk_issued",
            Self::StagingExhausted => "staging_exhausted",
            Self::AbortIssued => "abort_issued",
        }
    }
}

pub trait Observer: Send + Sync {
    fn record(&self, kind: ObservationKind, attrs: &[(&'static str, u64)]);
}

/// Default sink: one `trace`-level event per observation.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record(&self, kind: ObservationKind, attrs: &[(&'static str, u64)]) {
        tracing::trace!(kind = kind.as_str(), ?attrs, "observation");
    }
}

/// Snapshot of [`RuntimeStats`], suitable for logging or assertions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStatsSnapshot {
    pub commands_sent: u64,
    pub queue_full_retries: u64,
    pub commands_cancelled: u64,
    pub responses_received: u64,
    pub device_errors: u64,
    pub transfer_chunks: u64,
    pub staging_exhausted: u64,
    pub aborts_issued: u64,
}

#[derive(Debug, Default)]
pub struct RuntimeStats {
    commands_sent: AtomicU64,
    queue_full_retries: AtomicU64,
    commands_cancelled: AtomicU64,
    responses_received: AtomicU64,
    device_errors: AtomicU64,
    transfer_chunks: AtomicU64,
    staging_exhausted: AtomicU64,
    aborts_issued: AtomicU64,
}

impl RuntimeStats {
    fn count(&self, kind: ObservationKind) {
        let counter = match kind {
            ObservationKind::CommandSent => &self.commands_sent,
            ObservationKind::QueueFull => &self.queue_full_retries,
            ObservationKind::CommandCancelled => &self.commands_cancelled,
            ObservationKind::ResponseReceived => &self.responses_received,
            ObservationKind::DeviceError => &self.device_errors,
            ObservationKind::TransferChunkIssued => &self.transfer_chunks,
            ObservationKind::StagingExhausted => &self.staging_exhausted,
            ObservationKind::AbortIssued => &self.aborts_issued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RuntimeStatsSnapshot {
        RuntimeStatsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            queue_full_retries: self.queue_full_retries.load(Ordering::Relaxed),
            commands_cancelled: self.commands_cancelled.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            transfer_chunks: self.transfer_chunks.load(Ordering::Relaxed),
            staging_exhausted: self.staging_exhausted.load(Ordering::Relaxed),
            aborts_issued: self.aborts_issued.load(Ordering::Relaxed),
        }
    }
}

pub struct Observability {
    stats: RuntimeStats,
    sink: Arc<dyn Observer>,
}

impl Observability {
    pub fn new(sink: Arc<dyn Observer>) -> Self {
        Self {
            stats: RuntimeStats::default(),
            sink,
        }
    }

    pub fn record(&self, kind: ObservationKind, attrs: &[(&'static str, u64)]) {
        self.stats.count(kind);
        let sink = &self.sink;
        let _ = catch_unwind(AssertUnwindSafe(|| sink.record(kind, attrs)));
    }

    pub fn stats(&self) -> RuntimeStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for Observability {
    fn default() -> Self {
        Self::new(Arc::new(TracingObserver))
    }
}

impl std::fmt::Debug for Observability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observability")
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
