//! Chunked host ↔ device transfers.
//!
//! A transfer is a [`TransferAction`] driven by repeated [`TransferAction::advance`] calls. Each
//! call that finds staging space issues one *batch*: a single DMA list command covering up to
//! `max_element_size × max_element_count` bytes, split into one node (and one host copy) per
//! `max_element_size` piece.
//!
//! Event wiring per batch:
//!
//! ```text
//! H2D: sync_i (host copy into staging)  --join--> enable(batch)
//!      batch + every sync_i              --join--> free staging
//! D2H: batch (device response)          --join--> host copies sync_i
//!      sync_i (copy out of staging)     --join--> free staging, dispatch done
//! ```
//!
//! An action reserves its queue position at construction with a placeholder command and inserts
//! every batch in front of it. The placeholder holds the queue, so nothing queued after the
//! transfer reaches the device before its last batch. Once everything is submitted the
//! placeholder is cancelled and the completion event fires from a join over the per-batch
//! completion events.
//!
//! Each action hands out a [`TransferControl`] through which it can be aborted.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rvax_protocol::{
    encode_dma_read_list, encode_dma_write_list, CommandFlags, DeviceErrorCode, DmaNode,
};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::channel::{ChannelError, Command, CommandChannel};
use crate::event_ledger::EventLedger;
use crate::observability::{ObservationKind, Observability};
use crate::staging::{StagingBuffer, StagingPool};
use crate::streams::{deliver_error, retire, StreamError, StreamErrorCode, StreamRegistry};
use crate::thread_pool::ThreadPool;
use crate::transport::{DmaLimits, TransportError};
use crate::types::{DeviceId, EventId, HostBuffer, QueueId, StreamId};

mod device_to_host;
mod host_to_device;
mod list;

pub use device_to_host::DeviceToHost;
pub use host_to_device::HostToDevice;
pub use list::{DeviceToHostList, DeviceToHostOp, HostToDeviceList, HostToDeviceOp};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer of {requested} bytes does not fit the {capacity}-byte staging pool")]
    TooLarge { requested: u64, capacity: u64 },

    #[error("transfer needs {nodes} DMA nodes, the device accepts at most {max}")]
    TooManyNodes { nodes: u64, max: u64 },

    #[error("host range [{offset}, {offset}+{len}) exceeds the {capacity}-byte buffer")]
    HostRange {
        offset: usize,
        len: u64,
        capacity: usize,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Staging(#[from] TransportError),
}

/// Everything a transfer needs to issue batches on one stream.
#[derive(Clone)]
pub struct TransferContext {
    pub ledger: Arc<EventLedger>,
    pub streams: Arc<StreamRegistry>,
    pub obs: Arc<Observability>,
    pub stream: StreamId,
    pub device: DeviceId,
    pub channel: Arc<CommandChannel>,
    pub staging: Arc<StagingPool>,
    pub copy_pool: Arc<ThreadPool>,
    pub limits: DmaLimits,
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("stream", &self.stream)
            .field("device", &self.device)
            .field("limits", &self.limits)
            .finish()
    }
}

/// Abort handle of one transfer.
#[derive(Debug)]
pub struct TransferControl {
    completion: EventId,
    state: Mutex<ControlState>,
}

#[derive(Debug, Default)]
struct ControlState {
    /// Tags of every batch command handed to the channel.
    commands: Vec<EventId>,
    aborted: bool,
}

impl TransferControl {
    fn new(completion: EventId) -> Self {
        Self {
            completion,
            state: Mutex::new(ControlState::default()),
        }
    }

    pub fn completion(&self) -> EventId {
        self.completion
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Stop issuing batches. Returns the batch tags issued so far, or `None` if the transfer was
    /// already aborted.
    pub fn abort(&self) -> Option<Vec<EventId>> {
        let mut state = self.state.lock();
        if std::mem::replace(&mut state.aborted, true) {
            return None;
        }
        Some(state.commands.clone())
    }
}

pub trait TransferAction: Send {
    /// Issue the next batch if staging space allows. `Ok(true)` once every byte has been
    /// submitted (not necessarily completed).
    fn advance(&mut self) -> Result<bool, TransferError>;

    /// Release the queue reservation and arm the completion event. Called exactly once, after
    /// `advance` returned `Ok(true)` or the action was abandoned.
    fn on_finish(&mut self);

    fn completion(&self) -> EventId;

    fn context(&self) -> &TransferContext;

    fn control(&self) -> &Arc<TransferControl>;

    fn stream(&self) -> StreamId {
        self.context().stream
    }

    /// Channel the batches go to.
    fn lane(&self) -> (DeviceId, QueueId) {
        let ctx = self.context();
        (ctx.device, ctx.channel.queue())
    }

    /// Bytes submitted so far.
    fn submitted_bytes(&self) -> u64;

    /// Block until another `advance` might make progress, at most `timeout`.
    fn wait_for_progress(&self, timeout: Duration);
}

/// Host side of one contiguous piece of a transfer.
#[derive(Clone, Debug)]
pub(crate) struct Segment {
    pub host: HostBuffer,
    pub host_offset: usize,
    pub device_addr: u64,
    pub len: u64,
}

pub(crate) fn check_host_range(
    host: &HostBuffer,
    offset: usize,
    len: u64,
) -> Result<(), TransferError> {
    let capacity = host.len();
    let fits = usize::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .is_some_and(|end| end <= capacity);
    if fits {
        Ok(())
    } else {
        Err(TransferError::HostRange {
            offset,
            len,
            capacity,
        })
    }
}

/// Largest single DMA node, also bounded by the 32-bit node size field.
fn node_limit(limits: &DmaLimits) -> u64 {
    limits.max_element_size.clamp(1, u32::MAX as u64)
}

/// Number of DMA nodes `segments` split into.
pub(crate) fn node_count(segments: &[Segment], limits: &DmaLimits) -> u64 {
    let max = node_limit(limits);
    segments.iter().map(|s| s.len.div_ceil(max)).sum()
}

/// One DMA node together with the host range it copies.
struct Piece {
    host: HostBuffer,
    host_offset: usize,
    device_addr: u64,
    staging_offset: u64,
    len: u64,
}

fn split(segments: &[Segment], limits: &DmaLimits) -> Vec<Piece> {
    let max = node_limit(limits);
    let mut pieces = Vec::new();
    let mut staging_offset = 0u64;
    for seg in segments {
        let mut done = 0u64;
        while done < seg.len {
            let len = (seg.len - done).min(max);
            pieces.push(Piece {
                host: seg.host.clone(),
                host_offset: seg.host_offset + done as usize,
                device_addr: seg.device_addr + done,
                staging_offset,
                len,
            });
            done += len;
            staging_offset += len;
        }
    }
    pieces
}

/// Batch bookkeeping shared by every transfer variant.
pub(crate) struct Submission {
    ctx: TransferContext,
    control: Arc<TransferControl>,
    ghost: EventId,
    completion: EventId,
    barrier: bool,
    batch_events: Vec<EventId>,
    submitted: u64,
    finished: bool,
}

impl Submission {
    /// Reserve the queue position for a transfer completing `completion`.
    pub(crate) fn new(
        ctx: TransferContext,
        completion: EventId,
        barrier: bool,
    ) -> Result<Self, TransferError> {
        let ghost = ctx.ledger.next();
        if let Err(err) = ctx
            .channel
            .send(Command::ghost(ghost).with_stream(ctx.stream))
        {
            if let Err(dispatch_err) = ctx.ledger.dispatch(ghost) {
                warn!(%ghost, "placeholder dispatch failed: {dispatch_err}");
            }
            return Err(err.into());
        }
        Ok(Self {
            ctx,
            control: Arc::new(TransferControl::new(completion)),
            ghost,
            completion,
            barrier,
            batch_events: Vec::new(),
            submitted: 0,
            finished: false,
        })
    }

    pub(crate) fn ctx(&self) -> &TransferContext {
        &self.ctx
    }

    pub(crate) fn completion(&self) -> EventId {
        self.completion
    }

    pub(crate) fn control(&self) -> &Arc<TransferControl> {
        &self.control
    }

    pub(crate) fn submitted(&self) -> u64 {
        self.submitted
    }

    pub(crate) fn batch_count(&self) -> usize {
        self.batch_events.len()
    }

    /// Barrier applies to the first batch only.
    fn next_flags(&mut self) -> CommandFlags {
        if std::mem::take(&mut self.barrier) {
            CommandFlags::BARRIER
        } else {
            CommandFlags::empty()
        }
    }

    fn stage(&self, total: u64) -> Option<StagingBuffer> {
        let buffer = self.ctx.staging.alloc(total);
        if buffer.is_none() {
            self.ctx.obs.record(
                ObservationKind::StagingExhausted,
                &[("device", self.ctx.device.0 as u64), ("bytes", total)],
            );
        }
        buffer
    }

    /// Batch events belong to the stream so device failures are attributed to it.
    fn new_batch_event(&self) -> EventId {
        let batch = self.ctx.ledger.next();
        if let Err(err) = self.ctx.streams.add_event(self.ctx.stream, batch) {
            warn!(stream = %self.ctx.stream, %batch, "batch event without stream: {err}");
        }
        batch
    }

    /// Queue `command` ahead of the placeholder unless the transfer was aborted meanwhile.
    fn enqueue(
        &self,
        command: Command,
        buffer: StagingBuffer,
    ) -> Result<Option<StagingBuffer>, TransferError> {
        let batch = command.tag;
        let mut control = self.control.state.lock();
        if control.aborted {
            drop(control);
            self.abort_batch(batch, buffer);
            return Ok(None);
        }
        if let Err(err) = self.ctx.channel.send_before(self.ghost, command) {
            drop(control);
            self.abort_batch(batch, buffer);
            return Err(err.into());
        }
        control.commands.push(batch);
        Ok(Some(buffer))
    }

    fn issued(&mut self, batch_done: EventId, bytes: u64, nodes: usize) {
        self.batch_events.push(batch_done);
        self.submitted += bytes;
        self.ctx.obs.record(
            ObservationKind::TransferChunkIssued,
            &[
                ("device", self.ctx.device.0 as u64),
                ("bytes", bytes),
                ("nodes", nodes as u64),
            ],
        );
    }

    /// Host → device batch. Returns `Ok(false)` when staging space ran out.
    pub(crate) fn issue_write_batch(&mut self, segments: &[Segment]) -> Result<bool, TransferError> {
        let total: u64 = segments.iter().map(|s| s.len).sum();
        let Some(buffer) = self.stage(total) else {
            return Ok(false);
        };
        let pieces = split(segments, &self.ctx.limits);
        let nodes: Vec<DmaNode> = pieces
            .iter()
            .map(|p| DmaNode {
                src: buffer.dma_address() + p.staging_offset,
                dst: p.device_addr,
                size: p.len as u32,
            })
            .collect();

        let batch = self.new_batch_event();
        let flags = self.next_flags();
        let payload = encode_dma_write_list(batch.0, flags, &nodes);
        let command = Command::new(batch, payload)
            .disabled()
            .dma()
            .with_stream(self.ctx.stream);
        let Some(buffer) = self.enqueue(command, buffer)? else {
            return Ok(false);
        };

        let ctx = &self.ctx;
        let syncs: Vec<EventId> = pieces.iter().map(|_| ctx.ledger.next()).collect();

        let channel = Arc::clone(&ctx.channel);
        ctx.ledger.add_dependency_join(syncs.clone(), move || {
            if let Err(err) = channel.enable(batch) {
                debug!(%batch, "batch no longer queued at enable: {err}");
            }
        });
        // A cancelled or failed batch retires early; the copies may still be writing.
        let staging = Arc::clone(&ctx.staging);
        let watched: Vec<EventId> = syncs.iter().copied().chain([batch]).collect();
        ctx.ledger.add_dependency_join(watched, move || {
            if let Err(err) = staging.free(buffer) {
                error!(%batch, "staging free failed: {err}");
            }
        });

        for (piece, sync) in pieces.into_iter().zip(syncs) {
            let staging = Arc::clone(&ctx.staging);
            let ledger = Arc::clone(&ctx.ledger);
            let streams = Arc::clone(&ctx.streams);
            let channel = Arc::clone(&ctx.channel);
            let (stream, device) = (ctx.stream, ctx.device);
            let copy = move || {
                let end = piece.host_offset + piece.len as usize;
                let copied = piece.host.with_bytes(|bytes| {
                    staging.write(&buffer, piece.staging_offset, &bytes[piece.host_offset..end])
                });
                if let Err(err) = copied {
                    error!(%batch, "host copy into staging failed: {err}");
                    if channel.cancel(batch) {
                        fail_event(&ledger, &streams, stream, device, batch, err.to_string());
                    }
                }
                if let Err(err) = ledger.dispatch(sync) {
                    warn!(%sync, "sync event dispatch failed: {err}");
                }
            };
            ctx.copy_pool.push_or_run(copy);
        }

        self.issued(batch, total, nodes.len());
        Ok(true)
    }

    /// Device → host batch. Returns `Ok(false)` when staging space ran out.
    pub(crate) fn issue_read_batch(&mut self, segments: &[Segment]) -> Result<bool, TransferError> {
        let total: u64 = segments.iter().map(|s| s.len).sum();
        let Some(buffer) = self.stage(total) else {
            return Ok(false);
        };
        let pieces = split(segments, &self.ctx.limits);
        let nodes: Vec<DmaNode> = pieces
            .iter()
            .map(|p| DmaNode {
                src: p.device_addr,
                dst: buffer.dma_address() + p.staging_offset,
                size: p.len as u32,
            })
            .collect();

        let batch = self.new_batch_event();
        let flags = self.next_flags();
        let payload = encode_dma_read_list(batch.0, flags, &nodes);
        let command = Command::new(batch, payload).dma().with_stream(self.ctx.stream);
        let Some(buffer) = self.enqueue(command, buffer)? else {
            return Ok(false);
        };

        // The batch may already have completed; joins over dispatched events run at once.
        let ctx = &self.ctx;
        let done = ctx.ledger.next();
        let syncs: Vec<EventId> = pieces.iter().map(|_| ctx.ledger.next()).collect();

        let staging = Arc::clone(&ctx.staging);
        let ledger = Arc::clone(&ctx.ledger);
        ctx.ledger.add_dependency_join(syncs.clone(), move || {
            if let Err(err) = staging.free(buffer) {
                error!(%batch, "staging free failed: {err}");
            }
            if let Err(err) = ledger.dispatch(done) {
                warn!(%done, "batch done dispatch failed: {err}");
            }
        });

        let staging = Arc::clone(&ctx.staging);
        let ledger = Arc::clone(&ctx.ledger);
        let pool = Arc::clone(&ctx.copy_pool);
        let control = Arc::clone(&self.control);
        ctx.ledger.add_dependency_join([batch], move || {
            for (piece, sync) in pieces.into_iter().zip(syncs) {
                let staging = Arc::clone(&staging);
                let ledger = Arc::clone(&ledger);
                let control = Arc::clone(&control);
                let copy = move || {
                    let end = piece.host_offset + piece.len as usize;
                    // Aborted reads leave the host buffer untouched.
                    let copied = if control.is_aborted() {
                        Ok(())
                    } else {
                        piece.host.with_bytes_mut(|bytes| {
                            staging.read(&buffer, piece.staging_offset, &mut bytes[piece.host_offset..end])
                        })
                    };
                    if let Err(err) = copied {
                        error!(%batch, "host copy out of staging failed: {err}");
                    }
                    if let Err(err) = ledger.dispatch(sync) {
                        warn!(%sync, "sync event dispatch failed: {err}");
                    }
                };
                pool.push_or_run(copy);
            }
        });

        self.issued(done, total, nodes.len());
        Ok(true)
    }

    fn abort_batch(&self, batch: EventId, buffer: StagingBuffer) {
        if let Err(err) = self.ctx.staging.free(buffer) {
            error!(%batch, "staging free failed: {err}");
        }
        retire(&self.ctx.ledger, &self.ctx.streams, batch);
    }

    /// Drop the queue reservation and dispatch the completion once every issued batch is done.
    pub(crate) fn finish(&mut self) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        let ctx = &self.ctx;
        ctx.channel.cancel(self.ghost);
        if let Err(err) = ctx.ledger.dispatch(self.ghost) {
            warn!(ghost = %self.ghost, "placeholder dispatch failed: {err}");
        }

        let ledger = Arc::clone(&ctx.ledger);
        let streams = Arc::clone(&ctx.streams);
        let control = Arc::clone(&self.control);
        let (stream, device) = (ctx.stream, ctx.device);
        let completion = self.completion;
        debug!(%completion, batches = self.batch_events.len(), bytes = self.submitted, "transfer fully submitted");
        ctx.ledger
            .add_dependency_join(self.batch_events.clone(), move || {
                if !control.is_aborted() {
                    retire(&ledger, &streams, completion);
                    return;
                }
                let error = StreamError {
                    event: completion,
                    stream,
                    device,
                    code: StreamErrorCode::Device(DeviceErrorCode::Aborted),
                    response_kind: None,
                    core_dump: None,
                };
                deliver_error(&ledger, &streams, error);
            });
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Record a host-side submission failure for `event` and retire it.
pub(crate) fn fail_event(
    ledger: &EventLedger,
    streams: &StreamRegistry,
    stream: StreamId,
    device: DeviceId,
    event: EventId,
    reason: String,
) {
    let error = StreamError {
        event,
        stream,
        device,
        code: StreamErrorCode::SubmissionFailed(reason),
        response_kind: None,
        core_dump: None,
    };
    deliver_error(ledger, streams, error);
}

struct RunnerState {
    actions: VecDeque<Box<dyn TransferAction>>,
    running: bool,
}

struct RunnerShared {
    state: Mutex<RunnerState>,
    wake: Condvar,
    streams: Arc<StreamRegistry>,
    idle: Duration,
}

/// Drives queued transfer actions on one thread until each is fully submitted.
///
/// Only the oldest unfinished action of a channel issues batches. Later actions on the same
/// channel sit behind its placeholder, and staging they took would be stuck there.
pub struct ActionRunner {
    shared: Arc<RunnerShared>,
    worker: Option<JoinHandle<()>>,
}

impl ActionRunner {
    pub fn new(streams: Arc<StreamRegistry>, idle: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(RunnerShared {
            state: Mutex::new(RunnerState {
                actions: VecDeque::new(),
                running: true,
            }),
            wake: Condvar::new(),
            streams,
            idle,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("rvax-action-runner".into())
            .spawn(move || runner_loop(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue `action`. After shutdown the action is finished immediately instead.
    pub fn submit(&self, mut action: Box<dyn TransferAction>) {
        let mut st = self.shared.state.lock();
        if !st.running {
            drop(st);
            warn!(completion = %action.completion(), "action runner stopped, abandoning transfer");
            action.on_finish();
            return;
        }
        st.actions.push_back(action);
        drop(st);
        self.shared.wake.notify_all();
    }

    /// Actions not yet fully submitted.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().actions.len()
    }

    pub fn shutdown(&mut self) {
        self.shared.state.lock().running = false;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("action runner panicked");
            }
        }
        let leftover: Vec<_> = self.shared.state.lock().actions.drain(..).collect();
        for mut action in leftover {
            action.on_finish();
        }
    }
}

impl Drop for ActionRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn runner_loop(shared: &RunnerShared) {
    loop {
        let mut batch: Vec<Box<dyn TransferAction>> = {
            let mut st = shared.state.lock();
            while st.running && st.actions.is_empty() {
                shared.wake.wait(&mut st);
            }
            if !st.running {
                return;
            }
            st.actions.drain(..).collect()
        };

        let mut progressed = false;
        let mut stalled = Vec::with_capacity(batch.len());
        let mut busy: HashSet<(DeviceId, QueueId)> = HashSet::new();
        for mut action in batch.drain(..) {
            if action.control().is_aborted() {
                debug!(completion = %action.completion(), "transfer aborted, dropping remaining batches");
                action.on_finish();
                progressed = true;
                continue;
            }
            let lane = action.lane();
            if busy.contains(&lane) {
                stalled.push(action);
                continue;
            }
            let before = action.submitted_bytes();
            match action.advance() {
                Ok(true) => {
                    action.on_finish();
                    progressed = true;
                }
                Ok(false) => {
                    progressed |= action.submitted_bytes() != before;
                    busy.insert(lane);
                    stalled.push(action);
                }
                Err(err) => {
                    let completion = action.completion();
                    let stream = action.stream();
                    let device = action.context().device;
                    error!(%completion, %stream, %device, "transfer abandoned: {err}");
                    let error = StreamError {
                        event: completion,
                        stream,
                        device,
                        code: StreamErrorCode::SubmissionFailed(err.to_string()),
                        response_kind: None,
                        core_dump: None,
                    };
                    // The completion itself still retires through on_finish.
                    if !shared.streams.execute_callback(completion, &error, || {}) {
                        shared.streams.add_error(error);
                    }
                    action.on_finish();
                    progressed = true;
                }
            }
        }

        if stalled.is_empty() {
            continue;
        }
        if !progressed {
            stalled[0].wait_for_progress(shared.idle);
        }
        let mut st = shared.state.lock();
        // Stalled actions keep their place ahead of newly submitted ones.
        for action in stalled.into_iter().rev() {
            st.actions.push_front(action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_element_size_and_staging_layout() {
        let host = HostBuffer::zeroed(1000);
        let limits = DmaLimits {
            max_element_size: 300,
            max_element_count: 8,
        };
        let segments = [
            Segment {
                host: host.clone(),
                host_offset: 0,
                device_addr: 0x1000,
                len: 700,
            },
            Segment {
                host,
                host_offset: 900,
                device_addr: 0x9000,
                len: 100,
            },
        ];
        assert_eq!(node_count(&segments, &limits), 4);

        let pieces = split(&segments, &limits);
        let layout: Vec<(usize, u64, u64, u64)> = pieces
            .iter()
            .map(|p| (p.host_offset, p.device_addr, p.staging_offset, p.len))
            .collect();
        assert_eq!(
            layout,
            vec![
                (0, 0x1000, 0, 300),
                (300, 0x1000 + 300, 300, 300),
                (600, 0x1000 + 600, 600, 100),
                (900, 0x9000, 700, 100),
            ]
        );
    }

    #[test]
    fn host_range_is_checked() {
        let host = HostBuffer::zeroed(16);
        assert!(check_host_range(&host, 0, 16).is_ok());
        assert!(check_host_range(&host, 8, 9).is_err());
        assert!(check_host_range(&host, usize::MAX, 1).is_err());
    }

    #[test]
    fn control_hands_out_its_batches_once() {
        let control = TransferControl::new(EventId(7));
        control.state.lock().commands.extend([EventId(8), EventId(9)]);
        assert!(!control.is_aborted());
        assert_eq!(control.abort(), Some(vec![EventId(8), EventId(9)]));
        assert!(control.is_aborted());
        assert_eq!(control.abort(), None);
        assert_eq!(control.completion(), EventId(7));
    }
}
