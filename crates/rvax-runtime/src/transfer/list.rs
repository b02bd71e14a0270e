//! Scatter/gather transfers: many host ↔ device ranges moved as one DMA list.
//!
//! Unlike the contiguous variants there is no chunking loop. The whole list must fit one
//! staging allocation and one command's node budget; anything larger is rejected before a
//! single command is queued.

use std::sync::Arc;
use std::time::Duration;

use crate::types::{DevicePtr, EventId, HostBuffer};

use super::{
    check_host_range, node_count, Segment, Submission, TransferAction, TransferContext,
    TransferControl, TransferError,
};

#[derive(Debug, Clone)]
pub struct HostToDeviceOp {
    pub src: HostBuffer,
    pub src_offset: usize,
    pub dst: DevicePtr,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct DeviceToHostOp {
    pub src: DevicePtr,
    pub dst: HostBuffer,
    pub dst_offset: usize,
    pub size: u64,
}

fn validate(ctx: &TransferContext, segments: &[Segment]) -> Result<u64, TransferError> {
    let total: u64 = segments.iter().map(|s| s.len).sum();
    let capacity = ctx.staging.capacity();
    if total > capacity {
        return Err(TransferError::TooLarge {
            requested: total,
            capacity,
        });
    }
    let nodes = node_count(segments, &ctx.limits);
    if nodes > ctx.limits.max_element_count {
        return Err(TransferError::TooManyNodes {
            nodes,
            max: ctx.limits.max_element_count,
        });
    }
    Ok(total)
}

/// Shared single-batch state of both list directions.
struct ListState {
    sub: Submission,
    segments: Vec<Segment>,
    total: u64,
    issued: bool,
}

impl ListState {
    fn new(
        ctx: TransferContext,
        completion: EventId,
        segments: Vec<Segment>,
        barrier: bool,
    ) -> Result<Self, TransferError> {
        let total = validate(&ctx, &segments)?;
        Ok(Self {
            sub: Submission::new(ctx, completion, barrier)?,
            segments,
            total,
            issued: false,
        })
    }

    fn advance(
        &mut self,
        issue: fn(&mut Submission, &[Segment]) -> Result<bool, TransferError>,
    ) -> Result<bool, TransferError> {
        if self.issued || self.total == 0 {
            self.issued = true;
            return Ok(true);
        }
        if self.sub.ctx().staging.free_bytes() < self.total {
            return Ok(false);
        }
        self.issued = issue(&mut self.sub, &self.segments)?;
        Ok(self.issued)
    }

    fn wait_for_progress(&self, timeout: Duration) {
        self.sub.ctx().staging.wait_for_space(self.total, timeout);
    }
}

pub struct HostToDeviceList {
    state: ListState,
}

impl HostToDeviceList {
    pub fn new(
        ctx: TransferContext,
        completion: EventId,
        ops: Vec<HostToDeviceOp>,
        barrier: bool,
    ) -> Result<Self, TransferError> {
        let mut segments = Vec::with_capacity(ops.len());
        for op in ops.into_iter().filter(|op| op.size > 0) {
            check_host_range(&op.src, op.src_offset, op.size)?;
            segments.push(Segment {
                host: op.src,
                host_offset: op.src_offset,
                device_addr: op.dst.0,
                len: op.size,
            });
        }
        Ok(Self {
            state: ListState::new(ctx, completion, segments, barrier)?,
        })
    }
}

impl TransferAction for HostToDeviceList {
    fn advance(&mut self) -> Result<bool, TransferError> {
        self.state.advance(Submission::issue_write_batch)
    }

    fn on_finish(&mut self) {
        self.state.sub.finish();
    }

    fn completion(&self) -> EventId {
        self.state.sub.completion()
    }

    fn context(&self) -> &TransferContext {
        self.state.sub.ctx()
    }

    fn control(&self) -> &Arc<TransferControl> {
        self.state.sub.control()
    }

    fn submitted_bytes(&self) -> u64 {
        self.state.sub.submitted()
    }

    fn wait_for_progress(&self, timeout: Duration) {
        self.state.wait_for_progress(timeout);
    }
}

pub struct DeviceToHostList {
    state: ListState,
}

impl DeviceToHostList {
    pub fn new(
        ctx: TransferContext,
        completion: EventId,
        ops: Vec<DeviceToHostOp>,
        barrier: bool,
    ) -> Result<Self, TransferError> {
        let mut segments = Vec::with_capacity(ops.len());
        for op in ops.into_iter().filter(|op| op.size > 0) {
            check_host_range(&op.dst, op.dst_offset, op.size)?;
            segments.push(Segment {
                host: op.dst,
                host_offset: op.dst_offset,
                device_addr: op.src.0,
                len: op.size,
            });
        }
        Ok(Self {
            state: ListState::new(ctx, completion, segments, barrier)?,
        })
    }
}

impl TransferAction for DeviceToHostList {
    fn advance(&mut self) -> Result<bool, TransferError> {
        self.state.advance(Submission::issue_read_batch)
    }

    fn on_finish(&mut self) {
        self.state.sub.finish();
    }

    fn completion(&self) -> EventId {
        self.state.sub.completion()
    }

    fn context(&self) -> &TransferContext {
        self.state.sub.ctx()
    }

    fn control(&self) -> &Arc<TransferControl> {
        self.state.sub.control()
    }

    fn submitted_bytes(&self) -> u64 {
        self.state.sub.submitted()
    }

    fn wait_for_progress(&self, timeout: Duration) {
        self.state.wait_for_progress(timeout);
    }
}
