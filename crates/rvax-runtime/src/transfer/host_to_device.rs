use std::sync::Arc;
use std::time::Duration;

use crate::types::{DevicePtr, EventId, HostBuffer};

use super::{
    check_host_range, Segment, Submission, TransferAction, TransferContext, TransferControl,
    TransferError,
};

/// Contiguous host → device copy, chunked through the staging pool.
pub struct HostToDevice {
    sub: Submission,
    src: HostBuffer,
    src_offset: usize,
    dst: DevicePtr,
    size: u64,
    position: u64,
}

impl HostToDevice {
    /// Copy `size` bytes from `src[src_offset..]` to `dst`. `barrier` applies to the first batch.
    pub fn new(
        ctx: TransferContext,
        completion: EventId,
        src: HostBuffer,
        src_offset: usize,
        dst: DevicePtr,
        size: u64,
        barrier: bool,
    ) -> Result<Self, TransferError> {
        check_host_range(&src, src_offset, size)?;
        Ok(Self {
            sub: Submission::new(ctx, completion, barrier)?,
            src,
            src_offset,
            dst,
            size,
            position: 0,
        })
    }

    /// Batches issued so far.
    pub fn batches_issued(&self) -> usize {
        self.sub.batch_count()
    }
}

impl TransferAction for HostToDevice {
    fn advance(&mut self) -> Result<bool, TransferError> {
        if self.position == self.size {
            return Ok(true);
        }
        let ctx = self.sub.ctx();
        let chunk = ctx
            .staging
            .free_bytes()
            .min(self.size - self.position)
            .min(ctx.limits.max_batch_bytes());
        if chunk == 0 {
            return Ok(false);
        }

        let segment = Segment {
            host: self.src.clone(),
            host_offset: self.src_offset + self.position as usize,
            device_addr: self.dst.0 + self.position,
            len: chunk,
        };
        if !self.sub.issue_write_batch(&[segment])? {
            return Ok(false);
        }
        self.position += chunk;
        Ok(self.position == self.size)
    }

    fn on_finish(&mut self) {
        self.sub.finish();
    }

    fn completion(&self) -> EventId {
        self.sub.completion()
    }

    fn context(&self) -> &TransferContext {
        self.sub.ctx()
    }

    fn control(&self) -> &Arc<TransferControl> {
        self.sub.control()
    }

    fn submitted_bytes(&self) -> u64 {
        self.sub.submitted()
    }

    fn wait_for_progress(&self, timeout: Duration) {
        let ctx = self.sub.ctx();
        let want = (self.size - self.position)
            .min(ctx.limits.max_batch_bytes())
            .min(ctx.staging.capacity())
            .max(1);
        ctx.staging.wait_for_space(want, timeout);
    }
}
