use std::sync::Arc;
use std::time::Duration;

use crate::types::{DevicePtr, EventId, HostBuffer};

use super::{
    check_host_range, Segment, Submission, TransferAction, TransferContext, TransferControl,
    TransferError,
};

/// Contiguous device → host copy. Each batch is read into staging by the device, then copied
/// out on the device's copy pool.
pub struct DeviceToHost {
    sub: Submission,
    src: DevicePtr,
    dst: HostBuffer,
    dst_offset: usize,
    size: u64,
    position: u64,
}

impl DeviceToHost {
    pub fn new(
        ctx: TransferContext,
        completion: EventId,
        src: DevicePtr,
        dst: HostBuffer,
        dst_offset: usize,
        size: u64,
        barrier: bool,
    ) -> Result<Self, TransferError> {
        check_host_range(&dst, dst_offset, size)?;
        Ok(Self {
            sub: Submission::new(ctx, completion, barrier)?,
            src,
            dst,
            dst_offset,
            size,
            position: 0,
        })
    }

    pub fn batches_issued(&self) -> usize {
        self.sub.batch_count()
    }
}

impl TransferAction for DeviceToHost {
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
            host: self.dst.clone(),
            host_offset: self.dst_offset + self.position as usize,
            device_addr: self.src.0 + self.position,
            len: chunk,
        };
        if !self.sub.issue_read_batch(&[segment])? {
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
