//! Device transport seam.
//!
//! The runtime never touches hardware directly. Everything it needs from the kernel driver
//! (submission queues, completion queues, pinned host memory, readiness notifications) goes
//! through [`DeviceTransport`]. [`loopback::LoopbackTransport`] is the in-process
//! implementation used by the test suites.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::types::{DeviceId, QueueId};

pub mod loopback;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("device {device} has no queue {queue}")]
    UnknownQueue { device: DeviceId, queue: u16 },

    #[error("pinned allocation of {size} bytes failed on {device}")]
    PinnedAllocationFailed { device: DeviceId, size: usize },

    #[error("pinned region access [{offset}, {offset}+{len}) exceeds its {capacity} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("pinned region at 0x{0:x} is read-only")]
    ReadOnly(u64),

    #[error("pinned region at 0x{0:x} is not owned by this transport")]
    ForeignRegion(u64),

    #[error("device {0} failed: {1}")]
    Device(DeviceId, String),
}

/// Per-call DMA descriptor limits of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaLimits {
    /// Largest single DMA node.
    pub max_element_size: u64,
    /// Most nodes one DMA list command may carry.
    pub max_element_count: u64,
}

impl DmaLimits {
    /// Largest payload one DMA list command can move.
    pub fn max_batch_bytes(&self) -> u64 {
        self.max_element_size.saturating_mul(self.max_element_count)
    }
}

/// Static description of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLayout {
    pub dram_base: u64,
    pub dram_size: u64,
    /// Device allocator granule.
    pub block_size: u64,
    pub queue_count: u16,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Readiness: u8 {
        /// Every submission queue can accept another command.
        const SUBMISSION = 1 << 0;
        /// At least one response is waiting to be received.
        const COMPLETION = 1 << 1;
    }
}

/// Host memory the device can DMA to and from.
pub trait PinnedRegion: Send + Sync {
    /// Bus address the device uses for offset 0 of this region.
    fn dma_address(&self) -> u64;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), TransportError>;
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), TransportError>;
}

pub trait DeviceTransport: Send + Sync {
    fn device_count(&self) -> u32;

    fn device_layout(&self, device: DeviceId) -> Result<DeviceLayout, TransportError>;

    fn dma_limits(&self, device: DeviceId) -> Result<DmaLimits, TransportError>;

    /// Hand one encoded command to a submission queue. `Ok(false)` means the queue is full and
    /// the caller should retry after a readiness event.
    fn send_command(
        &self,
        device: DeviceId,
        queue: QueueId,
        command: &[u8],
    ) -> Result<bool, TransportError>;

    /// Pop the next encoded response, if any.
    fn receive_response(&self, device: DeviceId) -> Result<Option<Vec<u8>>, TransportError>;

    /// Block until one of the `interest` conditions holds or `timeout` elapses. Returns the
    /// conditions that hold on return (possibly none).
    fn wait_for_readiness_events(
        &self,
        device: DeviceId,
        interest: Readiness,
        timeout: Duration,
    ) -> Readiness;

    fn allocate_pinned_buffer(
        &self,
        device: DeviceId,
        size: usize,
        writable: bool,
    ) -> Result<Arc<dyn PinnedRegion>, TransportError>;

    fn free_pinned_buffer(
        &self,
        device: DeviceId,
        region: Arc<dyn PinnedRegion>,
    ) -> Result<(), TransportError>;
}

pub(crate) fn check_range(offset: usize, len: usize, capacity: usize) -> Result<(), TransportError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(TransportError::OutOfRange {
            offset,
            len,
            capacity,
        }),
    }
}
