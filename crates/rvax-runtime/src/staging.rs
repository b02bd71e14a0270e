//! Pinned host staging pool.
//!
//! Host ↔ device copies hop through one pinned region per device. The region is carved with
//! the same [`BlockAllocator`] as device DRAM; an exhausted pool is not an error but the
//! pipeline's backpressure signal (`alloc` returns `None` and the caller retries later).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::allocator::{AllocError, BlockAllocator};
use crate::error::{Result, RuntimeError};
use crate::transport::{check_range, DeviceTransport, DmaLimits, PinnedRegion, TransportError};
use crate::types::DeviceId;

/// A range of the staging region owned by one in-flight batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingBuffer {
    offset: u64,
    len: u64,
    dma_address: u64,
}

impl StagingBuffer {
    /// Offset from the start of the pinned region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of the first byte, as used in DMA nodes.
    pub fn dma_address(&self) -> u64 {
        self.dma_address
    }
}

pub struct StagingPool {
    device: DeviceId,
    transport: Arc<dyn DeviceTransport>,
    region: Arc<dyn PinnedRegion>,
    blocks: Mutex<BlockAllocator>,
    space: Condvar,
}

impl StagingPool {
    /// Pin `max_batch_bytes × overcommit` bytes, giving up 25% per failed attempt until the
    /// transport agrees or the request drops below one block.
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        device: DeviceId,
        limits: DmaLimits,
        overcommit: usize,
        block_size: u64,
    ) -> Result<Self> {
        let wanted = limits
            .max_batch_bytes()
            .saturating_mul(overcommit as u64)
            .min(usize::MAX as u64);
        let mut size = wanted;
        let region = loop {
            if size < block_size {
                return Err(RuntimeError::StagingUnavailable(device));
            }
            match transport.allocate_pinned_buffer(device, size as usize, true) {
                Ok(region) => break region,
                Err(err) => {
                    debug!(%device, size, "staging allocation refused, shrinking: {err}");
                    size -= size / 4;
                }
            }
        };
        if size < wanted {
            warn!(%device, wanted, size, "staging pool smaller than requested");
        }

        let blocks = BlockAllocator::new(region.dma_address(), region.len() as u64, block_size)
            .map_err(RuntimeError::from)?;
        Ok(Self {
            device,
            transport,
            region,
            blocks: Mutex::new(blocks),
            space: Condvar::new(),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Usable bytes of the pool.
    pub fn capacity(&self) -> u64 {
        self.blocks.lock().total_bytes()
    }

    /// Largest buffer `alloc` could currently return.
    pub fn free_bytes(&self) -> u64 {
        self.blocks.lock().largest_free_bytes()
    }

    pub fn alloc(&self, size: u64) -> Option<StagingBuffer> {
        if size == 0 {
            return None;
        }
        let dma_address = self.blocks.lock().malloc(size, 0).ok()?;
        Some(StagingBuffer {
            offset: dma_address - self.region.dma_address(),
            len: size,
            dma_address,
        })
    }

    pub fn free(&self, buffer: StagingBuffer) -> std::result::Result<(), AllocError> {
        self.blocks.lock().free(buffer.dma_address)?;
        self.space.notify_all();
        Ok(())
    }

    /// Wait until at least `min_bytes` are contiguously free. Returns `false` on timeout.
    pub fn wait_for_space(&self, min_bytes: u64, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut blocks = self.blocks.lock();
        while blocks.largest_free_bytes() < min_bytes {
            match deadline {
                Some(deadline) => {
                    if self.space.wait_until(&mut blocks, deadline).timed_out() {
                        return blocks.largest_free_bytes() >= min_bytes;
                    }
                }
                None => self.space.wait(&mut blocks),
            }
        }
        true
    }

    /// Copy `data` into `buffer` starting `offset` bytes in.
    pub fn write(
        &self,
        buffer: &StagingBuffer,
        offset: u64,
        data: &[u8],
    ) -> std::result::Result<(), TransportError> {
        check_range(offset as usize, data.len(), buffer.len as usize)?;
        self.region.write((buffer.offset + offset) as usize, data)
    }

    /// Fill `out` from `buffer` starting `offset` bytes in.
    pub fn read(
        &self,
        buffer: &StagingBuffer,
        offset: u64,
        out: &mut [u8],
    ) -> std::result::Result<(), TransportError> {
        check_range(offset as usize, out.len(), buffer.len as usize)?;
        self.region.read((buffer.offset + offset) as usize, out)
    }
}

impl Drop for StagingPool {
    fn drop(&mut self) {
        if let Err(err) = self
            .transport
            .free_pinned_buffer(self.device, Arc::clone(&self.region))
        {
            warn!(device = %self.device, "failed to release staging region: {err}");
        }
    }
}

impl std::fmt::Debug for StagingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let blocks = self.blocks.lock();
        f.debug_struct("StagingPool")
            .field("device", &self.device)
            .field("capacity", &blocks.total_bytes())
            .field("free", &blocks.free_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackConfig, LoopbackTransport};

    const DEV: DeviceId = DeviceId(0);

    fn limits() -> DmaLimits {
        DmaLimits {
            max_element_size: 64 << 10,
            max_element_count: 4,
        }
    }

    #[test]
    fn pool_is_sized_from_limits_and_overcommit() {
        let transport = Arc::new(LoopbackTransport::default());
        let pool = StagingPool::new(transport.clone(), DEV, limits(), 2, 4096).unwrap();
        assert_eq!(pool.capacity(), 512 << 10);
        assert_eq!(pool.free_bytes(), 512 << 10);
        drop(pool);
        assert_eq!(transport.pinned_in_use(), 0);
    }

    #[test]
    fn shrinks_until_the_transport_agrees() {
        let transport = Arc::new(LoopbackTransport::new(LoopbackConfig {
            pinned_limit: Some(300 << 10),
            ..LoopbackConfig::default()
        }));
        // 512K -> 384K -> 288K
        let pool = StagingPool::new(transport, DEV, limits(), 2, 4096).unwrap();
        assert_eq!(pool.capacity(), 288 << 10);
    }

    #[test]
    fn gives_up_below_one_block() {
        let transport = Arc::new(LoopbackTransport::new(LoopbackConfig {
            pinned_limit: Some(1024),
            ..LoopbackConfig::default()
        }));
        assert!(matches!(
            StagingPool::new(transport, DEV, limits(), 1, 4096),
            Err(RuntimeError::StagingUnavailable(DEV))
        ));
    }

    #[test]
    fn exhaustion_returns_none_and_free_restores() {
        let transport = Arc::new(LoopbackTransport::default());
        let pool = StagingPool::new(transport, DEV, limits(), 1, 4096).unwrap();
        let whole = pool.alloc(pool.capacity()).unwrap();
        assert_eq!(pool.alloc(1), None);
        assert!(!pool.wait_for_space(1, Duration::from_millis(5)));

        pool.free(whole).unwrap();
        assert!(pool.wait_for_space(1, Duration::ZERO));
        assert_eq!(pool.free_bytes(), pool.capacity());
        assert!(pool.free(whole).is_err());
    }

    #[test]
    fn write_then_read_through_a_buffer() {
        let transport = Arc::new(LoopbackTransport::default());
        let pool = StagingPool::new(transport, DEV, limits(), 1, 4096).unwrap();
        let _first = pool.alloc(100).unwrap();
        let buf = pool.alloc(100).unwrap();
        assert_eq!(buf.offset(), 4096);

        pool.write(&buf, 10, b"staged").unwrap();
        let mut out = [0u8; 6];
        pool.read(&buf, 10, &mut out).unwrap();
        assert_eq!(&out, b"staged");
        assert!(pool.write(&buf, 98, b"abc").is_err());
    }
}
