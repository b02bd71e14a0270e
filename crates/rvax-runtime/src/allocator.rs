//! Block-granular first-fit allocator.
//!
//! [`BlockAllocator`] manages an address range `[base, base + blocks * block_size)` and never
//! stores raw addresses: allocations and free chunks are tracked as 32-bit block indices
//! relative to `base` ("compressed" pointers). A single allocator therefore spans at most
//! `u32::MAX` blocks; larger ranges are rejected at construction with
//! [`AllocError::AddressSpaceTooLarge`].
//!
//! The same core backs device DRAM ([`DeviceAllocator`]) and the host staging pool.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{DeviceId, DevicePtr};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of memory: requested {requested} bytes (alignment {alignment}), {free} bytes free")]
    OutOfMemory {
        requested: u64,
        alignment: u64,
        free: u64,
    },

    #[error("invalid free of address 0x{0:x} (not a live allocation)")]
    InvalidFree(u64),

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u64),

    #[error("block size {0} is not a power of two")]
    InvalidBlockSize(u64),

    #[error("address space of {blocks} blocks exceeds the 32-bit compressed pointer range")]
    AddressSpaceTooLarge { blocks: u64 },
}

/// Round `value` up to the nearest multiple of `alignment` (`alignment` must be > 0).
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    // `value + alignment - 1` can overflow for pathological inputs; saturate instead.
    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk {
    pub start: u32,
    pub size_in_blocks: u32,
}

impl FreeChunk {
    fn end(self) -> u64 {
        self.start as u64 + self.size_in_blocks as u64
    }
}

#[derive(Debug, Clone)]
pub struct BlockAllocator {
    base: u64,
    block_size: u64,
    total_blocks: u32,
    /// Sorted by `start`; adjacent chunks are always merged.
    free: Vec<FreeChunk>,
    /// compressed start -> size in blocks.
    allocations: BTreeMap<u32, u32>,
}

impl BlockAllocator {
    /// Manage `size_bytes` starting at `base`.
    ///
    /// Address zero is reserved as the null pointer: a zero `base` is moved up by one block
    /// and the range shrinks accordingly. A `base` that is not block aligned is rounded up.
    pub fn new(base: u64, size_bytes: u64, block_size: u64) -> Result<Self, AllocError> {
        if !block_size.is_power_of_two() {
            return Err(AllocError::InvalidBlockSize(block_size));
        }

        let requested_base = if base == 0 { block_size } else { base };
        let aligned_base = align_up(requested_base, block_size);
        let lost = aligned_base - base;
        let usable = size_bytes.saturating_sub(lost);

        let blocks = usable / block_size;
        if blocks > u32::MAX as u64 {
            return Err(AllocError::AddressSpaceTooLarge { blocks });
        }
        let total_blocks = blocks as u32;

        let free = if total_blocks > 0 {
            vec![FreeChunk {
                start: 0,
                size_in_blocks: total_blocks,
            }]
        } else {
            Vec::new()
        };

        Ok(Self {
            base: aligned_base,
            block_size,
            total_blocks,
            free,
            allocations: BTreeMap::new(),
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_blocks as u64 * self.block_size
    }

    pub fn free_bytes(&self) -> u64 {
        self.free
            .iter()
            .map(|c| c.size_in_blocks as u64)
            .sum::<u64>()
            * self.block_size
    }

    pub fn largest_free_bytes(&self) -> u64 {
        self.free
            .iter()
            .map(|c| c.size_in_blocks as u64)
            .max()
            .unwrap_or(0)
            * self.block_size
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn free_chunks(&self) -> &[FreeChunk] {
        &self.free
    }

    /// Size in bytes of the live allocation starting at `addr`.
    pub fn allocation_size(&self, addr: u64) -> Option<u64> {
        let compressed = self.compress(addr)?;
        self.allocations
            .get(&compressed)
            .map(|blocks| *blocks as u64 * self.block_size)
    }

    /// Live allocations as `(address, size_bytes)`, ordered by address.
    pub fn allocations(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.allocations
            .iter()
            .map(|(start, blocks)| (self.decompress(*start), *blocks as u64 * self.block_size))
    }

    fn compress(&self, addr: u64) -> Option<u32> {
        let offset = addr.checked_sub(self.base)?;
        if offset % self.block_size != 0 {
            return None;
        }
        u32::try_from(offset / self.block_size).ok()
    }

    fn decompress(&self, compressed: u32) -> u64 {
        self.base + compressed as u64 * self.block_size
    }

    /// First-fit allocation of `size` bytes aligned to `alignment`.
    ///
    /// `alignment == 0` means block alignment; smaller alignments are raised to one block.
    /// A zero-byte request still consumes one block so every allocation has a unique address.
    pub fn malloc(&mut self, size: u64, alignment: u64) -> Result<u64, AllocError> {
        let alignment = if alignment == 0 {
            self.block_size
        } else if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        } else {
            alignment.max(self.block_size)
        };

        let out_of_memory = || AllocError::OutOfMemory {
            requested: size,
            alignment,
            free: self.free_bytes(),
        };

        let needed = (align_up(size, self.block_size) / self.block_size).max(1);
        if needed > self.total_blocks as u64 {
            return Err(out_of_memory());
        }

        for idx in 0..self.free.len() {
            let chunk = self.free[idx];
            let chunk_addr = self.decompress(chunk.start);
            let aligned_addr = align_up(chunk_addr, alignment);
            let padding = (aligned_addr - chunk_addr) / self.block_size;
            if padding + needed > chunk.size_in_blocks as u64 {
                continue;
            }

            let alloc_start = chunk.start + padding as u32;
            let tail_start = alloc_start as u64 + needed;
            let tail_blocks = chunk.end() - tail_start;

            let mut replacement = Vec::with_capacity(2);
            if padding > 0 {
                replacement.push(FreeChunk {
                    start: chunk.start,
                    size_in_blocks: padding as u32,
                });
            }
            if tail_blocks > 0 {
                replacement.push(FreeChunk {
                    start: tail_start as u32,
                    size_in_blocks: tail_blocks as u32,
                });
            }
            self.free.splice(idx..idx + 1, replacement);
            self.allocations.insert(alloc_start, needed as u32);
            return Ok(self.decompress(alloc_start));
        }

        Err(out_of_memory())
    }

    /// Return the allocation starting at `addr` to the free list, merging with its neighbours.
    pub fn free(&mut self, addr: u64) -> Result<u64, AllocError> {
        let start = self.compress(addr).ok_or(AllocError::InvalidFree(addr))?;
        let size = self
            .allocations
            .remove(&start)
            .ok_or(AllocError::InvalidFree(addr))?;

        let released = FreeChunk {
            start,
            size_in_blocks: size,
        };
        let idx = self.free.partition_point(|c| c.start < start);
        let merge_left = idx > 0 && self.free[idx - 1].end() == start as u64;
        let merge_right = idx < self.free.len() && released.end() == self.free[idx].start as u64;

        match (merge_left, merge_right) {
            (true, true) => {
                let right = self.free.remove(idx);
                self.free[idx - 1].size_in_blocks += size + right.size_in_blocks;
            }
            (true, false) => self.free[idx - 1].size_in_blocks += size,
            (false, true) => {
                self.free[idx].start = start;
                self.free[idx].size_in_blocks += size;
            }
            (false, false) => self.free.insert(idx, released),
        }

        Ok(size as u64 * self.block_size)
    }
}

/// Thread-safe allocator over one device's DRAM.
#[derive(Debug)]
pub struct DeviceAllocator {
    device: DeviceId,
    inner: Mutex<BlockAllocator>,
}

impl DeviceAllocator {
    pub fn new(
        device: DeviceId,
        dram_base: u64,
        dram_size: u64,
        block_size: u64,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            device,
            inner: Mutex::new(BlockAllocator::new(dram_base, dram_size, block_size)?),
        })
    }

    pub fn malloc(&self, size: u64, alignment: u64) -> Result<DevicePtr, AllocError> {
        let result = self.inner.lock().malloc(size, alignment);
        match result {
            Ok(addr) => {
                debug!(device = %self.device, addr = %DevicePtr(addr), size, "device malloc");
                Ok(DevicePtr(addr))
            }
            Err(err) => {
                warn!(device = %self.device, size, alignment, "device malloc failed: {err}");
                Err(err)
            }
        }
    }

    pub fn free(&self, ptr: DevicePtr) -> Result<(), AllocError> {
        let bytes = self.inner.lock().free(ptr.0)?;
        debug!(device = %self.device, addr = %ptr, bytes, "device free");
        Ok(())
    }

    pub fn free_bytes(&self) -> u64 {
        self.inner.lock().free_bytes()
    }

    pub fn largest_free_bytes(&self) -> u64 {
        self.inner.lock().largest_free_bytes()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes()
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.lock().allocation_count()
    }

    pub fn free_chunks(&self) -> Vec<FreeChunk> {
        self.inner.lock().free_chunks().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x8000_0000;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(u64::MAX, 256), u64::MAX / 256 * 256);
    }

    #[test]
    fn aligned_alloc_and_free_restores_pool() {
        let alloc = DeviceAllocator::new(DeviceId(0), BASE, 4096, 256).unwrap();
        let ptr = alloc.malloc(1024, 256).unwrap();
        assert_eq!(ptr.0 % 256, 0);
        assert_eq!(alloc.free_bytes(), 3072);

        alloc.free(ptr).unwrap();
        assert_eq!(alloc.free_bytes(), 4096);
        assert_eq!(
            alloc.free_chunks(),
            vec![FreeChunk {
                start: 0,
                size_in_blocks: 16
            }]
        );
    }

    #[test]
    fn zero_base_is_bumped_by_one_block() {
        let alloc = BlockAllocator::new(0, 4096, 256).unwrap();
        assert_eq!(alloc.base(), 256);
        assert_eq!(alloc.total_bytes(), 3840);
    }

    #[test]
    fn alignment_padding_becomes_free_chunk() {
        let mut alloc = BlockAllocator::new(BASE + 256, 8192, 256).unwrap();
        let addr = alloc.malloc(256, 1024).unwrap();
        assert_eq!(addr % 1024, 0);
        assert_eq!(addr, BASE + 1024);
        assert_eq!(
            alloc.free_chunks(),
            &[
                FreeChunk {
                    start: 0,
                    size_in_blocks: 3
                },
                FreeChunk {
                    start: 4,
                    size_in_blocks: 27
                },
            ]
        );
    }

    #[test]
    fn first_fit_takes_the_earliest_chunk() {
        let mut alloc = BlockAllocator::new(BASE, 16 * 256, 256).unwrap();
        let a = alloc.malloc(256, 0).unwrap();
        let _b = alloc.malloc(256, 0).unwrap();
        let c = alloc.malloc(512, 0).unwrap();
        let _d = alloc.malloc(256, 0).unwrap();
        alloc.free(a).unwrap();
        alloc.free(c).unwrap();

        // Both holes fit one block; the lower one wins.
        assert_eq!(alloc.malloc(1, 0).unwrap(), a);
    }

    #[test]
    fn double_free_and_foreign_pointers_are_rejected() {
        let mut alloc = BlockAllocator::new(BASE, 4096, 256).unwrap();
        let a = alloc.malloc(100, 0).unwrap();
        alloc.free(a).unwrap();
        assert_eq!(alloc.free(a), Err(AllocError::InvalidFree(a)));
        assert_eq!(alloc.free(a + 1), Err(AllocError::InvalidFree(a + 1)));
        assert_eq!(alloc.free(BASE - 256), Err(AllocError::InvalidFree(BASE - 256)));
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut alloc = BlockAllocator::new(BASE, 1024, 256).unwrap();
        alloc.malloc(1024, 0).unwrap();
        assert!(matches!(
            alloc.malloc(1, 0),
            Err(AllocError::OutOfMemory { free: 0, .. })
        ));
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        let mut alloc = BlockAllocator::new(BASE, 4096, 256).unwrap();
        assert_eq!(alloc.malloc(16, 384), Err(AllocError::InvalidAlignment(384)));
    }

    #[test]
    fn adjacent_frees_coalesce_in_either_order() {
        let layout = |first_a: bool| {
            let mut alloc = BlockAllocator::new(BASE, 8 * 256, 256).unwrap();
            let a = alloc.malloc(512, 0).unwrap();
            let b = alloc.malloc(256, 0).unwrap();
            let _guard = alloc.malloc(256, 0).unwrap();
            if first_a {
                alloc.free(a).unwrap();
                alloc.free(b).unwrap();
            } else {
                alloc.free(b).unwrap();
                alloc.free(a).unwrap();
            }
            alloc.free_chunks().to_vec()
        };

        let mut combined = BlockAllocator::new(BASE, 8 * 256, 256).unwrap();
        let ab = combined.malloc(768, 0).unwrap();
        let _guard = combined.malloc(256, 0).unwrap();
        combined.free(ab).unwrap();

        assert_eq!(layout(true), layout(false));
        assert_eq!(layout(true), combined.free_chunks().to_vec());
    }

    #[test]
    fn compressed_range_is_capped_at_u32_blocks() {
        let max = BlockAllocator::new(BASE, u32::MAX as u64, 1).unwrap();
        assert_eq!(max.total_bytes(), u32::MAX as u64);

        assert_eq!(
            BlockAllocator::new(BASE, u32::MAX as u64 + 1, 1).unwrap_err(),
            AllocError::AddressSpaceTooLarge {
                blocks: u32::MAX as u64 + 1
            }
        );
    }
}
