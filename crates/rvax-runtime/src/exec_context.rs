//! Kernel execution-context buffers.
//!
//! Every kernel launch needs a device buffer for its register file and stack. A fixed number
//! of them is carved from device DRAM at start-up; a launch reserves one under its tag and the
//! response dispatcher releases it when the launch completes.

use parking_lot::Mutex;
use tracing::debug;

use crate::allocator::{AllocError, DeviceAllocator};
use crate::types::{DeviceId, DevicePtr, EventId};

#[derive(Debug)]
struct Slot {
    addr: DevicePtr,
    owner: Option<EventId>,
}

#[derive(Debug)]
pub struct ExecContextPool {
    device: DeviceId,
    slots: Mutex<Vec<Slot>>,
}

impl ExecContextPool {
    pub fn new(
        device: DeviceId,
        allocator: &DeviceAllocator,
        count: usize,
        size: u64,
    ) -> Result<Self, AllocError> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let addr = allocator.malloc(size, 0)?;
            slots.push(Slot { addr, owner: None });
        }
        debug!(%device, count, size, "execution contexts reserved");
        Ok(Self {
            device,
            slots: Mutex::new(slots),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Hand a free context to the launch tagged `tag`.
    pub fn reserve(&self, tag: EventId) -> Option<DevicePtr> {
        let mut slots = self.slots.lock();
        let slot = slots.iter_mut().find(|s| s.owner.is_none())?;
        slot.owner = Some(tag);
        Some(slot.addr)
    }

    /// Return the context held by `tag`. `false` if `tag` holds none.
    pub fn release(&self, tag: EventId) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter_mut().find(|s| s.owner == Some(tag)) {
            Some(slot) => {
                slot.owner = None;
                true
            }
            None => false,
        }
    }

    pub fn available(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.owner.is_none()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }
}
