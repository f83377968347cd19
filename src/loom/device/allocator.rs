use std::collections::VecDeque;

use rustc_hash::FxHashMap as HashMap;

use super::DeviceError;
use crate::loom::tensor::BufferType;

/// Alignment of every device allocation, in bytes.
pub const ALIGNMENT: u32 = 32;

/// One address space of a device.
#[derive(Debug, Clone)]
pub struct Region {
    buffer_type: BufferType,
    base: u32,
    size: u32,
    /// First address never handed out.
    top: u32,
    /// Freed addresses, keyed by their aligned size.
    free: HashMap<u32, VecDeque<u32>>,
    /// Live allocations and their aligned sizes.
    allocated: HashMap<u32, u32>,
}

impl Region {
    pub fn new(buffer_type: BufferType, base: u32, size: u32) -> Self {
        Self {
            buffer_type,
            base,
            size,
            top: base,
            free: Default::default(),
            allocated: Default::default(),
        }
    }

    /// Allocates `size` bytes, reusing a freed block of the same aligned size if there is one.
    pub fn alloc(&mut self, size: usize) -> Result<u32, DeviceError> {
        let oom = DeviceError::OutOfMemory(self.buffer_type, size);
        let aligned = u32::try_from(size)
            .ok()
            .and_then(|size| size.max(1).checked_next_multiple_of(ALIGNMENT))
            .ok_or(oom.clone())?;

        let address = match self.free.get_mut(&aligned).and_then(VecDeque::pop_front) {
            Some(address) => address,
            None => {
                let end = self.top.checked_add(aligned).ok_or(oom.clone())?;
                if end > self.base.saturating_add(self.size) {
                    return Err(oom);
                }
                std::mem::replace(&mut self.top, end)
            }
        };
        self.allocated.insert(address, aligned);
        Ok(address)
    }

    pub fn free(&mut self, address: u32) -> Result<(), DeviceError> {
        let size = self
            .allocated
            .remove(&address)
            .ok_or(DeviceError::NotAllocated(self.buffer_type, address))?;
        self.free.entry(size).or_default().push_back(address);
        Ok(())
    }

    #[inline]
    pub fn is_allocated(&self, address: u32) -> bool {
        self.allocated.contains_key(&address)
    }

    /// Number of bytes in live allocations.
    pub fn used(&self) -> usize {
        self.allocated.values().map(|&size| size as usize).sum()
    }
}

/// Buffer allocator of a device, one region per buffer type.
#[derive(Debug, Clone)]
pub struct Allocator {
    dram: Region,
    l1: Region,
}

impl Allocator {
    pub fn new(dram: (u32, u32), l1: (u32, u32)) -> Self {
        Self {
            dram: Region::new(BufferType::Dram, dram.0, dram.1),
            l1: Region::new(BufferType::L1, l1.0, l1.1),
        }
    }

    #[inline]
    pub fn region(&self, buffer_type: BufferType) -> &Region {
        match buffer_type {
            BufferType::Dram => &self.dram,
            BufferType::L1 => &self.l1,
        }
    }

    #[inline]
    pub fn region_mut(&mut self, buffer_type: BufferType) -> &mut Region {
        match buffer_type {
            BufferType::Dram => &mut self.dram,
            BufferType::L1 => &mut self.l1,
        }
    }

    #[inline]
    pub fn alloc(&mut self, buffer_type: BufferType, size: usize) -> Result<u32, DeviceError> {
        self.region_mut(buffer_type).alloc(size)
    }

    #[inline]
    pub fn free(&mut self, buffer_type: BufferType, address: u32) -> Result<(), DeviceError> {
        self.region_mut(buffer_type).free(address)
    }

    #[inline]
    pub fn is_allocated(&self, buffer_type: BufferType, address: u32) -> bool {
        self.region(buffer_type).is_allocated(address)
    }
}
