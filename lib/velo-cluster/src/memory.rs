// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host memory access and the segments registered with the transport.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::ids::{Address, NodeId};

/// Byte-addressed view of the memory a node exposes to the network.
///
/// Transfers read their source rows and write arriving payloads through this
/// trait; it is the only way the network layer touches task data.
pub trait HostMemory: Send + Sync {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copy `data` to `addr`.
    fn write(&self, addr: Address, data: &[u8]) -> Result<(), MemoryError>;

    /// Read `len` bytes starting at `addr`.
    fn read(&self, addr: Address, len: usize) -> Result<Bytes, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Location and size of the segment a node registered with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub node: NodeId,
    pub addr: Address,
    pub len: usize,
}

/// First-fit range allocator over `[0, capacity)`.
///
/// Freed ranges are coalesced with their neighbours. Used both for the
/// staging segments and for the heap behind remote `malloc`.
#[derive(Debug)]
pub struct RangeAllocator {
    capacity: usize,
    align: usize,
    free: BTreeMap<usize, usize>,
    live: HashMap<usize, usize>,
}

impl RangeAllocator {
    pub fn new(capacity: usize, align: usize) -> Self {
        let align = align.max(1);
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            align,
            free,
            live: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently handed out, including alignment padding.
    pub fn used(&self) -> usize {
        self.live.values().sum()
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Reserve `len` bytes, returning the offset of the range.
    pub fn allocate(&mut self, len: usize) -> Option<usize> {
        // zero-length requests still get a distinct offset
        let len = len.max(1).next_multiple_of(self.align);
        let (&offset, &free_len) = self.free.iter().find(|(_, free_len)| **free_len >= len)?;
        self.free.remove(&offset);
        if free_len > len {
            self.free.insert(offset + len, free_len - len);
        }
        self.live.insert(offset, len);
        Some(offset)
    }

    /// Release the range starting at `offset`, returning its length.
    pub fn release(&mut self, offset: usize) -> Option<usize> {
        let len = self.live.remove(&offset)?;
        let mut start = offset;
        let mut end = offset + len;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }
        self.free.insert(start, end - start);
        Some(len)
    }

    /// Length of the live range starting at `offset`.
    pub fn len_of(&self, offset: usize) -> Option<usize> {
        self.live.get(&offset).copied()
    }
}

const HEAP_ALIGN: usize = 8;

/// Host memory backed by one contiguous segment with a heap for remote
/// allocations.
///
/// Addresses are `base + offset`; `base` is never zero so [`Address::NULL`]
/// is never handed out.
pub struct SegmentMemory {
    base: Address,
    storage: RwLock<Vec<u8>>,
    heap: Mutex<RangeAllocator>,
}

impl SegmentMemory {
    pub fn new(base: Address, len: usize) -> Self {
        debug_assert!(!base.is_null());
        Self {
            base,
            storage: RwLock::new(vec![0u8; len]),
            heap: Mutex::new(RangeAllocator::new(len, HEAP_ALIGN)),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn len(&self) -> usize {
        self.storage.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve `size` bytes from the segment heap.
    pub fn allocate(&self, size: usize) -> Result<Address, MemoryError> {
        let offset = self
            .heap
            .lock()
            .allocate(size)
            .ok_or(MemoryError::Exhausted { requested: size })?;
        Ok(self.base.offset(offset))
    }

    /// Return an allocation to the heap.
    pub fn free(&self, addr: Address) -> Result<usize, MemoryError> {
        let offset = self.offset_of(addr).ok_or(MemoryError::NotAllocated(addr))?;
        self.heap
            .lock()
            .release(offset)
            .ok_or(MemoryError::NotAllocated(addr))
    }

    /// Copy the first `min(old_size, new_size)` bytes of `old` to `new` and
    /// free `old`. `new` is an allocation the caller already holds.
    pub fn relocate(
        &self,
        old: Address,
        old_size: usize,
        new: Address,
        new_size: usize,
    ) -> Result<(), MemoryError> {
        let prefix = self.read(old, old_size.min(new_size))?;
        self.write(new, &prefix)?;
        self.free(old)?;
        Ok(())
    }

    pub fn info(&self, node: NodeId) -> SegmentInfo {
        SegmentInfo {
            node,
            addr: self.base,
            len: self.len(),
        }
    }

    fn offset_of(&self, addr: Address) -> Option<usize> {
        addr.as_u64()
            .checked_sub(self.base.as_u64())
            .map(|offset| offset as usize)
    }

    fn range(
        &self,
        addr: Address,
        len: usize,
        limit: usize,
    ) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = self
            .offset_of(addr)
            .ok_or(MemoryError::OutOfBounds { addr, len })?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= limit)
            .ok_or(MemoryError::OutOfBounds { addr, len })?;
        Ok(start..end)
    }
}

impl HostMemory for SegmentMemory {
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), MemoryError> {
        let storage = self.storage.read();
        let range = self.range(addr, buf.len(), storage.len())?;
        buf.copy_from_slice(&storage[range]);
        Ok(())
    }

    fn write(&self, addr: Address, data: &[u8]) -> Result<(), MemoryError> {
        let mut storage = self.storage.write();
        let range = self.range(addr, data.len(), storage.len())?;
        storage[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_allocator_first_fit_and_coalesce() {
        let mut alloc = RangeAllocator::new(64, 8);
        let a = alloc.allocate(16).unwrap();
        let b = alloc.allocate(16).unwrap();
        let c = alloc.allocate(32).unwrap();
        assert_eq!((a, b, c), (0, 16, 32));
        assert!(alloc.allocate(1).is_none());

        assert_eq!(alloc.release(a), Some(16));
        assert_eq!(alloc.release(b), Some(16));
        // a and b coalesced into one 32 byte hole
        assert_eq!(alloc.allocate(32), Some(0));
        assert_eq!(alloc.release(c), Some(32));
        assert_eq!(alloc.release(c), None);
    }

    #[test]
    fn test_range_allocator_rounds_to_alignment() {
        let mut alloc = RangeAllocator::new(32, 8);
        assert_eq!(alloc.allocate(3), Some(0));
        assert_eq!(alloc.allocate(0), Some(8));
        assert_eq!(alloc.used(), 16);
        assert_eq!(alloc.live_allocations(), 2);
    }

    #[test]
    fn test_segment_read_write_bounds() {
        let mem = SegmentMemory::new(Address::new(0x1000), 64);
        mem.write(Address::new(0x1010), b"hello").unwrap();
        assert_eq!(&mem.read(Address::new(0x1010), 5).unwrap()[..], b"hello");

        let err = mem.write(Address::new(0x103e), b"abc").unwrap_err();
        assert_eq!(err, MemoryError::OutOfBounds {
            addr: Address::new(0x103e),
            len: 3
        });
        assert!(mem.read(Address::new(0x10), 1).is_err());
    }

    #[test]
    fn test_segment_heap_allocate_free_relocate() {
        let mem = SegmentMemory::new(Address::new(0x4000), 128);
        let addr = mem.allocate(16).unwrap();
        assert_eq!(addr, Address::new(0x4000));
        mem.write(addr, &[7u8; 16]).unwrap();

        let moved = mem.allocate(32).unwrap();
        mem.relocate(addr, 16, moved, 32).unwrap();
        assert_eq!(&mem.read(moved, 16).unwrap()[..], &[7u8; 16]);
        assert_eq!(mem.free(addr), Err(MemoryError::NotAllocated(addr)));
        assert_eq!(mem.free(moved), Ok(32));
        assert!(matches!(
            mem.allocate(1024),
            Err(MemoryError::Exhausted { requested: 1024 })
        ));
    }
}
