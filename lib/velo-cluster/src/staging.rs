// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded staging segments for packing and receiving strided payloads.
//!
//! The transport only moves contiguous byte ranges, so strided rows are
//! linearised into a buffer reserved here. A reservation is a
//! [`StagingBuffer`]; dropping it returns the range to the segment on every
//! exit path.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;

use crate::memory::RangeAllocator;

const STAGING_ALIGN: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StagingError {
    /// The segment cannot hold the request. This indicates a segment sized
    /// too small for the workload, not a transient condition.
    #[error("{segment} segment cannot hold {requested} bytes ({used}/{capacity} in use)")]
    Exhausted {
        segment: &'static str,
        requested: usize,
        used: usize,
        capacity: usize,
    },
}

struct Segment {
    name: &'static str,
    ranges: Mutex<RangeAllocator>,
}

/// A fixed-capacity staging segment shared by every transfer of a node.
#[derive(Clone)]
pub struct StagingAllocator {
    segment: Arc<Segment>,
}

impl StagingAllocator {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            segment: Arc::new(Segment {
                name,
                ranges: Mutex::new(RangeAllocator::new(capacity, STAGING_ALIGN)),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.segment.name
    }

    pub fn capacity(&self) -> usize {
        self.segment.ranges.lock().capacity()
    }

    /// Bytes currently reserved by live buffers.
    pub fn used(&self) -> usize {
        self.segment.ranges.lock().used()
    }

    /// Reserve a zeroed buffer of `len` bytes.
    pub fn reserve(&self, len: usize) -> Result<StagingBuffer, StagingError> {
        let offset = {
            let mut ranges = self.segment.ranges.lock();
            match ranges.allocate(len) {
                Some(offset) => offset,
                None => {
                    return Err(StagingError::Exhausted {
                        segment: self.segment.name,
                        requested: len,
                        used: ranges.used(),
                        capacity: ranges.capacity(),
                    });
                }
            }
        };
        tracing::trace!(segment = self.segment.name, offset, len, "staging reserve");
        Ok(StagingBuffer {
            segment: self.segment.clone(),
            offset,
            data: BytesMut::zeroed(len),
        })
    }

    /// Reserve a buffer and fill it with `data`.
    pub fn stage(&self, data: &[u8]) -> Result<StagingBuffer, StagingError> {
        let mut buffer = self.reserve(data.len())?;
        buffer.as_mut_slice().copy_from_slice(data);
        Ok(buffer)
    }
}

impl fmt::Debug for StagingAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges = self.segment.ranges.lock();
        f.debug_struct("StagingAllocator")
            .field("name", &self.segment.name)
            .field("used", &ranges.used())
            .field("capacity", &ranges.capacity())
            .finish()
    }
}

/// A live reservation in a staging segment.
pub struct StagingBuffer {
    segment: Arc<Segment>,
    offset: usize,
    data: BytesMut,
}

impl StagingBuffer {
    /// Offset of the reservation inside its segment.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy the contents out for a transport that needs owned bytes. The
    /// reservation is still held until `self` is dropped.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        let released = self.segment.ranges.lock().release(self.offset);
        debug_assert!(released.is_some(), "staging range released twice");
        tracing::trace!(segment = self.segment.name, offset = self.offset, "staging release");
    }
}

impl fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("segment", &self.segment.name)
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish()
    }
}
