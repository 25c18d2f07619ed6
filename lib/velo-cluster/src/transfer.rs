// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outstanding transfers and the row packing protocol.
//!
//! A transfer with `ld == 0` is one contiguous copy. Otherwise it moves
//! `count` rows of `len` bytes spaced `ld` bytes apart: the sender packs the
//! rows into a contiguous staging buffer, the transport moves that buffer,
//! and the receiver unpacks it row by row into the strided destination.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, NetworkError};
use crate::ids::{Address, HostObject, NodeId, RemoteTaskId, RequestId, SequenceNumber};
use crate::memory::HostMemory;
use crate::region::RemoteRegion;

/// Geometry of a transfer: `count` rows of `size` bytes, `ld` bytes apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StridedShape {
    pub size: usize,
    pub count: usize,
    pub ld: usize,
}

impl StridedShape {
    pub fn new(size: usize, count: usize, ld: usize) -> Result<Self, NetworkError> {
        let invalid = |reason| NetworkError::InvalidShape {
            size,
            count,
            ld,
            reason,
        };
        if count == 0 {
            return Err(invalid("row count must be positive"));
        }
        if count > 1 && ld < size {
            return Err(invalid("rows overlap: stride is smaller than the row size"));
        }
        if size.checked_mul(count).is_none() {
            return Err(invalid("packed length overflows"));
        }
        let span = (count - 1).checked_mul(ld).and_then(|rows| rows.checked_add(size));
        if span.is_none() {
            return Err(invalid("strided span overflows"));
        }
        Ok(Self { size, count, ld })
    }

    /// A single contiguous range.
    pub fn contiguous(size: usize) -> Self {
        Self {
            size,
            count: 1,
            ld: 0,
        }
    }

    pub fn is_strided(&self) -> bool {
        self.ld != 0
    }

    /// Bytes on the wire.
    pub fn packed_len(&self) -> usize {
        self.size * self.count
    }

    /// Bytes covered in the strided address space, from the first row start
    /// to the last row end.
    pub fn span(&self) -> usize {
        if self.count == 0 {
            return 0;
        }
        (self.count - 1) * self.ld + self.size
    }

    fn row_offset(&self, row: usize) -> usize {
        row * self.ld
    }
}

/// Per-payload information the receiver needs to account for a put.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutMeta {
    /// Task whose input this payload is, if any.
    pub task: Option<RemoteTaskId>,
    /// Host address the payload satisfies; matched against wait-put requests.
    pub tag: Address,
    pub host_object: HostObject,
    pub region: Option<RemoteRegion>,
    /// Reply slot on the receiver when the payload answers a get.
    pub completion: Option<RequestId>,
}

/// One outstanding data movement: where from, where to, what shape, on
/// behalf of which task, and under which sequence number it was issued.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct PendingTransfer {
    /// Source address on the node executing the transfer.
    pub orig_addr: Address,
    /// Destination address on `dest_node`.
    pub dest_addr: Address,
    /// Row length in bytes (the whole length when contiguous).
    pub len: usize,
    #[builder(default = "1")]
    pub count: usize,
    /// Row stride; `0` means contiguous.
    #[builder(default)]
    pub ld: usize,
    pub dest_node: NodeId,
    #[builder(default)]
    pub task: Option<RemoteTaskId>,
    #[builder(default)]
    pub host_object: HostObject,
    #[builder(default)]
    pub region: Option<RemoteRegion>,
    #[builder(default)]
    pub seq: SequenceNumber,
    #[builder(default)]
    pub completion: Option<RequestId>,
}

impl Default for PendingTransfer {
    fn default() -> Self {
        Self {
            orig_addr: Address::NULL,
            dest_addr: Address::NULL,
            len: 0,
            count: 1,
            ld: 0,
            dest_node: NodeId::COORDINATOR,
            task: None,
            host_object: HostObject::default(),
            region: None,
            seq: 0,
            completion: None,
        }
    }
}

impl PendingTransfer {
    pub fn builder() -> PendingTransferBuilder {
        PendingTransferBuilder::default()
    }

    pub fn shape(&self) -> StridedShape {
        StridedShape {
            size: self.len,
            count: self.count,
            ld: self.ld,
        }
    }

    pub fn is_strided(&self) -> bool {
        self.ld != 0
    }

    pub fn total_bytes(&self) -> usize {
        self.len * self.count
    }

    /// Metadata attached to the payload this transfer produces.
    pub fn put_meta(&self) -> PutMeta {
        PutMeta {
            task: self.task,
            tag: self.dest_addr,
            host_object: self.host_object,
            region: self.region,
            completion: self.completion,
        }
    }
}

impl From<PendingTransferBuilderError> for NetworkError {
    fn from(err: PendingTransferBuilderError) -> Self {
        NetworkError::InvalidTransfer(err.to_string())
    }
}

/// Pack `shape.count` rows starting at `src` in host memory into `out`.
pub fn pack_rows(
    memory: &dyn HostMemory,
    src: Address,
    shape: StridedShape,
    out: &mut [u8],
) -> Result<(), MemoryError> {
    debug_assert_eq!(out.len(), shape.packed_len());
    if shape.size == 0 {
        return Ok(());
    }
    for (row, chunk) in out.chunks_exact_mut(shape.size).enumerate() {
        memory.read_into(src.offset(shape.row_offset(row)), chunk)?;
    }
    Ok(())
}

/// Unpack contiguous `packed` rows into host memory starting at `dst`.
pub fn unpack_rows(
    memory: &dyn HostMemory,
    dst: Address,
    shape: StridedShape,
    packed: &[u8],
) -> Result<(), MemoryError> {
    debug_assert_eq!(packed.len(), shape.packed_len());
    if shape.size == 0 {
        return Ok(());
    }
    for (row, chunk) in packed.chunks_exact(shape.size).enumerate() {
        memory.write(dst.offset(shape.row_offset(row)), chunk)?;
    }
    Ok(())
}
