// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identifiers that travel in protocol messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-destination sequence number assigned to put-request, get and wait-put
/// control messages.
pub type SequenceNumber = u32;

/// Rank of a node in the cluster. Node `0` is the coordinator.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(u32);

impl NodeId {
    /// The coordinating node; the only node allowed to dispatch work.
    pub const COORDINATOR: NodeId = NodeId(0);

    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into per-node tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_coordinator(self) -> bool {
        self == Self::COORDINATOR
    }

    /// Iterate over every node of a cluster of `num_nodes`.
    pub fn all(num_nodes: usize) -> impl Iterator<Item = NodeId> {
        (0..num_nodes as u32).map(NodeId)
    }
}

impl From<u32> for NodeId {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Address inside a node's registered host memory.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Address(u64);

impl Address {
    pub const NULL: Address = Address(0);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes as u64)
    }
}

impl From<u64> for Address {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of a task dispatched to a remote node; the key of the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteTaskId(u64);

impl RemoteTaskId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RemoteTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Opaque identity of the host-side memory object a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HostObject(u64);

impl HostObject {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Correlates an asynchronous reply (malloc, get) with the slot waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}
