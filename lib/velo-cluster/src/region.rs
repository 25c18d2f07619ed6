// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Region descriptors and the caches that avoid re-describing them.
//!
//! A region is a rectangular view into a registered host object. The first
//! transfer of a region to a node carries its dimensions in a separate
//! metadata message; the [`RegionForwardCache`] remembers which nodes already
//! got it, and the receiving side records it in a [`RegionDirectory`].

use std::collections::HashSet;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ids::{HostObject, NodeId};

/// Identifier of a region within the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(u64);

impl RegionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Key of the directory entry a region was registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectoryKey(u64);

impl DirectoryKey {
    pub const fn new(key: u64) -> Self {
        Self(key)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A `(region, directory key)` pair. Immutable and owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRegion {
    pub id: RegionId,
    pub key: DirectoryKey,
}

impl RemoteRegion {
    pub const fn new(id: RegionId, key: DirectoryKey) -> Self {
        Self { id, key }
    }
}

/// One dimension of a rectangular region, in elements of the dimension below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionDescriptor {
    pub size: usize,
    pub accessed_offset: usize,
    pub accessed_length: usize,
}

/// Payload of the one-time region metadata message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMetadata {
    pub region: RemoteRegion,
    pub host_object: HostObject,
    pub dimensions: Vec<DimensionDescriptor>,
}

/// Everything the caller knows about the region a transfer touches.
#[derive(Debug, Clone)]
pub struct RegionHandle {
    pub region: RemoteRegion,
    pub host_object: HostObject,
    pub dimensions: Vec<DimensionDescriptor>,
}

impl RegionHandle {
    /// Build the metadata message. One descriptor per dimension is
    /// serialized, so callers only do this after a forward-cache miss.
    pub fn metadata(&self) -> RegionMetadata {
        RegionMetadata {
            region: self.region,
            host_object: self.host_object,
            dimensions: self.dimensions.clone(),
        }
    }
}

/// Per destination node, the regions whose metadata was already sent.
///
/// Entries are never invalidated: regions are append-only directory entries.
pub struct RegionForwardCache {
    nodes: Vec<Mutex<HashSet<RemoteRegion>>>,
}

impl RegionForwardCache {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            nodes: (0..num_nodes).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    pub fn is_region_forwarded(&self, node: NodeId, region: &RemoteRegion) -> bool {
        self.nodes
            .get(node.index())
            .is_some_and(|set| set.lock().contains(region))
    }

    /// Mark `region` as forwarded to `node`. Returns `true` only for the call
    /// that inserted it; repeated calls are harmless.
    pub fn add_forwarded_region(&self, node: NodeId, region: RemoteRegion) -> bool {
        match self.nodes.get(node.index()) {
            Some(set) => set.lock().insert(region),
            None => false,
        }
    }

    pub fn forwarded_count(&self, node: NodeId) -> usize {
        self.nodes.get(node.index()).map_or(0, |set| set.lock().len())
    }
}

/// Receive side record of region metadata announced by peers.
#[derive(Default)]
pub struct RegionDirectory {
    regions: DashMap<RemoteRegion, RegionMetadata>,
}

impl RegionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record metadata; returns `false` if the region was already known.
    pub fn register(&self, metadata: RegionMetadata) -> bool {
        let region = metadata.region;
        self.regions.insert(region, metadata).is_none()
    }

    pub fn lookup(&self, region: &RemoteRegion) -> Option<RegionMetadata> {
        self.regions.get(region).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
