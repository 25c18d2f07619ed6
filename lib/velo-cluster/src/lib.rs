// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node-to-node data movement and ordering for clustered task runtimes.
//!
//! `velo-cluster` moves task input/output data between the host memory of
//! cooperating nodes over a pluggable [`Transport`], and keeps the protocol
//! messages that depend on that data in issue order even when the transport
//! delivers them out of order.
//!
//! # Architecture
//!
//! [`NetworkContext`] is the single entry point. It is built once per process
//! and composes:
//!
//! - [`RegionForwardCache`]: per-node set of regions whose metadata has
//!   already been announced, so dimensions are only described once.
//! - [`SequenceArbiter`]: per-destination issue counters and per-source
//!   expected counters with a delay queue for early arrivals.
//! - [`RendezvousTracker`]: joins "expected bytes" (from the work message) and
//!   "received bytes" (from data payloads) to release a remote task exactly
//!   once, whatever the arrival order.
//! - [`WaitPutTable`]: holds requests on an address until the put that
//!   produces it has landed.
//! - [`StagingAllocator`]: bounded pack segment used to linearise strided
//!   rows, handed out as RAII [`StagingBuffer`]s.
//!
//! Inbound traffic reaches the context through an [`InboundEvent`] channel
//! which is drained by [`NetworkContext::poll`]. Nothing in this crate spawns
//! threads; progress happens on whichever threads issue operations or poll.

mod completion;
mod config;
mod error;
mod ids;
mod memory;
mod network;
mod region;
mod rendezvous;
mod scheduler;
mod sequence;
mod staging;
mod transfer;
mod transport;
mod wait_put;

#[cfg(feature = "local")]
pub mod local;

pub use completion::{CompletionState, CompletionTable};
pub use config::{ConfigError, NetworkConfig, PollConfig, StagingConfig};
pub use error::{MemoryError, NetworkError, TransportError};
pub use ids::{Address, HostObject, NodeId, RemoteTaskId, RequestId, SequenceNumber};
pub use memory::{HostMemory, RangeAllocator, SegmentInfo, SegmentMemory};
pub use network::{NetworkContext, NetworkStats, PollOutcome};
pub use region::{
    DimensionDescriptor, DirectoryKey, RegionDirectory, RegionForwardCache, RegionHandle,
    RegionId, RegionMetadata, RemoteRegion,
};
pub use rendezvous::{RendezvousEntry, RendezvousTracker};
pub use scheduler::{RemoteWork, Scheduler, WorkMessage};
pub use sequence::{SequenceArbiter, SequencedRequest};
pub use staging::{StagingAllocator, StagingBuffer, StagingError};
pub use transfer::{
    PendingTransfer, PendingTransferBuilder, PutMeta, StridedShape, pack_rows, unpack_rows,
};
pub use transport::{ArrivedPayload, DataArrival, InboundEvent, InboundSender, Transport};
pub use wait_put::{WaitOutcome, WaitPutTable};
