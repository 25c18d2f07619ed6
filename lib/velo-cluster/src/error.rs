// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::config::ConfigError;
use crate::ids::{Address, NodeId, RemoteTaskId, RequestId, SequenceNumber};
use crate::staging::StagingError;

/// Errors raised by [`NetworkContext`](crate::NetworkContext) operations.
///
/// Out-of-sequence arrival is not an error; it is absorbed by the delay queue.
/// Everything classified by [`NetworkError::is_fatal`] signals a protocol or
/// configuration bug and must not be retried.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{operation} may only be issued by the coordinator, called on {node}")]
    NotCoordinator {
        node: NodeId,
        operation: &'static str,
    },

    #[error("{node} is outside of the cluster ({num_nodes} nodes)")]
    NodeOutOfRange { node: NodeId, num_nodes: usize },

    #[error("staging allocation failed: {0}")]
    Staging(#[from] StagingError),

    #[error("host memory access failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("{task} received {received} bytes but only {expected} were declared")]
    RendezvousOverflow {
        task: RemoteTaskId,
        expected: usize,
        received: usize,
    },

    #[error("{task} declared its expected data size twice")]
    DuplicateDeclaration { task: RemoteTaskId },

    #[error("no rendezvous entry for {task}")]
    RendezvousEntryMissing { task: RemoteTaskId },

    #[error("no pending request {0}")]
    UnknownRequest(RequestId),

    #[error("request {0} was completed twice")]
    RequestAlreadyCompleted(RequestId),

    #[error("sequence {seq} from {from} was already applied (expecting {expected})")]
    StaleSequence {
        from: NodeId,
        seq: SequenceNumber,
        expected: SequenceNumber,
    },

    #[error("invalid strided shape size={size} count={count} ld={ld}: {reason}")]
    InvalidShape {
        size: usize,
        count: usize,
        ld: usize,
        reason: &'static str,
    },

    #[error("invalid transfer request: {0}")]
    InvalidTransfer(String),

    #[error("remote allocation of {size} bytes on {node} failed")]
    RemoteAllocationFailed { node: NodeId, size: usize },
}

impl NetworkError {
    /// Whether the error reports a violated invariant rather than an
    /// environmental failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NetworkError::Transport(_))
    }

    /// Log the error at the point it is raised and hand it back.
    pub(crate) fn fatal(self) -> Self {
        if self.is_fatal() {
            tracing::error!(error = %self, "fatal network protocol violation");
        }
        self
    }
}

/// Errors returned by [`Transport`](crate::Transport) implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was used before [`Transport::initialize`](crate::Transport::initialize).
    #[error("transport not initialized")]
    NotInitialized,

    /// The transport was initialized twice.
    #[error("transport already initialized")]
    AlreadyInitialized,

    /// The destination is not part of the cluster.
    #[error("unknown destination {0}")]
    UnknownNode(NodeId),

    /// The inbound side of the transport was dropped.
    #[error("inbound channel closed")]
    InboundClosed,

    /// The transport was finalized.
    #[error("transport finalized")]
    Finalized,

    /// Backend specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Errors raised while accessing registered host memory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("range {addr}+{len} is outside of every registered segment")]
    OutOfBounds { addr: Address, len: usize },

    #[error("heap exhausted: {requested} bytes requested")]
    Exhausted { requested: usize },

    #[error("{0} is not a live allocation")]
    NotAllocated(Address),
}
