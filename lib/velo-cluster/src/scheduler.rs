// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Upward interface to the task runtime.

use bytes::Bytes;

use crate::ids::{NodeId, RemoteTaskId};

/// A remote task whose input has fully landed on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWork {
    pub task: RemoteTaskId,
    /// Node that dispatched the task; work-done goes back there.
    pub origin: NodeId,
    /// Opaque task descriptor produced by the dispatching runtime.
    pub descriptor: Bytes,
}

/// Work dispatch as it travels from the coordinator to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkMessage {
    pub task: RemoteTaskId,
    /// Input bytes the coordinator sent (or had sent) for this task.
    pub expected_data: usize,
    /// Region metadata messages the coordinator had sent to the destination
    /// when dispatching. The worker holds the task until it has seen as many.
    pub metadata_seq: u32,
    pub descriptor: Bytes,
}

/// Task runtime hooks invoked by the network layer.
pub trait Scheduler: Send + Sync {
    /// A remotely dispatched task became runnable on this node.
    fn submit(&self, work: RemoteWork);

    /// A task this node dispatched finished on its worker.
    fn notify_outlined_completion(&self, task: RemoteTaskId);
}
