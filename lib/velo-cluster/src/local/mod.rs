// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport connecting several nodes that live in one process.
//!
//! Every node owns a [`SegmentMemory`](crate::SegmentMemory), a pack segment
//! and a receive segment. Messages sit in the destination's mailbox until
//! that node polls; each poll delivers the whole mailbox in the configured
//! [`DeliveryOrder`], which is how tests exercise reordering.

mod cluster;
mod transport;

pub use cluster::{DeliveryOrder, LocalCluster, LocalClusterConfig, LocalClusterConfigBuilder};
pub use transport::LocalTransport;
