// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Barrier};

use derive_builder::Builder;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::transport::{Envelope, LocalTransport};
use crate::config::NetworkConfig;
use crate::ids::{Address, NodeId};
use crate::memory::SegmentInfo;

/// Distance between the base addresses of consecutive node segments.
const SEGMENT_STRIDE: u64 = 1 << 40;

/// Order a node's mailbox is delivered in on each poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryOrder {
    /// Send order.
    #[default]
    Fifo,
    /// Newest first.
    Reversed,
    /// Seeded random permutation; reproducible for a given seed.
    Shuffled { seed: u64 },
}

impl DeliveryOrder {
    pub(crate) fn rng(&self) -> StdRng {
        match self {
            DeliveryOrder::Shuffled { seed } => StdRng::seed_from_u64(*seed),
            _ => StdRng::seed_from_u64(0),
        }
    }

    pub(crate) fn arrange<T>(&self, batch: &mut [T], rng: &Mutex<StdRng>) {
        match self {
            DeliveryOrder::Fifo => {}
            DeliveryOrder::Reversed => batch.reverse(),
            DeliveryOrder::Shuffled { .. } => batch.shuffle(&mut *rng.lock()),
        }
    }
}

/// Shape of an in-process cluster.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct LocalClusterConfig {
    /// Number of nodes; node 0 is the coordinator.
    pub num_nodes: usize,

    #[builder(default)]
    pub order: DeliveryOrder,

    /// Size of each node's host memory segment.
    #[builder(default = "4 * 1024 * 1024")]
    pub segment_bytes: usize,

    /// Staging capacities are taken from here.
    #[builder(default)]
    pub network: NetworkConfig,
}

impl LocalClusterConfig {
    pub fn builder() -> LocalClusterConfigBuilder {
        LocalClusterConfigBuilder::default()
    }
}

impl LocalClusterConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.num_nodes {
            Some(0) => Err("a cluster needs at least one node".to_string()),
            _ => Ok(()),
        }
    }
}

/// State shared by every node of a cluster.
pub(crate) struct Fabric {
    pub(crate) mailboxes: Vec<Mutex<Vec<Envelope>>>,
    pub(crate) barrier: Barrier,
}

/// A set of connected [`LocalTransport`]s.
pub struct LocalCluster {
    config: LocalClusterConfig,
    transports: Vec<Arc<LocalTransport>>,
}

impl LocalCluster {
    pub fn new(config: LocalClusterConfig) -> Self {
        let num_nodes = config.num_nodes;
        let fabric = Arc::new(Fabric {
            mailboxes: (0..num_nodes).map(|_| Mutex::new(Vec::new())).collect(),
            barrier: Barrier::new(num_nodes),
        });

        let transports: Vec<_> = NodeId::all(num_nodes)
            .map(|node| {
                let base = Address::new(SEGMENT_STRIDE * (node.as_u32() as u64 + 1));
                Arc::new(LocalTransport::new(node, base, &config, fabric.clone()))
            })
            .collect();

        let segments: Vec<SegmentInfo> = transports.iter().map(|t| t.segment_info()).collect();
        for transport in &transports {
            transport.register_segments(&segments);
        }

        tracing::debug!(num_nodes, order = ?config.order, "local cluster created");
        Self { config, transports }
    }

    pub fn config(&self) -> &LocalClusterConfig {
        &self.config
    }

    pub fn num_nodes(&self) -> usize {
        self.transports.len()
    }

    /// Transport of `node`.
    ///
    /// # Panics
    /// If `node` is not part of the cluster.
    pub fn transport(&self, node: NodeId) -> Arc<LocalTransport> {
        self.transports[node.index()].clone()
    }

    pub fn transports(&self) -> impl Iterator<Item = &Arc<LocalTransport>> {
        self.transports.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    #[test]
    fn test_builder_defaults_and_validation() {
        let config = LocalClusterConfig::builder().num_nodes(3).build().unwrap();
        assert_eq!(config.order, DeliveryOrder::Fifo);
        assert_eq!(config.segment_bytes, 4 * 1024 * 1024);

        assert!(LocalClusterConfig::builder().num_nodes(0).build().is_err());
        assert!(LocalClusterConfig::builder().build().is_err());
    }

    #[test]
    fn test_arrange() {
        let lock = Mutex::new(DeliveryOrder::Fifo.rng());
        let mut batch = vec![1, 2, 3, 4];
        DeliveryOrder::Reversed.arrange(&mut batch, &lock);
        assert_eq!(batch, vec![4, 3, 2, 1]);

        let order = DeliveryOrder::Shuffled { seed: 7 };
        let mut a: Vec<u32> = (0..32).collect();
        let mut b = a.clone();
        order.arrange(&mut a, &Mutex::new(order.rng()));
        order.arrange(&mut b, &Mutex::new(order.rng()));
        assert_eq!(a, b);
        assert_ne!(a, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_segments_are_disjoint_and_registered() {
        let config = LocalClusterConfig::builder().num_nodes(2).build().unwrap();
        let cluster = LocalCluster::new(config);
        let t0 = cluster.transport(NodeId::new(0));
        let t1 = cluster.transport(NodeId::new(1));
        assert_eq!(t0.segment_addr(NodeId::new(1)), t1.segment_addr(NodeId::new(1)));
        assert_ne!(t0.segment_addr(NodeId::new(0)), t0.segment_addr(NodeId::new(1)));
        assert_eq!(t0.segment_len(NodeId::new(1)), Some(4 * 1024 * 1024));
    }
}
