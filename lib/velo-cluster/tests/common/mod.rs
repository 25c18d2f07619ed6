// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared harness for the in-process cluster tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use velo_cluster::local::{DeliveryOrder, LocalCluster, LocalClusterConfig, LocalTransport};
use velo_cluster::{
    Address, DimensionDescriptor, DirectoryKey, HostObject, NetworkConfig, NetworkContext, NodeId,
    RegionHandle, RegionId, RemoteRegion, RemoteTaskId, RemoteWork, Scheduler,
};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Scheduler that records what the network layer hands it.
#[derive(Default)]
pub struct RecordingScheduler {
    pub submitted: Mutex<Vec<RemoteWork>>,
    pub completed: Mutex<Vec<RemoteTaskId>>,
}

impl RecordingScheduler {
    pub fn submitted_tasks(&self) -> Vec<RemoteTaskId> {
        self.submitted.lock().iter().map(|work| work.task).collect()
    }
}

impl Scheduler for RecordingScheduler {
    fn submit(&self, work: RemoteWork) {
        self.submitted.lock().push(work);
    }

    fn notify_outlined_completion(&self, task: RemoteTaskId) {
        self.completed.lock().push(task);
    }
}

pub fn region(id: u64) -> RegionHandle {
    RegionHandle {
        region: RemoteRegion::new(RegionId::new(id), DirectoryKey::new(id + 100)),
        host_object: HostObject::new(id),
        dimensions: vec![
            DimensionDescriptor {
                size: 64,
                accessed_offset: 0,
                accessed_length: 64,
            },
            DimensionDescriptor {
                size: 64,
                accessed_offset: 8,
                accessed_length: 16,
            },
        ],
    }
}

pub fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(salt)).collect()
}

/// A local cluster with a network context and recording scheduler per node.
pub struct TestCluster {
    pub cluster: LocalCluster,
    pub nodes: Vec<Arc<NetworkContext>>,
    pub schedulers: Vec<Arc<RecordingScheduler>>,
}

impl TestCluster {
    pub fn new(num_nodes: usize, order: DeliveryOrder) -> Self {
        Self::with_network(num_nodes, order, NetworkConfig::default())
    }

    pub fn with_network(num_nodes: usize, order: DeliveryOrder, network: NetworkConfig) -> Self {
        init_tracing();
        let config = LocalClusterConfig::builder()
            .num_nodes(num_nodes)
            .order(order)
            .segment_bytes(1 << 20)
            .network(network.clone())
            .build()
            .unwrap();
        let cluster = LocalCluster::new(config);

        let mut nodes = Vec::new();
        let mut schedulers = Vec::new();
        for node in NodeId::all(num_nodes) {
            let scheduler = Arc::new(RecordingScheduler::default());
            let ctx =
                NetworkContext::new(network.clone(), cluster.transport(node), scheduler.clone())
                    .unwrap();
            nodes.push(ctx);
            schedulers.push(scheduler);
        }
        Self {
            cluster,
            nodes,
            schedulers,
        }
    }

    pub fn node(&self, node: u32) -> &Arc<NetworkContext> {
        &self.nodes[node as usize]
    }

    pub fn scheduler(&self, node: u32) -> &Arc<RecordingScheduler> {
        &self.schedulers[node as usize]
    }

    pub fn transport(&self, node: u32) -> Arc<LocalTransport> {
        self.cluster.transport(NodeId::new(node))
    }

    /// Base of the host memory segment of `node`.
    pub fn base(&self, node: u32) -> Address {
        self.transport(node).memory().base()
    }

    pub fn write(&self, node: u32, addr: Address, data: &[u8]) {
        use velo_cluster::HostMemory;
        self.transport(node).memory().write(addr, data).unwrap();
    }

    pub fn read(&self, node: u32, addr: Address, len: usize) -> Vec<u8> {
        use velo_cluster::HostMemory;
        self.transport(node).memory().read(addr, len).unwrap().to_vec()
    }

    pub fn poll_node(&self, node: u32) {
        self.node(node).poll(0).unwrap();
    }

    /// Poll every node round-robin until nothing is left in flight.
    pub fn poll_all(&self) {
        for _ in 0..10_000 {
            let mut idle = true;
            for (index, ctx) in self.nodes.iter().enumerate() {
                if !ctx.poll(index).unwrap().is_idle() {
                    idle = false;
                }
            }
            let quiet = self.cluster.transports().all(|t| t.mailbox_len() == 0);
            if idle && quiet {
                return;
            }
        }
        panic!("cluster did not quiesce");
    }

    /// Poll every node except `except` on background threads until the
    /// returned guard is dropped.
    pub fn serve_others(&self, except: u32) -> Servers {
        let stop = Arc::new(AtomicBool::new(false));
        let handles = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != except as usize)
            .map(|(index, ctx)| {
                let ctx = ctx.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        ctx.poll(index).unwrap();
                        std::thread::yield_now();
                    }
                })
            })
            .collect();
        Servers { stop, handles }
    }
}

pub struct Servers {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Servers {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let result = handle.join();
            if !std::thread::panicking() {
                result.unwrap();
            }
        }
    }
}
