// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;

use super::cluster::{DeliveryOrder, Fabric, LocalClusterConfig};
use crate::error::TransportError;
use crate::ids::{Address, NodeId, RemoteTaskId, RequestId, SequenceNumber};
use crate::memory::{HostMemory, SegmentInfo, SegmentMemory};
use crate::region::RegionMetadata;
use crate::scheduler::WorkMessage;
use crate::staging::{StagingAllocator, StagingBuffer};
use crate::transfer::{PendingTransfer, PutMeta, StridedShape};
use crate::transport::{ArrivedPayload, DataArrival, InboundEvent, InboundSender, Transport};

/// A message waiting in a node's mailbox.
pub(crate) enum Envelope {
    /// Delivered to the network layer unchanged.
    Event(InboundEvent),
    Malloc {
        from: NodeId,
        size: usize,
        request: RequestId,
    },
    Free {
        addr: Address,
    },
    Realloc {
        old_addr: Address,
        old_size: usize,
        new_addr: Address,
        new_size: usize,
    },
}

/// One node of a [`LocalCluster`](super::LocalCluster).
pub struct LocalTransport {
    node: NodeId,
    num_nodes: usize,
    fabric: Arc<Fabric>,
    memory: Arc<SegmentMemory>,
    pack: StagingAllocator,
    receive: StagingAllocator,
    max_get_strided_len: usize,
    order: DeliveryOrder,
    rng: Mutex<StdRng>,
    inbound: OnceLock<InboundSender>,
    segments: RwLock<HashMap<NodeId, SegmentInfo>>,
    finalized: AtomicBool,
}

impl LocalTransport {
    pub(crate) fn new(
        node: NodeId,
        base: Address,
        config: &LocalClusterConfig,
        fabric: Arc<Fabric>,
    ) -> Self {
        let staging = &config.network.staging;
        Self {
            node,
            num_nodes: config.num_nodes,
            fabric,
            memory: Arc::new(SegmentMemory::new(base, config.segment_bytes)),
            pack: StagingAllocator::new("pack", staging.pack_segment_bytes),
            receive: StagingAllocator::new("receive", staging.receive_segment_bytes),
            max_get_strided_len: staging.max_get_strided_len,
            order: config.order,
            rng: Mutex::new(config.order.rng()),
            inbound: OnceLock::new(),
            segments: RwLock::new(HashMap::new()),
            finalized: AtomicBool::new(false),
        }
    }

    /// Host memory of this node.
    pub fn memory(&self) -> &SegmentMemory {
        &self.memory
    }

    pub fn segment_info(&self) -> SegmentInfo {
        self.memory.info(self.node)
    }

    /// Messages waiting for this node to poll.
    pub fn mailbox_len(&self) -> usize {
        self.fabric.mailboxes[self.node.index()].lock().len()
    }

    pub(crate) fn register_segments(&self, segments: &[SegmentInfo]) {
        let mut registry = self.segments.write();
        for segment in segments {
            registry.insert(segment.node, *segment);
        }
    }

    fn send(&self, dest: NodeId, envelope: Envelope) -> Result<(), TransportError> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(TransportError::Finalized);
        }
        let mailbox = self
            .fabric
            .mailboxes
            .get(dest.index())
            .ok_or(TransportError::UnknownNode(dest))?;
        mailbox.lock().push(envelope);
        Ok(())
    }

    fn event(&self, dest: NodeId, event: InboundEvent) -> Result<(), TransportError> {
        self.send(dest, Envelope::Event(event))
    }

    fn deliver(&self, inbound: &InboundSender, envelope: Envelope) -> Result<(), TransportError> {
        let event = match envelope {
            Envelope::Event(event) => event,
            Envelope::Malloc {
                from,
                size,
                request,
            } => {
                let addr = match self.memory.allocate(size) {
                    Ok(addr) => Some(addr),
                    Err(err) => {
                        tracing::warn!(
                            node = %self.node,
                            size,
                            error = %err,
                            "remote malloc failed"
                        );
                        None
                    }
                };
                return self.event(from, InboundEvent::MallocReply { request, addr });
            }
            Envelope::Free { addr } => {
                if let Err(err) = self.memory.free(addr) {
                    tracing::warn!(node = %self.node, %addr, error = %err, "remote free failed");
                }
                return Ok(());
            }
            Envelope::Realloc {
                old_addr,
                old_size,
                new_addr,
                new_size,
            } => {
                if let Err(err) = self.memory.relocate(old_addr, old_size, new_addr, new_size) {
                    tracing::warn!(
                        node = %self.node,
                        %old_addr,
                        %new_addr,
                        error = %err,
                        "remote realloc failed"
                    );
                }
                return Ok(());
            }
        };
        inbound.send(event).map_err(|_| TransportError::InboundClosed)
    }
}

impl Transport for LocalTransport {
    fn initialize(&self, inbound: InboundSender) -> Result<(), TransportError> {
        self.inbound
            .set(inbound)
            .map_err(|_| TransportError::AlreadyInitialized)
    }

    fn finalize(&self) -> Result<(), TransportError> {
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }

    fn poll(&self, _poller: usize) -> Result<(), TransportError> {
        let inbound = self.inbound.get().ok_or(TransportError::NotInitialized)?;
        let mut batch = std::mem::take(&mut *self.fabric.mailboxes[self.node.index()].lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.order.arrange(&mut batch, &self.rng);
        tracing::trace!(node = %self.node, messages = batch.len(), "delivering mailbox");
        let mut pending = batch.into_iter();
        while let Some(envelope) = pending.next() {
            if let Err(err) = self.deliver(inbound, envelope) {
                // undelivered envelopes go back ahead of anything sent meanwhile
                let mut mailbox = self.fabric.mailboxes[self.node.index()].lock();
                let newer = std::mem::take(&mut *mailbox);
                mailbox.extend(pending);
                mailbox.extend(newer);
                return Err(err);
            }
        }
        Ok(())
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn node_id(&self) -> NodeId {
        self.node
    }

    fn host_memory(&self) -> Arc<dyn HostMemory> {
        self.memory.clone()
    }

    fn pack_segment(&self) -> &StagingAllocator {
        &self.pack
    }

    fn receive_segment(&self) -> &StagingAllocator {
        &self.receive
    }

    fn max_get_strided_len(&self) -> usize {
        self.max_get_strided_len
    }

    fn send_exit_msg(&self, dest: NodeId) -> Result<(), TransportError> {
        self.event(dest, InboundEvent::Exit { from: self.node })
    }

    fn send_work_msg(&self, dest: NodeId, work: WorkMessage) -> Result<(), TransportError> {
        self.event(dest, InboundEvent::Work {
            from: self.node,
            work,
        })
    }

    fn send_work_done_msg(&self, dest: NodeId, task: RemoteTaskId) -> Result<(), TransportError> {
        self.event(dest, InboundEvent::WorkDone {
            from: self.node,
            task,
        })
    }

    fn send_region_metadata(
        &self,
        dest: NodeId,
        metadata: RegionMetadata,
    ) -> Result<(), TransportError> {
        self.event(dest, InboundEvent::RegionMetadata {
            from: self.node,
            metadata,
        })
    }

    fn put(
        &self,
        dest: NodeId,
        dest_addr: Address,
        data: Bytes,
        meta: PutMeta,
    ) -> Result<(), TransportError> {
        self.event(
            dest,
            InboundEvent::Data(DataArrival {
                from: self.node,
                dest_addr,
                payload: ArrivedPayload::Contiguous(data),
                meta,
            }),
        )
    }

    fn put_strided_1d(
        &self,
        dest: NodeId,
        dest_addr: Address,
        packed: StagingBuffer,
        shape: StridedShape,
        meta: PutMeta,
    ) -> Result<(), TransportError> {
        self.event(
            dest,
            InboundEvent::Data(DataArrival {
                from: self.node,
                dest_addr,
                payload: ArrivedPayload::Strided {
                    packed: packed.to_bytes(),
                    shape,
                },
                meta,
            }),
        )
    }

    fn get(&self, dest: NodeId, transfer: PendingTransfer) -> Result<(), TransportError> {
        self.event(dest, InboundEvent::Get {
            from: self.node,
            transfer,
        })
    }

    fn get_strided_1d(
        &self,
        dest: NodeId,
        transfer: PendingTransfer,
    ) -> Result<(), TransportError> {
        self.get(dest, transfer)
    }

    fn send_request_put(
        &self,
        dest: NodeId,
        transfer: PendingTransfer,
    ) -> Result<(), TransportError> {
        self.event(dest, InboundEvent::RequestPut {
            from: self.node,
            transfer,
        })
    }

    fn send_request_put_strided_1d(
        &self,
        dest: NodeId,
        transfer: PendingTransfer,
    ) -> Result<(), TransportError> {
        self.send_request_put(dest, transfer)
    }

    fn send_wait_request_put(
        &self,
        dest: NodeId,
        addr: Address,
        task: Option<RemoteTaskId>,
        seq: SequenceNumber,
    ) -> Result<(), TransportError> {
        self.event(dest, InboundEvent::WaitRequestPut {
            from: self.node,
            seq,
            addr,
            task,
        })
    }

    fn malloc(&self, dest: NodeId, size: usize, request: RequestId) -> Result<(), TransportError> {
        self.send(dest, Envelope::Malloc {
            from: self.node,
            size,
            request,
        })
    }

    fn mem_free(&self, dest: NodeId, addr: Address) -> Result<(), TransportError> {
        self.send(dest, Envelope::Free { addr })
    }

    fn mem_realloc(
        &self,
        dest: NodeId,
        old_addr: Address,
        old_size: usize,
        new_addr: Address,
        new_size: usize,
    ) -> Result<(), TransportError> {
        self.send(dest, Envelope::Realloc {
            old_addr,
            old_size,
            new_addr,
            new_size,
        })
    }

    fn node_barrier(&self) -> Result<(), TransportError> {
        self.fabric.barrier.wait();
        Ok(())
    }

    fn add_segments(&self, segments: &[SegmentInfo]) -> Result<(), TransportError> {
        self.register_segments(segments);
        Ok(())
    }

    fn segment_addr(&self, node: NodeId) -> Option<Address> {
        self.segments.read().get(&node).map(|segment| segment.addr)
    }

    fn segment_len(&self, node: NodeId) -> Option<usize> {
        self.segments.read().get(&node).map(|segment| segment.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCluster;

    fn cluster(order: DeliveryOrder) -> LocalCluster {
        LocalCluster::new(
            LocalClusterConfig::builder()
                .num_nodes(2)
                .order(order)
                .segment_bytes(4096)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_poll_requires_initialize() {
        let cluster = cluster(DeliveryOrder::Fifo);
        let t0 = cluster.transport(NodeId::new(0));
        assert!(matches!(t0.poll(0), Err(TransportError::NotInitialized)));

        let (tx, _rx) = flume::unbounded();
        t0.initialize(tx.clone()).unwrap();
        assert!(matches!(t0.initialize(tx), Err(TransportError::AlreadyInitialized)));
    }

    #[test]
    fn test_reversed_delivery() {
        let cluster = cluster(DeliveryOrder::Reversed);
        let t0 = cluster.transport(NodeId::new(0));
        let t1 = cluster.transport(NodeId::new(1));
        let (tx, rx) = flume::unbounded();
        t1.initialize(tx).unwrap();

        for task in 0..3 {
            t0.send_work_done_msg(NodeId::new(1), RemoteTaskId::new(task)).unwrap();
        }
        assert_eq!(t1.mailbox_len(), 3);
        t1.poll(0).unwrap();

        let tasks: Vec<_> = rx
            .try_iter()
            .map(|event| match event {
                InboundEvent::WorkDone { task, .. } => task.as_u64(),
                other => panic!("unexpected {}", other.kind()),
            })
            .collect();
        assert_eq!(tasks, vec![2, 1, 0]);
    }

    #[test]
    fn test_malloc_is_serviced_by_the_target() {
        let cluster = cluster(DeliveryOrder::Fifo);
        let t0 = cluster.transport(NodeId::new(0));
        let t1 = cluster.transport(NodeId::new(1));
        let (tx0, rx0) = flume::unbounded();
        let (tx1, _rx1) = flume::unbounded();
        t0.initialize(tx0).unwrap();
        t1.initialize(tx1).unwrap();

        t0.malloc(NodeId::new(1), 64, RequestId::new(5)).unwrap();
        t0.malloc(NodeId::new(1), 1 << 20, RequestId::new(6)).unwrap();
        t1.poll(0).unwrap();
        t0.poll(0).unwrap();

        let replies: Vec<_> = rx0
            .try_iter()
            .map(|event| match event {
                InboundEvent::MallocReply { request, addr } => (request, addr),
                other => panic!("unexpected {}", other.kind()),
            })
            .collect();
        assert_eq!(replies, vec![
            (RequestId::new(5), Some(t1.memory().base())),
            (RequestId::new(6), None),
        ]);
    }

    #[test]
    fn test_strided_payload_delivery_holds_no_receive_memory() {
        let cluster = cluster(DeliveryOrder::Fifo);
        let t0 = cluster.transport(NodeId::new(0));
        let t1 = cluster.transport(NodeId::new(1));
        let (tx, rx) = flume::unbounded();
        t1.initialize(tx).unwrap();

        let packed = t0.pack_segment().stage(&[1, 2, 3, 4]).unwrap();
        let shape = StridedShape::new(2, 2, 8).unwrap();
        t0.put_strided_1d(NodeId::new(1), Address::new(0x40), packed, shape, PutMeta::default())
            .unwrap();
        assert_eq!(t0.pack_segment().used(), 0);

        t1.poll(0).unwrap();
        match rx.try_recv().unwrap() {
            InboundEvent::Data(DataArrival {
                payload: ArrivedPayload::Strided { packed, shape: landed },
                ..
            }) => {
                assert_eq!(&packed[..], &[1, 2, 3, 4]);
                assert_eq!(landed, shape);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        assert_eq!(t1.receive_segment().used(), 0);
    }

    #[test]
    fn test_failed_delivery_keeps_the_rest_of_the_mailbox() {
        let cluster = cluster(DeliveryOrder::Fifo);
        let t0 = cluster.transport(NodeId::new(0));
        let t1 = cluster.transport(NodeId::new(1));
        let (tx, rx) = flume::unbounded();
        t1.initialize(tx).unwrap();
        drop(rx);

        for task in 0..3 {
            t0.send_work_done_msg(NodeId::new(1), RemoteTaskId::new(task)).unwrap();
        }
        assert!(matches!(t1.poll(0), Err(TransportError::InboundClosed)));
        assert_eq!(t1.mailbox_len(), 2);
    }

    #[test]
    fn test_finalized_transport_rejects_sends() {
        let cluster = cluster(DeliveryOrder::Fifo);
        let t0 = cluster.transport(NodeId::new(0));
        t0.finalize().unwrap();
        assert!(matches!(
            t0.send_exit_msg(NodeId::new(1)),
            Err(TransportError::Finalized)
        ));
        assert!(matches!(
            cluster.transport(NodeId::new(1)).send_exit_msg(NodeId::new(7)),
            Err(TransportError::UnknownNode(_))
        ));
    }
}
