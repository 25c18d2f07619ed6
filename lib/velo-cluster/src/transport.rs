// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contract between the network layer and a wire backend.
//!
//! Outbound traffic goes through [`Transport`] methods. Inbound traffic is
//! pushed by the backend into the [`InboundSender`] it received in
//! [`Transport::initialize`] and applied by
//! [`NetworkContext::poll`](crate::NetworkContext::poll). Backends never call
//! back into the context directly, so no context lock can be held across a
//! transport call.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;
use crate::ids::{Address, NodeId, RemoteTaskId, RequestId, SequenceNumber};
use crate::memory::{HostMemory, SegmentInfo};
use crate::region::RegionMetadata;
use crate::scheduler::WorkMessage;
use crate::staging::{StagingAllocator, StagingBuffer};
use crate::transfer::{PendingTransfer, PutMeta, StridedShape};

/// Channel end the backend delivers inbound events through.
pub type InboundSender = flume::Sender<InboundEvent>;

/// Data carried by an arriving put.
#[derive(Debug)]
pub enum ArrivedPayload {
    Contiguous(Bytes),
    /// Packed rows; staged through the receive segment and unpacked into
    /// `shape` at the destination address.
    Strided { packed: Bytes, shape: StridedShape },
}

impl ArrivedPayload {
    /// Bytes carried on the wire.
    pub fn len(&self) -> usize {
        match self {
            ArrivedPayload::Contiguous(data) => data.len(),
            ArrivedPayload::Strided { packed, .. } => packed.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A put that landed on this node.
#[derive(Debug)]
pub struct DataArrival {
    pub from: NodeId,
    pub dest_addr: Address,
    pub payload: ArrivedPayload,
    pub meta: PutMeta,
}

/// Everything a backend can deliver to the network layer.
#[derive(Debug)]
pub enum InboundEvent {
    Data(DataArrival),
    RegionMetadata {
        from: NodeId,
        metadata: RegionMetadata,
    },
    Work {
        from: NodeId,
        work: WorkMessage,
    },
    WorkDone {
        from: NodeId,
        task: RemoteTaskId,
    },
    MallocReply {
        request: RequestId,
        addr: Option<Address>,
    },
    /// Put `transfer.orig_addr` to `transfer.dest_node`; sequenced.
    RequestPut {
        from: NodeId,
        transfer: PendingTransfer,
    },
    /// Send `transfer.orig_addr` back to the requester; sequenced.
    Get {
        from: NodeId,
        transfer: PendingTransfer,
    },
    WaitRequestPut {
        from: NodeId,
        seq: SequenceNumber,
        addr: Address,
        task: Option<RemoteTaskId>,
    },
    Exit {
        from: NodeId,
    },
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Data(_) => "data",
            InboundEvent::RegionMetadata { .. } => "region_metadata",
            InboundEvent::Work { .. } => "work",
            InboundEvent::WorkDone { .. } => "work_done",
            InboundEvent::MallocReply { .. } => "malloc_reply",
            InboundEvent::RequestPut { .. } => "request_put",
            InboundEvent::Get { .. } => "get",
            InboundEvent::WaitRequestPut { .. } => "wait_request_put",
            InboundEvent::Exit { .. } => "exit",
        }
    }
}

/// A wire backend connecting this node to its peers.
///
/// Every send is fire-and-forget and delivered exactly once; the backend does
/// not order messages. Remote `malloc`, `mem_free` and `mem_realloc` are
/// serviced by the backend on the target node, which answers `malloc` with an
/// [`InboundEvent::MallocReply`].
pub trait Transport: Send + Sync {
    /// Start delivering inbound events to `inbound`.
    fn initialize(&self, inbound: InboundSender) -> Result<(), TransportError>;

    fn finalize(&self) -> Result<(), TransportError>;

    /// Make progress; may push events into the inbound channel.
    fn poll(&self, poller: usize) -> Result<(), TransportError>;

    fn num_nodes(&self) -> usize;

    fn node_id(&self) -> NodeId;

    /// Memory transfers read from and land in.
    fn host_memory(&self) -> Arc<dyn HostMemory>;

    /// Segment outgoing strided payloads are packed into.
    fn pack_segment(&self) -> &StagingAllocator;

    /// Segment arriving strided payloads are staged in while they are
    /// unpacked.
    fn receive_segment(&self) -> &StagingAllocator;

    /// Largest packed length the backend accepts for one strided get.
    fn max_get_strided_len(&self) -> usize;

    fn send_exit_msg(&self, dest: NodeId) -> Result<(), TransportError>;

    fn send_work_msg(&self, dest: NodeId, work: WorkMessage) -> Result<(), TransportError>;

    fn send_work_done_msg(&self, dest: NodeId, task: RemoteTaskId) -> Result<(), TransportError>;

    fn send_region_metadata(
        &self,
        dest: NodeId,
        metadata: RegionMetadata,
    ) -> Result<(), TransportError>;

    fn put(
        &self,
        dest: NodeId,
        dest_addr: Address,
        data: Bytes,
        meta: PutMeta,
    ) -> Result<(), TransportError>;

    /// Move packed rows; the receiver unpacks them with `shape` at `dest_addr`.
    /// The pack buffer is released when the call returns.
    fn put_strided_1d(
        &self,
        dest: NodeId,
        dest_addr: Address,
        packed: StagingBuffer,
        shape: StridedShape,
        meta: PutMeta,
    ) -> Result<(), TransportError>;

    fn get(&self, dest: NodeId, transfer: PendingTransfer) -> Result<(), TransportError>;

    fn get_strided_1d(&self, dest: NodeId, transfer: PendingTransfer)
    -> Result<(), TransportError>;

    fn send_request_put(&self, dest: NodeId, transfer: PendingTransfer)
    -> Result<(), TransportError>;

    fn send_request_put_strided_1d(
        &self,
        dest: NodeId,
        transfer: PendingTransfer,
    ) -> Result<(), TransportError>;

    fn send_wait_request_put(
        &self,
        dest: NodeId,
        addr: Address,
        task: Option<RemoteTaskId>,
        seq: SequenceNumber,
    ) -> Result<(), TransportError>;

    fn malloc(&self, dest: NodeId, size: usize, request: RequestId) -> Result<(), TransportError>;

    fn mem_free(&self, dest: NodeId, addr: Address) -> Result<(), TransportError>;

    /// Move the first `min(old_size, new_size)` bytes of `old_addr` to
    /// `new_addr` on `dest` and free `old_addr`.
    fn mem_realloc(
        &self,
        dest: NodeId,
        old_addr: Address,
        old_size: usize,
        new_addr: Address,
        new_size: usize,
    ) -> Result<(), TransportError>;

    /// Block until every node reached the barrier.
    fn node_barrier(&self) -> Result<(), TransportError>;

    fn add_segments(&self, segments: &[SegmentInfo]) -> Result<(), TransportError>;

    fn segment_addr(&self, node: NodeId) -> Option<Address>;

    fn segment_len(&self, node: NodeId) -> Option<usize>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Transport that records outbound calls for unit tests.

    use super::*;
    use crate::memory::SegmentMemory;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Exit(NodeId),
        Work(NodeId, WorkMessage),
        WorkDone(NodeId, RemoteTaskId),
        Metadata(NodeId, RegionMetadata),
        Put {
            dest: NodeId,
            dest_addr: Address,
            data: Bytes,
            meta: PutMeta,
        },
        PutStrided {
            dest: NodeId,
            dest_addr: Address,
            packed: Bytes,
            shape: StridedShape,
            meta: PutMeta,
        },
        Get(NodeId, PendingTransfer),
        RequestPut(NodeId, PendingTransfer),
        WaitRequestPut(NodeId, Address, SequenceNumber),
        Malloc(NodeId, usize, RequestId),
        Free(NodeId, Address),
    }

    pub struct MockTransport {
        node: NodeId,
        num_nodes: usize,
        memory: Arc<SegmentMemory>,
        pack: StagingAllocator,
        receive: StagingAllocator,
        pub sent: Mutex<Vec<Sent>>,
        pub inbound: Mutex<Option<InboundSender>>,
    }

    impl MockTransport {
        pub fn new(node: NodeId, num_nodes: usize) -> Arc<Self> {
            Arc::new(Self {
                node,
                num_nodes,
                memory: Arc::new(SegmentMemory::new(Address::new(0x10_0000), 64 * 1024)),
                pack: StagingAllocator::new("pack", 16 * 1024),
                receive: StagingAllocator::new("receive", 16 * 1024),
                sent: Mutex::new(Vec::new()),
                inbound: Mutex::new(None),
            })
        }

        pub fn memory(&self) -> &SegmentMemory {
            &self.memory
        }

        pub fn take_sent(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock())
        }

        /// Deliver an event as if it came off the wire.
        pub fn deliver(&self, event: InboundEvent) {
            if let Some(inbound) = self.inbound.lock().as_ref() {
                inbound.send(event).unwrap();
            }
        }

        fn record(&self, sent: Sent) -> Result<(), TransportError> {
            self.sent.lock().push(sent);
            Ok(())
        }
    }

    impl Transport for MockTransport {
        fn initialize(&self, inbound: InboundSender) -> Result<(), TransportError> {
            *self.inbound.lock() = Some(inbound);
            Ok(())
        }

        fn finalize(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn poll(&self, _poller: usize) -> Result<(), TransportError> {
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
            usize::MAX
        }

        fn send_exit_msg(&self, dest: NodeId) -> Result<(), TransportError> {
            self.record(Sent::Exit(dest))
        }

        fn send_work_msg(&self, dest: NodeId, work: WorkMessage) -> Result<(), TransportError> {
            self.record(Sent::Work(dest, work))
        }

        fn send_work_done_msg(
            &self,
            dest: NodeId,
            task: RemoteTaskId,
        ) -> Result<(), TransportError> {
            self.record(Sent::WorkDone(dest, task))
        }

        fn send_region_metadata(
            &self,
            dest: NodeId,
            metadata: RegionMetadata,
        ) -> Result<(), TransportError> {
            self.record(Sent::Metadata(dest, metadata))
        }

        fn put(
            &self,
            dest: NodeId,
            dest_addr: Address,
            data: Bytes,
            meta: PutMeta,
        ) -> Result<(), TransportError> {
            self.record(Sent::Put {
                dest,
                dest_addr,
                data,
                meta,
            })
        }

        fn put_strided_1d(
            &self,
            dest: NodeId,
            dest_addr: Address,
            packed: StagingBuffer,
            shape: StridedShape,
            meta: PutMeta,
        ) -> Result<(), TransportError> {
            self.record(Sent::PutStrided {
                dest,
                dest_addr,
                packed: packed.to_bytes(),
                shape,
                meta,
            })
        }

        fn get(&self, dest: NodeId, transfer: PendingTransfer) -> Result<(), TransportError> {
            self.record(Sent::Get(dest, transfer))
        }

        fn get_strided_1d(
            &self,
            dest: NodeId,
            transfer: PendingTransfer,
        ) -> Result<(), TransportError> {
            self.record(Sent::Get(dest, transfer))
        }

        fn send_request_put(
            &self,
            dest: NodeId,
            transfer: PendingTransfer,
        ) -> Result<(), TransportError> {
            self.record(Sent::RequestPut(dest, transfer))
        }

        fn send_request_put_strided_1d(
            &self,
            dest: NodeId,
            transfer: PendingTransfer,
        ) -> Result<(), TransportError> {
            self.record(Sent::RequestPut(dest, transfer))
        }

        fn send_wait_request_put(
            &self,
            dest: NodeId,
            addr: Address,
            _task: Option<RemoteTaskId>,
            seq: SequenceNumber,
        ) -> Result<(), TransportError> {
            self.record(Sent::WaitRequestPut(dest, addr, seq))
        }

        fn malloc(
            &self,
            dest: NodeId,
            size: usize,
            request: RequestId,
        ) -> Result<(), TransportError> {
            self.record(Sent::Malloc(dest, size, request))
        }

        fn mem_free(&self, dest: NodeId, addr: Address) -> Result<(), TransportError> {
            self.record(Sent::Free(dest, addr))
        }

        fn mem_realloc(
            &self,
            _dest: NodeId,
            _old_addr: Address,
            _old_size: usize,
            _new_addr: Address,
            _new_size: usize,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn node_barrier(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn add_segments(&self, _segments: &[SegmentInfo]) -> Result<(), TransportError> {
            Ok(())
        }

        fn segment_addr(&self, _node: NodeId) -> Option<Address> {
            None
        }

        fn segment_len(&self, _node: NodeId) -> Option<usize> {
            None
        }
    }
}
