// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The network façade.
//!
//! [`NetworkContext`] is built once per process over a [`Transport`] and a
//! [`Scheduler`]. Outbound operations are called by runtime threads; inbound
//! events are applied by whichever threads call [`NetworkContext::poll`].
//! Synchronous operations (`malloc`, `get`) spin on `poll` themselves, so
//! progress never depends on a dedicated thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use flume::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, trace};
use validator::Validate;

use crate::completion::{CompletionState, CompletionTable};
use crate::config::{ConfigError, NetworkConfig};
use crate::error::NetworkError;
use crate::ids::{Address, NodeId, RemoteTaskId, RequestId, SequenceNumber};
use crate::memory::{HostMemory, SegmentInfo};
use crate::region::{
    RegionDirectory, RegionForwardCache, RegionHandle, RegionMetadata, RemoteRegion,
};
use crate::rendezvous::RendezvousTracker;
use crate::scheduler::{RemoteWork, Scheduler, WorkMessage};
use crate::sequence::{SequenceArbiter, SequencedRequest};
use crate::transfer::{PendingTransfer, PutMeta, StridedShape, pack_rows, unpack_rows};
use crate::transport::{ArrivedPayload, DataArrival, InboundEvent, Transport};
use crate::wait_put::WaitPutTable;

/// Snapshot of the context counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub puts: u64,
    pub gets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub metadata_sent: u64,
    pub delayed_messages: u64,
    pub released_tasks: u64,
}

#[derive(Default)]
struct StatCounters {
    puts: AtomicU64,
    gets: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    metadata_sent: AtomicU64,
    delayed_messages: AtomicU64,
    released_tasks: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> NetworkStats {
        NetworkStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            metadata_sent: self.metadata_sent.load(Ordering::Relaxed),
            delayed_messages: self.delayed_messages.load(Ordering::Relaxed),
            released_tasks: self.released_tasks.load(Ordering::Relaxed),
        }
    }
}

/// What one call to [`NetworkContext::poll`] accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Inbound events applied.
    pub events: usize,
    /// Parked sequenced messages applied by the delay-queue scan.
    pub delayed_applied: usize,
    /// Queued work messages whose region metadata had arrived.
    pub work_dispatched: usize,
}

impl PollOutcome {
    pub fn is_idle(&self) -> bool {
        self.events == 0 && self.delayed_applied == 0 && self.work_dispatched == 0
    }
}

struct QueuedWork {
    from: NodeId,
    work: WorkMessage,
}

/// Node-to-node data movement for one process.
pub struct NetworkContext {
    node: NodeId,
    num_nodes: usize,
    config: NetworkConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    memory: Arc<dyn HostMemory>,
    inbound: Receiver<InboundEvent>,

    forwarded: RegionForwardCache,
    directory: RegionDirectory,
    metadata_sent: Vec<AtomicU32>,
    metadata_received: Vec<AtomicU32>,

    arbiter: SequenceArbiter<SequencedRequest>,
    rendezvous: RendezvousTracker<RemoteWork>,
    wait_puts: WaitPutTable<PendingTransfer>,
    pending_work: Mutex<VecDeque<QueuedWork>>,
    completions: CompletionTable,

    exit: AtomicBool,
    stats: StatCounters,
}

impl NetworkContext {
    /// Build the context and initialize `transport` with its inbound channel.
    pub fn new(
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Self>, NetworkError> {
        config.validate().map_err(ConfigError::from)?;

        let node = transport.node_id();
        let num_nodes = transport.num_nodes();
        let (tx, rx) = flume::unbounded();
        transport.initialize(tx)?;

        let counters = || (0..num_nodes).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
        info!(%node, num_nodes, "network context initialized");

        Ok(Arc::new(Self {
            node,
            num_nodes,
            arbiter: SequenceArbiter::new(num_nodes, config.poll.delay_queue_warn_len),
            config,
            memory: transport.host_memory(),
            transport,
            scheduler,
            inbound: rx,
            forwarded: RegionForwardCache::new(num_nodes),
            directory: RegionDirectory::new(),
            metadata_sent: counters(),
            metadata_received: counters(),
            rendezvous: RendezvousTracker::new(),
            wait_puts: WaitPutTable::new(),
            pending_work: Mutex::new(VecDeque::new()),
            completions: CompletionTable::new(),
            exit: AtomicBool::new(false),
            stats: StatCounters::default(),
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.snapshot()
    }

    /// Whether an exit message was received.
    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub fn is_region_forwarded(&self, node: NodeId, region: &RemoteRegion) -> bool {
        self.forwarded.is_region_forwarded(node, region)
    }

    /// Metadata a peer announced for `region`.
    pub fn region_metadata(&self, region: &RemoteRegion) -> Option<RegionMetadata> {
        self.directory.lookup(region)
    }

    /// Sequenced messages from peers still waiting for a predecessor.
    pub fn delayed_len(&self) -> usize {
        self.arbiter.delayed_len()
    }

    /// Tasks with a partial rendezvous.
    pub fn pending_tasks(&self) -> usize {
        self.rendezvous.pending_len()
    }

    // ---------------------------------------------------------------------
    // outbound data
    // ---------------------------------------------------------------------

    /// Put `size` bytes at `src_addr` to `dest_addr` on `dest`.
    pub fn put(
        &self,
        dest: NodeId,
        dest_addr: Address,
        src_addr: Address,
        size: usize,
        task: Option<RemoteTaskId>,
        region: &RegionHandle,
    ) -> Result<(), NetworkError> {
        self.check_node(dest)?;
        self.forward_region(dest, region)?;
        if let Some(task) = task {
            self.rendezvous.record_sent(task, size);
        }
        let meta = Self::meta_for(task, dest_addr, region);
        self.send_contiguous(dest, dest_addr, src_addr, size, meta)
    }

    /// Put `count` rows of `size` bytes spaced `ld` apart.
    #[allow(clippy::too_many_arguments)]
    pub fn put_strided_1d(
        &self,
        dest: NodeId,
        dest_addr: Address,
        src_addr: Address,
        size: usize,
        count: usize,
        ld: usize,
        task: Option<RemoteTaskId>,
        region: &RegionHandle,
    ) -> Result<(), NetworkError> {
        let shape = StridedShape::new(size, count, ld).map_err(NetworkError::fatal)?;
        if !shape.is_strided() {
            return self.put(dest, dest_addr, src_addr, size, task, region);
        }
        self.check_node(dest)?;
        self.forward_region(dest, region)?;
        if let Some(task) = task {
            self.rendezvous.record_sent(task, shape.packed_len());
        }
        let meta = Self::meta_for(task, dest_addr, region);
        self.send_strided(dest, dest_addr, src_addr, shape, meta)
    }

    /// Copy `size` bytes at `remote_addr` on `src` to `local_addr`. Returns
    /// once the data has landed.
    pub fn get(
        &self,
        local_addr: Address,
        src: NodeId,
        remote_addr: Address,
        size: usize,
        task: Option<RemoteTaskId>,
        region: &RegionHandle,
    ) -> Result<(), NetworkError> {
        self.check_node(src)?;
        self.forward_region(src, region)?;

        let request = self.completions.register(1);
        let transfer = PendingTransfer {
            orig_addr: remote_addr,
            dest_addr: local_addr,
            len: size,
            dest_node: self.node,
            task,
            host_object: region.host_object,
            region: Some(region.region),
            seq: self.arbiter.next_sequence(src),
            completion: Some(request),
            ..Default::default()
        };
        trace!(%src, seq = transfer.seq, bytes = size, "get");
        self.transport.get(src, transfer)?;
        StatCounters::bump(&self.stats.gets, 1);
        self.wait_for(request)?;
        Ok(())
    }

    /// Strided form of [`get`](Self::get); rows land at the same stride
    /// locally. Gets larger than the configured limit are split into
    /// row-aligned chunks, each sequenced on its own.
    #[allow(clippy::too_many_arguments)]
    pub fn get_strided_1d(
        &self,
        local_addr: Address,
        src: NodeId,
        remote_addr: Address,
        size: usize,
        count: usize,
        ld: usize,
        task: Option<RemoteTaskId>,
        region: &RegionHandle,
    ) -> Result<(), NetworkError> {
        let shape = StridedShape::new(size, count, ld).map_err(NetworkError::fatal)?;
        if !shape.is_strided() {
            return self.get(local_addr, src, remote_addr, size, task, region);
        }
        self.check_node(src)?;
        self.forward_region(src, region)?;

        let limit = self
            .config
            .staging
            .max_get_strided_len
            .min(self.transport.max_get_strided_len());
        let rows_per_chunk = (limit / size.max(1)).clamp(1, count);
        let chunks = count.div_ceil(rows_per_chunk);

        let request = self.completions.register(chunks);
        let mut first_row = 0;
        while first_row < count {
            let rows = rows_per_chunk.min(count - first_row);
            let offset = first_row * ld;
            let transfer = PendingTransfer {
                orig_addr: remote_addr.offset(offset),
                dest_addr: local_addr.offset(offset),
                len: size,
                count: rows,
                ld,
                dest_node: self.node,
                task,
                host_object: region.host_object,
                region: Some(region.region),
                seq: self.arbiter.next_sequence(src),
                completion: Some(request),
            };
            trace!(%src, seq = transfer.seq, rows, "strided get chunk");
            self.transport.get_strided_1d(src, transfer)?;
            first_row += rows;
        }
        StatCounters::bump(&self.stats.gets, 1);
        self.wait_for(request)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // slave-to-slave transfers
    // ---------------------------------------------------------------------

    /// Ask `from` to put `size` bytes at its `src_addr` to `dest_addr` on `to`.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request_put(
        &self,
        from: NodeId,
        to: NodeId,
        src_addr: Address,
        dest_addr: Address,
        size: usize,
        task: Option<RemoteTaskId>,
        region: &RegionHandle,
    ) -> Result<(), NetworkError> {
        self.check_node(from)?;
        self.check_node(to)?;
        self.forward_region(to, region)?;
        if let Some(task) = task {
            self.rendezvous.record_sent(task, size);
        }
        let shape = StridedShape::contiguous(size);
        let transfer = self.remote_transfer(from, to, src_addr, dest_addr, shape, task, region);
        debug!(%from, %to, seq = transfer.seq, bytes = size, "request put");
        self.transport.send_request_put(from, transfer)?;
        Ok(())
    }

    /// Strided form of [`send_request_put`](Self::send_request_put).
    #[allow(clippy::too_many_arguments)]
    pub fn send_request_put_strided_1d(
        &self,
        from: NodeId,
        to: NodeId,
        src_addr: Address,
        dest_addr: Address,
        size: usize,
        count: usize,
        ld: usize,
        task: Option<RemoteTaskId>,
        region: &RegionHandle,
    ) -> Result<(), NetworkError> {
        let shape = StridedShape::new(size, count, ld).map_err(NetworkError::fatal)?;
        if !shape.is_strided() {
            return self.send_request_put(from, to, src_addr, dest_addr, size, task, region);
        }
        self.check_node(from)?;
        self.check_node(to)?;
        self.forward_region(to, region)?;
        if let Some(task) = task {
            self.rendezvous.record_sent(task, shape.packed_len());
        }
        let transfer = self.remote_transfer(from, to, src_addr, dest_addr, shape, task, region);
        debug!(%from, %to, seq = transfer.seq, rows = count, "strided request put");
        self.transport.send_request_put_strided_1d(from, transfer)?;
        Ok(())
    }

    /// Ask `node` to hold requests on `addr` until a put to it lands there.
    pub fn send_wait_request_put(
        &self,
        node: NodeId,
        addr: Address,
        task: Option<RemoteTaskId>,
    ) -> Result<(), NetworkError> {
        self.check_node(node)?;
        let seq = self.arbiter.next_sequence(node);
        debug!(%node, %addr, seq, "wait request put");
        self.transport.send_wait_request_put(node, addr, task, seq)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // remote memory
    // ---------------------------------------------------------------------

    /// Allocate `size` bytes in the registered segment of `node`.
    pub fn malloc(&self, node: NodeId, size: usize) -> Result<Address, NetworkError> {
        let request = self.issue_malloc(node, size)?;
        self.await_malloc(node, size, request)
    }

    /// Allocate `size` bytes on every node but the coordinator. Requests are
    /// issued together and the result is in node order whatever order the
    /// replies arrive in.
    pub fn malloc_slaves(&self, size: usize) -> Result<Vec<(NodeId, Address)>, NetworkError> {
        let requests = NodeId::all(self.num_nodes)
            .filter(|node| !node.is_coordinator())
            .map(|node| Ok((node, self.issue_malloc(node, size)?)))
            .collect::<Result<Vec<_>, NetworkError>>()?;

        requests
            .into_iter()
            .map(|(node, request)| Ok((node, self.await_malloc(node, size, request)?)))
            .collect()
    }

    pub fn mem_free(&self, node: NodeId, addr: Address) -> Result<(), NetworkError> {
        self.check_node(node)?;
        self.transport.mem_free(node, addr)?;
        Ok(())
    }

    /// Move an allocation on `node` to `new_addr` (allocated by the caller),
    /// keeping the common prefix, and free the old one.
    pub fn mem_realloc(
        &self,
        node: NodeId,
        old_addr: Address,
        old_size: usize,
        new_addr: Address,
        new_size: usize,
    ) -> Result<(), NetworkError> {
        self.check_node(node)?;
        self.transport
            .mem_realloc(node, old_addr, old_size, new_addr, new_size)?;
        Ok(())
    }

    pub fn add_segments(&self, segments: &[SegmentInfo]) -> Result<(), NetworkError> {
        self.transport.add_segments(segments)?;
        Ok(())
    }

    pub fn segment_addr(&self, node: NodeId) -> Option<Address> {
        self.transport.segment_addr(node)
    }

    pub fn segment_len(&self, node: NodeId) -> Option<usize> {
        self.transport.segment_len(node)
    }

    // ---------------------------------------------------------------------
    // work and control
    // ---------------------------------------------------------------------

    /// Dispatch `task` to `dest`. The expected input size is what was put for
    /// the task so far; only the coordinator dispatches work.
    pub fn send_work_msg(
        &self,
        dest: NodeId,
        task: RemoteTaskId,
        descriptor: Bytes,
    ) -> Result<(), NetworkError> {
        if !self.node.is_coordinator() {
            return Err(NetworkError::NotCoordinator {
                node: self.node,
                operation: "send_work_msg",
            }
            .fatal());
        }
        self.check_node(dest)?;

        let work = WorkMessage {
            task,
            expected_data: self.rendezvous.take_sent(task),
            metadata_seq: self.metadata_sent[dest.index()].load(Ordering::Acquire),
            descriptor,
        };
        debug!(
            %dest,
            %task,
            expected = work.expected_data,
            metadata_seq = work.metadata_seq,
            "dispatching work"
        );
        self.transport.send_work_msg(dest, work)?;
        Ok(())
    }

    /// Tell the coordinator `task` finished here.
    pub fn send_work_done_msg(&self, task: RemoteTaskId) -> Result<(), NetworkError> {
        debug!(%task, "work done");
        self.transport
            .send_work_done_msg(NodeId::COORDINATOR, task)?;
        Ok(())
    }

    /// Ask every other node to shut down.
    pub fn send_exit_msg(&self) -> Result<(), NetworkError> {
        for node in NodeId::all(self.num_nodes).filter(|node| *node != self.node) {
            self.transport.send_exit_msg(node)?;
        }
        Ok(())
    }

    pub fn node_barrier(&self) -> Result<(), NetworkError> {
        trace!(node = %self.node, "entering barrier");
        self.transport.node_barrier()?;
        Ok(())
    }

    /// Finalize the transport. Inbound events still queued are dropped.
    pub fn finalize(&self) -> Result<(), NetworkError> {
        let stats = self.stats();
        info!(
            node = %self.node,
            puts = stats.puts,
            gets = stats.gets,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            delayed = stats.delayed_messages,
            released = stats.released_tasks,
            "network finalized"
        );
        self.transport.finalize()?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // inbound hooks
    // ---------------------------------------------------------------------

    /// A put landed: write it to host memory, release held requests on its
    /// address, feed the rendezvous and fill the reply slot it answers.
    pub fn notify_put(&self, arrival: DataArrival) -> Result<(), NetworkError> {
        let DataArrival {
            from,
            dest_addr,
            payload,
            meta,
        } = arrival;

        let bytes = match payload {
            ArrivedPayload::Contiguous(data) => {
                self.memory.write(dest_addr, &data)?;
                data.len()
            }
            ArrivedPayload::Strided { packed, shape } => {
                // the receive buffer is held only for the duration of the unpack
                let buffer = self
                    .transport
                    .receive_segment()
                    .stage(&packed)
                    .map_err(|err| NetworkError::from(err).fatal())?;
                unpack_rows(self.memory.as_ref(), dest_addr, shape, buffer.as_slice())?;
                shape.packed_len()
            }
        };
        StatCounters::bump(&self.stats.bytes_received, bytes as u64);
        trace!(%from, %dest_addr, bytes, task = ?meta.task, "put landed");

        if let Some(request) = meta.completion {
            return self.completions.complete(request, None);
        }

        if !from.is_coordinator() {
            for transfer in self.wait_puts.on_put_landed(meta.tag) {
                debug!(addr = %meta.tag, seq = transfer.seq, "releasing held request");
                self.execute_transfer(transfer)?;
            }
        }

        if let Some(task) = meta.task {
            if let Some(work) = self.rendezvous.accumulate(task, bytes)? {
                self.release(work);
            }
        }
        Ok(())
    }

    pub fn notify_request_put(
        &self,
        from: NodeId,
        transfer: PendingTransfer,
    ) -> Result<(), NetworkError> {
        self.offer_sequenced(from, transfer.seq, SequencedRequest::RequestPut(transfer))
    }

    pub fn notify_get(&self, from: NodeId, transfer: PendingTransfer) -> Result<(), NetworkError> {
        self.offer_sequenced(from, transfer.seq, SequencedRequest::Get(transfer))
    }

    pub fn notify_wait_request_put(
        &self,
        from: NodeId,
        seq: SequenceNumber,
        addr: Address,
        task: Option<RemoteTaskId>,
    ) -> Result<(), NetworkError> {
        self.offer_sequenced(from, seq, SequencedRequest::WaitRequestPut { addr, task })
    }

    pub fn notify_region_metadata(
        &self,
        from: NodeId,
        metadata: RegionMetadata,
    ) -> Result<(), NetworkError> {
        self.check_node(from)?;
        trace!(
            %from,
            region = ?metadata.region,
            dims = metadata.dimensions.len(),
            "region metadata"
        );
        self.directory.register(metadata);
        self.metadata_received[from.index()].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// A work message arrived. It is declared to the rendezvous once the
    /// region metadata it was dispatched after has arrived too.
    pub fn notify_work(&self, from: NodeId, work: WorkMessage) -> Result<(), NetworkError> {
        self.check_node(from)?;
        if self.metadata_ready(from, &work) {
            return self.declare_work(from, work);
        }
        trace!(
            %from,
            task = %work.task,
            metadata_seq = work.metadata_seq,
            "queueing work behind region metadata"
        );
        self.pending_work.lock().push_back(QueuedWork { from, work });
        Ok(())
    }

    pub fn notify_work_done(&self, from: NodeId, task: RemoteTaskId) {
        debug!(%from, %task, "remote task completed");
        self.scheduler.notify_outlined_completion(task);
    }

    pub fn notify_malloc_reply(
        &self,
        request: RequestId,
        addr: Option<Address>,
    ) -> Result<(), NetworkError> {
        self.completions.complete(request, addr)
    }

    /// Make progress without blocking: poll the transport, apply inbound
    /// events, apply parked sequenced messages and dispatch queued work.
    pub fn poll(&self, poller: usize) -> Result<PollOutcome, NetworkError> {
        let _span = tracing::trace_span!("poll", node = %self.node, poller).entered();
        self.transport.poll(poller)?;

        let mut outcome = PollOutcome::default();
        while let Ok(event) = self.inbound.try_recv() {
            self.dispatch(event)?;
            outcome.events += 1;
        }
        outcome.delayed_applied = self
            .arbiter
            .drain(|from, seq, msg| self.apply_sequenced(from, seq, msg))?;
        outcome.work_dispatched = self.dispatch_pending_work()?;
        Ok(outcome)
    }

    fn dispatch(&self, event: InboundEvent) -> Result<(), NetworkError> {
        trace!(kind = event.kind(), "inbound");
        match event {
            InboundEvent::Data(arrival) => self.notify_put(arrival),
            InboundEvent::RegionMetadata { from, metadata } => {
                self.notify_region_metadata(from, metadata)
            }
            InboundEvent::Work { from, work } => self.notify_work(from, work),
            InboundEvent::WorkDone { from, task } => {
                self.notify_work_done(from, task);
                Ok(())
            }
            InboundEvent::MallocReply { request, addr } => self.notify_malloc_reply(request, addr),
            InboundEvent::RequestPut { from, transfer } => self.notify_request_put(from, transfer),
            InboundEvent::Get { from, transfer } => self.notify_get(from, transfer),
            InboundEvent::WaitRequestPut {
                from,
                seq,
                addr,
                task,
            } => self.notify_wait_request_put(from, seq, addr, task),
            InboundEvent::Exit { from } => {
                info!(%from, "exit requested");
                self.exit.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // internals
    // ---------------------------------------------------------------------

    fn check_node(&self, node: NodeId) -> Result<(), NetworkError> {
        if node.index() < self.num_nodes {
            return Ok(());
        }
        Err(NetworkError::NodeOutOfRange {
            node,
            num_nodes: self.num_nodes,
        }
        .fatal())
    }

    fn meta_for(task: Option<RemoteTaskId>, tag: Address, region: &RegionHandle) -> PutMeta {
        PutMeta {
            task,
            tag,
            host_object: region.host_object,
            region: Some(region.region),
            completion: None,
        }
    }

    /// Announce `region` to `dest` unless it already was.
    fn forward_region(&self, dest: NodeId, region: &RegionHandle) -> Result<(), NetworkError> {
        if self.forwarded.is_region_forwarded(dest, &region.region) {
            return Ok(());
        }
        if !self.forwarded.add_forwarded_region(dest, region.region) {
            return Ok(());
        }
        self.metadata_sent[dest.index()].fetch_add(1, Ordering::AcqRel);
        StatCounters::bump(&self.stats.metadata_sent, 1);
        debug!(%dest, region = ?region.region, "forwarding region metadata");
        self.transport.send_region_metadata(dest, region.metadata())?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn remote_transfer(
        &self,
        from: NodeId,
        to: NodeId,
        src_addr: Address,
        dest_addr: Address,
        shape: StridedShape,
        task: Option<RemoteTaskId>,
        region: &RegionHandle,
    ) -> PendingTransfer {
        PendingTransfer {
            orig_addr: src_addr,
            dest_addr,
            len: shape.size,
            count: shape.count,
            ld: shape.ld,
            dest_node: to,
            task,
            host_object: region.host_object,
            region: Some(region.region),
            seq: self.arbiter.next_sequence(from),
            completion: None,
        }
    }

    fn send_contiguous(
        &self,
        dest: NodeId,
        dest_addr: Address,
        src_addr: Address,
        size: usize,
        meta: PutMeta,
    ) -> Result<(), NetworkError> {
        let data = self.memory.read(src_addr, size)?;
        trace!(%dest, %dest_addr, bytes = size, "put");
        self.transport.put(dest, dest_addr, data, meta)?;
        StatCounters::bump(&self.stats.puts, 1);
        StatCounters::bump(&self.stats.bytes_sent, size as u64);
        Ok(())
    }

    fn send_strided(
        &self,
        dest: NodeId,
        dest_addr: Address,
        src_addr: Address,
        shape: StridedShape,
        meta: PutMeta,
    ) -> Result<(), NetworkError> {
        let mut packed = self
            .transport
            .pack_segment()
            .reserve(shape.packed_len())
            .map_err(|err| NetworkError::from(err).fatal())?;
        pack_rows(self.memory.as_ref(), src_addr, shape, packed.as_mut_slice())?;
        trace!(%dest, %dest_addr, rows = shape.count, bytes = shape.packed_len(), "strided put");
        self.transport
            .put_strided_1d(dest, dest_addr, packed, shape, meta)?;
        StatCounters::bump(&self.stats.puts, 1);
        StatCounters::bump(&self.stats.bytes_sent, shape.packed_len() as u64);
        Ok(())
    }

    /// Run a request-put or get on behalf of a peer.
    fn execute_transfer(&self, transfer: PendingTransfer) -> Result<(), NetworkError> {
        self.check_node(transfer.dest_node)?;
        let meta = transfer.put_meta();
        let shape = StridedShape::new(transfer.len, transfer.count, transfer.ld)
            .map_err(NetworkError::fatal)?;
        if shape.is_strided() {
            self.send_strided(
                transfer.dest_node,
                transfer.dest_addr,
                transfer.orig_addr,
                shape,
                meta,
            )
        } else {
            self.send_contiguous(
                transfer.dest_node,
                transfer.dest_addr,
                transfer.orig_addr,
                shape.packed_len(),
                meta,
            )
        }
    }

    fn offer_sequenced(
        &self,
        from: NodeId,
        seq: SequenceNumber,
        request: SequencedRequest,
    ) -> Result<(), NetworkError> {
        self.check_node(from)?;
        let applied = self
            .arbiter
            .offer(from, seq, request, |from, seq, msg| self.apply_sequenced(from, seq, msg))?;
        if applied == 0 {
            StatCounters::bump(&self.stats.delayed_messages, 1);
        }
        Ok(())
    }

    fn apply_sequenced(
        &self,
        from: NodeId,
        seq: SequenceNumber,
        request: SequencedRequest,
    ) -> Result<(), NetworkError> {
        trace!(%from, seq, kind = request.kind(), "applying sequenced request");
        match request {
            SequencedRequest::RequestPut(transfer) | SequencedRequest::Get(transfer) => {
                match self.wait_puts.admit(transfer.orig_addr, transfer) {
                    Some(transfer) => self.execute_transfer(transfer),
                    None => {
                        debug!(%from, seq, "request held behind wait-put");
                        Ok(())
                    }
                }
            }
            SequencedRequest::WaitRequestPut { addr, task } => {
                let outcome = self.wait_puts.on_wait_request(addr);
                debug!(%from, seq, %addr, ?task, ?outcome, "wait request put");
                Ok(())
            }
        }
    }

    fn metadata_ready(&self, from: NodeId, work: &WorkMessage) -> bool {
        self.metadata_received[from.index()].load(Ordering::Acquire) >= work.metadata_seq
    }

    fn declare_work(&self, from: NodeId, work: WorkMessage) -> Result<(), NetworkError> {
        let remote = RemoteWork {
            task: work.task,
            origin: from,
            descriptor: work.descriptor,
        };
        trace!(%from, task = %work.task, expected = work.expected_data, "declaring work");
        if let Some(remote) = self.rendezvous.declare(work.task, work.expected_data, remote)? {
            self.release(remote);
        }
        Ok(())
    }

    fn dispatch_pending_work(&self) -> Result<usize, NetworkError> {
        let ready: Vec<QueuedWork> = {
            let Some(mut queue) = self.pending_work.try_lock() else {
                return Ok(0);
            };
            if queue.is_empty() {
                return Ok(0);
            }
            let (ready, waiting): (VecDeque<_>, VecDeque<_>) = queue
                .drain(..)
                .partition(|queued| self.metadata_ready(queued.from, &queued.work));
            *queue = waiting;
            ready.into()
        };
        let dispatched = ready.len();
        for QueuedWork { from, work } in ready {
            self.declare_work(from, work)?;
        }
        Ok(dispatched)
    }

    fn release(&self, work: RemoteWork) {
        StatCounters::bump(&self.stats.released_tasks, 1);
        debug!(task = %work.task, origin = %work.origin, "releasing remote task");
        self.scheduler.submit(work);
    }

    fn issue_malloc(&self, node: NodeId, size: usize) -> Result<RequestId, NetworkError> {
        self.check_node(node)?;
        let request = self.completions.register(1);
        trace!(%node, size, %request, "malloc");
        self.transport.malloc(node, size, request)?;
        Ok(request)
    }

    fn await_malloc(
        &self,
        node: NodeId,
        size: usize,
        request: RequestId,
    ) -> Result<Address, NetworkError> {
        match self.wait_for(request)? {
            CompletionState::Complete { addr: Some(addr) } => Ok(addr),
            _ => Err(NetworkError::RemoteAllocationFailed { node, size }.fatal()),
        }
    }

    /// Spin on `poll` until `request` completes, then close its slot.
    fn wait_for(&self, request: RequestId) -> Result<CompletionState, NetworkError> {
        let yield_every = self.config.poll.yield_every.max(1);
        let mut spins: u32 = 0;
        while !self.completions.is_complete(request)? {
            self.poll(0)?;
            spins = spins.wrapping_add(1);
            if spins % yield_every == 0 {
                std::thread::yield_now();
            }
        }
        self.completions.remove(request)
    }
}
