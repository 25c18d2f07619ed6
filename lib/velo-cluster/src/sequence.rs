// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-destination sequencing of data-dependent control messages.
//!
//! Senders stamp put-requests, gets and wait-puts with a per-destination
//! counter. Receivers keep a per-source "next expected" counter: a message
//! whose number matches is applied at once, anything else waits in the delay
//! queue. Every successful apply rescans the queue from the front until no
//! entry matches, which yields FIFO application per source without any
//! retransmission. Messages from different sources are never ordered against
//! each other, and message kinds share one number space.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::ids::{Address, NodeId, RemoteTaskId, SequenceNumber};
use crate::transfer::PendingTransfer;

/// A control message that must be applied in issue order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SequencedRequest {
    /// Put `transfer.orig_addr` on this node to `transfer.dest_node`.
    RequestPut(PendingTransfer),
    /// Send `transfer.orig_addr` on this node back to the requester.
    Get(PendingTransfer),
    /// Hold requests on `addr` until a put to it has landed here.
    WaitRequestPut {
        addr: Address,
        task: Option<RemoteTaskId>,
    },
}

impl SequencedRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SequencedRequest::RequestPut(_) => "request_put",
            SequencedRequest::Get(_) => "get",
            SequencedRequest::WaitRequestPut { .. } => "wait_request_put",
        }
    }
}

struct Delayed<M> {
    from: NodeId,
    seq: SequenceNumber,
    msg: M,
}

/// Issue and arrival counters for every peer plus the delay queue.
pub struct SequenceArbiter<M> {
    issued: Vec<AtomicU32>,
    expected: Vec<AtomicU32>,
    delayed: Mutex<VecDeque<Delayed<M>>>,
    warn_len: usize,
}

impl<M> SequenceArbiter<M> {
    pub fn new(num_nodes: usize, warn_len: usize) -> Self {
        Self {
            issued: (0..num_nodes).map(|_| AtomicU32::new(0)).collect(),
            expected: (0..num_nodes).map(|_| AtomicU32::new(0)).collect(),
            delayed: Mutex::new(VecDeque::new()),
            warn_len,
        }
    }

    /// Assign the next sequence number for a message to `dest`.
    pub fn next_sequence(&self, dest: NodeId) -> SequenceNumber {
        self.issued[dest.index()].fetch_add(1, Ordering::AcqRel)
    }

    /// Number that the next message to `dest` will carry.
    pub fn peek_issued(&self, dest: NodeId) -> SequenceNumber {
        self.issued[dest.index()].load(Ordering::Acquire)
    }

    /// Number the next applicable message from `from` must carry.
    pub fn expected(&self, from: NodeId) -> SequenceNumber {
        self.expected[from.index()].load(Ordering::Acquire)
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.lock().len()
    }

    /// Accept a message from `from`. `apply` runs for it and for every parked
    /// message it unblocks, in sequence order per source. Returns how many
    /// messages were applied by this call.
    pub fn offer<F>(
        &self,
        from: NodeId,
        seq: SequenceNumber,
        msg: M,
        mut apply: F,
    ) -> Result<usize, NetworkError>
    where
        F: FnMut(NodeId, SequenceNumber, M) -> Result<(), NetworkError>,
    {
        let expected = self.expected(from);
        if seq == expected {
            apply(from, seq, msg)?;
            self.advance(from, seq)?;
            return Ok(1 + self.drain_inner(&mut apply, true)?);
        }

        if is_behind(seq, expected) {
            return Err(NetworkError::StaleSequence {
                from,
                seq,
                expected,
            }
            .fatal());
        }

        tracing::trace!(%from, seq, expected, "parking out-of-sequence message");
        {
            let mut queue = self.delayed.lock();
            queue.push_back(Delayed { from, seq, msg });
            if queue.len() > self.warn_len {
                tracing::warn!(
                    delayed = queue.len(),
                    threshold = self.warn_len,
                    "delay queue is growing"
                );
            }
        }
        // the expected message may have been applied while we were parking
        self.drain_inner(&mut apply, true)
    }

    /// Apply every parked message that became applicable. Skips the scan if
    /// another thread is already holding the queue.
    pub fn drain<F>(&self, mut apply: F) -> Result<usize, NetworkError>
    where
        F: FnMut(NodeId, SequenceNumber, M) -> Result<(), NetworkError>,
    {
        self.drain_inner(&mut apply, false)
    }

    fn drain_inner<F>(&self, apply: &mut F, blocking: bool) -> Result<usize, NetworkError>
    where
        F: FnMut(NodeId, SequenceNumber, M) -> Result<(), NetworkError>,
    {
        let mut applied = 0;
        loop {
            let next = {
                let mut queue = if blocking {
                    self.delayed.lock()
                } else {
                    match self.delayed.try_lock() {
                        Some(queue) => queue,
                        None => return Ok(applied),
                    }
                };
                let position = queue
                    .iter()
                    .position(|entry| entry.seq == self.expected(entry.from));
                match position {
                    Some(position) => queue.remove(position),
                    None => None,
                }
            };

            let Some(Delayed { from, seq, msg }) = next else {
                return Ok(applied);
            };
            tracing::trace!(%from, seq, "applying delayed message");
            apply(from, seq, msg)?;
            self.advance(from, seq)?;
            applied += 1;
        }
    }

    fn advance(&self, from: NodeId, seq: SequenceNumber) -> Result<(), NetworkError> {
        self.expected[from.index()]
            .compare_exchange(seq, seq.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| {
                NetworkError::StaleSequence {
                    from,
                    seq,
                    expected: current,
                }
                .fatal()
            })
    }
}

/// Whether `seq` was issued before `expected`, allowing for wrap-around.
fn is_behind(seq: SequenceNumber, expected: SequenceNumber) -> bool {
    (seq.wrapping_sub(expected) as i32) < 0
}
