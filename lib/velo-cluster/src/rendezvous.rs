// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Join of "expected size declared" and "bytes received" per remote task.
//!
//! A task dispatched to this node becomes runnable once every byte of its
//! input has landed. The work message (carrying the expected size) and the
//! data payloads travel independently, so either may arrive first. Both paths
//! go through the same per-task map entry, and whichever completes the join
//! removes the entry and hands the work back exactly once.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::NetworkError;
use crate::ids::RemoteTaskId;

/// State of one task that is not yet released.
#[derive(Debug)]
pub struct RendezvousEntry<W> {
    expected: Option<usize>,
    received: usize,
    work: Option<W>,
}

impl<W> RendezvousEntry<W> {
    /// Declared size, if the work message has arrived.
    pub fn expected(&self) -> Option<usize> {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Bytes still outstanding once the size is known.
    pub fn missing(&self) -> Option<usize> {
        self.expected.map(|expected| expected.saturating_sub(self.received))
    }

    pub fn into_work(self) -> Option<W> {
        self.work
    }
}

/// Receive-side joins plus the send-side byte counts used to fill in
/// outgoing work messages.
pub struct RendezvousTracker<W> {
    entries: DashMap<RemoteTaskId, RendezvousEntry<W>>,
    sent: DashMap<RemoteTaskId, usize>,
}

impl<W> Default for RendezvousTracker<W> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            sent: DashMap::new(),
        }
    }
}

impl<W> RendezvousTracker<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `task` expects `expected` bytes and runs `work`.
    ///
    /// Returns the work if every byte has already landed.
    pub fn declare(
        &self,
        task: RemoteTaskId,
        expected: usize,
        work: W,
    ) -> Result<Option<W>, NetworkError> {
        match self.entries.entry(task) {
            Entry::Vacant(vacant) => {
                if expected == 0 {
                    return Ok(Some(work));
                }
                vacant.insert(RendezvousEntry {
                    expected: Some(expected),
                    received: 0,
                    work: Some(work),
                });
                Ok(None)
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.expected.is_some() {
                    return Err(NetworkError::DuplicateDeclaration { task }.fatal());
                }
                let received = entry.received;
                if received > expected {
                    return Err(NetworkError::RendezvousOverflow {
                        task,
                        expected,
                        received,
                    }
                    .fatal());
                }
                if received == expected {
                    occupied.remove();
                    return Ok(Some(work));
                }
                entry.expected = Some(expected);
                entry.work = Some(work);
                Ok(None)
            }
        }
    }

    /// Account for `bytes` of input that landed for `task`.
    ///
    /// Returns the work if this payload completed the join.
    pub fn accumulate(&self, task: RemoteTaskId, bytes: usize) -> Result<Option<W>, NetworkError> {
        match self.entries.entry(task) {
            Entry::Vacant(vacant) => {
                if bytes > 0 {
                    vacant.insert(RendezvousEntry {
                        expected: None,
                        received: bytes,
                        work: None,
                    });
                }
                Ok(None)
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.received += bytes;
                let Some(expected) = entry.expected else {
                    return Ok(None);
                };
                if entry.received > expected {
                    return Err(NetworkError::RendezvousOverflow {
                        task,
                        expected,
                        received: entry.received,
                    }
                    .fatal());
                }
                if entry.received < expected {
                    return Ok(None);
                }
                Ok(occupied.remove().work)
            }
        }
    }

    /// Drop the entry for `task`.
    pub fn remove(&self, task: RemoteTaskId) -> Result<RendezvousEntry<W>, NetworkError> {
        self.entries
            .remove(&task)
            .map(|(_, entry)| entry)
            .ok_or(NetworkError::RendezvousEntryMissing { task })
    }

    pub fn is_pending(&self, task: RemoteTaskId) -> bool {
        self.entries.contains_key(&task)
    }

    pub fn pending_len(&self) -> usize {
        self.entries.len()
    }

    /// Add `bytes` to what was sent for `task`; returns the running total.
    pub fn record_sent(&self, task: RemoteTaskId, bytes: usize) -> usize {
        let mut total = self.sent.entry(task).or_insert(0);
        *total += bytes;
        *total
    }

    /// Consume the bytes sent for `task` so far. A task that was sent no
    /// data expects none.
    pub fn take_sent(&self, task: RemoteTaskId) -> usize {
        self.sent.remove(&task).map_or(0, |(_, bytes)| bytes)
    }
}
