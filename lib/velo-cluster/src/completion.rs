// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::NetworkError;
use crate::ids::{Address, RequestId};

/// Progress of a synchronous request waiting on asynchronous replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// `remaining` replies have not arrived yet.
    Pending { remaining: usize },
    /// Every reply arrived; `addr` is the value of the last one.
    Complete { addr: Option<Address> },
}

/// Reply slots for malloc and get, keyed by request id.
///
/// A slot is registered by the issuing thread, filled by whichever thread
/// polls the reply in, and removed by the issuing thread.
#[derive(Default)]
pub struct CompletionTable {
    next: AtomicU64,
    slots: DashMap<RequestId, CompletionState>,
}

impl CompletionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot that completes after `parts` replies.
    pub fn register(&self, parts: usize) -> RequestId {
        let id = RequestId::new(self.next.fetch_add(1, Ordering::Relaxed));
        let state = if parts == 0 {
            CompletionState::Complete { addr: None }
        } else {
            CompletionState::Pending { remaining: parts }
        };
        self.slots.insert(id, state);
        id
    }

    /// Record one reply for `id`.
    pub fn complete(&self, id: RequestId, addr: Option<Address>) -> Result<(), NetworkError> {
        let mut slot = self
            .slots
            .get_mut(&id)
            .ok_or_else(|| NetworkError::UnknownRequest(id).fatal())?;
        let current = *slot;
        match current {
            CompletionState::Pending { remaining } if remaining > 1 => {
                *slot = CompletionState::Pending {
                    remaining: remaining - 1,
                };
            }
            CompletionState::Pending { .. } => *slot = CompletionState::Complete { addr },
            CompletionState::Complete { .. } => {
                return Err(NetworkError::RequestAlreadyCompleted(id).fatal());
            }
        }
        Ok(())
    }

    pub fn is_complete(&self, id: RequestId) -> Result<bool, NetworkError> {
        self.slots
            .get(&id)
            .map(|slot| matches!(*slot, CompletionState::Complete { .. }))
            .ok_or(NetworkError::UnknownRequest(id))
    }

    /// Close the slot and return its final state.
    pub fn remove(&self, id: RequestId) -> Result<CompletionState, NetworkError> {
        self.slots
            .remove(&id)
            .map(|(_, state)| state)
            .ok_or_else(|| NetworkError::UnknownRequest(id).fatal())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
