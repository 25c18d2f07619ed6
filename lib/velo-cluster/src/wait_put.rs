// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Holding requests on an address until the put that produces it has landed.
//!
//! The coordinator tells a node to "wait for a put to X" ahead of asking it to
//! forward X elsewhere. The put comes from a third node, so it may land before
//! or after the wait. Whichever happens first is recorded (the `waiting` or
//! the `arrived` set) and the second one resolves it.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::ids::Address;

/// What a wait request found when it was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The put had not landed; requests on the address are now held.
    Waiting,
    /// The put had already landed; nothing is held.
    AlreadyArrived,
}

#[derive(Default)]
struct WaitSets {
    waiting: HashSet<Address>,
    arrived: HashSet<Address>,
}

/// Waiting set, already-arrived set and the requests held on waiting addresses.
///
/// Both sets live behind one lock, so an address is only ever resolved by one
/// side. Concurrent puts to the same address from two senders are not
/// distinguished.
pub struct WaitPutTable<M> {
    sets: Mutex<WaitSets>,
    held: Mutex<HashMap<Address, Vec<M>>>,
}

impl<M> Default for WaitPutTable<M> {
    fn default() -> Self {
        Self {
            sets: Mutex::new(WaitSets::default()),
            held: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> WaitPutTable<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a wait request for `addr`.
    pub fn on_wait_request(&self, addr: Address) -> WaitOutcome {
        let mut sets = self.sets.lock();
        if sets.arrived.remove(&addr) {
            WaitOutcome::AlreadyArrived
        } else {
            sets.waiting.insert(addr);
            WaitOutcome::Waiting
        }
    }

    /// Let `request` on `addr` through, or hold it if `addr` is waiting.
    pub fn admit(&self, addr: Address, request: M) -> Option<M> {
        let sets = self.sets.lock();
        if !sets.waiting.contains(&addr) {
            return Some(request);
        }
        self.held.lock().entry(addr).or_default().push(request);
        None
    }

    /// A put to `addr` landed. Returns the requests that were held on it, in
    /// the order they were admitted.
    ///
    /// A put nobody waits for leaves `addr` in the arrived set until a wait
    /// request consumes it, so the next wait on that address resolves at once
    /// even if it was meant for a later put. Addresses reused across waits
    /// need a wait issued ahead of every put to them.
    pub fn on_put_landed(&self, addr: Address) -> Vec<M> {
        let mut sets = self.sets.lock();
        if sets.waiting.remove(&addr) {
            self.held.lock().remove(&addr).unwrap_or_default()
        } else {
            sets.arrived.insert(addr);
            Vec::new()
        }
    }

    pub fn is_waiting(&self, addr: Address) -> bool {
        self.sets.lock().waiting.contains(&addr)
    }

    pub fn has_arrived(&self, addr: Address) -> bool {
        self.sets.lock().arrived.contains(&addr)
    }

    pub fn held_len(&self) -> usize {
        self.held.lock().values().map(Vec::len).sum()
    }
}
