//! Pooled fixed-size slot buffers.
//!
//! Each connection borrows at most one slot per pool: one for ciphertext
//! residue on the network side, one for cleartext staging on the
//! application side.  A slot is exclusively owned by its connection until
//! released; acquisition can fail when the pool is exhausted, which the
//! pumps treat as a hard per-connection error.

use crate::counters::{add, Counter};

/// Index of an acquired slot.  Not `Copy` so release sites are explicit.
#[derive(Debug, PartialEq, Eq)]
pub struct Slot(u32);

/// Fixed pool of equally sized slots with acquire/release accounting.
pub struct SlotPool {
    slot_capacity: usize,
    buffers: Vec<Vec<u8>>,
    free: Vec<u32>,
    acquires: Counter,
    releases: Counter,
}

impl SlotPool {
    /// `acquires`/`releases` are the host-visible accumulators for this
    /// pool (e.g. `server.network.acquires`).
    pub fn new(slot_count: usize, slot_capacity: usize, acquires: Counter, releases: Counter) -> Self {
        Self {
            slot_capacity,
            buffers: (0..slot_count).map(|_| vec![0u8; slot_capacity]).collect(),
            free: (0..slot_count as u32).rev().collect(),
            acquires,
            releases,
        }
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    /// Borrow a slot, or `None` when the pool is exhausted.
    pub fn acquire(&mut self) -> Option<Slot> {
        let index = self.free.pop()?;
        add(&self.acquires, 1);
        Some(Slot(index))
    }

    pub fn release(&mut self, slot: Slot) {
        add(&self.releases, 1);
        self.free.push(slot.0);
    }

    pub fn buffer(&mut self, slot: &Slot) -> &mut [u8] {
        &mut self.buffers[slot.0 as usize]
    }

    /// Slots currently held by connections.
    pub fn in_use(&self) -> usize {
        self.buffers.len() - self.free.len()
    }
}

/// Shift `buf[consumed..consumed + remaining]` to the front of `buf`.
///
/// Used after a partial unwrap/flush so the residue starts at offset zero
/// before more bytes are appended.
pub(crate) fn compact(buf: &mut [u8], consumed: usize, remaining: usize) {
    if consumed > 0 && remaining > 0 {
        buf.copy_within(consumed..consumed + remaining, 0);
    }
}
