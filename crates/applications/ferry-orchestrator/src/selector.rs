//! Connection-consistent member selection
//!
//! A five-tuple is hashed once (CRC-32C over its canonical byte layout) and the hash
//! picks a *home slot* `hash % capacity`. The slot count of a group never changes, so a
//! flow's home slot never changes either; what a slot points at is mutable.
//!
//! When the home slot is empty or inactive the flow spills over to one of the active
//! slots, chosen from the high bits of the same hash. Only flows whose home slot is
//! ineligible move, and the spill choice depends on nothing but the hash and the active
//! set, so every packet of the flow lands in the same place.

use crc::{Crc, CRC_32_ISCSI};
use ferry_core::FiveTuple;

const FLOW_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Hash of a five-tuple
pub fn flow_hash(tuple: &FiveTuple) -> u32 {
    FLOW_HASH.checksum(&tuple.to_bytes())
}

/// Member index a five-tuple hashes to in a group of `capacity` slots
pub fn home_slot(tuple: &FiveTuple, capacity: u16) -> u16 {
    debug_assert!(capacity > 0);
    (flow_hash(tuple) % u32::from(capacity.max(1))) as u16
}

/// Pick the serving slot for `hash` given each slot's eligibility.
///
/// Returns `None` when no slot is eligible.
pub fn select(hash: u32, eligible: &[bool]) -> Option<usize> {
    let capacity = eligible.len();
    if capacity == 0 {
        return None;
    }

    let home = hash as usize % capacity;
    if eligible[home] {
        return Some(home);
    }

    let active: Vec<usize> = eligible
        .iter()
        .enumerate()
        .filter_map(|(i, ok)| ok.then_some(i))
        .collect();
    if active.is_empty() {
        return None;
    }

    let spill = (hash as usize / capacity) % active.len();
    Some(active[spill])
}
