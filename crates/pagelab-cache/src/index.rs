//! Open-addressed page index.
//!
//! Maps a page number to the arena slot of its resident or ghost entry.
//! The table is allocated once at engine init with room for 4x the maximum
//! population, rounded up to a power of two, so the load factor stays below
//! 0.5 and the table never needs to grow or rehash. Linear probing
//! terminates on an empty slot; tombstones are skipped on lookup and reused
//! on insert.

use crate::list::SlotId;
use pagelab_error::Result;
use pagelab_types::PageNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Occupied,
    Tombstone,
}

#[derive(Debug)]
pub(crate) struct PageIndex {
    keys: Vec<u64>,
    vals: Vec<Option<SlotId>>,
    state: Vec<SlotState>,
    mask: usize,
    len: usize,
}

/// Mix the key with two odd multiplicative constants and xor-shifts so that
/// sequential page numbers do not cluster into probe chains.
fn mix64(key: u64) -> u64 {
    let mut x = key.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl PageIndex {
    /// Allocate a table sized for at most `max_population` live keys.
    pub(crate) fn with_population(max_population: usize) -> Result<Self> {
        let capacity = max_population
            .saturating_mul(4)
            .max(4)
            .next_power_of_two();

        let mut keys = Vec::new();
        keys.try_reserve_exact(capacity)?;
        keys.resize(capacity, 0_u64);

        let mut vals = Vec::new();
        vals.try_reserve_exact(capacity)?;
        vals.resize(capacity, None);

        let mut state = Vec::new();
        state.try_reserve_exact(capacity)?;
        state.resize(capacity, SlotState::Empty);

        Ok(Self {
            keys,
            vals,
            state,
            mask: capacity - 1,
            len: 0,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn get(&self, key: PageNumber) -> Option<SlotId> {
        let mut i = (mix64(key.0) as usize) & self.mask;
        loop {
            match self.state[i] {
                SlotState::Empty => return None,
                SlotState::Occupied if self.keys[i] == key.0 => return self.vals[i],
                SlotState::Occupied | SlotState::Tombstone => {}
            }
            i = (i + 1) & self.mask;
        }
    }

    pub(crate) fn insert(&mut self, key: PageNumber, value: SlotId) {
        debug_assert!(
            self.len < (self.mask + 1) / 2,
            "page index over its sizing contract"
        );
        let mut i = (mix64(key.0) as usize) & self.mask;
        let mut first_tombstone = None;
        loop {
            match self.state[i] {
                SlotState::Empty => {
                    let target = first_tombstone.unwrap_or(i);
                    self.state[target] = SlotState::Occupied;
                    self.keys[target] = key.0;
                    self.vals[target] = Some(value);
                    self.len += 1;
                    return;
                }
                SlotState::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(i);
                    }
                }
                SlotState::Occupied if self.keys[i] == key.0 => {
                    self.vals[i] = Some(value);
                    return;
                }
                SlotState::Occupied => {}
            }
            i = (i + 1) & self.mask;
        }
    }

    pub(crate) fn remove(&mut self, key: PageNumber) -> Option<SlotId> {
        let mut i = (mix64(key.0) as usize) & self.mask;
        loop {
            match self.state[i] {
                SlotState::Empty => return None,
                SlotState::Occupied if self.keys[i] == key.0 => {
                    self.state[i] = SlotState::Tombstone;
                    self.len -= 1;
                    return self.vals[i].take();
                }
                SlotState::Occupied | SlotState::Tombstone => {}
            }
            i = (i + 1) & self.mask;
        }
    }

}
