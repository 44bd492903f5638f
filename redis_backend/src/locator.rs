// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Hash-slot to connection-index routing table.

use crate::crc16;
use crate::slot_bitmap::{SlotBitmap, SLOT_COUNT};
use crate::Error;

/// Index of a connection in the connection manager's table.
pub type ConnIndex = u32;

/// Keeps the mask in sync with the slot count.
pub const SLOT_MASK: u16 = (SLOT_COUNT - 1) as u16;

pub struct Locator {
    index: Vec<Option<ConnIndex>>,
    cover: SlotBitmap,
}

impl Default for Locator {
    fn default() -> Locator {
        Locator::new()
    }
}

impl Locator {
    pub fn new() -> Locator {
        Locator {
            index: vec![None; SLOT_COUNT],
            cover: SlotBitmap::new(),
        }
    }

    /// Map key bytes to their hash slot.
    pub fn hash(key: &[u8]) -> Result<u16, Error> {
        Ok(crc16::crc_remainder(key)? & SLOT_MASK)
    }

    pub fn lookup(&self, slot: u16) -> Option<ConnIndex> {
        self.index[(slot & SLOT_MASK) as usize]
    }

    pub fn assign(&mut self, slot: u16, conn: ConnIndex) {
        let slot = slot & SLOT_MASK;
        self.index[slot as usize] = Some(conn);
        self.cover.set(slot);
    }

    pub fn remove(&mut self, slot: u16) {
        let slot = slot & SLOT_MASK;
        self.index[slot as usize] = None;
        self.cover.unset(slot);
    }

    /// Rebind every slot currently mapped to `from` onto `to`; `from =
    /// None` fills all holes. O(SLOT_COUNT) sweep. Returns the number of
    /// slots changed.
    pub fn reassociate(&mut self, from: Option<ConnIndex>, to: Option<ConnIndex>) -> usize {
        let mut updated = 0;
        for slot in 0..SLOT_COUNT as u16 {
            if self.index[slot as usize] == from {
                self.index[slot as usize] = to;
                match to {
                    Some(_) => self.cover.set(slot),
                    None => self.cover.unset(slot),
                }
                updated += 1;
            }
        }
        updated
    }

    /// Is the whole keyspace owned by some connection?
    pub fn fully_covered(&self) -> bool {
        self.cover.is_full()
    }

    pub fn first_uncovered(&self) -> Option<u16> {
        self.cover.first_unset()
    }
}
