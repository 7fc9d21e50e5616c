//! The block directory: the in-memory map of logical block slots to physical blocks in one zone.
//!
//! The directory is never persisted. It is rebuilt from the spare-area tags (see
//! [super::spare]) by scanning every block of the zone, so the tags on flash are always the
//! source of truth and the directory is only a cache of them.
//!
//! Slots are laid out as:
//!
//! ```text
//! 0 ............ max_logical-1 | max_logical | max_logical+1 | ... free ... | bad <- end
//!        logical blocks        |  odd xchg   |   even xchg   |              |
//! ```
//!
//! Bad blocks are recorded in slots taken from the end of the table downward, so a zone fails to
//! build once they would eat into the logical or exchange slots.

use log::{debug, warn};

use super::spare::read_tag;
use crate::error::{Error, Result};
use crate::nand::{RawNand, EXCHANGE_BLOCKS};

/// The state of a directory slot
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockState {
    /// Backed by an erased, never-written block
    Free,

    /// Records a bad physical block; such slots only exist at the end of the table
    Bad,

    /// Backed by a block that has been written at least once, so writing it again requires
    /// relocation
    Used {
        /// Mirrors the device's valid flag, kept apart from the used flag. Nothing writes an
        /// invalid tag, so every used block the scan finds is valid.
        valid: bool,
    },
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct DirectoryEntry {
    /// The physical block behind this slot, if any is left to assign
    pub physical: Option<u16>,
    pub state: BlockState,
}

impl DirectoryEntry {
    const UNASSIGNED: Self = Self {
        physical: None,
        state: BlockState::Free,
    };
}

/// Which exchange slot to draw from
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Parity {
    Odd,
    Even,
}

impl Parity {
    /// Relocating a physical block goes through the exchange slot of the opposite parity
    pub fn exchange_for(block: u16) -> Self {
        match block & 1 {
            1 => Parity::Even,
            _ => Parity::Odd,
        }
    }
}

/// First-fit allocation over the physical blocks not claimed during the scan
struct FirstFit {
    available: Vec<bool>,
    cursor: usize,
}

impl Iterator for FirstFit {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        let found = self.available[self.cursor..].iter().position(|&x| x)?;
        let block = self.cursor + found;
        self.available[block] = false;
        self.cursor = block + 1;
        Some(block as u16)
    }
}

#[derive(Debug, Clone)]
pub struct Directory {
    zone: u16,
    max_logical: u16,
    entries: Box<[DirectoryEntry]>,
}

impl Directory {
    /// Scan every block of `zone` and reconstruct its directory.
    ///
    /// Fails with [Error::TooManyBadBlocks] if the zone's bad blocks would overlap the logical
    /// and exchange slots.
    pub fn build<N: RawNand>(nand: &mut N, zone: u16) -> Result<Self> {
        let geometry = nand.geometry();
        let blocks = geometry.blocks_per_zone;
        let max_logical = geometry.max_logical_blocks_per_zone;
        let reserved = max_logical + EXCHANGE_BLOCKS;

        let mut entries = vec![DirectoryEntry::UNASSIGNED; usize::from(blocks)].into_boxed_slice();
        let mut available = vec![true; usize::from(blocks)];
        let mut bad_cursor = blocks - 1;

        for block in 0..blocks {
            let tag = read_tag(nand, zone, block)?;

            if tag.is_bad() {
                entries[usize::from(bad_cursor)] = DirectoryEntry {
                    physical: Some(block),
                    state: BlockState::Bad,
                };
                available[usize::from(block)] = false;

                bad_cursor -= 1;
                if bad_cursor <= reserved {
                    warn!("Zone {zone}: too many bad blocks");
                    return Err(Error::TooManyBadBlocks { zone });
                }
            } else if tag.is_used() {
                // Whatever happens below, a used block must not be handed out as free
                available[usize::from(block)] = false;

                let lbn = tag.lbn();
                if lbn >= max_logical {
                    warn!("Zone {zone}: block {block} tagged with invalid logical block {lbn}");
                    continue;
                }

                let entry = &mut entries[usize::from(lbn)];
                if let BlockState::Used { .. } = entry.state {
                    // Power was lost between tagging a relocated block and erasing its source
                    warn!(
                        "Zone {zone}: blocks {:?} and {block} both claim logical block {lbn}",
                        entry.physical
                    );
                    continue;
                }

                *entry = DirectoryEntry {
                    physical: Some(block),
                    state: BlockState::Used { valid: true },
                };
            }
        }

        // Hand the remaining good blocks to every slot that is neither used nor bad, in order
        let mut free = FirstFit {
            available,
            cursor: 0,
        };
        for entry in entries.iter_mut() {
            if entry.state == BlockState::Free {
                entry.physical = free.next();
            }
        }

        debug!(
            "Built directory for zone {zone}: {} bad blocks",
            usize::from(blocks - 1 - bad_cursor)
        );

        Ok(Self {
            zone,
            max_logical,
            entries,
        })
    }

    /// The zone this directory describes
    pub fn zone(&self) -> u16 {
        self.zone
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn entry(&self, slot: u16) -> Option<&DirectoryEntry> {
        self.entries.get(usize::from(slot))
    }

    /// Find the physical block and state behind logical block `lbn`
    pub fn lookup(&self, lbn: u16) -> Result<(u16, BlockState)> {
        let unmapped = Error::Unmapped {
            zone: self.zone,
            block: lbn,
        };

        match self.entry(lbn) {
            Some(&DirectoryEntry {
                physical: Some(physical),
                state,
            }) if lbn < self.max_logical => Ok((physical, state)),
            _ => Err(unmapped),
        }
    }

    /// Record that the block behind logical block `lbn` has now been written
    pub fn set_used(&mut self, lbn: u16) {
        if let Some(entry) = self.entries.get_mut(usize::from(lbn)) {
            entry.state = BlockState::Used { valid: true };
        }
    }

    /// The physical block currently reserved in the exchange slot of the given parity
    pub fn find_free_block(&self, parity: Parity) -> Option<u16> {
        let slot = match parity {
            Parity::Odd => self.max_logical,
            Parity::Even => self.max_logical + 1,
        };

        match self.entry(slot)? {
            DirectoryEntry {
                physical: Some(physical),
                state: BlockState::Free,
            } => Some(*physical),
            _ => None,
        }
    }

    /// The physical numbers of every block found bad
    pub fn bad_blocks(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries
            .iter()
            .filter(|x| x.state == BlockState::Bad)
            .filter_map(|x| x.physical)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftl::spare::{mark_bad, mark_logical, mark_used};
    use crate::nand::{sim::SimNand, TEST_GEOMETRY};

    fn physical_numbers(directory: &Directory) -> Vec<u16> {
        let mut numbers: Vec<u16> = directory
            .entries()
            .iter()
            .filter_map(|x| x.physical)
            .collect();
        numbers.sort();
        numbers
    }

    #[test]
    fn test_build_blank() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let directory = Directory::build(&mut nand, 0)?;

        assert_eq!(directory.zone(), 0);
        assert!(directory
            .entries()
            .iter()
            .all(|x| x.state == BlockState::Free));

        // Identity mapping on a blank zone
        for (slot, entry) in directory.entries().iter().enumerate() {
            assert_eq!(entry.physical, Some(slot as u16));
        }

        assert_eq!(directory.find_free_block(Parity::Odd), Some(56));
        assert_eq!(directory.find_free_block(Parity::Even), Some(57));
        Ok(())
    }

    #[test]
    fn test_build_used_blocks() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);

        // Logical block 0 lives in physical block 5, logical block 3 in physical block 0
        mark_used(&mut nand, 0, 5)?;
        mark_logical(&mut nand, 0, 5, 0)?;
        mark_used(&mut nand, 0, 0)?;
        mark_logical(&mut nand, 0, 0, 3)?;

        let directory = Directory::build(&mut nand, 0)?;
        assert_eq!(directory.lookup(0)?, (5, BlockState::Used { valid: true }));
        assert_eq!(directory.lookup(3)?, (0, BlockState::Used { valid: true }));

        // Free slots are filled first-fit, skipping the claimed blocks
        assert_eq!(directory.lookup(1)?, (1, BlockState::Free));
        assert_eq!(directory.lookup(2)?, (2, BlockState::Free));
        assert_eq!(directory.lookup(4)?, (3, BlockState::Free));
        assert_eq!(directory.lookup(5)?, (4, BlockState::Free));
        assert_eq!(directory.lookup(6)?, (6, BlockState::Free));

        // Every physical block is assigned exactly once
        assert_eq!(physical_numbers(&directory), (0..64).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_build_bad_blocks() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.set_factory_bad(2);
        mark_bad(&mut nand, 0, 57);

        let directory = Directory::build(&mut nand, 0)?;
        assert_eq!(directory.bad_blocks().collect::<Vec<_>>(), [57, 2]);
        assert_eq!(
            directory.entry(63),
            Some(&DirectoryEntry {
                physical: Some(2),
                state: BlockState::Bad
            })
        );

        // No slot is backed by a bad block
        for entry in directory.entries() {
            if entry.state != BlockState::Bad {
                assert!(!matches!(entry.physical, Some(2) | Some(57)));
            }
        }
        assert_eq!(directory.lookup(2)?, (3, BlockState::Free));
        assert_ne!(directory.find_free_block(Parity::Odd), Some(57));
        assert_ne!(directory.find_free_block(Parity::Even), Some(57));

        // Still a permutation of all blocks, counting the bad records
        assert_eq!(physical_numbers(&directory), (0..64).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_too_many_bad_blocks() {
        let mut nand = SimNand::new(TEST_GEOMETRY);

        // 64 slots, 56 logical + 2 exchange: the fifth bad block brings the cursor to 58
        for block in 0..4 {
            nand.set_factory_bad(block);
        }
        assert!(Directory::build(&mut nand, 0).is_ok());

        nand.set_factory_bad(40);
        assert!(matches!(
            Directory::build(&mut nand, 0),
            Err(Error::TooManyBadBlocks { zone: 0 })
        ));

        // The other zone is unaffected
        assert!(Directory::build(&mut nand, 1).is_ok());
    }

    #[test]
    fn test_duplicate_claim() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        for block in [4, 9] {
            mark_used(&mut nand, 0, block)?;
            mark_logical(&mut nand, 0, block, 7)?;
        }

        let directory = Directory::build(&mut nand, 0)?;
        assert_eq!(directory.lookup(7)?, (4, BlockState::Used { valid: true }));

        // The stale copy is not handed out
        assert!(directory
            .entries()
            .iter()
            .all(|x| x.physical != Some(9)));
        Ok(())
    }

    #[test]
    fn test_lookup_rejects_reserved_slots() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let directory = Directory::build(&mut nand, 0)?;
        assert!(matches!(
            directory.lookup(56),
            Err(Error::Unmapped { zone: 0, block: 56 })
        ));
        Ok(())
    }
}
