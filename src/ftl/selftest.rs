//! Physical block maintenance: a destructive erase/program self-test, the free-block query, and a
//! read-only survey of every block's tag in a zone.

use log::{info, warn};

use super::spare::{is_free, mark_bad, read_tag};
use super::TranslationLayer;
use crate::error::{Error, Result};
use crate::nand::{PageUtil, PhysAddr, RawNand};

/// How many erase/program rounds [TranslationLayer::scan_block] puts a block through
pub const TEST_CYCLES: u32 = 5;

/// What a block's tag says about it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockContent {
    Bad,
    Free,

    /// Holds the given logical block
    Used(u16),
}

impl<N: RawNand> TranslationLayer<N> {
    /// Test block `block` of the loaded zone: [TEST_CYCLES] rounds of erasing it, checking every
    /// byte (spare areas included) reads 0xFF, programming it to zero and checking that, then a
    /// final erase and check.
    ///
    /// This destroys whatever the block holds. A block that fails any step is marked bad and
    /// [Error::BadBlock] is returned. The zone's directory is rebuilt either way.
    pub fn scan_block(&mut self, block: u16) -> Result<()> {
        let zone = self.zone();
        PhysAddr::page(zone, block, 0).check_access(&self.geometry, 0)?;

        let result = self.exercise_block(zone, block);
        match &result {
            Ok(()) => info!("Block {block} of zone {zone} passed self-test"),
            Err(e) => {
                warn!("Block {block} of zone {zone} failed self-test: {e}");
                mark_bad(&mut self.nand, zone, block);
            }
        }

        self.rebuild(zone)?;
        result.map_err(|_| Error::BadBlock(block))
    }

    /// Is block `block` of the loaded zone good and never written?
    pub fn judge_free_block(&mut self, block: u16) -> Result<bool> {
        let zone = self.zone();
        is_free(&mut self.nand, zone, block)
    }

    /// Classify every block of `zone` by its tag. This doesn't touch the loaded directory.
    pub fn survey(&mut self, zone: u16) -> Result<Vec<BlockContent>> {
        let blocks = self.geometry.blocks_per_zone;
        PhysAddr::page(zone, 0, 0).check_access(&self.geometry, 0)?;

        let rpt = howudoin::new()
            .label("Surveying blocks")
            .set_len(u64::from(blocks));

        let mut contents = Vec::with_capacity(usize::from(blocks));
        for block in 0..blocks {
            let tag = read_tag(&mut self.nand, zone, block)?;
            contents.push(match tag {
                tag if tag.is_bad() => BlockContent::Bad,
                tag if tag.is_used() => BlockContent::Used(tag.lbn()),
                _ => BlockContent::Free,
            });
            rpt.inc();
        }

        rpt.close();

        Ok(contents)
    }

    fn exercise_block(&mut self, zone: u16, block: u16) -> Result<()> {
        let device_block = PhysAddr::page(zone, block, 0).device_block(&self.geometry);
        let zeros = vec![0u8; self.geometry.page_total_size()];

        for _ in 0..TEST_CYCLES {
            self.nand.erase_block(device_block)?;
            self.verify_block(zone, block, |x| x.is_erased())?;

            for page in 0..self.geometry.pages_per_block {
                self.nand.write_page(PhysAddr::page(zone, block, page), &zeros)?;
            }
            self.verify_block(zone, block, |x| x.is_filled(0))?;
        }

        self.nand.erase_block(device_block)?;
        self.verify_block(zone, block, |x| x.is_erased())
    }

    /// Read back every page of a block with its spare area and apply `check` to each
    fn verify_block<F: Fn(&[u8]) -> bool>(&mut self, zone: u16, block: u16, check: F) -> Result<()> {
        let mut buf = vec![0u8; self.geometry.page_total_size()];

        for page in 0..self.geometry.pages_per_block {
            self.nand.read_page(PhysAddr::page(zone, block, page), &mut buf)?;
            if !check(&buf) {
                return Err(Error::BadBlock(block));
            }
        }

        Ok(())
    }
}
