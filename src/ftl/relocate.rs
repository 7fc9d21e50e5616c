//! The write path: direct programming of blocks that have never been written, and relocation
//! through an exchange block for blocks that have.

use log::{debug, warn};
use retry::{delay::NoDelay, retry, OperationResult};

use super::directory::{BlockState, Parity};
use super::spare::{mark_bad, mark_logical, mark_used};
use super::{page_chunks, LogicalAddr, TranslationLayer};
use crate::error::{Error, Result};
use crate::nand::{PhysAddr, RawNand};

/// How many exchange blocks one relocation may go through
pub const RELOCATION_ATTEMPTS: usize = 5;

/// Failures that another exchange block might not hit
fn retryable(error: &Error) -> bool {
    matches!(error, Error::Fail | Error::Timeout | Error::BadBlock(_))
}

impl<N: RawNand> TranslationLayer<N> {
    /// Write within one logical block
    pub(super) fn write_block(&mut self, logical: LogicalAddr, buf: &[u8]) -> Result<()> {
        let (physical, state) = self.load_zone(logical.zone)?.lookup(logical.block)?;
        let addr = logical.on_block(physical);

        if let BlockState::Used { .. } = state {
            return self.relocate(addr, logical.block, buf);
        }

        self.write_data(addr, buf)?;
        mark_used(&mut self.nand, addr.zone, physical)?;
        mark_logical(&mut self.nand, addr.zone, physical, logical.block)?;

        // Any further write to this block has to relocate it
        self.load_zone(logical.zone)?.set_used(logical.block);
        Ok(())
    }

    /// Program main-area bytes from `addr` onward, continuing onto following pages of the block
    fn write_data(&mut self, mut addr: PhysAddr, mut buf: &[u8]) -> Result<()> {
        for len in page_chunks(&self.geometry, addr.page_in_offset, buf.len()) {
            let (chunk, rest) = buf.split_at(len);
            self.nand.write_page(addr, chunk)?;

            buf = rest;
            addr.page += 1;
            addr.page_in_offset = 0;
        }

        Ok(())
    }

    /// Move the block at `old` into an exchange block, replacing the bytes at `old`'s page and
    /// offset with `buf` on the way.
    ///
    /// Each attempt that fails on the exchange block marks it bad and tries the next one. If
    /// every attempt fails, the logical block keeps its old contents and
    /// [Error::RelocationExhausted] is returned. The same goes for [Error::StuckBlock], when the old
    /// block can be neither erased nor marked bad.
    fn relocate(&mut self, old: PhysAddr, lbn: u16, buf: &[u8]) -> Result<()> {
        let parity = Parity::exchange_for(old.block);
        debug!(
            "Relocating logical block {lbn} out of block {} of zone {}",
            old.block, old.zone
        );

        retry(NoDelay.take(RELOCATION_ATTEMPTS - 1), || {
            match self.relocate_once(old, lbn, parity, buf) {
                Ok(()) => OperationResult::Ok(()),
                Err(e) if retryable(&e) => {
                    warn!("Relocation of logical block {lbn} failed: {e}");
                    OperationResult::Retry(e)
                }
                Err(e) => OperationResult::Err(e),
            }
        })
        .map_err(|e| match retryable(&e.error) {
            true => Error::RelocationExhausted { attempts: e.tries },
            false => e.error,
        })
    }

    fn relocate_once(&mut self, old: PhysAddr, lbn: u16, parity: Parity, buf: &[u8]) -> Result<()> {
        let zone = old.zone;
        let new = self
            .load_zone(zone)?
            .find_free_block(parity)
            .ok_or(Error::NoExchangeBlock)?;

        if let Err(e) = self.copy_block(old, new, buf) {
            return self.retire(zone, new, e);
        }

        let tagged = mark_used(&mut self.nand, zone, new)
            .and_then(|()| mark_logical(&mut self.nand, zone, new, lbn));
        if let Err(e) = tagged {
            return self.retire(zone, new, e);
        }

        let old_block = old.device_block(&self.geometry);
        if let Err(e) = self.nand.erase_block(old_block) {
            // The data already lives in the new block; only the old one is lost
            warn!("Erasing block {} of zone {zone} failed: {e}", old.block);
            mark_bad(&mut self.nand, zone, old.block);
        }

        self.rebuild(zone)?;

        // The old block wins a double claim if it kept its tag
        if self.load_zone(zone)?.lookup(lbn)?.0 != new {
            warn!(
                "Block {} of zone {zone} still holds logical block {lbn}; dropping block {new}",
                old.block
            );
            self.discard(zone, new)?;
            return Err(Error::StuckBlock(old.block));
        }

        Ok(())
    }

    /// Return a tagged exchange block to the free pool, or retire it if it won't erase
    fn discard(&mut self, zone: u16, block: u16) -> Result<()> {
        let device_block = PhysAddr::page(zone, block, 0).device_block(&self.geometry);
        if let Err(e) = self.nand.erase_block(device_block) {
            warn!("Erasing block {block} of zone {zone} failed: {e}");
            mark_bad(&mut self.nand, zone, block);
        }

        self.rebuild(zone)
    }

    /// Copy every page of the block at `old` into block `new`, patching `buf` in from `old`'s
    /// page and offset onward
    fn copy_block(&mut self, old: PhysAddr, new: u16, buf: &[u8]) -> Result<()> {
        let geometry = self.geometry;
        let mut patch = buf;
        let mut offset = old.page_in_offset;

        for page in 0..geometry.pages_per_block {
            let src = PhysAddr::page(old.zone, old.block, page).row(&geometry);
            let dst = PhysAddr::page(old.zone, new, page).row(&geometry);

            if page < old.page || patch.is_empty() {
                self.nand.copyback(src, dst)?;
                continue;
            }

            let len = patch.len().min(geometry.page_size - usize::from(offset));
            let (head, rest) = patch.split_at(len);
            self.nand.copyback_with_patch(src, dst, head, offset)?;

            patch = rest;
            offset = 0;
        }

        Ok(())
    }

    /// Give up on an exchange block: mark it bad so the next directory build skips it
    fn retire(&mut self, zone: u16, block: u16, error: Error) -> Result<()> {
        mark_bad(&mut self.nand, zone, block);
        self.rebuild(zone)?;
        Err(error)
    }
}
