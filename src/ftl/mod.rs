//! This module implements the translation layer: a flat logical byte space on top of raw NAND,
//! with a block directory per zone, wear-leveling by block exchange, and bad-block exclusion.
//!
//! Writes to a logical block that has never been written go straight to its physical block.
//! Writes to a block that already holds data can't be done in place, so the block is relocated:
//! every page is copied on-chip into an exchange block, with the new bytes patched in as the
//! affected pages go past, then the new block is tagged and the old one erased and returned to
//! the free pool.

pub mod address;
pub mod directory;
mod relocate;
mod selftest;
pub mod shared;
pub mod spare;

use log::debug;

pub use address::LogicalAddr;
pub use directory::{BlockState, Directory, DirectoryEntry, Parity};
pub use relocate::RELOCATION_ATTEMPTS;
pub use selftest::{BlockContent, TEST_CYCLES};
pub use shared::SharedTranslationLayer;

use crate::error::{Error, Result};
use crate::nand::{NandGeometry, NandId, PhysAddr, RawNand};

/// A translation layer over a raw NAND device, caching the directory of one zone at a time
pub struct TranslationLayer<N: RawNand> {
    nand: N,
    geometry: NandGeometry,

    /// None until the first build succeeds, or after a build failed
    directory: Option<Directory>,
}

impl<N: RawNand> TranslationLayer<N> {
    /// Take over a NAND device and build the directory of zone 0
    pub fn init(nand: N) -> Result<Self> {
        let geometry = nand.geometry();
        geometry.validate()?;

        let mut ftl = Self {
            nand,
            geometry,
            directory: None,
        };
        ftl.rebuild(0)?;

        Ok(ftl)
    }

    pub fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    /// Give the NAND device back
    pub fn into_inner(self) -> N {
        self.nand
    }

    pub fn directory(&self) -> Option<&Directory> {
        self.directory.as_ref()
    }

    /// The zone whose directory is loaded
    pub fn zone(&self) -> u16 {
        self.directory.as_ref().map_or(0, Directory::zone)
    }

    pub fn read_id(&mut self) -> Result<NandId> {
        self.nand.read_id()
    }

    /// Rescan `zone` from flash, replacing the loaded directory
    pub fn rebuild(&mut self, zone: u16) -> Result<()> {
        self.directory = None;
        self.directory = Some(Directory::build(&mut self.nand, zone)?);
        Ok(())
    }

    /// Make sure the directory of `zone` is the one loaded
    fn load_zone(&mut self, zone: u16) -> Result<&mut Directory> {
        match &self.directory {
            Some(directory) if directory.zone() == zone => (),
            _ => {
                debug!("Switching to zone {zone}");
                self.rebuild(zone)?;
            }
        }

        self.directory.as_mut().ok_or(Error::Fail)
    }

    /// Write `buf` at logical byte address `addr`
    pub fn write(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        check_len(buf.len())?;

        let mut addr = u64::from(addr);
        let mut buf = buf;
        while !buf.is_empty() {
            let logical = LogicalAddr::decompose(&self.geometry, addr)?;
            let len = block_chunk(&self.geometry, &logical, buf.len());

            let (chunk, rest) = buf.split_at(len);
            self.write_block(logical, chunk)?;

            buf = rest;
            addr += len as u64;
        }

        Ok(())
    }

    /// Read `buf.len()` bytes from logical byte address `addr`
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;

        let mut addr = u64::from(addr);
        let mut buf = buf;
        while !buf.is_empty() {
            let logical = LogicalAddr::decompose(&self.geometry, addr)?;
            let len = block_chunk(&self.geometry, &logical, buf.len());

            let (chunk, rest) = std::mem::take(&mut buf).split_at_mut(len);
            self.read_block(logical, chunk)?;

            buf = rest;
            addr += len as u64;
        }

        Ok(())
    }

    /// Read within one logical block
    fn read_block(&mut self, logical: LogicalAddr, buf: &mut [u8]) -> Result<()> {
        let (physical, _) = self.load_zone(logical.zone)?.lookup(logical.block)?;
        self.read_data(logical.on_block(physical), buf)
    }

    /// Read main-area bytes from `addr` onward, continuing onto following pages of the block
    fn read_data(&mut self, mut addr: PhysAddr, mut buf: &mut [u8]) -> Result<()> {
        for len in page_chunks(&self.geometry, addr.page_in_offset, buf.len()) {
            let (chunk, rest) = std::mem::take(&mut buf).split_at_mut(len);
            self.nand.read_page(addr, chunk)?;

            buf = rest;
            addr.page += 1;
            addr.page_in_offset = 0;
        }

        Ok(())
    }
}

/// Transfers carry 16-bit lengths on the device interface
fn check_len(len: usize) -> Result<()> {
    match len > usize::from(u16::MAX) {
        true => Err(Error::TooLong(len)),
        false => Ok(()),
    }
}

/// How much of a `len`-byte transfer fits in the block containing `logical`
fn block_chunk(geometry: &NandGeometry, logical: &LogicalAddr, len: usize) -> usize {
    let remaining = logical.block_remaining(geometry);
    usize::try_from(remaining).map_or(len, |x| x.min(len))
}

/// Split a transfer of `len` bytes starting at `offset` within a page into page-sized pieces
fn page_chunks(geometry: &NandGeometry, offset: u16, len: usize) -> impl Iterator<Item = usize> {
    let page_size = geometry.page_size;
    let mut offset = usize::from(offset);
    let mut len = len;

    std::iter::from_fn(move || {
        if len == 0 {
            return None;
        }
        let chunk = len.min(page_size - offset);
        offset = 0;
        len -= chunk;
        Some(chunk)
    })
}
