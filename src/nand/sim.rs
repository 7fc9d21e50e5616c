//! A simulated in-memory NAND flash, for testing purposes

use std::io::{Read, Write};

use super::{NandGeometry, NandId, PageUtil, PhysAddr, RawNand, Status};
use crate::error::{Error, Result};

/// Hynix-compatible ID reported by default: HY27UF081G2A
pub const DEFAULT_ID: NandId = NandId {
    maker_id: 0xAD,
    device_id: 0xF1,
    third_id: 0x80,
    fourth_id: 0x1D,
};

/// A simulated in-memory NAND flash with spare areas.
///
/// Programming follows real NAND semantics: bits may only be cleared, and erasing a block sets
/// every byte (including the spare areas) back to 0xFF.
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    geometry: NandGeometry,
    id: NandId,

    /// What the status register reports after the last operation
    status: Status,

    /// Report busy forever, so every operation times out
    stuck_busy: bool,
}

/// A block of SimNand
#[derive(Debug, Clone, Default)]
struct SimBlock {
    /// Every byte of the block (with spare areas), or empty while the block is erased
    data: Vec<u8>,

    fail_program: bool,
    fail_erase: bool,
    fail_copyback: bool,

    /// Pages of this block whose programming fails
    failing_pages: Vec<u16>,

    erase_count: u32,
}

impl SimNand {
    /// Create an erased SimNand with the specified geometry
    pub fn new(geometry: NandGeometry) -> Self {
        let blocks = vec![SimBlock::default(); geometry.total_blocks() as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            geometry,
            id: DEFAULT_ID,
            status: Status::Ready,
            stuck_busy: false,
        }
    }

    /// Change the ID bytes reported by READ ID
    pub fn with_id(mut self, id: NandId) -> Self {
        self.id = id;
        self
    }

    /// Initialize the NAND contents with a raw image (pages with spare, in row order)
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let size = self.block_size();

        for block in self.blocks.iter_mut() {
            let mut buf = vec![0; size];
            read.read_exact(&mut buf)?;
            block.data = match buf.is_erased() {
                true => Vec::new(),
                false => buf,
            };
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let erased = vec![0xFF; self.block_size()];

        for block in self.blocks.iter() {
            match block.data.is_empty() {
                true => write.write_all(&erased)?,
                false => write.write_all(&block.data)?,
            }
        }

        Ok(())
    }

    /// Mark a block bad the way a factory does, by clearing its first spare byte
    pub fn set_factory_bad(&mut self, block: u32) {
        let size = self.block_size();
        let page_size = self.geometry.page_size;
        self.block_mut(block).materialize(size)[page_size] = 0x00;
    }

    /// Make every program operation touching `block` fail
    pub fn fail_program(&mut self, block: u32, fail: bool) {
        self.block_mut(block).fail_program = fail;
    }

    /// Make programming only page `page` of `block` fail
    pub fn fail_program_page(&mut self, block: u32, page: u16, fail: bool) {
        let failing = &mut self.block_mut(block).failing_pages;
        failing.retain(|&x| x != page);
        if fail {
            failing.push(page);
        }
    }

    /// Make erasing `block` fail
    pub fn fail_erase(&mut self, block: u32, fail: bool) {
        self.block_mut(block).fail_erase = fail;
    }

    /// Make copy-back with `block` as the destination fail
    pub fn fail_copyback(&mut self, block: u32, fail: bool) {
        self.block_mut(block).fail_copyback = fail;
    }

    /// Make the status register report busy indefinitely
    pub fn stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// How many times `block` has been erased
    pub fn erase_count(&self, block: u32) -> u32 {
        self.blocks[block as usize].erase_count
    }

    /// Is `block` completely erased?
    pub fn is_block_erased(&self, block: u32) -> bool {
        self.blocks[block as usize].data.is_erased()
    }

    fn block_size(&self) -> usize {
        self.geometry.page_total_size() * usize::from(self.geometry.pages_per_block)
    }

    fn block_mut(&mut self, block: u32) -> &mut SimBlock {
        &mut self.blocks[block as usize]
    }

    /// Split a row address into device block and in-block byte offset
    fn locate(&self, row: u32) -> Result<(u32, usize)> {
        if row >= self.geometry.total_pages() {
            return Err(Error::OutOfRange {
                addr: u64::from(row) * self.geometry.page_total_size() as u64,
            });
        }

        let pages_per_block = u32::from(self.geometry.pages_per_block);
        let page = (row % pages_per_block) as usize;
        Ok((row / pages_per_block, page * self.geometry.page_total_size()))
    }

    fn read_row(&self, row: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let (block, base) = self.locate(row)?;
        let begin = base + offset;

        match self.blocks[block as usize].data.get(begin..begin + buf.len()) {
            Some(bytes) => buf.copy_from_slice(bytes),
            None => buf.fill(0xFF),
        }

        Ok(())
    }

    /// Program bytes into a page, clearing bits only; sets the status register
    fn program_row(&mut self, row: u32, offset: usize, content: &[u8], copyback: bool) {
        let size = self.block_size();
        let (block, base) = match self.locate(row) {
            Ok(x) => x,
            Err(_) => {
                self.status = Status::Error;
                return;
            }
        };

        let page = (row % u32::from(self.geometry.pages_per_block)) as u16;
        let sim_block = self.block_mut(block);
        if sim_block.fail_program
            || sim_block.failing_pages.contains(&page)
            || (copyback && sim_block.fail_copyback)
        {
            self.status = Status::Error;
            return;
        }

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            let data = sim_block.materialize(size);
            let begin = base + offset;
            for (cell, &byte) in data[begin..begin + content.len()].iter_mut().zip(content) {
                *cell &= byte;
            }
        }

        self.status = Status::Ready;
    }
}

impl SimBlock {
    /// Get the backing bytes, allocating an erased image on first program
    fn materialize(&mut self, size: usize) -> &mut [u8] {
        if self.data.is_empty() {
            self.data.resize(size, 0xFF);
        }
        &mut self.data
    }
}

impl RawNand for SimNand {
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn read_id(&mut self) -> Result<NandId> {
        Ok(self.id)
    }

    fn read_page(&mut self, addr: PhysAddr, buf: &mut [u8]) -> Result<()> {
        addr.check_access(&self.geometry, buf.len())?;
        self.read_row(
            addr.row(&self.geometry),
            usize::from(addr.page_in_offset),
            buf,
        )?;
        self.status = Status::Ready;
        self.wait_ready()
    }

    fn write_page(&mut self, addr: PhysAddr, buf: &[u8]) -> Result<()> {
        addr.check_access(&self.geometry, buf.len())?;
        self.program_row(
            addr.row(&self.geometry),
            usize::from(addr.page_in_offset),
            buf,
            false,
        );
        self.wait_ready()
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        self.status = match self.blocks.get_mut(block as usize) {
            Some(sim_block) if !sim_block.fail_erase => {
                sim_block.data.clear();
                sim_block.erase_count += 1;
                Status::Ready
            }
            _ => Status::Error,
        };
        self.wait_ready()
    }

    fn copyback(&mut self, src: u32, dst: u32) -> Result<()> {
        self.copyback_with_patch(src, dst, &[], 0)
    }

    fn copyback_with_patch(
        &mut self,
        src: u32,
        dst: u32,
        patch: &[u8],
        offset: u16,
    ) -> Result<()> {
        let offset = usize::from(offset);
        let page_total = self.geometry.page_total_size();
        if offset + patch.len() > page_total {
            return Err(Error::OutOfRange {
                addr: u64::from(dst) * page_total as u64 + offset as u64,
            });
        }

        let mut page = vec![0xFF; page_total];
        self.read_row(src, 0, &mut page)?;
        page[offset..offset + patch.len()].copy_from_slice(patch);

        self.program_row(dst, 0, &page, true);
        self.wait_ready()
    }

    fn read_status(&mut self) -> Status {
        match self.stuck_busy {
            true => Status::Busy,
            false => self.status,
        }
    }
}

#[cfg(test)]
use super::TEST_GEOMETRY;

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);

    let data_in = vec![0xA5u8; TEST_GEOMETRY.page_size];
    let mut data_out = data_in.clone();

    nand.write_page(PhysAddr::page(0, 3, 2), &data_in)?;

    nand.read_page(PhysAddr::page(0, 3, 1), &mut data_out)?;
    assert!(data_out.is_erased());

    nand.read_page(PhysAddr::page(0, 3, 2), &mut data_out)?;
    assert_eq!(data_out, data_in);

    // Programming can only clear bits
    nand.write_page(PhysAddr::page(0, 3, 2), &[0x5A; 4])?;
    nand.read_page(PhysAddr::page(0, 3, 2), &mut data_out[..4])?;
    assert_eq!(data_out[..4], [0x00; 4]);

    Ok(())
}

#[test]
fn test_sim_spare_and_erase() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let spare = PhysAddr::spare(&TEST_GEOMETRY, 1, 5, 0, 1);

    nand.write_page(spare, &[0xFE])?;
    let mut flag = [0u8];
    nand.read_page(spare, &mut flag)?;
    assert_eq!(flag, [0xFE]);

    let device_block = spare.device_block(&TEST_GEOMETRY);
    assert!(!nand.is_block_erased(device_block));
    nand.erase_block(device_block)?;
    assert!(nand.is_block_erased(device_block));
    assert_eq!(nand.erase_count(device_block), 1);

    nand.read_page(spare, &mut flag)?;
    assert_eq!(flag, [0xFF]);

    Ok(())
}

#[test]
fn test_sim_bounds() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let mut buf = vec![0; TEST_GEOMETRY.page_total_size() + 1];
    assert!(nand.read_page(PhysAddr::page(0, 0, 0), &mut buf).is_err());
    assert!(nand.erase_block(TEST_GEOMETRY.total_blocks()).is_err());
}

#[test]
fn test_sim_copyback() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let geometry = TEST_GEOMETRY;

    let page: Vec<u8> = (0..geometry.page_total_size()).map(|i| i as u8).collect();
    nand.write_page(PhysAddr::page(0, 1, 4), &page)?;

    let src = PhysAddr::page(0, 1, 4).row(&geometry);
    let dst = PhysAddr::page(0, 2, 4).row(&geometry);
    nand.copyback(src, dst)?;

    let mut out = vec![0; geometry.page_total_size()];
    nand.read_page(PhysAddr::page(0, 2, 4), &mut out)?;
    assert_eq!(out, page);

    let dst = PhysAddr::page(0, 3, 4).row(&geometry);
    nand.copyback_with_patch(src, dst, &[0xEE; 3], 10)?;
    nand.read_page(PhysAddr::page(0, 3, 4), &mut out)?;
    assert_eq!(out[..10], page[..10]);
    assert_eq!(out[10..13], [0xEE; 3]);
    assert_eq!(out[13..], page[13..]);

    Ok(())
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_GEOMETRY);

    nand.fail_program(4, true);
    assert!(matches!(
        nand.write_page(PhysAddr::page(0, 4, 0), &[0]),
        Err(Error::Fail)
    ));
    nand.fail_program(4, false);
    assert!(nand.write_page(PhysAddr::page(0, 4, 0), &[0]).is_ok());

    nand.fail_program_page(4, 2, true);
    assert!(nand.write_page(PhysAddr::page(0, 4, 1), &[0]).is_ok());
    assert!(matches!(
        nand.write_page(PhysAddr::page(0, 4, 2), &[0]),
        Err(Error::Fail)
    ));
    nand.fail_program_page(4, 2, false);
    assert!(nand.write_page(PhysAddr::page(0, 4, 2), &[0]).is_ok());

    nand.fail_erase(4, true);
    assert!(matches!(nand.erase_block(4), Err(Error::Fail)));

    nand.fail_copyback(5, true);
    let dst = PhysAddr::page(0, 5, 0).row(&TEST_GEOMETRY);
    assert!(matches!(nand.copyback(0, dst), Err(Error::Fail)));

    nand.stuck_busy(true);
    assert!(matches!(nand.erase_block(6), Err(Error::Timeout)));
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    nand.write_page(PhysAddr::page(1, 10, 3), &[1, 2, 3, 4])?;
    nand.set_factory_bad(7);

    let mut image = Vec::new();
    nand.save(&mut image)?;
    assert_eq!(
        image.len(),
        TEST_GEOMETRY.total_pages() as usize * TEST_GEOMETRY.page_total_size()
    );

    let mut loaded = SimNand::new(TEST_GEOMETRY);
    loaded.load(&mut &image[..])?;

    let mut buf = [0u8; 4];
    loaded.read_page(PhysAddr::page(1, 10, 3), &mut buf)?;
    assert_eq!(buf, [1, 2, 3, 4]);
    loaded.read_page(PhysAddr::spare(&TEST_GEOMETRY, 0, 7, 0, 0), &mut buf[..1])?;
    assert_eq!(buf[0], 0x00);

    Ok(())
}
