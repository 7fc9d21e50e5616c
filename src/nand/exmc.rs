//! NAND abstraction layer implementation over the EXMC memory-mapped NAND banks.
//!
//! The EXMC exposes a NAND chip as three byte-wide windows in the bank's address space: writes
//! with A16 high latch a command (CLE), writes with A17 high latch an address cycle (ALE), and
//! plain accesses move data. [CommandNand] speaks the ONFI-style command sequences over any
//! [NandBus], so the sequencing can be exercised off-target.

use std::ptr;

use super::{NandGeometry, NandId, PhysAddr, RawNand, Status, STATUS_POLL_LIMIT};
use crate::error::{Error, Result};

pub const CMD_READ_1ST: u8 = 0x00;
pub const CMD_READ_2ND: u8 = 0x30;
pub const CMD_WRITE_1ST: u8 = 0x80;
pub const CMD_WRITE_2ND: u8 = 0x10;
pub const CMD_ERASE_1ST: u8 = 0x60;
pub const CMD_ERASE_2ND: u8 = 0xD0;
pub const CMD_READ_ID: u8 = 0x90;
pub const CMD_STATUS: u8 = 0x70;
pub const CMD_COPYBACK_A: u8 = 0x00;
pub const CMD_COPYBACK_B: u8 = 0x35;
pub const CMD_COPYBACK_C: u8 = 0x85;
pub const CMD_COPYBACK_D: u8 = 0x10;

const STATUS_FAIL: u8 = 0x01;
const STATUS_READY: u8 = 0x40;

/// A16 selects the command latch
const CMD_AREA: usize = 1 << 16;
/// A17 selects the address latch
const ADDR_AREA: usize = 1 << 17;

/// The EXMC NAND banks
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Bank {
    Bank1,
    Bank2,
}

impl Bank {
    pub fn base(self) -> usize {
        match self {
            Bank::Bank1 => 0x7000_0000,
            Bank::Bank2 => 0x8000_0000,
        }
    }
}

/// Byte-level access to a NAND chip's command, address and data latches
pub trait NandBus {
    fn command(&mut self, cmd: u8);
    fn address(&mut self, addr: u8);
    fn write_data(&mut self, data: u8);
    fn read_data(&mut self) -> u8;

    /// Read four data bytes as one little-endian word
    fn read_data_word(&mut self) -> u32 {
        u32::from_le_bytes(std::array::from_fn(|_| self.read_data()))
    }

    /// Block until the chip's R/B line reports ready (NWAIT on the EXMC), or fail with
    /// [Error::Timeout]
    fn wait_ready_line(&mut self) -> Result<()>;
}

/// Sample `ready` up to [STATUS_POLL_LIMIT] times
fn poll_ready(mut ready: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..STATUS_POLL_LIMIT {
        if ready() {
            return Ok(());
        }
    }

    Err(Error::Timeout)
}

/// A [NandBus] over an EXMC bank, with the R/B line sampled by `nwait`
pub struct ExmcBus<F: FnMut() -> bool> {
    base: usize,
    nwait: F,
}

impl<F: FnMut() -> bool> ExmcBus<F> {
    /// # Safety
    ///
    /// The EXMC must be clocked, configured for NAND on `bank`, and the bank enabled; nothing
    /// else may access the bank's address window while this exists.
    pub unsafe fn new(bank: Bank, nwait: F) -> Self {
        Self {
            base: bank.base(),
            nwait,
        }
    }
}

impl<F: FnMut() -> bool> NandBus for ExmcBus<F> {
    fn command(&mut self, cmd: u8) {
        // NOTE(unsafe) the bank window is owned by this bus, per `new`
        unsafe { ptr::write_volatile((self.base | CMD_AREA) as *mut u8, cmd) }
    }

    fn address(&mut self, addr: u8) {
        unsafe { ptr::write_volatile((self.base | ADDR_AREA) as *mut u8, addr) }
    }

    fn write_data(&mut self, data: u8) {
        unsafe { ptr::write_volatile(self.base as *mut u8, data) }
    }

    fn read_data(&mut self) -> u8 {
        unsafe { ptr::read_volatile(self.base as *const u8) }
    }

    fn read_data_word(&mut self) -> u32 {
        unsafe { ptr::read_volatile(self.base as *const u32) }
    }

    fn wait_ready_line(&mut self) -> Result<()> {
        poll_ready(&mut self.nwait)
    }
}

/// A NAND chip driven by command sequences over a [NandBus]
pub struct CommandNand<B: NandBus> {
    bus: B,
    geometry: NandGeometry,
}

impl<B: NandBus> CommandNand<B> {
    pub fn new(bus: B, geometry: NandGeometry) -> Self {
        Self { bus, geometry }
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Two column cycles followed by two row cycles
    fn send_address(&mut self, column: u16, row: u32) {
        let [col0, col1] = column.to_le_bytes();
        let [row0, row1, ..] = row.to_le_bytes();
        for cycle in [col0, col1, row0, row1] {
            self.bus.address(cycle);
        }
    }

    /// The first half of a copy-back: load `src` into the page register and start the program
    /// to `dst`
    fn start_copyback(&mut self, src: u32, dst: u32) -> Result<()> {
        self.bus.command(CMD_COPYBACK_A);
        self.send_address(0, src);
        self.bus.command(CMD_COPYBACK_B);
        // Must wait, or the page register holds stale data
        self.bus.wait_ready_line()?;

        self.bus.command(CMD_COPYBACK_C);
        self.send_address(0, dst);
        Ok(())
    }
}

impl<B: NandBus> RawNand for CommandNand<B> {
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn read_id(&mut self) -> Result<NandId> {
        self.bus.command(CMD_READ_ID);
        self.bus.address(0x00);
        Ok(self.bus.read_data_word().into())
    }

    fn read_page(&mut self, addr: PhysAddr, buf: &mut [u8]) -> Result<()> {
        addr.check_access(&self.geometry, buf.len())?;

        self.bus.command(CMD_READ_1ST);
        self.send_address(addr.page_in_offset, addr.row(&self.geometry));
        self.bus.command(CMD_READ_2ND);
        self.bus.wait_ready_line()?;

        buf.iter_mut().for_each(|x| *x = self.bus.read_data());
        Ok(())
    }

    fn write_page(&mut self, addr: PhysAddr, buf: &[u8]) -> Result<()> {
        addr.check_access(&self.geometry, buf.len())?;

        self.bus.command(CMD_WRITE_1ST);
        self.send_address(addr.page_in_offset, addr.row(&self.geometry));
        buf.iter().for_each(|&x| self.bus.write_data(x));
        self.bus.command(CMD_WRITE_2ND);

        self.wait_ready()
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        if block >= self.geometry.total_blocks() {
            return Err(Error::OutOfRange {
                addr: u64::from(block) * self.geometry.block_bytes(),
            });
        }

        let row = block * u32::from(self.geometry.pages_per_block);
        let [row0, row1, ..] = row.to_le_bytes();

        self.bus.command(CMD_ERASE_1ST);
        self.bus.address(row0);
        self.bus.address(row1);
        self.bus.command(CMD_ERASE_2ND);

        self.wait_ready()
    }

    fn copyback(&mut self, src: u32, dst: u32) -> Result<()> {
        self.start_copyback(src, dst)?;
        self.bus.command(CMD_COPYBACK_D);

        self.wait_ready()
    }

    fn copyback_with_patch(
        &mut self,
        src: u32,
        dst: u32,
        patch: &[u8],
        offset: u16,
    ) -> Result<()> {
        if usize::from(offset) + patch.len() > self.geometry.page_total_size() {
            return Err(Error::OutOfRange {
                addr: u64::from(dst) * self.geometry.page_total_size() as u64 + u64::from(offset),
            });
        }

        self.start_copyback(src, dst)?;

        // Random data input: move the column pointer and stream the replacement bytes
        self.bus.command(CMD_COPYBACK_C);
        for cycle in offset.to_le_bytes() {
            self.bus.address(cycle);
        }
        patch.iter().for_each(|&x| self.bus.write_data(x));

        self.bus.command(CMD_COPYBACK_D);

        self.wait_ready()
    }

    fn read_status(&mut self) -> Status {
        self.bus.command(CMD_STATUS);
        let data = self.bus.read_data();

        if data & STATUS_FAIL != 0 {
            Status::Error
        } else if data & STATUS_READY != 0 {
            Status::Ready
        } else {
            Status::Busy
        }
    }
}
