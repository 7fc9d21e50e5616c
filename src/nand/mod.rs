//! Abstractions and code to access raw NAND flash

use std::str::FromStr;

use crate::error::{Error, Result};

pub mod exmc;
pub mod sim;

/// Upper bound on status register reads before an operation is considered timed out
pub const STATUS_POLL_LIMIT: u32 = 0x10000;

/// Number of directory slots past the logical range reserved for wear-leveling exchange blocks
pub const EXCHANGE_BLOCKS: u16 = 2;

/// Physical block numbers are stored in 10 bits
pub const MAX_BLOCKS_PER_ZONE: u16 = 1 << 10;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// Is every byte equal to `value`?
    fn is_filled(&self, value: u8) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.is_filled(0xFF)
    }

    fn is_filled(&self, value: u8) -> bool {
        self.iter().all(|&x| x == value)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device, and how the
/// translation layer divides it into zones
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandGeometry {
    /// Bytes in the main area of a page
    pub page_size: usize,
    /// Bytes in the spare (out-of-band) area that follows each page
    pub spare_size: usize,
    pub pages_per_block: u16,
    pub blocks_per_zone: u16,
    pub zone_count: u16,
    /// Logical blocks exposed per zone; the remaining blocks are exchange and bad-block reserve
    pub max_logical_blocks_per_zone: u16,
}

/// GD9FU1G8F2AMG: 2 KiB pages with 128 spare bytes, 64 pages per block, 1024 blocks.
impl Default for NandGeometry {
    fn default() -> Self {
        Self {
            page_size: 2048,
            spare_size: 128,
            pages_per_block: 64,
            blocks_per_zone: 1024,
            zone_count: 1,
            max_logical_blocks_per_zone: 1000,
        }
    }
}

impl NandGeometry {
    /// Bytes per page including the spare area
    pub fn page_total_size(&self) -> usize {
        self.page_size + self.spare_size
    }

    /// Main-area bytes per block
    pub fn block_bytes(&self) -> u64 {
        self.page_size as u64 * u64::from(self.pages_per_block)
    }

    /// Main-area bytes per zone
    pub fn zone_bytes(&self) -> u64 {
        self.block_bytes() * u64::from(self.blocks_per_zone)
    }

    pub fn total_blocks(&self) -> u32 {
        u32::from(self.blocks_per_zone) * u32::from(self.zone_count)
    }

    pub fn total_pages(&self) -> u32 {
        self.total_blocks() * u32::from(self.pages_per_block)
    }

    /// Check the geometry is something the translation layer can manage
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Geometry(msg.to_string()));

        if self.page_size == 0 || self.pages_per_block == 0 || self.zone_count == 0 {
            return fail("sizes must be nonzero");
        }
        if self.spare_size < crate::ftl::spare::TAG_SIZE {
            return fail("spare area too small for the block tag");
        }
        if self.page_total_size() > usize::from(u16::MAX) {
            return fail("page too large for 16-bit column addressing");
        }
        if self.blocks_per_zone > MAX_BLOCKS_PER_ZONE {
            return fail("more than 1024 blocks per zone");
        }
        if u32::from(self.max_logical_blocks_per_zone) + u32::from(EXCHANGE_BLOCKS)
            >= u32::from(self.blocks_per_zone)
        {
            return fail("no room for exchange blocks");
        }
        if self.total_pages() > u32::from(u16::MAX) + 1 {
            return fail("row address exceeds two address cycles");
        }

        Ok(())
    }
}

/// Parse strings like "PAGE+SPARExPAGESxBLOCKSxZONESxLOGICAL", e.g. "2048+128x64x1024x1x1000"
impl FromStr for NandGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [page, pages_per_block, blocks_per_zone, zone_count, max_logical]: [&str; 5] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #+#x#x#x#x#"))?;
        let (page_size, spare_size) = page
            .split_once('+')
            .ok_or(anyhow::anyhow!("expected page size as PAGE+SPARE"))?;

        let geometry = NandGeometry {
            page_size: page_size.parse()?,
            spare_size: spare_size.parse()?,
            pages_per_block: pages_per_block.parse()?,
            blocks_per_zone: blocks_per_zone.parse()?,
            zone_count: zone_count.parse()?,
            max_logical_blocks_per_zone: max_logical.parse()?,
        };
        geometry.validate()?;

        Ok(geometry)
    }
}

/// A byte position in raw NAND space. `page_in_offset` at or beyond the page size addresses
/// the spare area.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PhysAddr {
    pub zone: u16,
    pub block: u16,
    pub page: u16,
    pub page_in_offset: u16,
}

impl PhysAddr {
    /// The first byte of `page` in `block`
    pub fn page(zone: u16, block: u16, page: u16) -> Self {
        Self {
            zone,
            block,
            page,
            page_in_offset: 0,
        }
    }

    /// Byte `offset` of the spare area of `page` in `block`
    pub fn spare(geometry: &NandGeometry, zone: u16, block: u16, page: u16, offset: usize) -> Self {
        Self {
            zone,
            block,
            page,
            page_in_offset: (geometry.page_size + offset) as u16,
        }
    }

    /// Device-wide block number
    pub fn device_block(&self, geometry: &NandGeometry) -> u32 {
        u32::from(self.block) + u32::from(self.zone) * u32::from(geometry.blocks_per_zone)
    }

    /// The row (page) address sent to the chip
    pub fn row(&self, geometry: &NandGeometry) -> u32 {
        u32::from(self.page) + self.device_block(geometry) * u32::from(geometry.pages_per_block)
    }

    /// Ensure an access of `len` bytes at this address stays inside one page (plus spare)
    pub fn check_access(&self, geometry: &NandGeometry, len: usize) -> Result<()> {
        let in_bounds = self.zone < geometry.zone_count
            && self.block < geometry.blocks_per_zone
            && self.page < geometry.pages_per_block
            && usize::from(self.page_in_offset) + len <= geometry.page_total_size();

        match in_bounds {
            true => Ok(()),
            false => Err(Error::OutOfRange {
                addr: u64::from(self.row(geometry)) * geometry.page_total_size() as u64
                    + u64::from(self.page_in_offset),
            }),
        }
    }
}

/// Decoded contents of the NAND status register
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Ready,
    Busy,
    Error,
}

/// The four bytes returned by the READ ID command
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct NandId {
    pub maker_id: u8,
    pub device_id: u8,
    pub third_id: u8,
    pub fourth_id: u8,
}

impl From<u32> for NandId {
    /// The ID bytes as read in one little-endian word from the data area
    fn from(word: u32) -> Self {
        let [maker_id, device_id, third_id, fourth_id] = word.to_le_bytes();
        Self {
            maker_id,
            device_id,
            third_id,
            fourth_id,
        }
    }
}

/// Represents a raw NAND flash device: the primitives consumed by the translation layer
pub trait RawNand {
    /// Get the geometry of the NAND
    fn geometry(&self) -> NandGeometry;

    fn read_id(&mut self) -> Result<NandId>;

    /// Read `buf.len()` bytes starting at `addr`, within one page and its spare area
    fn read_page(&mut self, addr: PhysAddr, buf: &mut [u8]) -> Result<()>;

    /// Program `buf` starting at `addr`, within one page and its spare area
    fn write_page(&mut self, addr: PhysAddr, buf: &[u8]) -> Result<()>;

    /// Erase a block, addressed by its device-wide block number
    fn erase_block(&mut self, block: u32) -> Result<()>;

    /// Copy a whole page (with spare) on-chip from row `src` to row `dst`
    fn copyback(&mut self, src: u32, dst: u32) -> Result<()>;

    /// Like [RawNand::copyback], but `patch` replaces the bytes at `offset` of the destination
    /// before it is programmed
    fn copyback_with_patch(&mut self, src: u32, dst: u32, patch: &[u8], offset: u16)
        -> Result<()>;

    /// Sample the status register once
    fn read_status(&mut self) -> Status;

    /// Poll the status register until the device is no longer busy.
    ///
    /// Gives up with [Error::Timeout] after [STATUS_POLL_LIMIT] polls.
    fn get_status(&mut self) -> Result<Status> {
        for _ in 0..STATUS_POLL_LIMIT {
            match self.read_status() {
                Status::Busy => continue,
                status => return Ok(status),
            }
        }

        Err(Error::Timeout)
    }

    /// Wait for the current operation, turning an error status into [Error::Fail]
    fn wait_ready(&mut self) -> Result<()> {
        match self.get_status()? {
            Status::Ready => Ok(()),
            _ => Err(Error::Fail),
        }
    }
}

#[cfg(test)]
pub(crate) const TEST_GEOMETRY: NandGeometry = NandGeometry {
    page_size: 64,
    spare_size: 16,
    pages_per_block: 8,
    blocks_per_zone: 64,
    zone_count: 2,
    max_logical_blocks_per_zone: 56,
};

#[test]
fn test_geometry_parse() {
    let geometry: NandGeometry = "2048+128x64x1024x1x1000".parse().unwrap();
    assert_eq!(geometry, NandGeometry::default());

    assert!("2048x64x1024x1x1000".parse::<NandGeometry>().is_err());
    assert!("2048+128x64x1024x1".parse::<NandGeometry>().is_err());
    // Logical range leaves no exchange blocks
    assert!("2048+128x64x1024x1x1023".parse::<NandGeometry>().is_err());
}

#[test]
fn test_geometry_validate() {
    assert!(NandGeometry::default().validate().is_ok());
    assert!(TEST_GEOMETRY.validate().is_ok());

    let tiny_spare = NandGeometry {
        spare_size: 2,
        ..TEST_GEOMETRY
    };
    assert!(tiny_spare.validate().is_err());

    let too_many_blocks = NandGeometry {
        blocks_per_zone: 2048,
        ..NandGeometry::default()
    };
    assert!(too_many_blocks.validate().is_err());
}

#[test]
fn test_row_address() {
    let geometry = TEST_GEOMETRY;
    assert_eq!(PhysAddr::page(0, 0, 0).row(&geometry), 0);
    assert_eq!(PhysAddr::page(0, 3, 5).row(&geometry), 3 * 8 + 5);
    assert_eq!(PhysAddr::page(1, 3, 5).row(&geometry), (64 + 3) * 8 + 5);
}

#[test]
fn test_check_access() {
    let geometry = TEST_GEOMETRY;
    assert!(PhysAddr::page(0, 0, 0).check_access(&geometry, 80).is_ok());
    assert!(PhysAddr::page(0, 0, 0).check_access(&geometry, 81).is_err());
    assert!(PhysAddr::spare(&geometry, 1, 63, 7, 12)
        .check_access(&geometry, 4)
        .is_ok());
    assert!(PhysAddr::page(2, 0, 0).check_access(&geometry, 1).is_err());
    assert!(PhysAddr::page(0, 0, 8).check_access(&geometry, 1).is_err());
}

#[test]
fn test_nand_id_from_word() {
    let id = NandId::from(0x1D80_F1ADu32);
    assert_eq!(id.maker_id, 0xAD);
    assert_eq!(id.device_id, 0xF1);
    assert_eq!(id.third_id, 0x80);
    assert_eq!(id.fourth_id, 0x1D);
}
