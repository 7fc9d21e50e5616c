//! The block tag kept in the spare area of each block's first page.
//!
//! The tag is what makes the block directory reconstructible after power loss:
//!
//! ```text
//! +------+------+------+------+
//! |  BI  | USED | LBN0 | LBN1 |
//! +------+------+------+------+
//! ```
//!
//! `BI` is 0xFF on a good block, `USED` is 0xFE once the block holds data, and `LBN` is the
//! little-endian logical block number the block belongs to.

pub use deku::{DekuContainerRead, DekuContainerWrite};
use deku::prelude::*;
use log::warn;

use crate::error;
use crate::nand::{PhysAddr, RawNand};

pub const BI_OFFSET: usize = 0;
pub const USED_OFFSET: usize = 1;
pub const LBN0_OFFSET: usize = 2;
pub const LBN1_OFFSET: usize = 3;
pub const TAG_SIZE: usize = 4;

pub const GOOD_BLOCK_FLAG: u8 = 0xFF;
pub const BAD_BLOCK_FLAG: u8 = 0x00;
pub const USED_BLOCK_FLAG: u8 = 0xFE;

/// Logical block numbers occupy the low 10 bits of the LBN field
const LBN_MASK: u16 = 0x03FF;

#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SpareTag {
    pub bad_marker: u8,
    pub used_marker: u8,
    pub logical_block: u16,
}

impl Default for SpareTag {
    /// The tag of an erased block
    fn default() -> Self {
        Self {
            bad_marker: GOOD_BLOCK_FLAG,
            used_marker: 0xFF,
            logical_block: 0xFFFF,
        }
    }
}

impl SpareTag {
    /// Convert from a byte slice holding at least [TAG_SIZE] bytes
    pub fn decode(bytes: &[u8]) -> error::Result<Self> {
        let (_, tag) = Self::from_bytes((bytes, 0))?;
        Ok(tag)
    }

    pub fn is_bad(&self) -> bool {
        self.bad_marker != GOOD_BLOCK_FLAG
    }

    pub fn is_used(&self) -> bool {
        self.used_marker == USED_BLOCK_FLAG
    }

    pub fn lbn(&self) -> u16 {
        self.logical_block & LBN_MASK
    }
}

/// Read the tag of `block` in `zone`. A bad marker on page 1 counts too, since [mark_bad] falls
/// back to it.
pub fn read_tag<N: RawNand>(nand: &mut N, zone: u16, block: u16) -> error::Result<SpareTag> {
    let geometry = nand.geometry();
    let mut bytes = [0u8; TAG_SIZE];
    nand.read_page(PhysAddr::spare(&geometry, zone, block, 0, 0), &mut bytes)?;
    let mut tag = SpareTag::decode(&bytes)?;

    if !tag.is_bad() && geometry.pages_per_block > 1 {
        let mut marker = [GOOD_BLOCK_FLAG];
        let addr = PhysAddr::spare(&geometry, zone, block, 1, BI_OFFSET);
        nand.read_page(addr, &mut marker)?;
        tag.bad_marker = marker[0];
    }

    Ok(tag)
}

/// Program part of the tag of `block`, on page `page`
fn write_tag_bytes<N: RawNand>(
    nand: &mut N,
    zone: u16,
    block: u16,
    page: u16,
    offset: usize,
    bytes: &[u8],
) -> error::Result<()> {
    let geometry = nand.geometry();
    nand.write_page(PhysAddr::spare(&geometry, zone, block, page, offset), bytes)
}

pub fn is_bad<N: RawNand>(nand: &mut N, zone: u16, block: u16) -> error::Result<bool> {
    Ok(read_tag(nand, zone, block)?.is_bad())
}

/// A block is free when it is good and has never been marked used
pub fn is_free<N: RawNand>(nand: &mut N, zone: u16, block: u16) -> error::Result<bool> {
    let tag = read_tag(nand, zone, block)?;
    Ok(!tag.is_bad() && tag.used_marker == 0xFF)
}

pub fn mark_used<N: RawNand>(nand: &mut N, zone: u16, block: u16) -> error::Result<()> {
    write_tag_bytes(nand, zone, block, 0, USED_OFFSET, &[USED_BLOCK_FLAG])
}

/// Mark a block bad. This is best-effort: if page 0's spare area can't be programmed, page 1's
/// is tried instead, and failure of both is only logged.
pub fn mark_bad<N: RawNand>(nand: &mut N, zone: u16, block: u16) {
    warn!("Marking block {block} of zone {zone} bad");

    for page in [0, 1] {
        match write_tag_bytes(nand, zone, block, page, BI_OFFSET, &[BAD_BLOCK_FLAG]) {
            Ok(()) => return,
            Err(e) => warn!("Could not mark block {block} bad on page {page}: {e}"),
        }
    }
}

/// Record which logical block `block` holds
pub fn mark_logical<N: RawNand>(nand: &mut N, zone: u16, block: u16, lbn: u16) -> error::Result<()> {
    let tag = SpareTag {
        logical_block: lbn,
        ..Default::default()
    }
    .to_bytes()?;

    write_tag_bytes(
        nand,
        zone,
        block,
        0,
        LBN0_OFFSET,
        &tag[LBN0_OFFSET..=LBN1_OFFSET],
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::nand::{sim::SimNand, TEST_GEOMETRY};

    #[test]
    fn test_tag_layout() -> anyhow::Result<()> {
        let tag = SpareTag::decode(&[0xFF, 0xFE, 0x34, 0x02, 0x99])?;
        assert!(!tag.is_bad());
        assert!(tag.is_used());
        assert_eq!(tag.lbn(), 0x234);

        let bytes = SpareTag {
            bad_marker: 0x00,
            used_marker: 0xFE,
            logical_block: 0x0102,
        }
        .to_bytes()?;
        assert_eq!(bytes, [0x00, 0xFE, 0x02, 0x01]);

        assert!(SpareTag::decode(&[0xFF, 0xFF]).is_err());
        Ok(())
    }

    #[test]
    fn test_fresh_block_is_free() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        assert_eq!(read_tag(&mut nand, 0, 3)?, SpareTag::default());
        assert!(is_free(&mut nand, 0, 3)?);
        assert!(!is_bad(&mut nand, 0, 3)?);
        Ok(())
    }

    #[test]
    fn test_mark_used_and_logical() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        mark_used(&mut nand, 1, 7)?;
        mark_logical(&mut nand, 1, 7, 42)?;

        let tag = read_tag(&mut nand, 1, 7)?;
        assert!(tag.is_used());
        assert_eq!(tag.lbn(), 42);
        assert!(!is_free(&mut nand, 1, 7)?);

        // The same block number in the other zone is untouched
        assert!(is_free(&mut nand, 0, 7)?);
        Ok(())
    }

    #[test]
    fn test_mark_bad() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        mark_bad(&mut nand, 0, 9);
        assert!(is_bad(&mut nand, 0, 9)?);
        assert!(!is_free(&mut nand, 0, 9)?);
        Ok(())
    }

    #[test]
    fn test_mark_used_failure() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.fail_program(4, true);
        assert!(matches!(mark_used(&mut nand, 0, 4), Err(Error::Fail)));
        assert!(matches!(mark_logical(&mut nand, 0, 4, 1), Err(Error::Fail)));

        // Neither page takes the marker; that is only logged
        mark_bad(&mut nand, 0, 4);
        assert!(!is_bad(&mut nand, 0, 4).unwrap());
    }

    #[test]
    fn test_mark_bad_falls_back_to_page_1() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.fail_program_page(6, 0, true);
        mark_bad(&mut nand, 0, 6);

        let mut marker = [0u8];
        nand.read_page(PhysAddr::spare(&TEST_GEOMETRY, 0, 6, 0, BI_OFFSET), &mut marker)?;
        assert_eq!(marker, [GOOD_BLOCK_FLAG]);
        nand.read_page(PhysAddr::spare(&TEST_GEOMETRY, 0, 6, 1, BI_OFFSET), &mut marker)?;
        assert_eq!(marker, [BAD_BLOCK_FLAG]);

        assert!(is_bad(&mut nand, 0, 6)?);
        assert!(!is_free(&mut nand, 0, 6)?);
        Ok(())
    }
}
