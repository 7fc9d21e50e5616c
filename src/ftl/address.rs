//! Translation of flat logical byte addresses into zone/block/page/offset coordinates.

use crate::error::{Error, Result};
use crate::nand::{NandGeometry, PhysAddr};

/// A logical byte position: `block` is a directory slot within `zone`
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct LogicalAddr {
    pub zone: u16,
    pub block: u16,
    pub page: u16,
    pub page_in_offset: u16,
}

impl LogicalAddr {
    /// Split a flat byte address. Each zone spans `blocks_per_zone` blocks of address space, of
    /// which only the first `max_logical_blocks_per_zone` are backed; addresses in the remainder
    /// (and past the last zone) are out of range.
    pub fn decompose(geometry: &NandGeometry, addr: u64) -> Result<Self> {
        let block_bytes = geometry.block_bytes();
        let page_size = geometry.page_size as u64;

        let zone = addr / geometry.zone_bytes();
        let block = (addr / block_bytes) % u64::from(geometry.blocks_per_zone);
        let in_block = addr % block_bytes;

        if zone >= u64::from(geometry.zone_count)
            || block >= u64::from(geometry.max_logical_blocks_per_zone)
        {
            return Err(Error::OutOfRange { addr });
        }

        Ok(Self {
            zone: zone as u16,
            block: block as u16,
            page: (in_block / page_size) as u16,
            page_in_offset: (in_block % page_size) as u16,
        })
    }

    /// The flat byte address this decomposes from
    pub fn linear(&self, geometry: &NandGeometry) -> u64 {
        u64::from(self.zone) * geometry.zone_bytes()
            + u64::from(self.block) * geometry.block_bytes()
            + u64::from(self.page) * geometry.page_size as u64
            + u64::from(self.page_in_offset)
    }

    /// Bytes from this position to the end of its block
    pub fn block_remaining(&self, geometry: &NandGeometry) -> u64 {
        geometry.block_bytes()
            - u64::from(self.page) * geometry.page_size as u64
            - u64::from(self.page_in_offset)
    }

    /// The same page and offset within physical block `block`
    pub fn on_block(&self, block: u16) -> PhysAddr {
        PhysAddr {
            zone: self.zone,
            block,
            page: self.page,
            page_in_offset: self.page_in_offset,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::TEST_GEOMETRY;

    #[test]
    fn test_decompose() -> anyhow::Result<()> {
        let geometry = NandGeometry::default();
        let addr = LogicalAddr::decompose(&geometry, 10 * 64 * 2048 + 1100)?;
        assert_eq!(
            addr,
            LogicalAddr {
                zone: 0,
                block: 10,
                page: 0,
                page_in_offset: 1100,
            }
        );
        assert_eq!(addr.block_remaining(&geometry), 64 * 2048 - 1100);

        let addr = LogicalAddr::decompose(&geometry, 3 * 64 * 2048 + 5 * 2048 + 7)?;
        assert_eq!((addr.block, addr.page, addr.page_in_offset), (3, 5, 7));
        Ok(())
    }

    #[test]
    fn test_decompose_roundtrip() -> anyhow::Result<()> {
        let geometry = TEST_GEOMETRY;
        let block_bytes = geometry.block_bytes();

        for zone in 0..u64::from(geometry.zone_count) {
            for block in 0..u64::from(geometry.max_logical_blocks_per_zone) {
                for in_block in (0..block_bytes).step_by(13) {
                    let addr = zone * geometry.zone_bytes() + block * block_bytes + in_block;
                    let logical = LogicalAddr::decompose(&geometry, addr)?;
                    assert_eq!(logical.linear(&geometry), addr);

                    // The row address lands on the same page of whatever block backs it
                    let phys = logical.on_block(logical.block);
                    let row = u64::from(phys.row(&geometry));
                    let offset = u64::from(phys.page_in_offset);
                    assert_eq!(row * geometry.page_size as u64 + offset, addr);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_decompose_out_of_range() {
        let geometry = TEST_GEOMETRY;
        let block_bytes = geometry.block_bytes();

        // Exchange and reserve slots are not addressable
        let reserved = u64::from(geometry.max_logical_blocks_per_zone) * block_bytes;
        assert!(LogicalAddr::decompose(&geometry, reserved).is_err());
        assert!(LogicalAddr::decompose(&geometry, reserved - 1).is_ok());

        // Second zone starts after a full zone of address space
        assert!(LogicalAddr::decompose(&geometry, geometry.zone_bytes()).is_ok());
        assert!(LogicalAddr::decompose(&geometry, 2 * geometry.zone_bytes()).is_err());
    }
}
