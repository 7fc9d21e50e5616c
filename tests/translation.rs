//! End-to-end behavior of the translation layer against the simulated NAND.

use nand_ftl::{
    ftl::{BlockState, LogicalAddr, Parity},
    nand::{sim::SimNand, NandGeometry},
    Error, TranslationLayer,
};

const GEOMETRY: NandGeometry = NandGeometry {
    page_size: 128,
    spare_size: 16,
    pages_per_block: 4,
    blocks_per_zone: 32,
    zone_count: 2,
    max_logical_blocks_per_zone: 24,
};

const BLOCK_BYTES: u32 = 128 * 4;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn fresh() -> anyhow::Result<TranslationLayer<SimNand>> {
    Ok(TranslationLayer::init(SimNand::new(GEOMETRY))?)
}

fn read_back(ftl: &mut TranslationLayer<SimNand>, addr: u32, len: usize) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    ftl.read(addr, &mut buf)?;
    Ok(buf)
}

#[test]
fn test_unwritten_reads_erased() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    assert!(read_back(&mut ftl, 1000, 300)?.iter().all(|&x| x == 0xFF));
    Ok(())
}

#[test]
fn test_roundtrip_within_block() -> anyhow::Result<()> {
    let mut ftl = fresh()?;

    // Starts mid-page and ends mid-page two pages later
    let data = pattern(300, 3);
    ftl.write(2 * BLOCK_BYTES + 50, &data)?;
    assert_eq!(read_back(&mut ftl, 2 * BLOCK_BYTES + 50, 300)?, data);

    // Re-reading changes nothing
    assert_eq!(read_back(&mut ftl, 2 * BLOCK_BYTES + 50, 300)?, data);
    Ok(())
}

#[test]
fn test_roundtrip_across_blocks() -> anyhow::Result<()> {
    let mut ftl = fresh()?;

    let data = pattern(3 * BLOCK_BYTES as usize, 9);
    ftl.write(BLOCK_BYTES - 7, &data)?;
    assert_eq!(read_back(&mut ftl, BLOCK_BYTES - 7, data.len())?, data);

    // Logical blocks 0 through 3 were touched
    let directory = ftl.directory().unwrap();
    for lbn in 0..=3 {
        assert_eq!(directory.lookup(lbn)?.1, BlockState::Used { valid: true });
    }
    assert_eq!(directory.lookup(4)?.1, BlockState::Free);
    Ok(())
}

#[test]
fn test_rewrite_preserves_surroundings() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    let base = 7 * BLOCK_BYTES;

    let mut expected = pattern(BLOCK_BYTES as usize, 1);
    ftl.write(base, &expected)?;

    // Overwrite across a page boundary, then again somewhere else in the same block
    let patch = pattern(200, 0x80);
    ftl.write(base + 100, &patch)?;
    expected[100..300].copy_from_slice(&patch);

    ftl.write(base + 450, &[0x5A; 20])?;
    expected[450..470].fill(0x5A);

    assert_eq!(read_back(&mut ftl, base, BLOCK_BYTES as usize)?, expected);

    // Each rewrite moved the block and erased the one it left
    let physical = ftl.directory().unwrap().lookup(7)?.0;
    assert_ne!(physical, 7);
    assert_eq!(ftl.nand().erase_count(7), 1);
    assert!(ftl.nand().is_block_erased(7));
    Ok(())
}

#[test]
fn test_acceptance_scenario() -> anyhow::Result<()> {
    let mut ftl = TranslationLayer::init(SimNand::new(NandGeometry::default()))?;

    let id = ftl.read_id()?;
    assert_eq!((id.maker_id, id.device_id), (0xAD, 0xF1));

    let addr = LogicalAddr {
        zone: 0,
        block: 10,
        page: 0,
        page_in_offset: 1100,
    }
    .linear(&ftl.geometry());
    assert_eq!(addr, 10 * 64 * 2048 + 1100);
    let addr = addr as u32;

    let data: Vec<u8> = (0..=255u8).map(|i| 0x10u8.wrapping_add(i)).collect();
    ftl.write(addr, &data)?;
    assert_eq!(read_back(&mut ftl, addr, 256)?, data);

    // Running it a second time goes through relocation
    let data: Vec<u8> = (0..=255u8).map(|i| 0x20u8.wrapping_add(i)).collect();
    ftl.write(addr, &data)?;
    assert_eq!(read_back(&mut ftl, addr, 256)?, data);
    Ok(())
}

#[test]
fn test_bad_blocks_never_used() -> anyhow::Result<()> {
    let mut nand = SimNand::new(GEOMETRY);
    for block in [0, 5, 31] {
        nand.set_factory_bad(block);
    }
    let mut ftl = TranslationLayer::init(nand)?;

    // Fill every logical block of zone 0, twice so the exchange blocks get used too
    for round in 0..2u8 {
        for lbn in 0..24u32 {
            ftl.write(lbn * BLOCK_BYTES, &pattern(64, round ^ lbn as u8))?;
        }
    }

    for block in [0, 5, 31] {
        assert_eq!(ftl.nand().erase_count(block), 0);
    }
    let directory = ftl.directory().unwrap();
    let mut bad: Vec<u16> = directory.bad_blocks().collect();
    bad.sort();
    assert_eq!(bad, [0, 5, 31]);

    for lbn in 0..24u32 {
        assert_eq!(
            read_back(&mut ftl, lbn * BLOCK_BYTES, 64)?,
            pattern(64, 1 ^ lbn as u8)
        );
    }
    Ok(())
}

#[test]
fn test_directory_survives_reload() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    ftl.write(3 * BLOCK_BYTES, &pattern(100, 4))?;
    ftl.write(3 * BLOCK_BYTES + 10, &pattern(10, 5))?;
    ftl.write(GEOMETRY.zone_bytes() as u32, b"zone one")?;

    let mut image = Vec::new();
    ftl.into_inner().save(&mut image)?;

    let mut nand = SimNand::new(GEOMETRY);
    nand.load(&mut image.as_slice())?;
    let mut ftl = TranslationLayer::init(nand)?;

    let mut expected = pattern(100, 4);
    expected[10..20].copy_from_slice(&pattern(10, 5));
    assert_eq!(read_back(&mut ftl, 3 * BLOCK_BYTES, 100)?, expected);
    assert_eq!(read_back(&mut ftl, GEOMETRY.zone_bytes() as u32, 8)?, b"zone one");
    Ok(())
}

#[test]
fn test_zone_switching() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    let zone1 = GEOMETRY.zone_bytes() as u32;

    ftl.write(0, b"first zone")?;
    assert_eq!(ftl.zone(), 0);

    ftl.write(zone1 + BLOCK_BYTES, b"second zone")?;
    assert_eq!(ftl.zone(), 1);

    assert_eq!(read_back(&mut ftl, 0, 10)?, b"first zone");
    assert_eq!(ftl.zone(), 0);

    // Same physical block number, different device blocks
    assert_eq!(ftl.nand().erase_count(0), 0);
    assert_eq!(read_back(&mut ftl, zone1 + BLOCK_BYTES, 11)?, b"second zone");
    Ok(())
}

#[test]
fn test_out_of_range() -> anyhow::Result<()> {
    let mut ftl = fresh()?;

    // Past the last logical block of zone 0, in the part of its address space with no backing
    let reserved = 24 * BLOCK_BYTES;
    assert!(matches!(
        ftl.write(reserved, &[0; 4]),
        Err(Error::OutOfRange { .. })
    ));

    // A write running into that gap fails once it gets there
    assert!(matches!(
        ftl.write(reserved - 4, &[0; 8]),
        Err(Error::OutOfRange { .. })
    ));

    let past_end = 2 * GEOMETRY.zone_bytes() as u32;
    let mut buf = [0u8; 4];
    assert!(matches!(
        ftl.read(past_end, &mut buf),
        Err(Error::OutOfRange { .. })
    ));
    Ok(())
}

#[test]
fn test_too_long() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    let data = vec![0u8; 65536];
    assert!(matches!(ftl.write(0, &data), Err(Error::TooLong(65536))));

    let mut buf = vec![0u8; 65536];
    assert!(matches!(ftl.read(0, &mut buf), Err(Error::TooLong(65536))));
    Ok(())
}

#[test]
fn test_stuck_device_times_out() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    ftl.nand_mut().stuck_busy(true);
    assert!(matches!(ftl.write(0, &[1, 2, 3]), Err(Error::Timeout)));

    ftl.nand_mut().stuck_busy(false);
    ftl.write(0, &[1, 2, 3])?;
    assert_eq!(read_back(&mut ftl, 0, 3)?, [1u8, 2, 3]);
    Ok(())
}

#[test]
fn test_relocation_retries_then_runs_out_of_spares() -> anyhow::Result<()> {
    let mut ftl = fresh()?;
    ftl.write(0, &pattern(64, 2))?;

    // The first exchange block fails; the relocation lands on the next one
    let first = ftl
        .directory()
        .unwrap()
        .find_free_block(Parity::Odd)
        .unwrap();
    ftl.nand_mut().fail_copyback(u32::from(first), true);
    ftl.write(8, &[0xEE; 8])?;

    let mut expected = pattern(64, 2);
    expected[8..16].fill(0xEE);
    assert_eq!(read_back(&mut ftl, 0, 64)?, expected);
    assert_eq!(
        ftl.directory().unwrap().bad_blocks().collect::<Vec<_>>(),
        [first]
    );

    // With every block failing, the fifth bad block leaves no room for the exchange slots
    for block in 0..32 {
        ftl.nand_mut().fail_copyback(block, true);
    }
    assert!(matches!(
        ftl.write(8, &[0x11; 8]),
        Err(Error::TooManyBadBlocks { zone: 0 })
    ));
    assert!(ftl.directory().is_none());

    // Zone 0 can't be used any more; zone 1 is unaffected
    let mut buf = [0u8; 8];
    assert!(matches!(
        ftl.read(0, &mut buf),
        Err(Error::TooManyBadBlocks { zone: 0 })
    ));

    let zone1 = GEOMETRY.zone_bytes() as u32;
    ftl.write(zone1, b"still ok")?;
    assert_eq!(read_back(&mut ftl, zone1, 8)?, b"still ok");
    Ok(())
}
