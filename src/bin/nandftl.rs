//! A command-line front end for the translation layer, running against a NAND image file.
//!
//! The image holds every page with its spare area, in row order. It is loaded when it exists,
//! otherwise the NAND starts out blank; pass `--sim-write` to save it back when done.

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use time::macros::format_description;

use std::fs::{self, File};
use std::io::Write;
use std::num::ParseIntError;
use std::path::PathBuf;

use nand_ftl::{
    ftl::LogicalAddr,
    nand::{sim::SimNand, NandGeometry},
    TranslationLayer,
};

/// The largest transfer the translation layer accepts in one call
const MAX_TRANSFER: usize = u16::MAX as usize;

/// Accept numbers in decimal or, with a `0x` prefix, hexadecimal
fn parse_number(s: &str) -> std::result::Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Args, Debug)]
struct NandOptions {
    /// Path to the NAND image to use
    #[clap(long)]
    sim_path: Option<PathBuf>,

    /// Geometry of the NAND to simulate, as PAGE+SPARExPAGES_PER_BLOCKxBLOCKS_PER_ZONExZONESxLOGICAL
    #[clap(long, default_value = "2048+128x64x1024x1x1000")]
    geometry: NandGeometry,

    /// Write back the NAND image when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<SimNand> {
        let mut sim = SimNand::new(self.geometry);

        if let Some(path) = self.sim_path.as_ref().filter(|x| x.exists()) {
            sim.load(&mut File::open(path)?)
                .with_context(|| format!("loading NAND image {}", path.display()))?;
        }

        Ok(sim)
    }

    fn cleanup(&self, nand: SimNand) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                nand.save(&mut File::create(path)?)
                    .with_context(|| format!("saving NAND image {}", path.display()))?;
            }
        }

        Ok(())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the ID bytes reported by the NAND
    Id,

    /// Print the block directory of a zone
    Directory {
        #[clap(long, default_value_t = 0)]
        zone: u16,
    },

    /// Print what each block of a zone holds, according to its tag; this is a read-only operation
    Survey {
        #[clap(long, default_value_t = 0)]
        zone: u16,
    },

    /// Write a file at a logical address
    Write {
        #[clap(value_parser = parse_number)]
        addr: u32,

        /// The file whose contents to write
        path: PathBuf,
    },

    /// Read from a logical address, to a file or as a hex dump
    Read {
        #[clap(value_parser = parse_number)]
        addr: u32,

        #[clap(value_parser = parse_number)]
        len: u32,

        /// The file to write to; if omitted, the data is dumped to stdout
        out: Option<PathBuf>,
    },

    /// Erase and program a physical block repeatedly, marking it bad if it fails; this destroys
    /// its contents
    ScanBlock {
        block: u16,

        #[clap(long, default_value_t = 0)]
        zone: u16,
    },

    /// Tell whether a physical block is good and unwritten
    Free {
        block: u16,

        #[clap(long, default_value_t = 0)]
        zone: u16,
    },

    /// Check the NAND ID, then write a 256-byte pattern at offset 1100 of block 10 and read it
    /// back
    Selftest {
        /// The first byte of the pattern; each following byte counts up from it
        #[clap(long, default_value_t = 0x10)]
        value: u8,
    },
}

impl Command {
    fn execute(self, ftl: &mut TranslationLayer<SimNand>) -> Result<()> {
        match self {
            Command::Id => {
                let id = ftl.read_id()?;
                println!(
                    "{:02X} {:02X} {:02X} {:02X}",
                    id.maker_id, id.device_id, id.third_id, id.fourth_id
                );
            }

            Command::Directory { zone } => {
                ftl.rebuild(zone)?;
                let directory = ftl.directory().context("directory not built")?;

                for (slot, entry) in directory.entries().iter().enumerate() {
                    println!("{slot:4} => {entry:?}");
                }
            }

            Command::Survey { zone } => {
                for (block, content) in ftl.survey(zone)?.iter().enumerate() {
                    println!("{block:4} => {content:?}");
                }
            }

            Command::Write { addr, path } => {
                let data = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;

                let mut addr = addr;
                for chunk in data.chunks(MAX_TRANSFER) {
                    ftl.write(addr, chunk)
                        .with_context(|| format!("writing at {addr:#x}"))?;
                    addr += chunk.len() as u32;
                }
            }

            Command::Read { addr, len, out } => {
                let mut data = vec![0u8; len as usize];

                let mut addr = addr;
                for chunk in data.chunks_mut(MAX_TRANSFER) {
                    ftl.read(addr, chunk)
                        .with_context(|| format!("reading at {addr:#x}"))?;
                    addr += chunk.len() as u32;
                }

                match out {
                    Some(path) => fs::write(&path, &data)
                        .with_context(|| format!("writing {}", path.display()))?,
                    None => hexdump(&data)?,
                }
            }

            Command::ScanBlock { block, zone } => {
                ftl.rebuild(zone)?;
                ftl.scan_block(block)?;
                println!("Block {block} of zone {zone} is good");
            }

            Command::Free { block, zone } => {
                ftl.rebuild(zone)?;
                let free = ftl.judge_free_block(block)?;
                println!("Block {block} of zone {zone} is {}", if free { "free" } else { "not free" });
            }

            Command::Selftest { value } => selftest(ftl, value)?,
        };

        Ok(())
    }
}

fn hexdump(data: &[u8]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();

    for (i, line) in data.chunks(16).enumerate() {
        write!(stdout, "{:08x}:", i * 16)?;
        for byte in line {
            write!(stdout, " {byte:02x}")?;
        }
        writeln!(stdout)?;
    }

    Ok(())
}

fn selftest(ftl: &mut TranslationLayer<SimNand>, value: u8) -> Result<()> {
    let id = ftl.read_id()?;
    ensure!(
        id.maker_id == 0xAD && id.device_id == 0xF1,
        "unexpected NAND ID {:02X} {:02X}",
        id.maker_id,
        id.device_id
    );

    let addr = LogicalAddr {
        zone: 0,
        block: 10,
        page: 0,
        page_in_offset: 1100,
    }
    .linear(&ftl.geometry());
    let addr = u32::try_from(addr)?;

    let pattern: Vec<u8> = (0..=255u8).map(|i| value.wrapping_add(i)).collect();
    ftl.write(addr, &pattern)?;

    let mut readback = vec![0u8; pattern.len()];
    ftl.read(addr, &mut readback)?;
    ensure!(readback == pattern, "read back data differs from what was written");

    println!("Self-test passed");
    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// Log everything, down to individual relocations
    #[clap(long, short)]
    verbose: bool,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();
    let level = match args.verbose {
        true => LevelFilter::Trace,
        false => LevelFilter::Info,
    };
    TermLogger::init(level, log_cfg, TerminalMode::Stderr, ColorChoice::Auto)?;

    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let mut ftl = TranslationLayer::init(nand).context("building the directory of zone 0")?;
    args.cmd.execute(&mut ftl)?;
    args.nand.cleanup(ftl.into_inner())?;
    Ok(())
}
