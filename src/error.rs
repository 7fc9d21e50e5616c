//! The error type shared by the raw NAND layer and the translation layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A raw operation failed, or the device reported an error in its status register
    #[error("NAND operation failed")]
    Fail,

    /// The status register never reported ready within the polling bound
    #[error("timed out waiting for NAND to become ready")]
    Timeout,

    /// A block failed verification and has been marked bad
    #[error("block {0} is bad")]
    BadBlock(u16),

    /// Every relocation attempt failed; the logical block still maps to its old physical block
    #[error("block relocation failed after {attempts} attempts")]
    RelocationExhausted { attempts: u64 },

    /// A block could be neither erased nor marked bad, so it still claims its logical block
    #[error("block {0} could not be erased or marked bad")]
    StuckBlock(u16),

    /// The exchange slot for the requested parity has no physical block behind it
    #[error("no exchange block available")]
    NoExchangeBlock,

    /// Too many bad blocks in a zone to back every logical block
    #[error("too many bad blocks in zone {zone}")]
    TooManyBadBlocks { zone: u16 },

    /// The directory has no physical block for a logical block
    #[error("logical block {block} in zone {zone} is not mapped")]
    Unmapped { zone: u16, block: u16 },

    #[error("address {addr:#x} out of range")]
    OutOfRange { addr: u64 },

    /// Transfers carry 16-bit lengths on the device interface
    #[error("transfer of {0} bytes exceeds the maximum of 65535")]
    TooLong(usize),

    #[error("malformed spare area: {0}")]
    Spare(#[from] deku::DekuError),

    #[error("invalid geometry: {0}")]
    Geometry(String),
}
