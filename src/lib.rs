//! A flash translation layer for raw NAND attached to a GD32F30x external memory controller.
//!
//! [nand] holds the raw device layer: geometry, physical addressing, the [nand::RawNand] trait,
//! a driver issuing command sequences over the EXMC bus and an in-memory simulator. [ftl] builds
//! a flat logical byte space on top, with a per-zone block directory rebuilt from spare-area
//! tags, wear-leveling through on-chip copy-back, and bad-block exclusion.

pub mod error;
pub mod ftl;
pub mod nand;

pub use error::{Error, Result};
pub use ftl::{SharedTranslationLayer, TranslationLayer};
pub use nand::{sim::SimNand, NandGeometry, NandId, PhysAddr, RawNand};
