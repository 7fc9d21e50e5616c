//! A clonable handle for using one translation layer from several threads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BlockContent, TranslationLayer};
use crate::error::Result;
use crate::nand::{NandId, RawNand};

/// Shares a [TranslationLayer] behind one lock; every call holds it for its whole duration, so
/// operations never interleave on the device.
pub struct SharedTranslationLayer<N: RawNand> {
    inner: Arc<Mutex<TranslationLayer<N>>>,
}

impl<N: RawNand> Clone for SharedTranslationLayer<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: RawNand> SharedTranslationLayer<N> {
    pub fn new(ftl: TranslationLayer<N>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ftl)),
        }
    }

    /// A panic mid-operation leaves nothing half-updated in memory that a rebuild can't fix, so
    /// a poisoned lock is taken over as is.
    fn lock(&self) -> MutexGuard<'_, TranslationLayer<N>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the translation layer
    pub fn with<T>(&self, f: impl FnOnce(&mut TranslationLayer<N>) -> T) -> T {
        f(&mut self.lock())
    }

    pub fn read_id(&self) -> Result<NandId> {
        self.lock().read_id()
    }

    pub fn write(&self, addr: u32, buf: &[u8]) -> Result<()> {
        self.lock().write(addr, buf)
    }

    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.lock().read(addr, buf)
    }

    pub fn scan_block(&self, block: u16) -> Result<()> {
        self.lock().scan_block(block)
    }

    pub fn judge_free_block(&self, block: u16) -> Result<bool> {
        self.lock().judge_free_block(block)
    }

    pub fn survey(&self, zone: u16) -> Result<Vec<BlockContent>> {
        self.lock().survey(zone)
    }
}

#[test]
fn test_shared_writers() -> anyhow::Result<()> {
    use crate::nand::{sim::SimNand, TEST_GEOMETRY};

    let ftl = SharedTranslationLayer::new(TranslationLayer::init(SimNand::new(TEST_GEOMETRY))?);
    let block_bytes = TEST_GEOMETRY.block_bytes() as u32;

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let ftl = ftl.clone();
            std::thread::spawn(move || -> crate::error::Result<()> {
                // Each thread rewrites its own block, forcing relocations
                for round in 0..3u8 {
                    ftl.write(u32::from(i) * block_bytes, &[i * 16 + round; 32])?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("writer thread panicked")?;
    }

    for i in 0..4u8 {
        let mut buf = [0u8; 32];
        ftl.read(u32::from(i) * block_bytes, &mut buf)?;
        assert_eq!(buf, [i * 16 + 2; 32]);
    }

    assert_eq!(ftl.with(|x| x.directory().map(|d| d.bad_blocks().count())), Some(0));
    Ok(())
}
