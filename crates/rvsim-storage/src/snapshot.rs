use std::collections::HashMap;

use crate::raw::sector_range;
use crate::{BlockImage, Result, StorageBackend, SECTOR_SIZE};

/// Copy-on-write image built from a read-only base plus a volatile overlay.
///
/// Reads consult the overlay first; sectors without an override come from the
/// base. Writes allocate 512-byte overlay entries lazily and never reach the
/// base, so the underlying file survives a guest session unmodified. The
/// overlay is bounded by the base sector count and lives for the lifetime of
/// the device.
pub struct SnapshotImage<B> {
    base: B,
    sector_count: u64,
    overlay: HashMap<u64, Box<[u8; SECTOR_SIZE]>>,
}

impl<B: StorageBackend> SnapshotImage<B> {
    pub fn open(mut base: B) -> Result<Self> {
        let sector_count = base.sector_count()?;
        Ok(Self {
            base,
            sector_count,
            overlay: HashMap::new(),
        })
    }

    /// Number of sectors currently shadowed by the overlay.
    pub fn overlay_sectors(&self) -> usize {
        self.overlay.len()
    }

    pub fn into_base(self) -> B {
        self.base
    }
}

impl<B: StorageBackend> BlockImage for SnapshotImage<B> {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        sector_range(sector, buf.len(), self.sector_count)?;
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let lba = sector + i as u64;
            match self.overlay.get(&lba) {
                Some(shadow) => chunk.copy_from_slice(&shadow[..]),
                None => self.base.read_at(lba * SECTOR_SIZE as u64, chunk)?,
            }
        }
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        sector_range(sector, buf.len(), self.sector_count)?;
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            let lba = sector + i as u64;
            let shadow = self
                .overlay
                .entry(lba)
                .or_insert_with(|| Box::new([0u8; SECTOR_SIZE]));
            shadow.copy_from_slice(chunk);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // The overlay is volatile and the base is read-only; nothing to do.
        Ok(())
    }
}
