use crate::{DiskError, Result, StorageBackend};

pub const SECTOR_SIZE: usize = 512;

/// A fixed-capacity, sector-granular disk image.
///
/// Buffers passed to `read_sectors` / `write_sectors` must be a whole number
/// of sectors; requests past the end of the image fail without partial I/O.
pub trait BlockImage {
    /// Image capacity in 512-byte sectors.
    fn sector_count(&self) -> u64;

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;
    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Validate a sector-granular request and return its byte offset.
pub(crate) fn sector_range(sector: u64, len: usize, capacity_sectors: u64) -> Result<u64> {
    if len % SECTOR_SIZE != 0 {
        return Err(DiskError::UnalignedLength {
            len,
            alignment: SECTOR_SIZE,
        });
    }
    let count = (len / SECTOR_SIZE) as u64;
    let end = sector.checked_add(count).ok_or(DiskError::OffsetOverflow)?;
    let offset = sector
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity_sectors {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity: capacity_sectors * SECTOR_SIZE as u64,
        });
    }
    Ok(offset)
}

/// A raw disk image stored in a byte backend.
///
/// The capacity is fixed when the image is opened: a trailing partial sector
/// in the backing file is not addressable, matching how the simulator sizes
/// its images.
pub struct RawImage<B> {
    backend: B,
    sector_count: u64,
    read_only: bool,
}

impl<B: StorageBackend> RawImage<B> {
    /// Open an existing image. Capacity is the backend length in whole sectors.
    pub fn open(mut backend: B, read_only: bool) -> Result<Self> {
        let sector_count = backend.sector_count()?;
        Ok(Self {
            backend,
            sector_count,
            read_only,
        })
    }

    /// Create a zero-filled writable image of `sector_count` sectors.
    pub fn create(mut backend: B, sector_count: u64) -> Result<Self> {
        let len = sector_count
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        backend.set_len(len)?;
        Ok(Self {
            backend,
            sector_count,
            read_only: false,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: StorageBackend> BlockImage for RawImage<B> {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let offset = sector_range(sector, buf.len(), self.sector_count)?;
        self.backend.read_at(offset, buf)
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        let offset = sector_range(sector, buf.len(), self.sector_count)?;
        self.backend.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_range_rejects_unaligned_and_oob() {
        assert!(matches!(
            sector_range(0, 100, 8),
            Err(DiskError::UnalignedLength { .. })
        ));
        assert!(matches!(
            sector_range(7, 2 * SECTOR_SIZE, 8),
            Err(DiskError::OutOfBounds { .. })
        ));
        assert_eq!(sector_range(2, SECTOR_SIZE, 8).unwrap(), 1024);
    }

    #[test]
    fn sector_range_reports_overflow() {
        assert!(matches!(
            sector_range(u64::MAX, SECTOR_SIZE, u64::MAX),
            Err(DiskError::OffsetOverflow)
        ));
    }
}
