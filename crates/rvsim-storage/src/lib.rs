//! Backing stores for the rvsim virtio block device.
//!
//! The device model needs a *sector-oriented* disk interface, while host
//! storage is byte-addressed. This crate provides:
//!
//! - [`StorageBackend`]: fixed-size byte store (host file or memory)
//! - [`BlockImage`]: the sector-granular interface the device model consumes
//! - [`RawImage`]: raw image over a backend, optionally read-only
//! - [`SnapshotImage`]: copy-on-write overlay that never touches the base image

mod backend;
mod error;
mod raw;
mod snapshot;

pub use backend::{FileBackend, MemBackend, StorageBackend};
pub use error::{DiskError, Result};
pub use raw::{BlockImage, RawImage, SECTOR_SIZE};
pub use snapshot::SnapshotImage;

/// How a block image file is attached to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    /// Writes fail; the file is the source of truth.
    ReadOnly,
    /// The file is read and written in place.
    ReadWrite,
    /// Writes land in a volatile per-sector overlay; the file is never modified.
    Snapshot,
}

impl ImageMode {
    /// Parse the `mode=` device argument. Unknown strings fall back to
    /// read-write, matching the permissive argument handling of the
    /// simulator's device plugins.
    pub fn from_arg(arg: &str) -> Self {
        match arg {
            "ro" => Self::ReadOnly,
            "snapshot" => Self::Snapshot,
            _ => Self::ReadWrite,
        }
    }
}
