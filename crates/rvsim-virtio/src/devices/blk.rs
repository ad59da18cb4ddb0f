//! Virtio block device.
//!
//! Requests carry a 16-byte header in the read-only part of the chain; the
//! writable part receives the payload (reads) and a trailing status byte.
//! One request is in flight at a time: a second arrival while the backend is
//! busy pushes back on the dispatch loop until the completion path drains
//! the queue again.

use tracing::warn;

use rvsim_storage::{BlockImage, DiskError, SECTOR_SIZE};

use crate::devices::{DispatchOutcome, VirtioDevice};
use crate::queue::QueueCtx;

pub const VIRTIO_DEVICE_TYPE_BLK: u32 = 2;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const REQUEST_HEADER_SIZE: usize = 16;

/// Cap on per-request payload allocations, against pathological chains.
pub const VIRTIO_BLK_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

/// Outcome of submitting I/O to a [`BlockBackend`].
#[derive(Debug)]
pub enum BlockIoStatus {
    /// Completed synchronously with the given result.
    Done(Result<(), DiskError>),
    /// The backend accepted the request and will deliver the result through
    /// [`VirtioBlk::complete_request`].
    Pending,
}

/// Submission-style disk interface consumed by the device model.
///
/// The shape admits an asynchronous backend even though every backend in the
/// tree today completes synchronously: callers must be prepared for
/// [`BlockIoStatus::Pending`] and route the eventual completion through
/// [`VirtioBlk::complete_request`].
pub trait BlockBackend {
    fn sector_count(&self) -> u64;
    fn submit_read(&mut self, sector: u64, buf: &mut [u8]) -> BlockIoStatus;
    fn submit_write(&mut self, sector: u64, buf: &[u8]) -> BlockIoStatus;
}

/// Any boxed [`BlockImage`] is a synchronous [`BlockBackend`].
impl<T: BlockImage + ?Sized> BlockBackend for Box<T> {
    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn submit_read(&mut self, sector: u64, buf: &mut [u8]) -> BlockIoStatus {
        BlockIoStatus::Done((**self).read_sectors(sector, buf))
    }

    fn submit_write(&mut self, sector: u64, buf: &[u8]) -> BlockIoStatus {
        BlockIoStatus::Done((**self).write_sectors(sector, buf))
    }
}

/// The single request a block device may have in flight.
#[derive(Debug)]
struct BlockRequest {
    typ: u32,
    queue_idx: usize,
    desc_idx: u16,
    write_size: usize,
    /// Reply buffer for `IN` requests (payload plus status byte); empty for
    /// `OUT`.
    buf: Vec<u8>,
}

/// Virtio block device model over a [`BlockBackend`].
pub struct VirtioBlk<B: BlockBackend> {
    backend: B,
    config: [u8; 8],
    req: Option<BlockRequest>,
}

impl<B: BlockBackend> VirtioBlk<B> {
    pub fn new(backend: B) -> Self {
        // Config space: total sector count, little-endian u64.
        let config = backend.sector_count().to_le_bytes();
        Self {
            backend,
            config,
            req: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn finish_request(&mut self, ctx: &mut QueueCtx<'_>, req: BlockRequest, ok: bool) {
        let status = if ok {
            VIRTIO_BLK_S_OK
        } else {
            VIRTIO_BLK_S_IOERR
        };
        let result = match req.typ {
            VIRTIO_BLK_T_IN => {
                let mut buf = req.buf;
                buf[req.write_size - 1] = status;
                ctx.copy_to_queue(req.queue_idx, req.desc_idx, 0, &buf)
                    .and_then(|()| ctx.consume(req.queue_idx, req.desc_idx, req.write_size as u32))
            }
            _ => ctx
                .copy_to_queue(req.queue_idx, req.desc_idx, 0, &[status])
                .and_then(|()| ctx.consume(req.queue_idx, req.desc_idx, 1)),
        };
        if let Err(err) = result {
            warn!(target: "rvsim_virtio", %err, "failed to post block completion");
        }
    }

    /// Complete a request a backend left [`BlockIoStatus::Pending`].
    ///
    /// Returns the queue index that should be re-notified so entries held
    /// back by the busy device get dispatched. Unused with the synchronous
    /// backends in this tree.
    pub fn complete_request(
        &mut self,
        ctx: &mut QueueCtx<'_>,
        result: Result<(), DiskError>,
    ) -> Option<usize> {
        let req = self.req.take()?;
        let queue_idx = req.queue_idx;
        self.finish_request(ctx, req, result.is_ok());
        Some(queue_idx)
    }
}

impl<B: BlockBackend> VirtioDevice for VirtioBlk<B> {
    fn device_id(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_BLK
    }

    fn config_space(&self) -> &[u8] {
        &self.config
    }

    fn config_space_mut(&mut self) -> &mut [u8] {
        &mut self.config
    }

    fn recv_request(
        &mut self,
        ctx: &mut QueueCtx<'_>,
        queue_idx: usize,
        desc_idx: u16,
        read_size: usize,
        write_size: usize,
    ) -> DispatchOutcome {
        if self.req.is_some() {
            return DispatchOutcome::Busy;
        }

        let mut hdr = [0u8; REQUEST_HEADER_SIZE];
        if read_size < REQUEST_HEADER_SIZE {
            warn!(target: "rvsim_virtio", read_size, "block request header too short");
            return DispatchOutcome::Done;
        }
        if let Err(err) = ctx.copy_from_queue(queue_idx, desc_idx, 0, &mut hdr) {
            warn!(target: "rvsim_virtio", %err, "failed to read block request header");
            return DispatchOutcome::Done;
        }

        let typ = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(hdr[8..16].try_into().unwrap());

        if read_size.max(write_size) > VIRTIO_BLK_MAX_REQUEST_BYTES {
            warn!(target: "rvsim_virtio", read_size, write_size, "oversized block request");
            if write_size > 0 {
                // The status byte is the last writable byte of the chain.
                let result = ctx
                    .copy_to_queue(queue_idx, desc_idx, write_size - 1, &[VIRTIO_BLK_S_IOERR])
                    .and_then(|()| ctx.consume(queue_idx, desc_idx, 1));
                if let Err(err) = result {
                    warn!(target: "rvsim_virtio", %err, "failed to post IOERR status");
                }
            }
            return DispatchOutcome::Done;
        }

        match typ {
            VIRTIO_BLK_T_IN => {
                if write_size == 0 {
                    warn!(target: "rvsim_virtio", "block read request without writable chain");
                    return DispatchOutcome::Done;
                }
                let mut req = BlockRequest {
                    typ,
                    queue_idx,
                    desc_idx,
                    write_size,
                    buf: vec![0u8; write_size],
                };
                // The last writable byte is the status; everything before it
                // is sector payload.
                let data_len = ((write_size - 1) / SECTOR_SIZE) * SECTOR_SIZE;
                match self.backend.submit_read(sector, &mut req.buf[..data_len]) {
                    BlockIoStatus::Done(result) => self.finish_request(ctx, req, result.is_ok()),
                    BlockIoStatus::Pending => self.req = Some(req),
                }
            }
            VIRTIO_BLK_T_OUT => {
                if write_size == 0 {
                    warn!(target: "rvsim_virtio", "block write request without status descriptor");
                    return DispatchOutcome::Done;
                }
                let len = read_size - REQUEST_HEADER_SIZE;
                let mut data = vec![0u8; len];
                if let Err(err) =
                    ctx.copy_from_queue(queue_idx, desc_idx, REQUEST_HEADER_SIZE, &mut data)
                {
                    warn!(target: "rvsim_virtio", %err, "failed to read block write payload");
                    return DispatchOutcome::Done;
                }
                let data_len = (len / SECTOR_SIZE) * SECTOR_SIZE;
                let req = BlockRequest {
                    typ,
                    queue_idx,
                    desc_idx,
                    write_size,
                    buf: Vec::new(),
                };
                match self.backend.submit_write(sector, &data[..data_len]) {
                    BlockIoStatus::Done(result) => self.finish_request(ctx, req, result.is_ok()),
                    BlockIoStatus::Pending => self.req = Some(req),
                }
            }
            _ => {
                // FLUSH and unknown types: report UNSUPP rather than leaving
                // the chain unconsumed and the ring stuck.
                if write_size == 0 {
                    return DispatchOutcome::Done;
                }
                let result = ctx
                    .copy_to_queue(queue_idx, desc_idx, 0, &[VIRTIO_BLK_S_UNSUPP])
                    .and_then(|()| ctx.consume(queue_idx, desc_idx, 1));
                if let Err(err) = result {
                    warn!(target: "rvsim_virtio", %err, "failed to post UNSUPP status");
                }
            }
        }
        DispatchOutcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvsim_storage::{MemBackend, RawImage};

    #[test]
    fn config_space_encodes_sector_count() {
        let image = RawImage::create(MemBackend::new(), 0x1_0002).unwrap();
        let blk = VirtioBlk::new(Box::new(image) as Box<dyn BlockImage>);

        let config = blk.config_space();
        assert_eq!(config.len(), 8);
        assert_eq!(u64::from_le_bytes(config.try_into().unwrap()), 0x1_0002);
    }
}
