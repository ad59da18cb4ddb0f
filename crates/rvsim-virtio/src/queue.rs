//! Split-virtqueue engine.
//!
//! Descriptor chains are walked iteratively in guest memory. A chain is a
//! read-only prefix (driver to device) followed by a writable suffix (device
//! to driver); the engine enforces that partition on every access. One
//! used-ring entry is published per consumed chain and publishing raises the
//! used-ring interrupt.

use thiserror::Error;
use tracing::warn;

use crate::irq::{InterruptState, INT_STATUS_USED_RING};
use crate::memory::{
    copy_from_guest, copy_to_guest, read_u16_le, write_u16_le, write_u32_le, GuestMemory,
    MemoryError,
};

pub const MAX_QUEUE: usize = 8;
pub const MAX_QUEUE_NUM: u32 = 16;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Walk limit for a single chain, against cyclic `next` links.
const MAX_CHAIN_DESCRIPTORS: usize = 1024;

const DESC_SIZE: u64 = 16;

pub type QueueResult<T> = std::result::Result<T, VirtQueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VirtQueueError {
    #[error("descriptor chain ended before the requested range")]
    ChainTooShort,

    #[error("descriptor direction does not match the access")]
    DirectionMismatch,

    #[error("descriptor chain exceeds {MAX_CHAIN_DESCRIPTORS} descriptors")]
    ChainTooLong,

    #[error("indirect descriptors are not supported")]
    IndirectDescriptor,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// One descriptor-table entry, 16 bytes in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

/// Guest-programmed configuration of one virtqueue.
#[derive(Debug, Clone, Copy)]
pub struct QueueState {
    pub ready: bool,
    /// Ring size; kept a power of two (at most [`MAX_QUEUE_NUM`]) by the
    /// register file.
    pub num: u32,
    /// Consumer cursor into the available ring.
    pub last_avail_idx: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    /// Suppresses automatic dispatch on `QUEUE_NOTIFY`; the embedder drains
    /// the queue itself.
    pub manual_recv: bool,
}

impl QueueState {
    pub(crate) fn reset(&mut self) {
        self.ready = false;
        self.num = MAX_QUEUE_NUM;
        self.last_avail_idx = 0;
        self.desc_addr = 0;
        self.avail_addr = 0;
        self.used_addr = 0;
    }

    pub(crate) fn mask(&self) -> u16 {
        (self.num - 1) as u16
    }
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            ready: false,
            num: MAX_QUEUE_NUM,
            last_avail_idx: 0,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            manual_recv: false,
        }
    }
}

/// Engine operations handed to device logic for the duration of one dispatch.
///
/// All methods take the queue index and head descriptor index the device was
/// called with; offsets address the read-only or writable portion of the
/// chain as a contiguous byte span.
pub struct QueueCtx<'a> {
    pub(crate) queues: &'a mut [QueueState; MAX_QUEUE],
    pub(crate) mem: &'a mut dyn GuestMemory,
    pub(crate) interrupt: &'a mut InterruptState,
}

impl QueueCtx<'_> {
    fn read_desc(&mut self, queue_idx: usize, desc_idx: u16) -> QueueResult<Descriptor> {
        // Guest-supplied addresses may be arbitrary; wrapped addresses fail
        // the memory lookup rather than the arithmetic.
        let base = self.queues[queue_idx]
            .desc_addr
            .wrapping_add(u64::from(desc_idx) * DESC_SIZE);
        let mut raw = [0u8; DESC_SIZE as usize];
        copy_from_guest(self.mem, base, &mut raw)?;
        Ok(Descriptor {
            addr: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
        })
    }

    /// Find the descriptor containing byte `offset` of the requested
    /// direction, returning it together with the offset into it.
    fn seek(
        &mut self,
        queue_idx: usize,
        desc_idx: u16,
        mut offset: usize,
        writable: bool,
    ) -> QueueResult<(Descriptor, usize)> {
        let mut desc = self.read_desc(queue_idx, desc_idx)?;
        let mut walked = 0usize;

        // A write into the chain starts past the read-only prefix.
        if writable {
            while !desc.is_write_only() {
                if !desc.has_next() {
                    return Err(VirtQueueError::ChainTooShort);
                }
                desc = self.read_desc(queue_idx, desc.next)?;
                walked += 1;
                if walked > MAX_CHAIN_DESCRIPTORS {
                    return Err(VirtQueueError::ChainTooLong);
                }
            }
        }

        loop {
            if desc.is_write_only() != writable {
                return Err(VirtQueueError::DirectionMismatch);
            }
            if offset < desc.len as usize {
                return Ok((desc, offset));
            }
            if !desc.has_next() {
                return Err(VirtQueueError::ChainTooShort);
            }
            offset -= desc.len as usize;
            desc = self.read_desc(queue_idx, desc.next)?;
            walked += 1;
            if walked > MAX_CHAIN_DESCRIPTORS {
                return Err(VirtQueueError::ChainTooLong);
            }
        }
    }

    /// Gather `buf.len()` bytes from the read-only part of the chain,
    /// starting `offset` bytes in.
    pub fn copy_from_queue(
        &mut self,
        queue_idx: usize,
        desc_idx: u16,
        offset: usize,
        buf: &mut [u8],
    ) -> QueueResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (mut desc, mut offset) = self.seek(queue_idx, desc_idx, offset, false)?;
        let mut pos = 0usize;
        let mut walked = 0usize;
        loop {
            let take = (buf.len() - pos).min(desc.len as usize - offset);
            copy_from_guest(
                self.mem,
                desc.addr.wrapping_add(offset as u64),
                &mut buf[pos..pos + take],
            )?;
            pos += take;
            if pos == buf.len() {
                return Ok(());
            }
            offset += take;
            if offset == desc.len as usize {
                if !desc.has_next() {
                    return Err(VirtQueueError::ChainTooShort);
                }
                desc = self.read_desc(queue_idx, desc.next)?;
                if desc.is_write_only() {
                    return Err(VirtQueueError::DirectionMismatch);
                }
                offset = 0;
                walked += 1;
                if walked > MAX_CHAIN_DESCRIPTORS {
                    return Err(VirtQueueError::ChainTooLong);
                }
            }
        }
    }

    /// Scatter `buf` into the writable part of the chain, starting `offset`
    /// bytes into it.
    pub fn copy_to_queue(
        &mut self,
        queue_idx: usize,
        desc_idx: u16,
        offset: usize,
        buf: &[u8],
    ) -> QueueResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (mut desc, mut offset) = self.seek(queue_idx, desc_idx, offset, true)?;
        let mut pos = 0usize;
        let mut walked = 0usize;
        loop {
            let take = (buf.len() - pos).min(desc.len as usize - offset);
            copy_to_guest(
                self.mem,
                desc.addr.wrapping_add(offset as u64),
                &buf[pos..pos + take],
            )?;
            pos += take;
            if pos == buf.len() {
                return Ok(());
            }
            offset += take;
            if offset == desc.len as usize {
                if !desc.has_next() {
                    return Err(VirtQueueError::ChainTooShort);
                }
                desc = self.read_desc(queue_idx, desc.next)?;
                if !desc.is_write_only() {
                    return Err(VirtQueueError::DirectionMismatch);
                }
                offset = 0;
                walked += 1;
                if walked > MAX_CHAIN_DESCRIPTORS {
                    return Err(VirtQueueError::ChainTooLong);
                }
            }
        }
    }

    /// Measure the chain: total bytes of the read-only prefix and of the
    /// writable suffix. A writable descriptor followed by a read-only one is
    /// a protocol error.
    pub fn chain_sizes(&mut self, queue_idx: usize, desc_idx: u16) -> QueueResult<(usize, usize)> {
        let mut read_size = 0usize;
        let mut write_size = 0usize;
        let mut desc = self.read_desc(queue_idx, desc_idx)?;
        let mut walked = 0usize;

        loop {
            if desc.is_indirect() {
                return Err(VirtQueueError::IndirectDescriptor);
            }
            if desc.is_write_only() {
                break;
            }
            read_size += desc.len as usize;
            if !desc.has_next() {
                return Ok((read_size, write_size));
            }
            desc = self.read_desc(queue_idx, desc.next)?;
            walked += 1;
            if walked > MAX_CHAIN_DESCRIPTORS {
                return Err(VirtQueueError::ChainTooLong);
            }
        }

        loop {
            if desc.is_indirect() {
                return Err(VirtQueueError::IndirectDescriptor);
            }
            if !desc.is_write_only() {
                return Err(VirtQueueError::DirectionMismatch);
            }
            write_size += desc.len as usize;
            if !desc.has_next() {
                return Ok((read_size, write_size));
            }
            desc = self.read_desc(queue_idx, desc.next)?;
            walked += 1;
            if walked > MAX_CHAIN_DESCRIPTORS {
                return Err(VirtQueueError::ChainTooLong);
            }
        }
    }

    /// Publish the chain to the used ring and raise the used-ring interrupt.
    ///
    /// `len` is the number of bytes the device wrote into the chain.
    pub fn consume(&mut self, queue_idx: usize, desc_idx: u16, len: u32) -> QueueResult<()> {
        let qs = self.queues[queue_idx];

        let idx_addr = qs.used_addr.wrapping_add(2);
        let index = read_u16_le(self.mem, idx_addr)?;

        let slot = qs
            .used_addr
            .wrapping_add(4 + u64::from(index & qs.mask()) * 8);
        write_u32_le(self.mem, slot, u32::from(desc_idx))?;
        write_u32_le(self.mem, slot.wrapping_add(4), len)?;
        write_u16_le(self.mem, idx_addr, index.wrapping_add(1))?;

        self.interrupt.raise(INT_STATUS_USED_RING);
        Ok(())
    }

    /// Head descriptor index at available-ring position `avail_pos`.
    pub(crate) fn avail_entry(&mut self, queue_idx: usize, avail_pos: u16) -> QueueResult<u16> {
        let qs = self.queues[queue_idx];
        let slot = qs
            .avail_addr
            .wrapping_add(4 + u64::from(avail_pos & qs.mask()) * 2);
        Ok(read_u16_le(self.mem, slot)?)
    }

    /// Producer cursor of the available ring.
    pub(crate) fn avail_idx(&mut self, queue_idx: usize) -> QueueResult<u16> {
        let qs = self.queues[queue_idx];
        Ok(read_u16_le(self.mem, qs.avail_addr.wrapping_add(2))?)
    }
}

pub(crate) fn warn_malformed(queue_idx: usize, desc_idx: u16, err: VirtQueueError) {
    warn!(
        target: "rvsim_virtio",
        queue_idx,
        desc_idx,
        %err,
        "skipping malformed descriptor chain"
    );
}
