//! Virtio 9P filesystem device (9P2000.L).
//!
//! Each available-ring chain carries one request frame in its read-only part
//! and receives the reply frame in its writable part. A reply's message type
//! is the request's plus one; failures are RLERROR frames carrying a Linux
//! errno. FIDs are resolved through a hash map to [`FileService`] handles.
//!
//! The request loop is serialized by construction: the [`FileService`]
//! interface is synchronous, so every request completes before `recv_request`
//! returns and the dispatch loop never observes a busy device.

pub mod fs;
pub mod wire;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::devices::{DispatchOutcome, VirtioDevice, MAX_CONFIG_SPACE_SIZE};
use crate::queue::QueueCtx;

use fs::{FileService, FsError, FsResult, Lock, SetAttr, P9_EPROTO};
use wire::{Reader, Writer};

pub const VIRTIO_DEVICE_TYPE_9P: u32 = 9;

/// Feature bit: the mount tag is available in configuration space.
pub const VIRTIO_9P_MOUNT_TAG: u32 = 1;

pub const P9_VERSION: &str = "9P2000.L";
pub const P9_INITIAL_MSIZE: u32 = 8192;

/// Slack below `msize` reserved for message headers; bounds `iounit` and
/// payload sizes.
const P9_IOHDR_SIZE: u32 = 24;

const FRAME_HEADER_SIZE: usize = 7;

/// Error replies carry this id regardless of the request.
const P9_RLERROR: u8 = 6;
const P9_TSTATFS: u8 = 8;
const P9_TLOPEN: u8 = 12;
const P9_TLCREATE: u8 = 14;
const P9_TSYMLINK: u8 = 16;
const P9_TMKNOD: u8 = 18;
const P9_TREADLINK: u8 = 22;
const P9_TGETATTR: u8 = 24;
const P9_TSETATTR: u8 = 26;
const P9_TXATTRWALK: u8 = 30;
const P9_TREADDIR: u8 = 40;
const P9_TFSYNC: u8 = 50;
const P9_TLOCK: u8 = 52;
const P9_TGETLOCK: u8 = 54;
const P9_TLINK: u8 = 70;
const P9_TMKDIR: u8 = 72;
const P9_TRENAMEAT: u8 = 74;
const P9_TUNLINKAT: u8 = 76;
const P9_TVERSION: u8 = 100;
const P9_TATTACH: u8 = 104;
const P9_TFLUSH: u8 = 108;
const P9_TWALK: u8 = 110;
const P9_TREAD: u8 = 116;
const P9_TWRITE: u8 = 118;
const P9_TCLUNK: u8 = 120;

/// `getattr` reply mask: all the basic attributes are valid.
const P9_GETATTR_BASIC: u64 = 0x0000_07ff;

#[derive(Debug, Error)]
#[error("mount tag does not fit the {MAX_CONFIG_SPACE_SIZE}-byte configuration space")]
pub struct MountTagTooLong;

/// Virtio 9P device over a [`FileService`].
pub struct Virtio9p<F: FileService> {
    svc: F,
    config: Vec<u8>,
    msize: u32,
    fids: HashMap<u32, F::File>,
}

impl<F: FileService> Virtio9p<F> {
    pub fn new(svc: F, mount_tag: &str) -> Result<Self, MountTagTooLong> {
        let tag = mount_tag.as_bytes();
        if tag.len() > MAX_CONFIG_SPACE_SIZE - 2 {
            return Err(MountTagTooLong);
        }
        // Config space: u16 tag length, then the tag bytes.
        let mut config = Vec::with_capacity(2 + tag.len());
        config.extend_from_slice(&(tag.len() as u16).to_le_bytes());
        config.extend_from_slice(tag);
        Ok(Self {
            svc,
            config,
            msize: P9_INITIAL_MSIZE,
            fids: HashMap::new(),
        })
    }

    pub fn service(&self) -> &F {
        &self.svc
    }

    pub fn service_mut(&mut self) -> &mut F {
        &mut self.svc
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    fn iounit(&self) -> u32 {
        self.msize.saturating_sub(P9_IOHDR_SIZE)
    }

    fn fid(&self, fid: u32) -> FsResult<&F::File> {
        self.fids.get(&fid).ok_or(FsError::new(P9_EPROTO))
    }

    /// Bind `fid`, releasing any handle it displaces.
    fn bind_fid(&mut self, fid: u32, file: F::File) {
        if let Some(old) = self.fids.insert(fid, file) {
            self.svc.clunk(old);
        }
    }

    fn op_version(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let msize = rd.get_u32()?;
        let version = rd.get_str()?;
        debug!(target: "rvsim_9p", msize, %version, "version negotiation");
        self.msize = msize;

        let mut wr = Writer::new();
        wr.put_u32(self.msize);
        wr.put_str(P9_VERSION);
        Ok(wr)
    }

    fn op_attach(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let _afid = rd.get_u32()?;
        let uname = rd.get_str()?;
        let aname = rd.get_str()?;
        let uid = rd.get_u32()?;

        let (file, qid) = self.svc.attach(uid, &uname, &aname)?;
        self.bind_fid(fid, file);

        let mut wr = Writer::new();
        wr.put_qid(&qid);
        Ok(wr)
    }

    fn op_walk(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let newfid = rd.get_u32()?;
        let nwname = rd.get_u16()?;

        let mut cur = self.fid(fid)?.clone();
        let mut qids = Vec::new();
        for i in 0..nwname {
            let name = rd.get_str()?;
            match self.svc.walk(&cur, &name) {
                Ok((next, qid)) => {
                    cur = next;
                    qids.push(qid);
                }
                // The first failing component fails the walk; a later one
                // stops it with the qids gathered so far.
                Err(err) if i == 0 => return Err(err),
                Err(_) => break,
            }
        }

        // The new FID is only bound by a complete walk.
        if qids.len() == usize::from(nwname) {
            self.bind_fid(newfid, cur);
        }

        let mut wr = Writer::new();
        wr.put_u16(qids.len() as u16);
        for qid in &qids {
            wr.put_qid(qid);
        }
        Ok(wr)
    }

    fn op_clunk(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let file = self.fids.remove(&fid).ok_or(FsError::new(P9_EPROTO))?;
        self.svc.clunk(file);
        Ok(Writer::new())
    }

    fn op_statfs(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        self.fid(fid)?;
        let st = self.svc.statfs()?;

        let mut wr = Writer::new();
        wr.put_u32(0); // type
        wr.put_u32(st.bsize);
        wr.put_u64(st.blocks);
        wr.put_u64(st.bfree);
        wr.put_u64(st.bavail);
        wr.put_u64(st.files);
        wr.put_u64(st.ffree);
        wr.put_u64(0); // fsid
        wr.put_u32(256); // namelen
        Ok(wr)
    }

    fn op_lopen(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let flags = rd.get_u32()?;
        let file = self.fid(fid)?.clone();
        let qid = self.svc.open(&file, flags)?;

        let mut wr = Writer::new();
        wr.put_qid(&qid);
        wr.put_u32(self.iounit());
        Ok(wr)
    }

    fn op_lcreate(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let name = rd.get_str()?;
        let flags = rd.get_u32()?;
        let mode = rd.get_u32()?;
        let gid = rd.get_u32()?;

        let dir = self.fid(fid)?.clone();
        let (file, qid) = self.svc.create(&dir, &name, flags, mode, gid)?;
        // The FID now refers to the created, open file.
        self.bind_fid(fid, file);

        let mut wr = Writer::new();
        wr.put_qid(&qid);
        wr.put_u32(self.iounit());
        Ok(wr)
    }

    fn op_symlink(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let name = rd.get_str()?;
        let target = rd.get_str()?;
        let gid = rd.get_u32()?;

        let dir = self.fid(fid)?.clone();
        let qid = self.svc.symlink(&dir, &name, &target, gid)?;

        let mut wr = Writer::new();
        wr.put_qid(&qid);
        Ok(wr)
    }

    fn op_mknod(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let name = rd.get_str()?;
        let mode = rd.get_u32()?;
        let major = rd.get_u32()?;
        let minor = rd.get_u32()?;
        let gid = rd.get_u32()?;

        let dir = self.fid(fid)?.clone();
        let qid = self.svc.mknod(&dir, &name, mode, major, minor, gid)?;

        let mut wr = Writer::new();
        wr.put_qid(&qid);
        Ok(wr)
    }

    fn op_readlink(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let file = self.fid(fid)?.clone();
        let target = self.svc.readlink(&file)?;

        let mut wr = Writer::new();
        wr.put_str(&target);
        Ok(wr)
    }

    fn op_getattr(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let mask = rd.get_u64()?;
        let file = self.fid(fid)?.clone();
        let attr = self.svc.getattr(&file, mask)?;

        let mut wr = Writer::new();
        wr.put_u64(P9_GETATTR_BASIC);
        wr.put_qid(&attr.qid);
        wr.put_u32(attr.mode);
        wr.put_u32(attr.uid);
        wr.put_u32(attr.gid);
        wr.put_u64(attr.nlink);
        wr.put_u64(attr.rdev);
        wr.put_u64(attr.size);
        wr.put_u64(attr.blksize);
        wr.put_u64(attr.blocks);
        wr.put_u64(attr.atime_sec);
        wr.put_u64(attr.atime_nsec);
        wr.put_u64(attr.mtime_sec);
        wr.put_u64(attr.mtime_nsec);
        wr.put_u64(attr.ctime_sec);
        wr.put_u64(attr.ctime_nsec);
        // btime, gen and data_version are not tracked.
        wr.put_u64(0);
        wr.put_u64(0);
        wr.put_u64(0);
        wr.put_u64(0);
        Ok(wr)
    }

    fn op_setattr(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let attr = SetAttr {
            mask: rd.get_u32()?,
            mode: rd.get_u32()?,
            uid: rd.get_u32()?,
            gid: rd.get_u32()?,
            size: rd.get_u64()?,
            atime_sec: rd.get_u64()?,
            atime_nsec: rd.get_u64()?,
            mtime_sec: rd.get_u64()?,
            mtime_nsec: rd.get_u64()?,
        };
        let file = self.fid(fid)?.clone();
        self.svc.setattr(&file, &attr)?;
        Ok(Writer::new())
    }

    fn op_readdir(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let offset = rd.get_u64()?;
        let count = rd.get_u32()?.min(self.iounit());

        let dir = self.fid(fid)?.clone();
        let entries = self.svc.readdir(&dir, offset)?;

        let mut payload = Writer::new();
        for (i, entry) in entries.iter().enumerate() {
            let entry_size = wire::QID_SIZE + 8 + 1 + 2 + entry.name.len();
            if payload.len() + entry_size > count as usize {
                break;
            }
            payload.put_qid(&entry.qid);
            // Cookie of the entry after this one.
            payload.put_u64(offset + i as u64 + 1);
            payload.put_u8(entry.kind);
            payload.put_str(&entry.name);
        }

        let mut wr = Writer::new();
        wr.put_u32(payload.len() as u32);
        wr.put_bytes(&payload.into_vec());
        Ok(wr)
    }

    fn op_fsync(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let file = self.fid(fid)?.clone();
        self.svc.fsync(&file)?;
        Ok(Writer::new())
    }

    fn op_lock(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let lock = Lock {
            kind: rd.get_u8()?,
            flags: rd.get_u32()?,
            start: rd.get_u64()?,
            length: rd.get_u64()?,
            proc_id: rd.get_u32()?,
            client_id: rd.get_str()?,
        };
        let file = self.fid(fid)?.clone();
        let status = self.svc.lock(&file, &lock)?;

        let mut wr = Writer::new();
        wr.put_u8(status);
        Ok(wr)
    }

    fn op_getlock(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let lock = Lock {
            kind: rd.get_u8()?,
            flags: 0,
            start: rd.get_u64()?,
            length: rd.get_u64()?,
            proc_id: rd.get_u32()?,
            client_id: rd.get_str()?,
        };
        let file = self.fid(fid)?.clone();
        let reply = self.svc.getlock(&file, &lock)?;

        let mut wr = Writer::new();
        wr.put_u8(reply.kind);
        wr.put_u64(reply.start);
        wr.put_u64(reply.length);
        wr.put_u32(reply.proc_id);
        wr.put_str(&reply.client_id);
        Ok(wr)
    }

    fn op_link(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let dfid = rd.get_u32()?;
        let fid = rd.get_u32()?;
        let name = rd.get_str()?;

        let dir = self.fid(dfid)?.clone();
        let target = self.fid(fid)?.clone();
        self.svc.link(&dir, &target, &name)?;
        Ok(Writer::new())
    }

    fn op_mkdir(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let name = rd.get_str()?;
        let mode = rd.get_u32()?;
        let gid = rd.get_u32()?;

        let dir = self.fid(fid)?.clone();
        let qid = self.svc.mkdir(&dir, &name, mode, gid)?;

        let mut wr = Writer::new();
        wr.put_qid(&qid);
        Ok(wr)
    }

    fn op_renameat(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let oldfid = rd.get_u32()?;
        let oldname = rd.get_str()?;
        let newfid = rd.get_u32()?;
        let newname = rd.get_str()?;

        let olddir = self.fid(oldfid)?.clone();
        let newdir = self.fid(newfid)?.clone();
        self.svc.renameat(&olddir, &oldname, &newdir, &newname)?;
        Ok(Writer::new())
    }

    fn op_unlinkat(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let name = rd.get_str()?;
        let flags = rd.get_u32()?;

        let dir = self.fid(fid)?.clone();
        self.svc.unlinkat(&dir, &name, flags)?;
        Ok(Writer::new())
    }

    fn op_flush(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        // No asynchronous requests exist to cancel.
        let _oldtag = rd.get_u16()?;
        Ok(Writer::new())
    }

    fn op_read(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let offset = rd.get_u64()?;
        let count = rd.get_u32()?.min(self.iounit());

        let file = self.fid(fid)?.clone();
        let mut buf = vec![0u8; count as usize];
        let n = self.svc.read(&file, offset, &mut buf)?;

        let mut wr = Writer::new();
        wr.put_u32(n as u32);
        wr.put_bytes(&buf[..n]);
        Ok(wr)
    }

    fn op_write(&mut self, rd: &mut Reader<'_>) -> FsResult<Writer> {
        let fid = rd.get_u32()?;
        let offset = rd.get_u64()?;
        let count = rd.get_u32()?;
        let data = rd.get_bytes(count as usize)?;

        let file = self.fid(fid)?.clone();
        let n = self.svc.write(&file, offset, data)?;

        let mut wr = Writer::new();
        wr.put_u32(n as u32);
        Ok(wr)
    }

    fn handle_request(&mut self, id: u8, payload: &[u8]) -> FsResult<Writer> {
        let mut rd = Reader::new(payload);
        match id {
            P9_TVERSION => self.op_version(&mut rd),
            P9_TATTACH => self.op_attach(&mut rd),
            P9_TWALK => self.op_walk(&mut rd),
            P9_TCLUNK => self.op_clunk(&mut rd),
            P9_TSTATFS => self.op_statfs(&mut rd),
            P9_TLOPEN => self.op_lopen(&mut rd),
            P9_TLCREATE => self.op_lcreate(&mut rd),
            P9_TSYMLINK => self.op_symlink(&mut rd),
            P9_TMKNOD => self.op_mknod(&mut rd),
            P9_TREADLINK => self.op_readlink(&mut rd),
            P9_TGETATTR => self.op_getattr(&mut rd),
            P9_TSETATTR => self.op_setattr(&mut rd),
            P9_TXATTRWALK => Err(FsError::new(fs::P9_ENOTSUP)),
            P9_TREADDIR => self.op_readdir(&mut rd),
            P9_TFSYNC => self.op_fsync(&mut rd),
            P9_TLOCK => self.op_lock(&mut rd),
            P9_TGETLOCK => self.op_getlock(&mut rd),
            P9_TLINK => self.op_link(&mut rd),
            P9_TMKDIR => self.op_mkdir(&mut rd),
            P9_TRENAMEAT => self.op_renameat(&mut rd),
            P9_TUNLINKAT => self.op_unlinkat(&mut rd),
            P9_TFLUSH => self.op_flush(&mut rd),
            P9_TREAD => self.op_read(&mut rd),
            P9_TWRITE => self.op_write(&mut rd),
            _ => {
                warn!(target: "rvsim_9p", id, "unknown 9p request");
                Err(FsError::new(P9_EPROTO))
            }
        }
    }

    fn send_frame(
        &self,
        ctx: &mut QueueCtx<'_>,
        queue_idx: usize,
        desc_idx: u16,
        id: u8,
        tag: u16,
        payload: &[u8],
    ) {
        let total = FRAME_HEADER_SIZE + payload.len();
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u32).to_le_bytes());
        frame.push(id);
        frame.extend_from_slice(&tag.to_le_bytes());
        frame.extend_from_slice(payload);

        let result = ctx
            .copy_to_queue(queue_idx, desc_idx, 0, &frame)
            .and_then(|()| ctx.consume(queue_idx, desc_idx, total as u32));
        if let Err(err) = result {
            warn!(target: "rvsim_9p", %err, "failed to post 9p reply");
            // Consume with no bytes so the ring keeps moving.
            let _ = ctx.consume(queue_idx, desc_idx, 0);
        }
    }

    fn send_error(
        &self,
        ctx: &mut QueueCtx<'_>,
        queue_idx: usize,
        desc_idx: u16,
        tag: u16,
        err: FsError,
    ) {
        let mut wr = Writer::new();
        wr.put_u32(err.errno);
        self.send_frame(ctx, queue_idx, desc_idx, P9_RLERROR, tag, &wr.into_vec());
    }
}

impl<F: FileService> VirtioDevice for Virtio9p<F> {
    fn device_id(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_9P
    }

    fn device_features(&self) -> u32 {
        VIRTIO_9P_MOUNT_TAG
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
        _write_size: usize,
    ) -> DispatchOutcome {
        // Frames never legitimately exceed the negotiated msize.
        if read_size > self.msize.max(P9_INITIAL_MSIZE) as usize {
            warn!(target: "rvsim_9p", read_size, "oversized 9p request frame");
            self.send_error(ctx, queue_idx, desc_idx, 0, FsError::new(P9_EPROTO));
            return DispatchOutcome::Done;
        }

        let mut frame = vec![0u8; read_size];
        if ctx.copy_from_queue(queue_idx, desc_idx, 0, &mut frame).is_err() {
            warn!(target: "rvsim_9p", "failed to read 9p request frame");
            self.send_error(ctx, queue_idx, desc_idx, 0, FsError::new(P9_EPROTO));
            return DispatchOutcome::Done;
        }

        if frame.len() < FRAME_HEADER_SIZE {
            self.send_error(ctx, queue_idx, desc_idx, 0, FsError::new(P9_EPROTO));
            return DispatchOutcome::Done;
        }
        let size = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        let id = frame[4];
        let tag = u16::from_le_bytes(frame[5..7].try_into().unwrap());
        if size < FRAME_HEADER_SIZE || size > frame.len() {
            self.send_error(ctx, queue_idx, desc_idx, tag, FsError::new(P9_EPROTO));
            return DispatchOutcome::Done;
        }

        trace!(target: "rvsim_9p", id, tag, size, "request");
        match self.handle_request(id, &frame[FRAME_HEADER_SIZE..size]) {
            Ok(reply) => {
                self.send_frame(ctx, queue_idx, desc_idx, id + 1, tag, &reply.into_vec())
            }
            Err(err) => {
                debug!(target: "rvsim_9p", id, tag, errno = err.errno, "request failed");
                self.send_error(ctx, queue_idx, desc_idx, tag, err);
            }
        }
        DispatchOutcome::Done
    }
}
