//! File-service interface behind the 9P device, plus an in-memory
//! implementation.
//!
//! The device model resolves FIDs to `FileService::File` handles and calls
//! one method per protocol operation. Errors travel as Linux errno values
//! and become RLERROR replies. A host-directory service is the embedder's
//! concern; [`MemFs`] serves tests and RAM-backed guests.

use std::collections::HashMap;

use thiserror::Error;

use super::wire::Qid;

pub const P9_EPERM: u32 = 1;
pub const P9_ENOENT: u32 = 2;
pub const P9_EIO: u32 = 5;
pub const P9_EEXIST: u32 = 17;
pub const P9_ENOTDIR: u32 = 20;
pub const P9_EISDIR: u32 = 21;
pub const P9_EINVAL: u32 = 22;
pub const P9_ENOTEMPTY: u32 = 39;
pub const P9_EPROTO: u32 = 71;
pub const P9_ENOTSUP: u32 = 95;

/// Qid type bits.
pub const QT_FILE: u8 = 0x00;
pub const QT_SYMLINK: u8 = 0x02;
pub const QT_DIR: u8 = 0x80;

/// `setattr` valid-mask bits.
pub const SETATTR_MODE: u32 = 1 << 0;
pub const SETATTR_UID: u32 = 1 << 1;
pub const SETATTR_GID: u32 = 1 << 2;
pub const SETATTR_SIZE: u32 = 1 << 3;
pub const SETATTR_ATIME: u32 = 1 << 4;
pub const SETATTR_MTIME: u32 = 1 << 5;

/// `lock`/`getlock` type values.
pub const LOCK_TYPE_RDLCK: u8 = 0;
pub const LOCK_TYPE_WRLCK: u8 = 1;
pub const LOCK_TYPE_UNLCK: u8 = 2;

/// `lock` status values.
pub const LOCK_SUCCESS: u8 = 0;
pub const LOCK_BLOCKED: u8 = 1;
pub const LOCK_ERROR: u8 = 2;

/// `unlinkat` flag requesting directory removal.
pub const AT_REMOVEDIR: u32 = 0x200;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

const O_TRUNC: u32 = 0o1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("errno {errno}")]
pub struct FsError {
    pub errno: u32,
}

impl FsError {
    pub const fn new(errno: u32) -> Self {
        Self { errno }
    }
}

impl From<super::wire::WireError> for FsError {
    fn from(_: super::wire::WireError) -> Self {
        FsError::new(P9_EPROTO)
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Attributes returned by `getattr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAttr {
    pub qid: Qid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
}

/// Attribute changes requested by `setattr`; `mask` selects applied fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mask: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub qid: Qid,
    pub kind: u8,
    pub name: String,
}

/// POSIX advisory lock description carried by `lock`/`getlock`.
#[derive(Debug, Clone)]
pub struct Lock {
    pub kind: u8,
    pub flags: u32,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

/// The filesystem behind a 9P device.
///
/// `File` is the service's opaque handle; the device owns the FID table
/// mapping guest FIDs to handles and clones handles as `walk` forks them.
pub trait FileService {
    type File: Clone;

    fn attach(&mut self, uid: u32, uname: &str, aname: &str) -> FsResult<(Self::File, Qid)>;

    /// Resolve one path component relative to `file` (`.` and `..` included).
    fn walk(&mut self, file: &Self::File, name: &str) -> FsResult<(Self::File, Qid)>;

    fn open(&mut self, file: &Self::File, flags: u32) -> FsResult<Qid>;

    /// Create and open `name` under the directory `file`. The returned
    /// handle replaces the directory handle on the caller's FID.
    fn create(
        &mut self,
        file: &Self::File,
        name: &str,
        flags: u32,
        mode: u32,
        gid: u32,
    ) -> FsResult<(Self::File, Qid)>;

    fn mkdir(&mut self, dir: &Self::File, name: &str, mode: u32, gid: u32) -> FsResult<Qid>;

    fn symlink(&mut self, dir: &Self::File, name: &str, target: &str, gid: u32) -> FsResult<Qid>;

    fn mknod(
        &mut self,
        dir: &Self::File,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> FsResult<Qid>;

    fn link(&mut self, dir: &Self::File, target: &Self::File, name: &str) -> FsResult<()>;

    fn readlink(&mut self, file: &Self::File) -> FsResult<String>;

    fn getattr(&mut self, file: &Self::File, mask: u64) -> FsResult<FileAttr>;

    fn setattr(&mut self, file: &Self::File, attr: &SetAttr) -> FsResult<()>;

    fn read(&mut self, file: &Self::File, offset: u64, buf: &mut [u8]) -> FsResult<usize>;

    fn write(&mut self, file: &Self::File, offset: u64, data: &[u8]) -> FsResult<usize>;

    /// Directory entries starting at index `offset` (`.` and `..` first).
    fn readdir(&mut self, dir: &Self::File, offset: u64) -> FsResult<Vec<DirEntry>>;

    fn fsync(&mut self, _file: &Self::File) -> FsResult<()> {
        Ok(())
    }

    fn lock(&mut self, _file: &Self::File, _lock: &Lock) -> FsResult<u8> {
        Ok(LOCK_SUCCESS)
    }

    fn getlock(&mut self, _file: &Self::File, lock: &Lock) -> FsResult<Lock> {
        // No lock tracking: report the range unlocked.
        Ok(Lock {
            kind: LOCK_TYPE_UNLCK,
            ..lock.clone()
        })
    }

    fn renameat(
        &mut self,
        olddir: &Self::File,
        oldname: &str,
        newdir: &Self::File,
        newname: &str,
    ) -> FsResult<()>;

    fn unlinkat(&mut self, dir: &Self::File, name: &str, flags: u32) -> FsResult<()>;

    fn statfs(&mut self) -> FsResult<StatFs>;

    /// Release a handle unbound by `clunk` (or displaced by a rebind).
    fn clunk(&mut self, _file: Self::File) {}
}

#[derive(Debug, Clone)]
enum NodeContent {
    File(Vec<u8>),
    Dir(Vec<DirSlot>),
    Symlink(String),
}

#[derive(Debug, Clone)]
struct DirSlot {
    name: String,
    ino: u64,
}

#[derive(Debug, Clone)]
struct Node {
    parent: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u64,
    rdev: u64,
    atime_sec: u64,
    atime_nsec: u64,
    mtime_sec: u64,
    mtime_nsec: u64,
    content: NodeContent,
}

impl Node {
    fn qid_kind(&self) -> u8 {
        match self.content {
            NodeContent::Dir(_) => QT_DIR,
            NodeContent::Symlink(_) => QT_SYMLINK,
            NodeContent::File(_) => QT_FILE,
        }
    }

    fn size(&self) -> u64 {
        match &self.content {
            NodeContent::File(data) => data.len() as u64,
            NodeContent::Symlink(target) => target.len() as u64,
            NodeContent::Dir(_) => 0,
        }
    }
}

const ROOT_INO: u64 = 1;

/// In-memory filesystem tree keyed by inode number.
pub struct MemFs {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                parent: ROOT_INO,
                mode: S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                nlink: 2,
                rdev: 0,
                atime_sec: 0,
                atime_nsec: 0,
                mtime_sec: 0,
                mtime_nsec: 0,
                content: NodeContent::Dir(Vec::new()),
            },
        );
        Self {
            nodes,
            next_ino: ROOT_INO + 1,
        }
    }

    pub fn root(&self) -> u64 {
        ROOT_INO
    }

    fn node(&self, ino: u64) -> FsResult<&Node> {
        self.nodes.get(&ino).ok_or(FsError::new(P9_ENOENT))
    }

    fn node_mut(&mut self, ino: u64) -> FsResult<&mut Node> {
        self.nodes.get_mut(&ino).ok_or(FsError::new(P9_ENOENT))
    }

    fn qid(&self, ino: u64) -> FsResult<Qid> {
        Ok(Qid {
            kind: self.node(ino)?.qid_kind(),
            version: 0,
            path: ino,
        })
    }

    fn dir_entries(&self, ino: u64) -> FsResult<&Vec<DirSlot>> {
        match &self.node(ino)?.content {
            NodeContent::Dir(entries) => Ok(entries),
            _ => Err(FsError::new(P9_ENOTDIR)),
        }
    }

    fn dir_entries_mut(&mut self, ino: u64) -> FsResult<&mut Vec<DirSlot>> {
        match &mut self.node_mut(ino)?.content {
            NodeContent::Dir(entries) => Ok(entries),
            _ => Err(FsError::new(P9_ENOTDIR)),
        }
    }

    fn lookup(&self, dir: u64, name: &str) -> FsResult<u64> {
        self.dir_entries(dir)?
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.ino)
            .ok_or(FsError::new(P9_ENOENT))
    }

    fn insert_node(&mut self, dir: u64, name: &str, node: Node) -> FsResult<u64> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::new(P9_EINVAL));
        }
        // Validate the parent before the node enters the table.
        if self.dir_entries(dir)?.iter().any(|slot| slot.name == name) {
            return Err(FsError::new(P9_EEXIST));
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        self.dir_entries_mut(dir)?.push(DirSlot {
            name: name.to_string(),
            ino,
        });
        Ok(ino)
    }

    fn new_node(&self, parent: u64, mode: u32, gid: u32, content: NodeContent) -> Node {
        Node {
            parent,
            mode,
            uid: 0,
            gid,
            nlink: 1,
            rdev: 0,
            atime_sec: 0,
            atime_nsec: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
            content,
        }
    }

    /// Test and embedding helper: create a file under `dir`.
    pub fn add_file(&mut self, dir: u64, name: &str, data: &[u8]) -> FsResult<u64> {
        let node = self.new_node(dir, S_IFREG | 0o644, 0, NodeContent::File(data.to_vec()));
        self.insert_node(dir, name, node)
    }

    /// Test and embedding helper: create a directory under `dir`.
    pub fn add_dir(&mut self, dir: u64, name: &str) -> FsResult<u64> {
        let node = self.new_node(dir, S_IFDIR | 0o755, 0, NodeContent::Dir(Vec::new()));
        let ino = self.insert_node(dir, name, node)?;
        self.node_mut(ino)?.nlink = 2;
        Ok(ino)
    }
}

impl FileService for MemFs {
    type File = u64;

    fn attach(&mut self, _uid: u32, _uname: &str, _aname: &str) -> FsResult<(u64, Qid)> {
        Ok((ROOT_INO, self.qid(ROOT_INO)?))
    }

    fn walk(&mut self, file: &u64, name: &str) -> FsResult<(u64, Qid)> {
        let node = self.node(*file)?;
        if !matches!(node.content, NodeContent::Dir(_)) {
            return Err(FsError::new(P9_ENOTDIR));
        }
        let ino = match name {
            "" | "." => *file,
            ".." => node.parent,
            _ => self.lookup(*file, name)?,
        };
        Ok((ino, self.qid(ino)?))
    }

    fn open(&mut self, file: &u64, flags: u32) -> FsResult<Qid> {
        if flags & O_TRUNC != 0 {
            if let NodeContent::File(data) = &mut self.node_mut(*file)?.content {
                data.clear();
            }
        }
        self.qid(*file)
    }

    fn create(
        &mut self,
        file: &u64,
        name: &str,
        _flags: u32,
        mode: u32,
        gid: u32,
    ) -> FsResult<(u64, Qid)> {
        let node = self.new_node(
            *file,
            S_IFREG | (mode & !S_IFMT),
            gid,
            NodeContent::File(Vec::new()),
        );
        let ino = self.insert_node(*file, name, node)?;
        Ok((ino, self.qid(ino)?))
    }

    fn mkdir(&mut self, dir: &u64, name: &str, mode: u32, gid: u32) -> FsResult<Qid> {
        let node = self.new_node(
            *dir,
            S_IFDIR | (mode & !S_IFMT),
            gid,
            NodeContent::Dir(Vec::new()),
        );
        let ino = self.insert_node(*dir, name, node)?;
        self.node_mut(ino)?.nlink = 2;
        self.qid(ino)
    }

    fn symlink(&mut self, dir: &u64, name: &str, target: &str, gid: u32) -> FsResult<Qid> {
        let node = self.new_node(
            *dir,
            S_IFLNK | 0o777,
            gid,
            NodeContent::Symlink(target.to_string()),
        );
        let ino = self.insert_node(*dir, name, node)?;
        self.qid(ino)
    }

    fn mknod(
        &mut self,
        dir: &u64,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> FsResult<Qid> {
        let mut node = self.new_node(*dir, mode, gid, NodeContent::File(Vec::new()));
        node.rdev = (u64::from(major) << 8) | u64::from(minor);
        let ino = self.insert_node(*dir, name, node)?;
        self.qid(ino)
    }

    fn link(&mut self, dir: &u64, target: &u64, name: &str) -> FsResult<()> {
        let target_ino = *target;
        if matches!(self.node(target_ino)?.content, NodeContent::Dir(_)) {
            return Err(FsError::new(P9_EPERM));
        }
        if name.is_empty() || name.contains('/') {
            return Err(FsError::new(P9_EINVAL));
        }
        if self.lookup(*dir, name).is_ok() {
            return Err(FsError::new(P9_EEXIST));
        }
        self.dir_entries_mut(*dir)?.push(DirSlot {
            name: name.to_string(),
            ino: target_ino,
        });
        self.node_mut(target_ino)?.nlink += 1;
        Ok(())
    }

    fn readlink(&mut self, file: &u64) -> FsResult<String> {
        match &self.node(*file)?.content {
            NodeContent::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::new(P9_EINVAL)),
        }
    }

    fn getattr(&mut self, file: &u64, _mask: u64) -> FsResult<FileAttr> {
        let qid = self.qid(*file)?;
        let node = self.node(*file)?;
        let size = node.size();
        Ok(FileAttr {
            qid,
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            nlink: node.nlink,
            rdev: node.rdev,
            size,
            blksize: 4096,
            blocks: size.div_ceil(512),
            atime_sec: node.atime_sec,
            atime_nsec: node.atime_nsec,
            mtime_sec: node.mtime_sec,
            mtime_nsec: node.mtime_nsec,
            ctime_sec: node.mtime_sec,
            ctime_nsec: node.mtime_nsec,
        })
    }

    fn setattr(&mut self, file: &u64, attr: &SetAttr) -> FsResult<()> {
        if attr.mask & SETATTR_SIZE != 0 {
            let size: usize = attr
                .size
                .try_into()
                .map_err(|_| FsError::new(P9_EINVAL))?;
            match &mut self.node_mut(*file)?.content {
                NodeContent::File(data) => data.resize(size, 0),
                _ => return Err(FsError::new(P9_EINVAL)),
            }
        }
        let node = self.node_mut(*file)?;
        if attr.mask & SETATTR_MODE != 0 {
            node.mode = (node.mode & S_IFMT) | (attr.mode & !S_IFMT);
        }
        if attr.mask & SETATTR_UID != 0 {
            node.uid = attr.uid;
        }
        if attr.mask & SETATTR_GID != 0 {
            node.gid = attr.gid;
        }
        if attr.mask & SETATTR_ATIME != 0 {
            node.atime_sec = attr.atime_sec;
            node.atime_nsec = attr.atime_nsec;
        }
        if attr.mask & SETATTR_MTIME != 0 {
            node.mtime_sec = attr.mtime_sec;
            node.mtime_nsec = attr.mtime_nsec;
        }
        Ok(())
    }

    fn read(&mut self, file: &u64, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        match &self.node(*file)?.content {
            NodeContent::File(data) => {
                let start = usize::try_from(offset)
                    .unwrap_or(usize::MAX)
                    .min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            NodeContent::Dir(_) => Err(FsError::new(P9_EISDIR)),
            NodeContent::Symlink(_) => Err(FsError::new(P9_EINVAL)),
        }
    }

    fn write(&mut self, file: &u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        match &mut self.node_mut(*file)?.content {
            NodeContent::File(content) => {
                let start = usize::try_from(offset).map_err(|_| FsError::new(P9_EINVAL))?;
                let end = start
                    .checked_add(data.len())
                    .ok_or(FsError::new(P9_EINVAL))?;
                if end > content.len() {
                    content.resize(end, 0);
                }
                content[start..end].copy_from_slice(data);
                Ok(data.len())
            }
            NodeContent::Dir(_) => Err(FsError::new(P9_EISDIR)),
            NodeContent::Symlink(_) => Err(FsError::new(P9_EINVAL)),
        }
    }

    fn readdir(&mut self, dir: &u64, offset: u64) -> FsResult<Vec<DirEntry>> {
        let parent = self.node(*dir)?.parent;
        let slots = self.dir_entries(*dir)?;

        let mut all = Vec::with_capacity(slots.len() + 2);
        all.push(DirEntry {
            qid: self.qid(*dir)?,
            kind: QT_DIR,
            name: ".".to_string(),
        });
        all.push(DirEntry {
            qid: self.qid(parent)?,
            kind: QT_DIR,
            name: "..".to_string(),
        });
        for slot in self.dir_entries(*dir)? {
            let qid = self.qid(slot.ino)?;
            all.push(DirEntry {
                qid,
                kind: qid.kind,
                name: slot.name.clone(),
            });
        }

        let skip = usize::try_from(offset).unwrap_or(usize::MAX).min(all.len());
        Ok(all.split_off(skip))
    }

    fn renameat(&mut self, olddir: &u64, oldname: &str, newdir: &u64, newname: &str) -> FsResult<()> {
        let ino = self.lookup(*olddir, oldname)?;
        if newname.is_empty() || newname.contains('/') {
            return Err(FsError::new(P9_EINVAL));
        }

        // rename(2) semantics: silently replace an existing target entry.
        if let Ok(existing) = self.lookup(*newdir, newname) {
            if existing != ino {
                self.unlinkat(newdir, newname, 0)?;
            }
        }

        let entries = self.dir_entries_mut(*olddir)?;
        entries.retain(|slot| slot.name != oldname);

        self.dir_entries_mut(*newdir)?.push(DirSlot {
            name: newname.to_string(),
            ino,
        });
        self.node_mut(ino)?.parent = *newdir;
        Ok(())
    }

    fn unlinkat(&mut self, dir: &u64, name: &str, flags: u32) -> FsResult<()> {
        let ino = self.lookup(*dir, name)?;
        let is_dir = matches!(self.node(ino)?.content, NodeContent::Dir(_));
        if is_dir {
            if !self.dir_entries(ino)?.is_empty() {
                return Err(FsError::new(P9_ENOTEMPTY));
            }
        } else if flags & AT_REMOVEDIR != 0 {
            return Err(FsError::new(P9_ENOTDIR));
        }

        self.dir_entries_mut(*dir)?.retain(|slot| slot.name != name);

        let node = self.node_mut(ino)?;
        node.nlink = node.nlink.saturating_sub(if is_dir { 2 } else { 1 });
        if node.nlink == 0 || is_dir {
            self.nodes.remove(&ino);
        }
        Ok(())
    }

    fn statfs(&mut self) -> FsResult<StatFs> {
        Ok(StatFs {
            bsize: 4096,
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: self.nodes.len() as u64,
            ffree: 1 << 16,
        })
    }
}
