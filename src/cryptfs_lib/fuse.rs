//! FUSE operations.
//!
//! The bridge keeps an inode-to-path table and forwards every request to
//! the path-resolved operation surface. Inode numbers are header block
//! ids, which makes the root header coincide with `FUSE_ROOT_ID`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::SystemTime;

use block_dev::BlockDev;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT, ENOSYS, ERANGE};
use log::debug;

use crate::cryptfs_lib::desc::{FileKind, InodeAttr, LOGICAL_BLOCK_SIZE, ROOT_HEADER_ID};
use crate::cryptfs_lib::utils::ret;
use crate::cryptfs_lib::{CryptFS, TTL};
use crate::rep;

pub struct FuseBridge<T: BlockDev> {
    fs: CryptFS<T>,
    /// ino -> absolute path inside the volume.
    paths: HashMap<u64, String>,
    mount_time: SystemTime,
}

fn join(parent: &str, name: &OsStr) -> Result<String, c_int> {
    let name = name.to_str().ok_or(EINVAL)?;
    if parent == "/" {
        Ok(format!("/{}", name))
    } else {
        Ok(format!("{}/{}", parent, name))
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

impl<T: BlockDev> FuseBridge<T> {
    pub fn new(fs: CryptFS<T>) -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_HEADER_ID, "/".to_string());
        Self {
            fs,
            paths,
            mount_time: SystemTime::now(),
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.paths.get(&ino).cloned().ok_or(ENOENT)
    }

    /// Synthesise the kernel-facing attributes: 0777, the caller's
    /// uid/gid, the mount time for every timestamp.
    fn to_attr(&self, attr: &InodeAttr, req: &Request<'_>) -> FileAttr {
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            crtime: self.mount_time,
            kind: file_type(attr.kind),
            perm: 0o777,
            nlink: attr.nlink,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: LOGICAL_BLOCK_SIZE as u32,
            flags: 0,
        }
    }

    fn remember(&mut self, ino: u64, path: String) {
        self.paths.insert(ino, path);
    }

    /// Rewrite the table after a rename: the entry itself plus everything
    /// resolved beneath it when a directory moved.
    fn rename_paths(&mut self, src: &str, dst: &str) {
        let prefix = format!("{}/", src);
        for path in self.paths.values_mut() {
            if path.as_str() == src {
                *path = dst.to_string();
            } else if let Some(rest) = path.strip_prefix(&prefix) {
                let moved = format!("{}/{}", dst, rest);
                *path = moved;
            }
        }
    }
}

impl<T: BlockDev> Filesystem for FuseBridge<T> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        ret(self.fs.cfs_init())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.fs.cfs_destroy() {
            log::error!("flush at unmount failed: {}", e);
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let path = match self.path_of(parent).and_then(|p| join(&p, name)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, attr, self.fs.cfs_getattr(&path));
        let fattr = self.to_attr(&attr, req);
        self.remember(attr.ino, path);
        reply.entry(&TTL, &fattr, 0);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, attr, self.fs.cfs_getattr(&path));
        reply.attr(&TTL, &self.to_attr(&attr, req));
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if let Some(size) = size {
            rep!(reply, self.fs.cfs_truncate(&path, fh.unwrap_or(0), size));
        }
        if let Some(mode) = mode {
            rep!(reply, self.fs.cfs_chmod(&path, mode));
        }
        if uid.is_some() || gid.is_some() {
            rep!(reply, self.fs.cfs_chown(&path, uid, gid));
        }
        rep!(reply, attr, self.fs.cfs_getattr(&path));
        reply.attr(&TTL, &self.to_attr(&attr, req));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, target, self.fs.cfs_readlink(&path));
        reply.data(&target);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);
        if mode & libc::S_IFMT != libc::S_IFREG {
            return reply.error(ENOSYS);
        }
        let path = match self.path_of(parent).and_then(|p| join(&p, name)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, attr, self.fs.cfs_mknod(&path));
        let fattr = self.to_attr(&attr, req);
        self.remember(attr.ino, path);
        reply.entry(&TTL, &fattr, 0);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = match self.path_of(parent).and_then(|p| join(&p, name)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, attr, self.fs.cfs_mkdir(&path));
        let fattr = self.to_attr(&attr, req);
        self.remember(attr.ino, path);
        reply.entry(&TTL, &fattr, 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(parent).and_then(|p| join(&p, name)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, self.fs.cfs_unlink(&path));
        self.paths.retain(|_, p| p != &path);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(parent).and_then(|p| join(&p, name)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, self.fs.cfs_rmdir(&path));
        self.paths.retain(|_, p| p != &path);
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.path_of(parent).and_then(|p| join(&p, name)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let target = match link.to_str() {
            Some(t) => t,
            None => return reply.error(EINVAL),
        };
        rep!(reply, attr, self.fs.cfs_symlink(&path, target));
        let fattr = self.to_attr(&attr, req);
        self.remember(attr.ino, path);
        reply.entry(&TTL, &fattr, 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let src = match self.path_of(parent).and_then(|p| join(&p, name)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let dst = match self.path_of(newparent).and_then(|p| join(&p, newname)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, self.fs.cfs_rename(&src, &dst, flags));
        self.rename_paths(&src, &dst);
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, fh, self.fs.cfs_open(&path));
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, offset={}, size={})", ino, offset, size);
        if offset < 0 {
            return reply.error(EINVAL);
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(
            reply,
            data,
            self.fs.cfs_read(&path, fh, offset as u64, size as u64)
        );
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, offset={}, len={})", ino, offset, data.len());
        if offset < 0 {
            return reply.error(EINVAL);
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, written, self.fs.cfs_write(&path, fh, offset as u64, data));
        reply.written(written as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        rep!(reply, self.fs.cfs_flush());
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        rep!(reply, self.fs.cfs_release(fh));
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        rep!(reply, self.fs.cfs_fsync());
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, fh, self.fs.cfs_opendir(&path));
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, entries, self.fs.cfs_readdir(&path));
        for (i, (name, kind, child)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*child, (i + 1) as i64, file_type(*kind), name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        rep!(reply, self.fs.cfs_releasedir(fh));
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        rep!(reply, st, self.fs.cfs_statfs());
        reply.statfs(st.blocks, st.bfree, st.bfree, 0, 0, st.bsize, st.namemax, st.bsize);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let name = name.to_string_lossy();
        rep!(reply, self.fs.cfs_setxattr(&path, name.as_bytes(), value, flags));
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let name = name.to_string_lossy();
        rep!(reply, value, self.fs.cfs_getxattr(&path, name.as_bytes()));
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() <= size as usize {
            reply.data(&value);
        } else {
            reply.error(ERANGE);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, names, self.fs.cfs_listxattr(&path));
        let mut packed = Vec::new();
        for name in names {
            packed.extend_from_slice(&name);
            packed.push(0);
        }
        if size == 0 {
            reply.size(packed.len() as u32);
        } else if packed.len() <= size as usize {
            reply.data(&packed);
        } else {
            reply.error(ERANGE);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let name = name.to_string_lossy();
        rep!(reply, self.fs.cfs_removexattr(&path, name.as_bytes()));
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        // permissions are synthesised as 0777
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, self.fs.cfs_getattr(&path));
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?})", parent, name);
        let path = match self.path_of(parent).and_then(|p| join(&p, name)) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        rep!(reply, out, self.fs.cfs_create(&path));
        let (fh, attr) = out;
        let fattr = self.to_attr(&attr, req);
        self.remember(attr.ino, path);
        reply.created(&TTL, &fattr, 0, fh, 0);
    }
}
