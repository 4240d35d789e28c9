//! Path resolution and the operation surface consumed by the kernel
//! bridge. Every operation takes the volume whole for its duration (the
//! exclusive borrow is the volume lock) and returns `Result<_, FsError>`;
//! the bridge turns errors into negated errnos.

use block_dev::BlockDev;
use log::debug;

use crate::cryptfs_lib::desc::{
    FileKind, InodeAttr, VolumeStat, DIR_ENTRY_SIZE, FILENAME_SIZE, LOGICAL_BLOCK_SIZE,
    ROOT_HEADER_ID,
};
use crate::cryptfs_lib::error::{FsError, Result};
use crate::cryptfs_lib::{CryptFS, OpenHandle};

impl<T: BlockDev> CryptFS<T> {
    /*
     * Path walking
     */

    fn split_path(path: &str) -> Result<Vec<&str>> {
        let mut comps = Vec::new();
        for c in path.split('/') {
            if c.is_empty() || c == "." {
                continue;
            }
            if c.len() > FILENAME_SIZE {
                return Err(FsError::NameTooLong);
            }
            if c.contains('\0') {
                return Err(FsError::InvalidArgument("NUL in path component"));
            }
            comps.push(c);
        }
        Ok(comps)
    }

    fn walk(&mut self, comps: &[&str]) -> Result<u64> {
        let mut cur = ROOT_HEADER_ID;
        for &c in comps {
            let h = self.read_header(cur)?;
            if h.kind(cur)? != FileKind::Directory {
                return Err(FsError::NotADirectory);
            }
            cur = self.dir_lookup(cur, c)?.ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }

    /// Resolve a full path to a header id. The empty path and `/` resolve
    /// to the root.
    pub fn resolve(&mut self, path: &str) -> Result<u64> {
        let comps = Self::split_path(path)?;
        self.walk(&comps)
    }

    /// Resolve the parent directory of `path`, returning its header id
    /// and the final component.
    fn resolve_parent<'p>(&mut self, path: &'p str) -> Result<(u64, &'p str)> {
        let mut comps = Self::split_path(path)?;
        let name = comps
            .pop()
            .ok_or(FsError::InvalidArgument("operation on the root"))?;
        let parent = self.walk(&comps)?;
        let h = self.read_header(parent)?;
        if h.kind(parent)? != FileKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok((parent, name))
    }

    fn attr_of(&mut self, id: u64) -> Result<InodeAttr> {
        let h = self.read_header(id)?;
        let kind = h.kind(id)?;
        let nlink = match kind {
            FileKind::Directory => {
                2 + (h.file_size.get() / DIR_ENTRY_SIZE as u64) as u32
            }
            _ => 1,
        };
        Ok(InodeAttr {
            ino: id,
            kind,
            size: h.file_size.get(),
            blocks: self.file_block_count(id)?,
            nlink,
        })
    }

    fn handle_target(&self, fh: u64) -> Result<Option<u64>> {
        match self.handles.get(&fh) {
            Some(h) if h.stale => Err(FsError::NotFound),
            Some(h) => Ok(Some(h.header)),
            None => Ok(None),
        }
    }

    fn new_handle(&mut self, header: u64) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(
            fh,
            OpenHandle {
                header,
                stale: false,
            },
        );
        fh
    }

    /// A deleted file vanishes immediately; handles that still point at it
    /// start failing.
    fn stale_handles(&mut self, header: u64) {
        for h in self.handles.values_mut() {
            if h.header == header {
                h.stale = true;
            }
        }
    }

    /*
     * Operation surface
     */

    pub fn cfs_init(&mut self) -> Result<()> {
        self.guard_live()?;
        let root = self.read_header(ROOT_HEADER_ID)?;
        if root.kind(ROOT_HEADER_ID)? != FileKind::Directory {
            return Err(FsError::BadVolume("root header is not a directory"));
        }
        Ok(())
    }

    pub fn cfs_destroy(&mut self) -> Result<()> {
        self.flush()
    }

    pub fn cfs_getattr(&mut self, path: &str) -> Result<InodeAttr> {
        self.guard_live()?;
        let id = self.resolve(path)?;
        self.attr_of(id)
    }

    pub fn cfs_readlink(&mut self, path: &str) -> Result<Vec<u8>> {
        self.guard_live()?;
        let id = self.resolve(path)?;
        let h = self.read_header(id)?;
        if h.kind(id)? != FileKind::Symlink {
            return Err(FsError::InvalidArgument("not a symlink"));
        }
        self.read_bytes(id, 0, h.file_size.get())
    }

    fn create_at(&mut self, path: &str, kind: FileKind) -> Result<u64> {
        self.guard_live()?;
        self.guard_writable()?;
        let (parent, name) = self.resolve_parent(path)?;
        if self.dir_lookup(parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let id = self.create_file(kind)?;
        self.dir_insert(parent, name, id)?;
        debug!("create_at: {} -> header {} ({:?})", path, id, kind);
        Ok(id)
    }

    pub fn cfs_mknod(&mut self, path: &str) -> Result<InodeAttr> {
        let id = self.create_at(path, FileKind::Regular)?;
        self.attr_of(id)
    }

    pub fn cfs_mkdir(&mut self, path: &str) -> Result<InodeAttr> {
        let id = self.create_at(path, FileKind::Directory)?;
        self.attr_of(id)
    }

    pub fn cfs_symlink(&mut self, path: &str, target: &str) -> Result<InodeAttr> {
        let id = self.create_at(path, FileKind::Symlink)?;
        self.write_bytes(id, 0, target.as_bytes())?;
        self.attr_of(id)
    }

    /// `create` returns an open handle along with the attributes.
    pub fn cfs_create(&mut self, path: &str) -> Result<(u64, InodeAttr)> {
        let id = self.create_at(path, FileKind::Regular)?;
        let fh = self.new_handle(id);
        Ok((fh, self.attr_of(id)?))
    }

    pub fn cfs_unlink(&mut self, path: &str) -> Result<()> {
        self.guard_live()?;
        self.guard_writable()?;
        let (parent, name) = self.resolve_parent(path)?;
        let id = self.dir_lookup(parent, name)?.ok_or(FsError::NotFound)?;
        let h = self.read_header(id)?;
        if h.kind(id)? == FileKind::Directory {
            return Err(FsError::IsADirectory);
        }
        self.dir_remove(parent, name)?;
        self.delete_file(id)?;
        self.stale_handles(id);
        Ok(())
    }

    pub fn cfs_rmdir(&mut self, path: &str) -> Result<()> {
        self.guard_live()?;
        self.guard_writable()?;
        let (parent, name) = self.resolve_parent(path)?;
        let id = self.dir_lookup(parent, name)?.ok_or(FsError::NotFound)?;
        let h = self.read_header(id)?;
        if h.kind(id)? != FileKind::Directory {
            return Err(FsError::NotADirectory);
        }
        if !self.dir_is_empty(id)? {
            return Err(FsError::NotEmpty);
        }
        self.dir_remove(parent, name)?;
        self.delete_file(id)?;
        self.stale_handles(id);
        Ok(())
    }

    /// Atomic at the directory-entry level; both directories are updated
    /// under the same exclusive borrow of the volume.
    pub fn cfs_rename(&mut self, src: &str, dst: &str, flags: u32) -> Result<()> {
        self.guard_live()?;
        self.guard_writable()?;
        let (sp, sname) = self.resolve_parent(src)?;
        let sname = sname.to_string();
        let (dp, dname) = self.resolve_parent(dst)?;
        let dname = dname.to_string();
        let sid = self.dir_lookup(sp, &sname)?.ok_or(FsError::NotFound)?;
        let existing = self.dir_lookup(dp, &dname)?;

        if flags & libc::RENAME_EXCHANGE as u32 != 0 {
            let did = existing.ok_or(FsError::NotFound)?;
            self.dir_set_child(sp, &sname, did)?;
            self.dir_set_child(dp, &dname, sid)?;
            return Ok(());
        }

        if let Some(did) = existing {
            if flags & libc::RENAME_NOREPLACE as u32 != 0 {
                return Err(FsError::AlreadyExists);
            }
            if sp == dp && sname == dname {
                return Ok(());
            }
            let sh = self.read_header(sid)?;
            let dh = self.read_header(did)?;
            let skind = sh.kind(sid)?;
            match dh.kind(did)? {
                FileKind::Directory => {
                    if !self.dir_is_empty(did)? {
                        return Err(FsError::NotEmpty);
                    }
                    if skind != FileKind::Directory {
                        return Err(FsError::IsADirectory);
                    }
                }
                _ => {
                    if skind == FileKind::Directory {
                        return Err(FsError::NotADirectory);
                    }
                }
            }
            self.dir_remove(dp, &dname)?;
            self.delete_file(did)?;
            self.stale_handles(did);
        }

        self.dir_remove(sp, &sname)?;
        self.dir_insert(dp, &dname, sid)?;
        debug!("rename: {} -> {}", src, dst);
        Ok(())
    }

    /// Permission bits are not persisted; accepted so callers don't fail.
    pub fn cfs_chmod(&mut self, path: &str, _mode: u32) -> Result<InodeAttr> {
        self.guard_live()?;
        self.guard_writable()?;
        let id = self.resolve(path)?;
        self.attr_of(id)
    }

    /// Ownership is synthesised from the caller; accepted and ignored.
    pub fn cfs_chown(&mut self, path: &str, _uid: Option<u32>, _gid: Option<u32>) -> Result<InodeAttr> {
        self.guard_live()?;
        self.guard_writable()?;
        let id = self.resolve(path)?;
        self.attr_of(id)
    }

    pub fn cfs_truncate(&mut self, path: &str, fh: u64, size: u64) -> Result<()> {
        self.guard_live()?;
        self.guard_writable()?;
        let id = match self.handle_target(fh)? {
            Some(id) => id,
            None => self.resolve(path)?,
        };
        let h = self.read_header(id)?;
        if h.kind(id)? == FileKind::Directory {
            return Err(FsError::IsADirectory);
        }
        self.truncate_file(id, size)
    }

    pub fn cfs_open(&mut self, path: &str) -> Result<u64> {
        self.guard_live()?;
        let id = self.resolve(path)?;
        let h = self.read_header(id)?;
        if h.kind(id)? == FileKind::Directory {
            return Err(FsError::IsADirectory);
        }
        Ok(self.new_handle(id))
    }

    pub fn cfs_opendir(&mut self, path: &str) -> Result<u64> {
        self.guard_live()?;
        let id = self.resolve(path)?;
        let h = self.read_header(id)?;
        if h.kind(id)? != FileKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(self.new_handle(id))
    }

    pub fn cfs_read(&mut self, path: &str, fh: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.guard_live()?;
        let id = match self.handle_target(fh)? {
            Some(id) => id,
            None => self.resolve(path)?,
        };
        self.read_bytes(id, offset, len)
    }

    pub fn cfs_write(&mut self, path: &str, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        self.guard_live()?;
        self.guard_writable()?;
        let id = match self.handle_target(fh)? {
            Some(id) => id,
            None => self.resolve(path)?,
        };
        self.write_bytes(id, offset, data)
    }

    pub fn cfs_statfs(&mut self) -> Result<VolumeStat> {
        self.guard_live()?;
        Ok(VolumeStat {
            blocks: self.total_blocks(),
            bfree: self.count_free()?,
            bsize: LOGICAL_BLOCK_SIZE as u32,
            namemax: FILENAME_SIZE as u32,
        })
    }

    pub fn cfs_flush(&mut self) -> Result<()> {
        self.guard_live()?;
        self.flush()
    }

    pub fn cfs_fsync(&mut self) -> Result<()> {
        self.guard_live()?;
        self.flush()
    }

    pub fn cfs_release(&mut self, fh: u64) -> Result<()> {
        self.handles.remove(&fh);
        Ok(())
    }

    pub fn cfs_releasedir(&mut self, fh: u64) -> Result<()> {
        self.handles.remove(&fh);
        Ok(())
    }

    /// Directory listing with `.` and `..` synthesised up front.
    pub fn cfs_readdir(&mut self, path: &str) -> Result<Vec<(String, FileKind, u64)>> {
        self.guard_live()?;
        let id = self.resolve(path)?;
        let h = self.read_header(id)?;
        if h.kind(id)? != FileKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let parent = {
            let mut comps = Self::split_path(path)?;
            comps.pop();
            self.walk(&comps)?
        };
        let mut out = vec![
            (".".to_string(), FileKind::Directory, id),
            ("..".to_string(), FileKind::Directory, parent),
        ];
        for (name, child) in self.dir_entries(id)? {
            let ch = self.read_header(child)?;
            out.push((name, ch.kind(child)?, child));
        }
        Ok(out)
    }

    pub fn cfs_setxattr(&mut self, path: &str, name: &[u8], value: &[u8], flags: i32) -> Result<()> {
        self.guard_live()?;
        self.guard_writable()?;
        let id = self.resolve(path)?;
        self.xattr_set(id, name, value, flags)
    }

    pub fn cfs_getxattr(&mut self, path: &str, name: &[u8]) -> Result<Vec<u8>> {
        self.guard_live()?;
        let id = self.resolve(path)?;
        self.xattr_get(id, name)
    }

    pub fn cfs_listxattr(&mut self, path: &str) -> Result<Vec<Vec<u8>>> {
        self.guard_live()?;
        let id = self.resolve(path)?;
        self.xattr_list(id)
    }

    pub fn cfs_removexattr(&mut self, path: &str, name: &[u8]) -> Result<()> {
        self.guard_live()?;
        self.guard_writable()?;
        let id = self.resolve(path)?;
        self.xattr_remove(id, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptfs_lib::MountOptions;
    use block_dev::MemBlockDev;

    fn test_volume() -> CryptFS<MemBlockDev> {
        let opts = MountOptions {
            passphrase: "test".into(),
            ..Default::default()
        };
        CryptFS::create(MemBlockDev::new(), &opts).unwrap()
    }

    #[test]
    fn resolve_and_getattr() {
        let mut vol = test_volume();
        assert_eq!(vol.resolve("/").unwrap(), ROOT_HEADER_ID);
        assert_eq!(vol.resolve("").unwrap(), ROOT_HEADER_ID);
        let attr = vol.cfs_getattr("/").unwrap();
        assert_eq!(attr.kind, FileKind::Directory);
        assert_eq!(attr.nlink, 2);
        assert!(matches!(vol.cfs_getattr("/nope"), Err(FsError::NotFound)));
    }

    #[test]
    fn create_write_read() {
        let mut vol = test_volume();
        let (fh, attr) = vol.cfs_create("/hello.txt").unwrap();
        assert_eq!(attr.kind, FileKind::Regular);
        vol.cfs_write("/hello.txt", fh, 0, b"hello").unwrap();
        assert_eq!(vol.cfs_read("/hello.txt", fh, 0, 5).unwrap(), b"hello");
        assert_eq!(vol.cfs_getattr("/hello.txt").unwrap().size, 5);
        assert!(matches!(
            vol.cfs_create("/hello.txt"),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn lookup_through_missing_intermediate() {
        let mut vol = test_volume();
        vol.cfs_create("/f").unwrap();
        // a regular file in the middle of a path is ENOTDIR
        assert!(matches!(
            vol.cfs_getattr("/f/x"),
            Err(FsError::NotADirectory)
        ));
        assert!(matches!(vol.cfs_getattr("/a/b"), Err(FsError::NotFound)));
    }

    #[test]
    fn mkdir_rmdir_not_empty() {
        let mut vol = test_volume();
        let free0 = vol.count_free().unwrap();
        vol.cfs_mkdir("/a").unwrap();
        vol.cfs_mkdir("/a/b").unwrap();
        assert!(matches!(vol.cfs_rmdir("/a"), Err(FsError::NotEmpty)));
        vol.cfs_rmdir("/a/b").unwrap();
        vol.cfs_rmdir("/a").unwrap();
        assert_eq!(vol.count_free().unwrap(), free0);
    }

    #[test]
    fn unlink_kind_checks() {
        let mut vol = test_volume();
        vol.cfs_mkdir("/d").unwrap();
        vol.cfs_create("/f").unwrap();
        assert!(matches!(vol.cfs_unlink("/d"), Err(FsError::IsADirectory)));
        assert!(matches!(vol.cfs_rmdir("/f"), Err(FsError::NotADirectory)));
        vol.cfs_unlink("/f").unwrap();
        assert!(matches!(vol.cfs_getattr("/f"), Err(FsError::NotFound)));
    }

    #[test]
    fn stale_handle_after_unlink() {
        let mut vol = test_volume();
        let (fh, _) = vol.cfs_create("/victim").unwrap();
        vol.cfs_write("/victim", fh, 0, b"data").unwrap();
        vol.cfs_unlink("/victim").unwrap();
        assert!(matches!(
            vol.cfs_read("/victim", fh, 0, 4),
            Err(FsError::NotFound)
        ));
        vol.cfs_release(fh).unwrap();
    }

    #[test]
    fn rename_basic_and_back() {
        let mut vol = test_volume();
        let (fh, _) = vol.cfs_create("/a").unwrap();
        vol.cfs_write("/a", fh, 0, b"payload").unwrap();
        vol.cfs_release(fh).unwrap();
        vol.cfs_mkdir("/sub").unwrap();

        vol.cfs_rename("/a", "/sub/b", 0).unwrap();
        assert!(matches!(vol.cfs_getattr("/a"), Err(FsError::NotFound)));
        assert_eq!(vol.cfs_read("/sub/b", 0, 0, 7).unwrap(), b"payload");

        vol.cfs_rename("/sub/b", "/a", 0).unwrap();
        assert_eq!(vol.cfs_read("/a", 0, 0, 7).unwrap(), b"payload");
        let names: Vec<String> = vol
            .cfs_readdir("/")
            .unwrap()
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();
        // swap-remove reordered the records; contents are what counts
        assert_eq!(names, vec![".", "..", "sub", "a"]);
    }

    #[test]
    fn rename_flags() {
        let mut vol = test_volume();
        vol.cfs_create("/a").unwrap();
        vol.cfs_create("/b").unwrap();
        assert!(matches!(
            vol.cfs_rename("/a", "/b", libc::RENAME_NOREPLACE as u32),
            Err(FsError::AlreadyExists)
        ));

        let a = vol.resolve("/a").unwrap();
        let b = vol.resolve("/b").unwrap();
        vol.cfs_rename("/a", "/b", libc::RENAME_EXCHANGE as u32).unwrap();
        assert_eq!(vol.resolve("/a").unwrap(), b);
        assert_eq!(vol.resolve("/b").unwrap(), a);

        // plain replace deletes the destination
        vol.cfs_rename("/a", "/b", 0).unwrap();
        assert!(matches!(vol.cfs_getattr("/a"), Err(FsError::NotFound)));
        assert_eq!(vol.resolve("/b").unwrap(), b);
    }

    #[test]
    fn rename_onto_directory() {
        let mut vol = test_volume();
        vol.cfs_mkdir("/d").unwrap();
        vol.cfs_mkdir("/d/inner").unwrap();
        vol.cfs_create("/f").unwrap();
        assert!(matches!(
            vol.cfs_rename("/f", "/d", 0),
            Err(FsError::NotEmpty)
        ));
        vol.cfs_rmdir("/d/inner").unwrap();
        assert!(matches!(
            vol.cfs_rename("/f", "/d", 0),
            Err(FsError::IsADirectory)
        ));
        vol.cfs_mkdir("/e").unwrap();
        assert!(matches!(
            vol.cfs_rename("/e", "/f", 0),
            Err(FsError::NotADirectory)
        ));
        // empty dir over empty dir works
        vol.cfs_rename("/e", "/d", 0).unwrap();
        assert!(matches!(vol.cfs_getattr("/e"), Err(FsError::NotFound)));
    }

    #[test]
    fn symlink_roundtrip() {
        let mut vol = test_volume();
        vol.cfs_symlink("/link", "/target/elsewhere").unwrap();
        assert_eq!(
            vol.cfs_readlink("/link").unwrap(),
            b"/target/elsewhere"
        );
        let attr = vol.cfs_getattr("/link").unwrap();
        assert_eq!(attr.kind, FileKind::Symlink);
        vol.cfs_create("/plain").unwrap();
        assert!(vol.cfs_readlink("/plain").is_err());
    }

    #[test]
    fn statfs_shape() {
        let mut vol = test_volume();
        let st = vol.cfs_statfs().unwrap();
        assert_eq!(st.bsize, LOGICAL_BLOCK_SIZE as u32);
        assert_eq!(st.namemax, FILENAME_SIZE as u32);
        assert_eq!(st.blocks, vol.total_blocks());
        assert_eq!(st.bfree, st.blocks - 1 - vol.regions);
    }

    #[test]
    fn readdir_of_fresh_root() {
        let mut vol = test_volume();
        let entries = vol.cfs_readdir("/").unwrap();
        let names: Vec<&str> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, vec![".", ".."]);
        assert_eq!(entries[0].2, ROOT_HEADER_ID);
        assert_eq!(entries[1].2, ROOT_HEADER_ID);
    }

    #[test]
    fn read_only_volume_rejects_mutation() {
        let opts = MountOptions {
            passphrase: "test".into(),
            ..Default::default()
        };
        let mut vol = CryptFS::create(MemBlockDev::new(), &opts).unwrap();
        vol.read_only = true;
        assert!(matches!(vol.cfs_mkdir("/x"), Err(FsError::ReadOnly)));
        assert!(matches!(
            vol.cfs_write("/", 0, 0, b"x"),
            Err(FsError::ReadOnly)
        ));
        // reads still work
        assert!(vol.cfs_readdir("/").is_ok());
    }

    #[test]
    fn name_length_limits() {
        let mut vol = test_volume();
        let ok = "x".repeat(FILENAME_SIZE);
        vol.cfs_create(&format!("/{}", ok)).unwrap();
        let too_long = "x".repeat(FILENAME_SIZE + 1);
        assert!(matches!(
            vol.cfs_create(&format!("/{}", too_long)),
            Err(FsError::NameTooLong)
        ));
    }

    #[test]
    fn truncate_via_surface() {
        let mut vol = test_volume();
        let (fh, _) = vol.cfs_create("/t").unwrap();
        vol.cfs_write("/t", fh, 0, &vec![1u8; 10000]).unwrap();
        vol.cfs_truncate("/t", 0, 100).unwrap();
        assert_eq!(vol.cfs_getattr("/t").unwrap().size, 100);
        assert!(matches!(
            vol.cfs_truncate("/", 0, 0),
            Err(FsError::IsADirectory)
        ));
    }
}
