//! File layer: header and continuation chains, directory records and the
//! extended-attribute stream, all keyed by a file-header block id.
//!
//! Logical file offset `o` maps to slot `o / LOGICAL_BLOCK_SIZE`; the
//! first 32 slots live in the header's direct array, each continuation
//! carries the next 32. A slot id of 0 is a hole and reads as zeros.
//! Chain walks keep a visited set and fail with `CorruptBlock` on a
//! revisited id.

use std::collections::HashSet;

use block_dev::BlockDev;
use log::debug;
use zerocopy::byteorder::U64;
use zerocopy::{AsBytes, FromBytes};

use crate::cryptfs_lib::desc::{
    decode_xattrs, encode_xattrs, Continuation, DirEntryRaw, FileHeader, FileKind,
    DIRECT_SLOTS, DIR_ENTRY_SIZE, LOGICAL_BLOCK_SIZE, XATTR_INLINE_SIZE,
};
use crate::cryptfs_lib::error::{FsError, Result};
use crate::cryptfs_lib::CryptFS;

const LBS: u64 = LOGICAL_BLOCK_SIZE as u64;

/// Payload bytes carried by one xattr overflow block, past its next-id.
const XATTR_OVERFLOW_PAYLOAD: usize = LOGICAL_BLOCK_SIZE - 8;

impl<T: BlockDev> CryptFS<T> {
    pub(crate) fn read_cont(&mut self, id: u64) -> Result<Continuation> {
        let page = self.page(id)?;
        Continuation::read_from_prefix(page).ok_or(FsError::CorruptBlock(id))
    }

    pub(crate) fn write_cont(&mut self, id: u64, cont: &Continuation) -> Result<()> {
        let page = self.page_mut(id)?;
        page[..cont.as_bytes().len()].copy_from_slice(cont.as_bytes());
        Ok(())
    }

    /// Allocate a header block and write an empty header into it.
    pub fn create_file(&mut self, kind: FileKind) -> Result<u64> {
        let id = self.allocate()?;
        self.fresh_page(id)?;
        self.write_header(id, &FileHeader::new(kind))?;
        debug!("create_file: kind {:?} header {}", kind, id);
        Ok(id)
    }

    /// Free every block owned by the file: data slots, continuations,
    /// xattr overflow and finally the header itself.
    pub fn delete_file(&mut self, header_id: u64) -> Result<()> {
        let h = self.read_header(header_id)?;
        for id in self.xattr_chain(&h)? {
            self.free(id)?;
        }
        for slot in h.direct.iter() {
            if slot.get() != 0 {
                self.free(slot.get())?;
            }
        }
        let mut visited = HashSet::new();
        let mut c = h.next_continuation.get();
        while c != 0 {
            if !visited.insert(c) {
                return Err(FsError::CorruptBlock(c));
            }
            let cont = self.read_cont(c)?;
            for slot in cont.direct.iter() {
                if slot.get() != 0 {
                    self.free(slot.get())?;
                }
            }
            let next = cont.next.get();
            self.free(c)?;
            c = next;
        }
        self.free(header_id)?;
        debug!("delete_file: header {} released", header_id);
        Ok(())
    }

    /// Data-block id stored at slot `s`, 0 for holes or past the chain.
    fn slot_block(&mut self, h: &FileHeader, s: usize) -> Result<u64> {
        if s < DIRECT_SLOTS {
            return Ok(h.direct[s].get());
        }
        let want = (s - DIRECT_SLOTS) / DIRECT_SLOTS;
        let mut visited = HashSet::new();
        let mut c = h.next_continuation.get();
        for _ in 0..want {
            if c == 0 {
                return Ok(0);
            }
            if !visited.insert(c) {
                return Err(FsError::CorruptBlock(c));
            }
            c = self.read_cont(c)?.next.get();
        }
        if c == 0 {
            return Ok(0);
        }
        let cont = self.read_cont(c)?;
        Ok(cont.direct[(s - DIRECT_SLOTS) % DIRECT_SLOTS].get())
    }

    /// Data-block id for slot `s`, allocating the block (and any
    /// continuation on the way there) on first write. Updates `h` in
    /// place and persists whatever containers changed.
    fn ensure_slot(&mut self, header_id: u64, h: &mut FileHeader, s: usize) -> Result<u64> {
        if s < DIRECT_SLOTS {
            let id = h.direct[s].get();
            if id != 0 {
                return Ok(id);
            }
            let id = self.allocate()?;
            self.fresh_page(id)?;
            h.direct[s] = U64::new(id);
            self.write_header(header_id, h)?;
            return Ok(id);
        }

        let want = (s - DIRECT_SLOTS) / DIRECT_SLOTS;
        let mut visited = HashSet::new();
        let mut prev = header_id;
        let mut c = h.next_continuation.get();
        let mut i = 0usize;
        loop {
            if c == 0 {
                let nc = self.allocate()?;
                self.fresh_page(nc)?;
                self.write_cont(nc, &Continuation::new(prev))?;
                if prev == header_id {
                    h.next_continuation = U64::new(nc);
                    self.write_header(header_id, h)?;
                } else {
                    let mut p = self.read_cont(prev)?;
                    p.next = U64::new(nc);
                    self.write_cont(prev, &p)?;
                }
                c = nc;
            }
            if i == want {
                break;
            }
            if !visited.insert(c) {
                return Err(FsError::CorruptBlock(c));
            }
            prev = c;
            c = self.read_cont(c)?.next.get();
            i += 1;
        }

        let mut cont = self.read_cont(c)?;
        let idx = (s - DIRECT_SLOTS) % DIRECT_SLOTS;
        let id = cont.direct[idx].get();
        if id != 0 {
            return Ok(id);
        }
        let id = self.allocate()?;
        self.fresh_page(id)?;
        cont.direct[idx] = U64::new(id);
        self.write_cont(c, &cont)?;
        Ok(id)
    }

    /// Read up to `len` bytes at `offset`, clamped to the file size.
    /// Holes read as zeros; a read at or past the end returns nothing.
    pub fn read_bytes(&mut self, header_id: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        let h = self.read_header(header_id)?;
        let size = h.file_size.get();
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = len.min(size - offset) as usize;
        let mut out = vec![0u8; len];
        let mut pos = 0usize;
        let mut off = offset;
        while pos < len {
            let s = (off / LBS) as usize;
            let in_block = (off % LBS) as usize;
            let take = (LOGICAL_BLOCK_SIZE - in_block).min(len - pos);
            let blk = self.slot_block(&h, s)?;
            if blk != 0 {
                let page = self.page(blk)?;
                out[pos..pos + take].copy_from_slice(&page[in_block..in_block + take]);
            }
            pos += take;
            off += take as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, growing the chain as needed. The write is
    /// complete only once the header page is dirty.
    pub fn write_bytes(&mut self, header_id: u64, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut h = self.read_header(header_id)?;
        let mut pos = 0usize;
        let mut off = offset;
        while pos < data.len() {
            let s = (off / LBS) as usize;
            let in_block = (off % LBS) as usize;
            let take = (LOGICAL_BLOCK_SIZE - in_block).min(data.len() - pos);
            let blk = self.ensure_slot(header_id, &mut h, s)?;
            let page = self.page_mut(blk)?;
            page[in_block..in_block + take].copy_from_slice(&data[pos..pos + take]);
            pos += take;
            off += take as u64;
        }
        let end = offset + data.len() as u64;
        if end > h.file_size.get() {
            h.file_size = U64::new(end);
        }
        self.write_header(header_id, &h)?;
        Ok(data.len())
    }

    /// Shrink or grow the file to `new_size`. Shrinking frees every slot
    /// past the new end, unlinks continuations whose whole range is gone
    /// and zero-fills the tail of the last kept block. Growing just moves
    /// the size; the new range reads as zeros until written.
    pub fn truncate_file(&mut self, header_id: u64, new_size: u64) -> Result<()> {
        let mut h = self.read_header(header_id)?;
        let old_size = h.file_size.get();
        if new_size >= old_size {
            if new_size != old_size {
                h.file_size = U64::new(new_size);
                self.write_header(header_id, &h)?;
            }
            return Ok(());
        }

        // load the whole continuation chain up front
        let mut chain: Vec<(u64, Continuation)> = Vec::new();
        let mut visited = HashSet::new();
        let mut c = h.next_continuation.get();
        while c != 0 {
            if !visited.insert(c) {
                return Err(FsError::CorruptBlock(c));
            }
            let cont = self.read_cont(c)?;
            let next = cont.next.get();
            chain.push((c, cont));
            c = next;
        }

        let keep_slots = ((new_size + LBS - 1) / LBS) as usize;
        let total_slots = DIRECT_SLOTS + chain.len() * DIRECT_SLOTS;
        let keep_conts = if keep_slots <= DIRECT_SLOTS {
            0
        } else {
            (keep_slots - DIRECT_SLOTS + DIRECT_SLOTS - 1) / DIRECT_SLOTS
        };

        // zero the retained tail while the chain is still intact
        let tail = (new_size % LBS) as usize;
        if tail != 0 {
            let last = keep_slots - 1;
            let id = if last < DIRECT_SLOTS {
                h.direct[last].get()
            } else {
                chain[(last - DIRECT_SLOTS) / DIRECT_SLOTS]
                    .1
                    .direct[(last - DIRECT_SLOTS) % DIRECT_SLOTS]
                    .get()
            };
            if id != 0 {
                let page = self.page_mut(id)?;
                page[tail..].fill(0);
            }
        }

        // drop data slots past the new end
        for s in keep_slots..total_slots {
            let slot = if s < DIRECT_SLOTS {
                &mut h.direct[s]
            } else {
                &mut chain[(s - DIRECT_SLOTS) / DIRECT_SLOTS]
                    .1
                    .direct[(s - DIRECT_SLOTS) % DIRECT_SLOTS]
            };
            let id = slot.get();
            if id != 0 {
                *slot = U64::new(0);
                self.free(id)?;
            }
        }

        // keep the leading continuations, sever and free the rest
        for (i, (cid, cont)) in chain.iter_mut().enumerate() {
            if i < keep_conts {
                if i == keep_conts - 1 {
                    cont.next = U64::new(0);
                }
                let cont = cont.clone();
                self.write_cont(*cid, &cont)?;
            } else {
                self.free(*cid)?;
            }
        }
        if keep_conts == 0 {
            h.next_continuation = U64::new(0);
        }

        h.file_size = U64::new(new_size);
        self.write_header(header_id, &h)?;
        debug!(
            "truncate_file: header {} {} -> {} bytes, {} slots kept",
            header_id, old_size, new_size, keep_slots
        );
        Ok(())
    }

    /// Every block the file owns: header, continuations, data slots and
    /// xattr overflow.
    pub fn file_block_count(&mut self, header_id: u64) -> Result<u64> {
        let h = self.read_header(header_id)?;
        let mut count = 1u64;
        count += self.xattr_chain(&h)?.len() as u64;
        count += h.direct.iter().filter(|s| s.get() != 0).count() as u64;
        let mut visited = HashSet::new();
        let mut c = h.next_continuation.get();
        while c != 0 {
            if !visited.insert(c) {
                return Err(FsError::CorruptBlock(c));
            }
            let cont = self.read_cont(c)?;
            count += 1;
            count += cont.direct.iter().filter(|s| s.get() != 0).count() as u64;
            c = cont.next.get();
        }
        Ok(count)
    }

    /*
     * Directory encoding
     */

    pub fn dir_entries(&mut self, header_id: u64) -> Result<Vec<(String, u64)>> {
        let h = self.read_header(header_id)?;
        let data = self.read_bytes(header_id, 0, h.file_size.get())?;
        let mut out = Vec::with_capacity(data.len() / DIR_ENTRY_SIZE);
        for rec in data.chunks_exact(DIR_ENTRY_SIZE) {
            let entry = DirEntryRaw::read_from_prefix(rec).ok_or(FsError::CorruptBlock(header_id))?;
            out.push((entry.name(), entry.child.get()));
        }
        Ok(out)
    }

    pub fn dir_lookup(&mut self, header_id: u64, name: &str) -> Result<Option<u64>> {
        let h = self.read_header(header_id)?;
        let data = self.read_bytes(header_id, 0, h.file_size.get())?;
        for rec in data.chunks_exact(DIR_ENTRY_SIZE) {
            let entry = DirEntryRaw::read_from_prefix(rec).ok_or(FsError::CorruptBlock(header_id))?;
            if entry.matches(name) {
                return Ok(Some(entry.child.get()));
            }
        }
        Ok(None)
    }

    /// Append a record; the caller has already ruled out duplicates.
    pub fn dir_insert(&mut self, header_id: u64, name: &str, child: u64) -> Result<()> {
        let entry = DirEntryRaw::new(name, child)?;
        let h = self.read_header(header_id)?;
        self.write_bytes(header_id, h.file_size.get(), entry.as_bytes())?;
        Ok(())
    }

    /// Remove a record by swapping the last record into its place and
    /// truncating. Returns the removed child id.
    pub fn dir_remove(&mut self, header_id: u64, name: &str) -> Result<u64> {
        let h = self.read_header(header_id)?;
        let size = h.file_size.get();
        let data = self.read_bytes(header_id, 0, size)?;
        let count = data.len() / DIR_ENTRY_SIZE;
        let mut found = None;
        for (i, rec) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let entry = DirEntryRaw::read_from_prefix(rec).ok_or(FsError::CorruptBlock(header_id))?;
            if entry.matches(name) {
                found = Some((i, entry.child.get()));
                break;
            }
        }
        let (index, child) = found.ok_or(FsError::NotFound)?;
        if index != count - 1 {
            let last = &data[(count - 1) * DIR_ENTRY_SIZE..count * DIR_ENTRY_SIZE];
            self.write_bytes(header_id, (index * DIR_ENTRY_SIZE) as u64, last)?;
        }
        self.truncate_file(header_id, size - DIR_ENTRY_SIZE as u64)?;
        Ok(child)
    }

    /// Point an existing record at a different child header.
    pub fn dir_set_child(&mut self, header_id: u64, name: &str, child: u64) -> Result<()> {
        let h = self.read_header(header_id)?;
        let data = self.read_bytes(header_id, 0, h.file_size.get())?;
        for (i, rec) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let entry = DirEntryRaw::read_from_prefix(rec).ok_or(FsError::CorruptBlock(header_id))?;
            if entry.matches(name) {
                let off = i * DIR_ENTRY_SIZE + DIR_ENTRY_SIZE - 8;
                self.write_bytes(header_id, off as u64, &child.to_le_bytes())?;
                return Ok(());
            }
        }
        Err(FsError::NotFound)
    }

    pub fn dir_is_empty(&mut self, header_id: u64) -> Result<bool> {
        let h = self.read_header(header_id)?;
        Ok(h.file_size.get() == 0)
    }

    /*
     * Extended attributes
     */

    fn xattr_chain(&mut self, h: &FileHeader) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut visited = HashSet::new();
        let mut x = h.xattr_overflow.get();
        while x != 0 {
            if !visited.insert(x) {
                return Err(FsError::CorruptBlock(x));
            }
            ids.push(x);
            let page = self.page(x)?;
            x = u64::from_le_bytes(page[..8].try_into().expect("8-byte prefix"));
        }
        Ok(ids)
    }

    /// The full xattr byte stream: inline area plus the overflow chain.
    fn xattr_stream(&mut self, h: &FileHeader) -> Result<Vec<u8>> {
        let mut stream = h.xattr_inline.to_vec();
        for id in self.xattr_chain(h)? {
            let page = self.page(id)?;
            stream.extend_from_slice(&page[8..]);
        }
        Ok(stream)
    }

    /// Write the stream back: inline first, the remainder chunked into
    /// overflow blocks which are reused, allocated or freed to fit.
    fn xattr_write_stream(&mut self, header_id: u64, h: &mut FileHeader, bytes: &[u8]) -> Result<()> {
        let n = bytes.len().min(XATTR_INLINE_SIZE);
        let mut inline = [0u8; XATTR_INLINE_SIZE];
        inline[..n].copy_from_slice(&bytes[..n]);
        h.xattr_inline = inline;

        let rest = &bytes[n..];
        let existing = self.xattr_chain(h)?;
        let needed = (rest.len() + XATTR_OVERFLOW_PAYLOAD - 1) / XATTR_OVERFLOW_PAYLOAD;
        let mut ids = Vec::with_capacity(needed);
        for i in 0..needed {
            match existing.get(i) {
                Some(&id) => ids.push(id),
                None => {
                    let id = self.allocate()?;
                    self.fresh_page(id)?;
                    ids.push(id);
                }
            }
        }
        for &id in existing.iter().skip(needed) {
            self.free(id)?;
        }
        for (i, &id) in ids.iter().enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(0);
            let chunk =
                &rest[i * XATTR_OVERFLOW_PAYLOAD..rest.len().min((i + 1) * XATTR_OVERFLOW_PAYLOAD)];
            let page = self.page_mut(id)?;
            page[..8].copy_from_slice(&next.to_le_bytes());
            page[8..8 + chunk.len()].copy_from_slice(chunk);
            page[8 + chunk.len()..].fill(0);
        }
        h.xattr_overflow = U64::new(ids.first().copied().unwrap_or(0));
        self.write_header(header_id, h)?;
        Ok(())
    }

    pub fn xattr_get(&mut self, header_id: u64, name: &[u8]) -> Result<Vec<u8>> {
        let h = self.read_header(header_id)?;
        let stream = self.xattr_stream(&h)?;
        decode_xattrs(&stream)
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or(FsError::NotFound)
    }

    pub fn xattr_list(&mut self, header_id: u64) -> Result<Vec<Vec<u8>>> {
        let h = self.read_header(header_id)?;
        let stream = self.xattr_stream(&h)?;
        Ok(decode_xattrs(&stream).into_iter().map(|(n, _)| n).collect())
    }

    pub fn xattr_set(
        &mut self,
        header_id: u64,
        name: &[u8],
        value: &[u8],
        flags: i32,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument("empty xattr name"));
        }
        if name.len() > u8::MAX as usize {
            return Err(FsError::NameTooLong);
        }
        if value.len() > u16::MAX as usize {
            return Err(FsError::InvalidArgument("xattr value too large"));
        }
        let mut h = self.read_header(header_id)?;
        let stream = self.xattr_stream(&h)?;
        let mut entries = decode_xattrs(&stream);
        let existing = entries.iter().position(|(n, _)| n == name);
        if flags == libc::XATTR_CREATE && existing.is_some() {
            return Err(FsError::AlreadyExists);
        }
        if flags == libc::XATTR_REPLACE && existing.is_none() {
            return Err(FsError::NotFound);
        }
        match existing {
            Some(i) => entries[i].1 = value.to_vec(),
            None => entries.push((name.to_vec(), value.to_vec())),
        }
        let encoded = encode_xattrs(&entries);
        self.xattr_write_stream(header_id, &mut h, &encoded)
    }

    pub fn xattr_remove(&mut self, header_id: u64, name: &[u8]) -> Result<()> {
        let mut h = self.read_header(header_id)?;
        let stream = self.xattr_stream(&h)?;
        let mut entries = decode_xattrs(&stream);
        let before = entries.len();
        entries.retain(|(n, _)| n != name);
        if entries.len() == before {
            return Err(FsError::NotFound);
        }
        let encoded = encode_xattrs(&entries);
        self.xattr_write_stream(header_id, &mut h, &encoded)
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
    fn write_read_roundtrip() {
        let mut vol = test_volume();
        let f = vol.create_file(FileKind::Regular).unwrap();
        vol.write_bytes(f, 0, b"hello").unwrap();
        assert_eq!(vol.read_bytes(f, 0, 5).unwrap(), b"hello");
        assert_eq!(vol.read_header(f).unwrap().file_size.get(), 5);
        // read past the end is empty, a long read clamps
        assert!(vol.read_bytes(f, 5, 10).unwrap().is_empty());
        assert_eq!(vol.read_bytes(f, 3, 100).unwrap(), b"lo");
    }

    #[test]
    fn spill_into_first_continuation() {
        let mut vol = test_volume();
        let f = vol.create_file(FileKind::Regular).unwrap();
        let data = vec![0x61u8; DIRECT_SLOTS * LOGICAL_BLOCK_SIZE + 1];
        vol.write_bytes(f, 0, &data).unwrap();
        let h = vol.read_header(f).unwrap();
        assert!(h.direct.iter().all(|s| s.get() != 0));
        let c = h.next_continuation.get();
        assert_ne!(c, 0);
        let cont = vol.read_cont(c).unwrap();
        assert_ne!(cont.direct[0].get(), 0);
        assert_eq!(cont.prev.get(), f);
        assert!(cont.direct[1..].iter().all(|s| s.get() == 0));
        assert_eq!(vol.read_bytes(f, 0, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn holes_read_as_zeros() {
        let mut vol = test_volume();
        let f = vol.create_file(FileKind::Regular).unwrap();
        let far = 10 * LBS + 7;
        vol.write_bytes(f, far, b"tail").unwrap();
        let head = vol.read_bytes(f, 0, LBS).unwrap();
        assert!(head.iter().all(|&b| b == 0));
        assert_eq!(vol.read_bytes(f, far, 4).unwrap(), b"tail");
        // only the written slot holds a data block
        let h = vol.read_header(f).unwrap();
        assert_eq!(h.direct.iter().filter(|s| s.get() != 0).count(), 1);
    }

    #[test]
    fn truncate_shrinks_and_zero_fills() {
        let mut vol = test_volume();
        let f = vol.create_file(FileKind::Regular).unwrap();
        let data: Vec<u8> = (0..3 * LOGICAL_BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        vol.write_bytes(f, 0, &data).unwrap();
        let cut = LBS + 100;
        vol.truncate_file(f, cut).unwrap();
        assert_eq!(vol.read_header(f).unwrap().file_size.get(), cut);
        assert_eq!(
            vol.read_bytes(f, 0, cut).unwrap(),
            &data[..cut as usize]
        );
        // regrowing exposes zeros where the old bytes used to be
        vol.truncate_file(f, 2 * LBS).unwrap();
        let reread = vol.read_bytes(f, cut, LBS).unwrap();
        assert!(reread.iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_releases_continuations() {
        let mut vol = test_volume();
        let free0 = vol.count_free().unwrap();
        let f = vol.create_file(FileKind::Regular).unwrap();
        let data = vec![7u8; (DIRECT_SLOTS + 40) * LOGICAL_BLOCK_SIZE];
        vol.write_bytes(f, 0, &data).unwrap();
        vol.truncate_file(f, LBS).unwrap();
        let h = vol.read_header(f).unwrap();
        assert_eq!(h.next_continuation.get(), 0);
        assert_eq!(h.direct.iter().filter(|s| s.get() != 0).count(), 1);
        vol.delete_file(f).unwrap();
        assert_eq!(vol.count_free().unwrap(), free0);
    }

    #[test]
    fn create_then_delete_restores_free_count() {
        let mut vol = test_volume();
        let before = vol.count_free().unwrap();
        let f = vol.create_file(FileKind::Regular).unwrap();
        vol.write_bytes(f, 0, &vec![1u8; 100 * LOGICAL_BLOCK_SIZE]).unwrap();
        vol.xattr_set(f, b"user.note", &vec![9u8; 2000], 0).unwrap();
        vol.delete_file(f).unwrap();
        assert_eq!(vol.count_free().unwrap(), before);
    }

    #[test]
    fn slot_census_matches_file_size() {
        let mut vol = test_volume();
        let f = vol.create_file(FileKind::Regular).unwrap();
        let len = 5 * LOGICAL_BLOCK_SIZE + 123;
        vol.write_bytes(f, 0, &vec![3u8; len]).unwrap();
        let h = vol.read_header(f).unwrap();
        let slots = h.direct.iter().filter(|s| s.get() != 0).count();
        assert_eq!(slots as u64, (len as u64 + LBS - 1) / LBS);
    }

    #[test]
    fn dir_insert_lookup_remove() {
        let mut vol = test_volume();
        let d = vol.create_file(FileKind::Directory).unwrap();
        let a = vol.create_file(FileKind::Regular).unwrap();
        let b = vol.create_file(FileKind::Regular).unwrap();
        vol.dir_insert(d, "a.txt", a).unwrap();
        vol.dir_insert(d, "b.txt", b).unwrap();
        assert_eq!(vol.dir_lookup(d, "a.txt").unwrap(), Some(a));
        assert_eq!(vol.dir_lookup(d, "missing").unwrap(), None);
        assert!(!vol.dir_is_empty(d).unwrap());

        // removing the first entry swaps the last one into its place
        assert_eq!(vol.dir_remove(d, "a.txt").unwrap(), a);
        let entries = vol.dir_entries(d).unwrap();
        assert_eq!(entries, vec![("b.txt".to_string(), b)]);
        assert_eq!(vol.dir_remove(d, "b.txt").unwrap(), b);
        assert!(vol.dir_is_empty(d).unwrap());
        assert!(matches!(vol.dir_remove(d, "b.txt"), Err(FsError::NotFound)));
    }

    #[test]
    fn xattr_inline_and_overflow() {
        let mut vol = test_volume();
        let f = vol.create_file(FileKind::Regular).unwrap();
        vol.xattr_set(f, b"user.small", b"v", 0).unwrap();
        assert_eq!(vol.xattr_get(f, b"user.small").unwrap(), b"v");
        // no overflow yet
        assert_eq!(vol.read_header(f).unwrap().xattr_overflow.get(), 0);

        // spill past the inline area, then across one overflow block
        let big = vec![0xbcu8; 3 * XATTR_OVERFLOW_PAYLOAD / 2];
        vol.xattr_set(f, b"user.big", &big, 0).unwrap();
        assert_ne!(vol.read_header(f).unwrap().xattr_overflow.get(), 0);
        assert_eq!(vol.xattr_get(f, b"user.big").unwrap(), big);
        assert_eq!(vol.xattr_get(f, b"user.small").unwrap(), b"v");

        let names = vol.xattr_list(f).unwrap();
        assert_eq!(names, vec![b"user.small".to_vec(), b"user.big".to_vec()]);

        // shrinking back frees the overflow chain
        vol.xattr_remove(f, b"user.big").unwrap();
        assert_eq!(vol.read_header(f).unwrap().xattr_overflow.get(), 0);
        assert!(matches!(
            vol.xattr_get(f, b"user.big"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn xattr_flags() {
        let mut vol = test_volume();
        let f = vol.create_file(FileKind::Regular).unwrap();
        vol.xattr_set(f, b"user.k", b"1", libc::XATTR_CREATE).unwrap();
        assert!(matches!(
            vol.xattr_set(f, b"user.k", b"2", libc::XATTR_CREATE),
            Err(FsError::AlreadyExists)
        ));
        vol.xattr_set(f, b"user.k", b"2", libc::XATTR_REPLACE).unwrap();
        assert_eq!(vol.xattr_get(f, b"user.k").unwrap(), b"2");
        assert!(matches!(
            vol.xattr_set(f, b"user.x", b"v", libc::XATTR_REPLACE),
            Err(FsError::NotFound)
        ));
        vol.xattr_remove(f, b"user.k").unwrap();
        assert!(matches!(
            vol.xattr_remove(f, b"user.k"),
            Err(FsError::NotFound)
        ));
    }
}
