//! Bounded write-back cache of decrypted logical blocks.
//!
//! Pages are keyed by logical index. A dirty page is written back through
//! the crypto layer when it is evicted, flushed explicitly, or the volume
//! is closed. A failed write-back leaves the page dirty and in the cache.

use std::num::NonZeroUsize;

use block_dev::BlockDev;
use log::trace;
use lru::LruCache;

use crate::cryptfs_lib::crypto::BlockCrypt;
use crate::cryptfs_lib::desc::LOGICAL_BLOCK_SIZE;
use crate::cryptfs_lib::error::Result;

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

struct Page {
    data: Vec<u8>,
    dirty: bool,
}

pub struct BlockCache {
    pages: LruCache<u64, Page>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Write back the least-recently-used dirty pages until there is room
    /// for one more page. The page stays cached (and dirty) if its
    /// write-back fails.
    fn make_room<T: BlockDev>(&mut self, crypt: &mut BlockCrypt<T>) -> Result<()> {
        while self.pages.len() >= self.pages.cap().get() {
            {
                let (&id, page) = self.pages.peek_lru().expect("cache full but empty");
                if page.dirty {
                    trace!("evict dirty page {}", id);
                    crypt.write_block(id, &page.data)?;
                }
            }
            self.pages.pop_lru();
        }
        Ok(())
    }

    /// Borrow a page, decrypting on miss.
    pub fn get<'a, T: BlockDev>(
        &'a mut self,
        crypt: &mut BlockCrypt<T>,
        id: u64,
    ) -> Result<&'a [u8]> {
        if !self.pages.contains(&id) {
            let data = crypt.read_block(id)?;
            self.make_room(crypt)?;
            self.pages.put(id, Page { data, dirty: false });
        }
        Ok(&self.pages.get(&id).expect("page just inserted").data)
    }

    /// Borrow a page mutably; the page is marked dirty.
    pub fn get_mut<'a, T: BlockDev>(
        &'a mut self,
        crypt: &mut BlockCrypt<T>,
        id: u64,
    ) -> Result<&'a mut Vec<u8>> {
        if !self.pages.contains(&id) {
            let data = crypt.read_block(id)?;
            self.make_room(crypt)?;
            self.pages.put(id, Page { data, dirty: false });
        }
        let page = self.pages.get_mut(&id).expect("page just inserted");
        page.dirty = true;
        Ok(&mut page.data)
    }

    /// Install a zeroed dirty page for a block whose previous on-disk
    /// content is dead (freshly allocated), skipping the decrypt.
    pub fn new_page<'a, T: BlockDev>(
        &'a mut self,
        crypt: &mut BlockCrypt<T>,
        id: u64,
    ) -> Result<&'a mut Vec<u8>> {
        if !self.pages.contains(&id) {
            self.make_room(crypt)?;
        }
        self.pages.put(
            id,
            Page {
                data: vec![0u8; LOGICAL_BLOCK_SIZE],
                dirty: true,
            },
        );
        Ok(&mut self.pages.get_mut(&id).expect("page just inserted").data)
    }

    pub fn mark_dirty(&mut self, id: u64) {
        if let Some(page) = self.pages.peek_mut(&id) {
            page.dirty = true;
        }
    }

    /// Drop a page without write-back, dirty or not. Used when the block
    /// is freed and its content no longer matters.
    pub fn discard(&mut self, id: u64) {
        self.pages.pop(&id);
    }

    /// Drop a page only if it is clean.
    pub fn drop_clean(&mut self, id: u64) {
        if let Some(page) = self.pages.peek(&id) {
            if !page.dirty {
                self.pages.pop(&id);
            }
        }
    }

    /// Write out every dirty page in ascending index order. Pages stay
    /// cached and are marked clean on success.
    pub fn flush<T: BlockDev>(&mut self, crypt: &mut BlockCrypt<T>) -> Result<()> {
        let mut dirty: Vec<u64> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(&id, _)| id)
            .collect();
        dirty.sort_unstable();
        for id in dirty {
            let page = self.pages.peek(&id).expect("dirty page vanished");
            crypt.write_block(id, &page.data)?;
            if let Some(page) = self.pages.peek_mut(&id) {
                page.dirty = false;
            }
        }
        Ok(())
    }

    /// Write out a single page if it is cached and dirty.
    pub fn flush_one<T: BlockDev>(&mut self, crypt: &mut BlockCrypt<T>, id: u64) -> Result<()> {
        if let Some(page) = self.pages.peek(&id) {
            if page.dirty {
                crypt.write_block(id, &page.data)?;
                if let Some(page) = self.pages.peek_mut(&id) {
                    page.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Resize the cache, writing back whatever no longer fits.
    pub fn set_capacity<T: BlockDev>(
        &mut self,
        crypt: &mut BlockCrypt<T>,
        capacity: usize,
    ) -> Result<()> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        while self.pages.len() > capacity.get() {
            {
                let (&id, page) = self.pages.peek_lru().expect("cache shrink underflow");
                if page.dirty {
                    crypt.write_block(id, &page.data)?;
                }
            }
            self.pages.pop_lru();
        }
        self.pages.resize(capacity);
        Ok(())
    }

    pub fn dirty_count(&self) -> usize {
        self.pages.iter().filter(|(_, p)| p.dirty).count()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptfs_lib::crypto::KEY_SIZE;
    use block_dev::MemBlockDev;

    fn setup() -> (BlockCrypt<MemBlockDev>, BlockCache) {
        let crypt = BlockCrypt::new(MemBlockDev::new(), &[3u8; KEY_SIZE]);
        (crypt, BlockCache::new(4))
    }

    #[test]
    fn miss_reads_through() {
        let (mut crypt, mut cache) = setup();
        crypt.write_block(5, b"five").unwrap();
        let page = cache.get(&mut crypt, 5).unwrap();
        assert_eq!(&page[..4], b"five");
    }

    #[test]
    fn eviction_writes_dirty_pages() {
        let (mut crypt, mut cache) = setup();
        for id in 0..4u64 {
            let page = cache.new_page(&mut crypt, id).unwrap();
            page[0] = id as u8 + 1;
        }
        // pushing a fifth page evicts page 0, which must hit the store
        cache.new_page(&mut crypt, 4).unwrap();
        assert_eq!(cache.len(), 4);
        assert_eq!(crypt.read_block(0).unwrap()[0], 1);
    }

    #[test]
    fn flush_is_ordered_and_keeps_pages() {
        let (mut crypt, mut cache) = setup();
        for id in [3u64, 1, 2] {
            let page = cache.new_page(&mut crypt, id).unwrap();
            page[0] = id as u8;
        }
        assert_eq!(cache.dirty_count(), 3);
        cache.flush(&mut crypt).unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.len(), 3);
        for id in 1..4u64 {
            assert_eq!(crypt.read_block(id).unwrap()[0], id as u8);
        }
    }

    #[test]
    fn discard_skips_write_back() {
        let (mut crypt, mut cache) = setup();
        let page = cache.new_page(&mut crypt, 9).unwrap();
        page[0] = 0xff;
        cache.discard(9);
        assert_eq!(cache.dirty_count(), 0);
        assert!(crypt.read_block(9).is_err());
    }

    #[test]
    fn shrink_writes_back_overflow() {
        let (mut crypt, mut cache) = setup();
        for id in 0..4u64 {
            cache.new_page(&mut crypt, id).unwrap()[0] = 0xaa;
        }
        cache.set_capacity(&mut crypt, 1).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(crypt.read_block(0).unwrap()[0], 0xaa);
    }
}
