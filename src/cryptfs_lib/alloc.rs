//! Free-space tracking.
//!
//! Bitmap superblocks are interleaved into the logical address space every
//! `REGION_STRIDE` blocks. Bit `j` of superblock `i` governs logical block
//! `i * REGION_STRIDE + j`; bit 0 is the superblock itself and is always
//! set. Bitmap pages travel through the block cache like any other block,
//! so they share its flush semantics.

use block_dev::BlockDev;
use log::debug;

use crate::cryptfs_lib::desc::{BITMAP_BITS, REGION_STRIDE};
use crate::cryptfs_lib::error::{FsError, Result};
use crate::cryptfs_lib::CryptFS;

/// Logical index of the superblock heading region `region`.
pub fn superblock_id(region: u64) -> u64 {
    region * REGION_STRIDE
}

impl<T: BlockDev> CryptFS<T> {
    /// Logical blocks tracked by the existing bitmaps. One index per
    /// region falls outside every bitmap and is never handed out.
    pub fn total_blocks(&self) -> u64 {
        self.regions * BITMAP_BITS as u64
    }

    fn bitmap_page(&mut self, region: u64) -> Result<&[u8]> {
        let sb = superblock_id(region);
        if matches!(self.page(sb), Err(FsError::CorruptBlock(_))) {
            self.poisoned = true;
        }
        self.page(sb)
    }

    fn bitmap_page_mut(&mut self, region: u64) -> Result<&mut Vec<u8>> {
        let sb = superblock_id(region);
        if matches!(self.page_mut(sb), Err(FsError::CorruptBlock(_))) {
            self.poisoned = true;
        }
        self.page_mut(sb)
    }

    /// Lay out one more region: a fresh superblock (only bit 0 set) plus
    /// room on the backing store for it.
    pub(crate) fn grow_region(&mut self) -> Result<()> {
        let region = self.regions;
        let sb = superblock_id(region);
        if sb.checked_add(REGION_STRIDE).is_none() {
            return Err(FsError::NoSpace);
        }
        self.crypt.extend(sb + 1)?;
        let page = self.fresh_page(sb)?;
        page[0] = 0x01;
        self.regions += 1;
        debug!("grew to {} regions, superblock at {}", self.regions, sb);
        Ok(())
    }

    /// First-fit scan of one bitmap starting at `from_bit`; lowest bit of
    /// the first non-full byte wins.
    fn scan_region(&mut self, region: u64, from_bit: usize) -> Result<Option<usize>> {
        let bitmap = self.bitmap_page(region)?;
        let mut byte = from_bit / 8;
        let mut first_bit = from_bit % 8;
        while byte < bitmap.len() {
            let b = bitmap[byte];
            if b != 0xff {
                for j in first_bit..8 {
                    if (b >> j) & 0x1 == 0 {
                        return Ok(Some(byte * 8 + j));
                    }
                }
            }
            byte += 1;
            first_bit = 0;
        }
        Ok(None)
    }

    /// Allocate one logical block, scanning from the in-memory hint and
    /// extending the volume by a region when every bitmap is full.
    pub fn allocate(&mut self) -> Result<u64> {
        let mut region = self.alloc_hint / REGION_STRIDE;
        let mut from_bit = (self.alloc_hint % REGION_STRIDE) as usize;
        if from_bit >= BITMAP_BITS {
            region += 1;
            from_bit = 0;
        }
        loop {
            if region == self.regions {
                self.grow_region()?;
            }
            if let Some(bit) = self.scan_region(region, from_bit)? {
                let bitmap = self.bitmap_page_mut(region)?;
                bitmap[bit / 8] |= 1u8 << (bit % 8);
                let index = superblock_id(region) + bit as u64;
                self.alloc_hint = index + 1;
                self.crypt.extend(index + 1)?;
                return Ok(index);
            }
            region += 1;
            from_bit = 0;
        }
    }

    /// Return a block to the bitmap and pull the hint back.
    pub fn free(&mut self, index: u64) -> Result<()> {
        let region = index / REGION_STRIDE;
        let bit = (index % REGION_STRIDE) as usize;
        if bit == 0 {
            return Err(FsError::InvalidArgument("cannot free a superblock"));
        }
        if region >= self.regions || bit >= BITMAP_BITS {
            return Err(FsError::InvalidArgument("free of an untracked block"));
        }
        let bitmap = self.bitmap_page_mut(region)?;
        bitmap[bit / 8] &= !(1u8 << (bit % 8));
        self.cache.discard(index);
        if index < self.alloc_hint {
            self.alloc_hint = index;
        }
        Ok(())
    }

    pub fn is_allocated(&mut self, index: u64) -> Result<bool> {
        let region = index / REGION_STRIDE;
        let bit = (index % REGION_STRIDE) as usize;
        if region >= self.regions || bit >= BITMAP_BITS {
            return Ok(false);
        }
        let bitmap = self.bitmap_page(region)?;
        Ok((bitmap[bit / 8] >> (bit % 8)) & 0x1 == 1)
    }

    /// Count free blocks across every bitmap.
    pub fn count_free(&mut self) -> Result<u64> {
        let mut free = 0u64;
        for region in 0..self.regions {
            let bitmap = self.bitmap_page(region)?;
            let used: u32 = bitmap.iter().map(|b| b.count_ones()).sum();
            free += BITMAP_BITS as u64 - used as u64;
        }
        Ok(free)
    }
}
