//! Volume lifecycle and the layering glue.
//!
//! A `CryptFS` owns the whole stack for one mounted volume: the crypto
//! block layer over the backing device, the write-back page cache, the
//! bitmap allocator state and the open-handle table. One volume, one
//! object, explicit open/close; there are no process-wide singletons.

use std::collections::HashMap;
use std::time::Duration;

pub use block_dev;
use block_dev::BlockDev;
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes};

pub mod alloc;
pub mod cache;
pub mod crypto;
pub mod desc;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod ops;
pub mod utils;

use self::cache::{BlockCache, DEFAULT_CACHE_CAPACITY};
use self::crypto::{BlockCrypt, KEY_SIZE, SALT_SIZE};
use self::desc::{
    FileHeader, FileKind, VolumeHeader, CIPHER_AES256_GCM, KDF_ARGON2ID, REGION_STRIDE,
    ROOT_HEADER_ID, VOLUME_HEADER_SIZE, VOLUME_MAGIC, VOLUME_VERSION,
};
use self::error::{FsError, Result};

/// Kernel cache validity for attributes and entries.
pub const TTL: Duration = Duration::from_secs(1);

/// Recognized mount-time configuration. Unknown options fail volume open.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub passphrase: String,
    pub cache_capacity: usize,
    pub read_only: bool,
    pub allow_other: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            passphrase: String::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            read_only: false,
            allow_other: false,
        }
    }
}

impl MountOptions {
    /// Parse `-o` style `key[=value]` option strings.
    pub fn parse(passphrase: String, raw: &[String]) -> Result<Self> {
        let mut opts = Self {
            passphrase,
            ..Self::default()
        };
        for item in raw.iter().flat_map(|s| s.split(',')) {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (item, None),
            };
            match key {
                "passphrase" => {
                    opts.passphrase = value
                        .ok_or(FsError::InvalidArgument("passphrase needs a value"))?
                        .to_string();
                }
                "cache_capacity" => {
                    let v = value.ok_or(FsError::InvalidArgument("cache_capacity needs a value"))?;
                    opts.cache_capacity = v
                        .parse::<u32>()
                        .map_err(|_| FsError::InvalidArgument("cache_capacity must be a number"))?
                        as usize;
                }
                "read_only" | "ro" => opts.read_only = true,
                "rw" => opts.read_only = false,
                "allow_other" => opts.allow_other = true,
                _ => return Err(FsError::UnknownOption(item.to_string())),
            }
        }
        Ok(opts)
    }
}

pub(crate) struct OpenHandle {
    pub header: u64,
    pub stale: bool,
}

/// One mounted (or about to be mounted) volume.
pub struct CryptFS<T: BlockDev> {
    pub(crate) crypt: BlockCrypt<T>,
    pub(crate) cache: BlockCache,
    /// Number of superblock regions currently laid out.
    pub(crate) regions: u64,
    /// First logical index worth scanning for a free bit.
    pub(crate) alloc_hint: u64,
    pub(crate) read_only: bool,
    pub(crate) poisoned: bool,
    pub(crate) handles: HashMap<u64, OpenHandle>,
    pub(crate) next_fh: u64,
}

impl<T: BlockDev> CryptFS<T> {
    /// Format a fresh volume on `dev` and leave it open.
    pub fn create(mut dev: T, opts: &MountOptions) -> Result<Self> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut master = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut master);
        let kek = crypto::derive_kek(
            &opts.passphrase,
            &salt,
            crypto::DEFAULT_KDF_M_COST,
            crypto::DEFAULT_KDF_T_COST,
            crypto::DEFAULT_KDF_P_COST,
        )?;
        let (key_iv, key_wrapped) = crypto::wrap_master_key(&kek, &master)?;

        let header = VolumeHeader {
            magic: VOLUME_MAGIC,
            version: U16::new(VOLUME_VERSION),
            cipher: U16::new(CIPHER_AES256_GCM),
            kdf: U16::new(KDF_ARGON2ID),
            _pad: [0u8; 2],
            kdf_m_cost: U32::new(crypto::DEFAULT_KDF_M_COST),
            kdf_t_cost: U32::new(crypto::DEFAULT_KDF_T_COST),
            kdf_p_cost: U32::new(crypto::DEFAULT_KDF_P_COST),
            salt,
            key_iv,
            key_wrapped,
        };
        let mut block = vec![0u8; VOLUME_HEADER_SIZE];
        block[..header.as_bytes().len()].copy_from_slice(header.as_bytes());
        dev.write_at(&block, 0)?;

        let mut vol = Self {
            crypt: BlockCrypt::new(dev, &master),
            cache: BlockCache::new(opts.cache_capacity),
            regions: 0,
            alloc_hint: 0,
            read_only: false,
            poisoned: false,
            handles: HashMap::new(),
            next_fh: 1,
        };
        vol.grow_region()?;
        let root = vol.allocate()?;
        debug_assert_eq!(root, ROOT_HEADER_ID);
        vol.cache.new_page(&mut vol.crypt, root)?;
        vol.write_header(root, &FileHeader::new(FileKind::Directory))?;
        vol.flush()?;
        vol.read_only = opts.read_only;
        info!("formatted volume: {} blocks tracked", vol.total_blocks());
        Ok(vol)
    }

    /// Open an existing volume: load the volume header, unwrap the master
    /// key, size the allocator and verify the root header.
    pub fn open(mut dev: T, opts: &MountOptions) -> Result<Self> {
        let mut raw = vec![0u8; VOLUME_HEADER_SIZE];
        let got = dev.read_at(&mut raw, 0)?;
        if got < VOLUME_HEADER_SIZE {
            return Err(FsError::BadVolume("backing store too small"));
        }
        let header =
            VolumeHeader::read_from_prefix(&raw[..]).ok_or(FsError::BadVolume("unreadable header"))?;
        if !header.magic_matched() {
            return Err(FsError::BadVolume("bad magic"));
        }
        if header.version.get() != VOLUME_VERSION {
            return Err(FsError::BadVolume("unsupported version"));
        }
        if header.cipher.get() != CIPHER_AES256_GCM || header.kdf.get() != KDF_ARGON2ID {
            return Err(FsError::BadVolume("unsupported cipher or KDF"));
        }

        let kek = crypto::derive_kek(
            &opts.passphrase,
            &header.salt,
            header.kdf_m_cost.get(),
            header.kdf_t_cost.get(),
            header.kdf_p_cost.get(),
        )?;
        let master = crypto::unwrap_master_key(&kek, &header.key_iv, &header.key_wrapped)?;

        let mut crypt = BlockCrypt::new(dev, &master);
        let raw_blocks = crypt.block_count()?;
        let regions = (raw_blocks.max(1) + REGION_STRIDE - 1) / REGION_STRIDE;
        let mut vol = Self {
            crypt,
            cache: BlockCache::new(opts.cache_capacity),
            regions: regions.max(1),
            alloc_hint: 0,
            read_only: opts.read_only,
            poisoned: false,
            handles: HashMap::new(),
            next_fh: 1,
        };
        let root = vol.read_header(ROOT_HEADER_ID)?;
        if root.kind(ROOT_HEADER_ID)? != FileKind::Directory {
            return Err(FsError::BadVolume("root header is not a directory"));
        }
        debug!(
            "opened volume: {} regions, {} blocks tracked",
            vol.regions,
            vol.total_blocks()
        );
        Ok(vol)
    }

    /// Flush every dirty page (ascending) and sync the backing store.
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush(&mut self.crypt)?;
        self.crypt.sync()?;
        Ok(())
    }

    /// Flush and tear the volume down.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /*
     * Cached page plumbing shared by the layers above.
     */

    pub(crate) fn page(&mut self, id: u64) -> Result<&[u8]> {
        self.cache.get(&mut self.crypt, id)
    }

    pub(crate) fn page_mut(&mut self, id: u64) -> Result<&mut Vec<u8>> {
        self.cache.get_mut(&mut self.crypt, id)
    }

    pub(crate) fn fresh_page(&mut self, id: u64) -> Result<&mut Vec<u8>> {
        self.cache.new_page(&mut self.crypt, id)
    }

    /// Read the fixed prefix of a file header block. Corruption of the
    /// root header poisons the volume.
    pub(crate) fn read_header(&mut self, id: u64) -> Result<FileHeader> {
        let res = self
            .page(id)
            .and_then(|p| FileHeader::read_from_prefix(p).ok_or(FsError::CorruptBlock(id)));
        if let Err(FsError::CorruptBlock(_)) = res {
            if id == ROOT_HEADER_ID {
                warn!("root header failed authentication, poisoning volume");
                self.poisoned = true;
            }
        }
        res
    }

    pub(crate) fn write_header(&mut self, id: u64, header: &FileHeader) -> Result<()> {
        let page = self.page_mut(id)?;
        page[..header.as_bytes().len()].copy_from_slice(header.as_bytes());
        Ok(())
    }

    pub(crate) fn guard_live(&self) -> Result<()> {
        if self.poisoned {
            Err(FsError::Poisoned)
        } else {
            Ok(())
        }
    }

    pub(crate) fn guard_writable(&self) -> Result<()> {
        if self.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl<T: BlockDev> Drop for CryptFS<T> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("flush on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_option_parsing() {
        let opts = MountOptions::parse(
            "pw".into(),
            &["cache_capacity=64,ro".into(), "allow_other".into()],
        )
        .unwrap();
        assert_eq!(opts.cache_capacity, 64);
        assert!(opts.read_only);
        assert!(opts.allow_other);
        assert_eq!(opts.passphrase, "pw");

        let opts = MountOptions::parse("a".into(), &["passphrase=b".into()]).unwrap();
        assert_eq!(opts.passphrase, "b");

        assert!(matches!(
            MountOptions::parse("pw".into(), &["nodev".into()]),
            Err(FsError::UnknownOption(_))
        ));
        assert!(MountOptions::parse("pw".into(), &["cache_capacity=x".into()]).is_err());
    }
}
