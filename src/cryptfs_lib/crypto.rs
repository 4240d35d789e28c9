//! Key derivation and the cryptographic block layer.
//!
//! Logical block `k` lives at byte offset `VOLUME_HEADER_SIZE + k * 4096`
//! as `IV || ciphertext || tag`. Each block is sealed with AES-256-GCM
//! under the master key, a fresh random IV per write, and the block index
//! as associated data, so moving ciphertext between positions is detected
//! the same as flipping bytes in place.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use argon2::{Algorithm, Argon2, Params, Version};
use block_dev::BlockDev;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cryptfs_lib::desc::{
    IV_SIZE, LOGICAL_BLOCK_SIZE, PHYSICAL_BLOCK_SIZE, VOLUME_HEADER_SIZE, VOLUME_MAGIC,
    WRAPPED_KEY_SIZE,
};
use crate::cryptfs_lib::error::{FsError, Result};

/// AES-256-GCM with the 16-byte IV the block format carries.
pub type BlockCipher = AesGcm<Aes256, U16>;

pub const KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 16;

pub const DEFAULT_KDF_M_COST: u32 = 65536;
pub const DEFAULT_KDF_T_COST: u32 = 3;
pub const DEFAULT_KDF_P_COST: u32 = 1;

/// Derive the key-encryption key from a passphrase with Argon2id.
pub fn derive_kek(
    passphrase: &str,
    salt: &[u8],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
) -> Result<[u8; KEY_SIZE]> {
    let params = Params::new(m_cost, t_cost, p_cost, Some(KEY_SIZE))
        .map_err(|_| FsError::BadVolume("unusable KDF parameters"))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut kek = [0u8; KEY_SIZE];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut kek)
        .map_err(|_| FsError::BadVolume("KDF failure"))?;
    Ok(kek)
}

/// Wrap the master key under the KEK. Returns the IV and the wrapped blob.
pub fn wrap_master_key(
    kek: &[u8; KEY_SIZE],
    master: &[u8; KEY_SIZE],
) -> Result<([u8; IV_SIZE], [u8; WRAPPED_KEY_SIZE])> {
    let cipher = BlockCipher::new(GenericArray::from_slice(kek));
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let ct = cipher
        .encrypt(
            GenericArray::from_slice(&iv),
            Payload {
                msg: master,
                aad: &VOLUME_MAGIC,
            },
        )
        .map_err(|_| FsError::BadVolume("master key wrap failed"))?;
    let mut wrapped = [0u8; WRAPPED_KEY_SIZE];
    wrapped.copy_from_slice(&ct);
    Ok((iv, wrapped))
}

/// Unwrap the master key; an authentication failure means the passphrase
/// is wrong (or the header was tampered with, which is indistinguishable).
pub fn unwrap_master_key(
    kek: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    wrapped: &[u8; WRAPPED_KEY_SIZE],
) -> Result<[u8; KEY_SIZE]> {
    let cipher = BlockCipher::new(GenericArray::from_slice(kek));
    let plain = cipher
        .decrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: wrapped,
                aad: &VOLUME_MAGIC,
            },
        )
        .map_err(|_| FsError::BadPassphrase)?;
    let mut master = [0u8; KEY_SIZE];
    master.copy_from_slice(&plain);
    Ok(master)
}

/// Maps logical block indices to authenticated ciphertext on the backing
/// store. Stateless besides the key; allocation lives elsewhere.
pub struct BlockCrypt<T: BlockDev> {
    dev: T,
    cipher: BlockCipher,
}

impl<T: BlockDev> BlockCrypt<T> {
    pub fn new(dev: T, master: &[u8; KEY_SIZE]) -> Self {
        Self {
            dev,
            cipher: BlockCipher::new(GenericArray::from_slice(master)),
        }
    }

    fn offset(index: u64) -> u64 {
        VOLUME_HEADER_SIZE as u64 + index * PHYSICAL_BLOCK_SIZE as u64
    }

    /// Decrypt and authenticate one logical block.
    pub fn read_block(&mut self, index: u64) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; PHYSICAL_BLOCK_SIZE];
        let got = self.dev.read_at(&mut raw, Self::offset(index))?;
        if got < PHYSICAL_BLOCK_SIZE {
            return Err(FsError::ShortRead { block: index, got });
        }
        let (iv, sealed) = raw.split_at(IV_SIZE);
        self.cipher
            .decrypt(
                GenericArray::from_slice(iv),
                Payload {
                    msg: sealed,
                    aad: &index.to_le_bytes(),
                },
            )
            .map_err(|_| FsError::CorruptBlock(index))
    }

    /// Encrypt one logical block under a fresh IV and write the physical
    /// block with a single positional write. Shorter plaintexts are
    /// zero-padded to the logical block size.
    pub fn write_block(&mut self, index: u64, plain: &[u8]) -> Result<()> {
        debug_assert!(plain.len() <= LOGICAL_BLOCK_SIZE);
        let mut padded;
        let msg: &[u8] = if plain.len() == LOGICAL_BLOCK_SIZE {
            plain
        } else {
            padded = vec![0u8; LOGICAL_BLOCK_SIZE];
            padded[..plain.len()].copy_from_slice(plain);
            &padded
        };
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let sealed = self
            .cipher
            .encrypt(
                GenericArray::from_slice(&iv),
                Payload {
                    msg,
                    aad: &index.to_le_bytes(),
                },
            )
            .map_err(|_| FsError::CorruptBlock(index))?;
        let mut raw = Vec::with_capacity(PHYSICAL_BLOCK_SIZE);
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(&sealed);
        let put = self.dev.write_at(&raw, Self::offset(index))?;
        if put < PHYSICAL_BLOCK_SIZE {
            return Err(FsError::ShortWrite { block: index, put });
        }
        Ok(())
    }

    /// Logical blocks currently covered by the backing store.
    pub fn block_count(&mut self) -> Result<u64> {
        let len = self.dev.len()?;
        Ok(len.saturating_sub(VOLUME_HEADER_SIZE as u64) / PHYSICAL_BLOCK_SIZE as u64)
    }

    /// Grow the backing store so block `to - 1` is addressable. New blocks
    /// stay uninitialised until first written.
    pub fn extend(&mut self, to: u64) -> Result<()> {
        if self.block_count()? < to {
            self.dev.set_len(Self::offset(to))?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync()?;
        Ok(())
    }

    pub fn dev_mut(&mut self) -> &mut T {
        &mut self.dev
    }
}
