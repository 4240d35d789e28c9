//! On-disk layout.
//!
//! The backing store is a volume header followed by an array of physical
//! blocks. Every physical block is `IV || ciphertext || tag`; everything
//! above the crypto layer sees only the decrypted logical payload.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::cryptfs_lib::error::{FsError, Result};

type LE = LittleEndian;

/*
 * Geometry
 */
pub const PHYSICAL_BLOCK_SIZE: usize = 4096;
pub const IV_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;
pub const LOGICAL_BLOCK_SIZE: usize = PHYSICAL_BLOCK_SIZE - IV_SIZE - TAG_SIZE;

pub const BLOCK_ID_SIZE: usize = 8;
pub const FILESIZE_SIZE: usize = 8;
pub const FILENAME_SIZE: usize = 256;
pub const XATTR_INLINE_SIZE: usize = 256;

/// The volume header occupies exactly one physical block at offset 0.
pub const VOLUME_HEADER_SIZE: usize = PHYSICAL_BLOCK_SIZE;

/// Direct data-block pointers carried by a header or continuation block.
pub const DIRECT_SLOTS: usize = 32;

/// Bits in one superblock bitmap; one bit per logical block.
pub const BITMAP_BITS: usize = LOGICAL_BLOCK_SIZE * 8;

/// Distance between consecutive superblocks, in logical blocks.
///
/// Bit `j` of superblock `i` governs logical block `i * REGION_STRIDE + j`
/// with bit 0 being the superblock itself, so the final index of each
/// region is tracked by no bitmap and is never used.
pub const REGION_STRIDE: u64 = BITMAP_BITS as u64 + 1;

/// The root directory header: the first non-superblock logical block.
pub const ROOT_HEADER_ID: u64 = 1;

pub const DIR_ENTRY_SIZE: usize = FILENAME_SIZE + BLOCK_ID_SIZE;

/*
 * Volume header
 */
pub const VOLUME_MAGIC: [u8; 8] = *b"CRYPTFS1";
pub const VOLUME_VERSION: u16 = 1;
pub const CIPHER_AES256_GCM: u16 = 1;
pub const KDF_ARGON2ID: u16 = 1;

/// Wrapped master key: 32 key bytes plus the AEAD tag.
pub const WRAPPED_KEY_SIZE: usize = 32 + TAG_SIZE;

/// Fixed fields at the start of the backing store. Written once at volume
/// creation, the remainder of the header block is zero.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Debug)]
#[repr(C)]
pub struct VolumeHeader {
    pub magic: [u8; 8],
    pub version: U16<LE>,
    pub cipher: U16<LE>,
    pub kdf: U16<LE>,
    pub _pad: [u8; 2],
    pub kdf_m_cost: U32<LE>,
    pub kdf_t_cost: U32<LE>,
    pub kdf_p_cost: U32<LE>,
    pub salt: [u8; 16],
    pub key_iv: [u8; IV_SIZE],
    pub key_wrapped: [u8; WRAPPED_KEY_SIZE],
}

impl VolumeHeader {
    pub fn magic_matched(&self) -> bool {
        self.magic == VOLUME_MAGIC
    }
}

/*
 * File headers
 */

/// The `mode` byte of a file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FileKind {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
}

/// Fixed prefix of a file header block. The payload tail past these fields
/// is reserved; file content lives in data blocks only.
#[derive(FromBytes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub struct FileHeader {
    pub mode: u8,
    pub file_size: U64<LE>,
    pub next_continuation: U64<LE>,
    pub direct: [U64<LE>; DIRECT_SLOTS],
    pub xattr_overflow: U64<LE>,
    pub xattr_inline: [u8; XATTR_INLINE_SIZE],
}

pub const FILE_HEADER_SIZE: usize =
    1 + FILESIZE_SIZE + BLOCK_ID_SIZE + DIRECT_SLOTS * BLOCK_ID_SIZE + BLOCK_ID_SIZE + XATTR_INLINE_SIZE;

impl FileHeader {
    pub fn new(kind: FileKind) -> Self {
        Self {
            mode: kind.into(),
            file_size: U64::new(0),
            next_continuation: U64::new(0),
            direct: [U64::new(0); DIRECT_SLOTS],
            xattr_overflow: U64::new(0),
            xattr_inline: [0u8; XATTR_INLINE_SIZE],
        }
    }

    pub fn kind(&self, id: u64) -> Result<FileKind> {
        FileKind::try_from(self.mode).map_err(|_| FsError::CorruptBlock(id))
    }
}

/// Fixed prefix of a continuation block. Continuations after the first are
/// doubly linked; the header fills the role of `prev` for the first one.
#[derive(FromBytes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub struct Continuation {
    pub next: U64<LE>,
    pub prev: U64<LE>,
    pub direct: [U64<LE>; DIRECT_SLOTS],
}

pub const CONTINUATION_SIZE: usize = 2 * BLOCK_ID_SIZE + DIRECT_SLOTS * BLOCK_ID_SIZE;

impl Continuation {
    pub fn new(prev: u64) -> Self {
        Self {
            next: U64::new(0),
            prev: U64::new(prev),
            direct: [U64::new(0); DIRECT_SLOTS],
        }
    }
}

/*
 * Directory encoding
 */

/// One directory record: NUL-padded name plus the child's header block id.
/// Records are packed back to back in the directory's file content;
/// removal swaps the last record in and truncates.
#[derive(FromBytes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub struct DirEntryRaw {
    pub name: [u8; FILENAME_SIZE],
    pub child: U64<LE>,
}

impl DirEntryRaw {
    pub fn new(name: &str, child: u64) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > FILENAME_SIZE {
            return Err(FsError::NameTooLong);
        }
        if bytes.contains(&0) {
            return Err(FsError::InvalidArgument("NUL in file name"));
        }
        let mut padded = [0u8; FILENAME_SIZE];
        padded[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            name: padded,
            child: U64::new(child),
        })
    }

    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .rposition(|&b| b != 0)
            .map(|p| p + 1)
            .unwrap_or(0);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        if bytes.len() > FILENAME_SIZE {
            return false;
        }
        self.name[..bytes.len()] == *bytes && self.name[bytes.len()..].iter().all(|&b| b == 0)
    }
}

/*
 * Extended attributes
 */

/// Decode the xattr entry stream: `(name_len: u8, name, value_len: u16 LE,
/// value)` records, ended by a zero `name_len` sentinel or the end of the
/// stream.
pub fn decode_xattrs(stream: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut p = 0usize;
    while p < stream.len() {
        let name_len = stream[p] as usize;
        if name_len == 0 {
            break;
        }
        p += 1;
        if p + name_len + 2 > stream.len() {
            break;
        }
        let name = stream[p..p + name_len].to_vec();
        p += name_len;
        let value_len = u16::from_le_bytes([stream[p], stream[p + 1]]) as usize;
        p += 2;
        if p + value_len > stream.len() {
            break;
        }
        let value = stream[p..p + value_len].to_vec();
        p += value_len;
        out.push((name, value));
    }
    out
}

/// Encode xattr entries back into a stream with the trailing sentinel.
pub fn encode_xattrs(entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in entries {
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(value);
    }
    out.push(0);
    out
}

/*
 * Synthesised attributes
 */

/// Attribute payload returned by the operation surface. Permission bits,
/// ownership and timestamps are synthesised by the bridge.
#[derive(Debug, Clone, Copy)]
pub struct InodeAttr {
    pub ino: u64,
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub nlink: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeStat {
    pub blocks: u64,
    pub bfree: u64,
    pub bsize: u32,
    pub namemax: u32,
}
