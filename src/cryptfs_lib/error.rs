//! Error kinds surfaced by the volume and the operation surface.

use std::io;

use libc::c_int;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// AEAD tag mismatch while decrypting a logical block.
    #[error("block {0} failed authentication")]
    CorruptBlock(u64),

    #[error("short read of block {block}: {got} bytes")]
    ShortRead { block: u64, got: usize },

    #[error("short write of block {block}: {put} bytes")]
    ShortWrite { block: u64, put: usize },

    #[error("block address space exhausted")]
    NoSpace,

    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("file exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file name too long")]
    NameTooLong,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unknown mount option: {0}")]
    UnknownOption(String),

    #[error("read-only volume")]
    ReadOnly,

    /// Corruption was detected in the allocator bitmaps or the root
    /// header; the volume refuses further operations until remounted.
    #[error("volume poisoned by earlier corruption")]
    Poisoned,

    /// The passphrase failed to unwrap the master key.
    #[error("passphrase authentication failed")]
    BadPassphrase,

    /// The volume header is not a recognisable cryptfs header.
    #[error("bad volume header: {0}")]
    BadVolume(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// The errno handed back through the kernel bridge.
    pub fn errno(&self) -> c_int {
        match self {
            FsError::CorruptBlock(_)
            | FsError::ShortRead { .. }
            | FsError::ShortWrite { .. }
            | FsError::Poisoned
            | FsError::BadVolume(_)
            | FsError::Io(_) => libc::EIO,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::InvalidArgument(_) | FsError::UnknownOption(_) => libc::EINVAL,
            FsError::ReadOnly => libc::EROFS,
            FsError::BadPassphrase => libc::EACCES,
        }
    }

    /// Process exit code for mount-time failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            FsError::BadPassphrase => 2,
            FsError::Io(_) | FsError::ShortWrite { .. } => 3,
            FsError::CorruptBlock(_)
            | FsError::ShortRead { .. }
            | FsError::BadVolume(_)
            | FsError::Poisoned => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::CorruptBlock(3).errno(), libc::EIO);
        assert_eq!(FsError::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::ReadOnly.errno(), libc::EROFS);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(FsError::BadPassphrase.exit_code(), 2);
        assert_eq!(FsError::CorruptBlock(0).exit_code(), 4);
        assert_eq!(
            FsError::Io(io::Error::new(io::ErrorKind::Other, "x")).exit_code(),
            3
        );
    }
}
