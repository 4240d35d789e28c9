//! End-to-end volume scenarios over the in-memory device, plus the
//! persistence and tamper cases that need a real file between sessions.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use cryptfs::block_dev::{FileBlockDev, MemBlockDev};
use cryptfs::desc::{
    FileKind, LOGICAL_BLOCK_SIZE, PHYSICAL_BLOCK_SIZE, ROOT_HEADER_ID, VOLUME_HEADER_SIZE,
};
use cryptfs::error::FsError;
use cryptfs::{CryptFS, MountOptions};

const MIB: u64 = 1024 * 1024;

fn opts() -> MountOptions {
    MountOptions {
        passphrase: "test".into(),
        ..Default::default()
    }
}

fn mem_volume() -> CryptFS<MemBlockDev> {
    CryptFS::create(MemBlockDev::with_len(MIB as usize), &opts()).unwrap()
}

fn temp_image(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cryptfs_it_{}_{}", tag, std::process::id()))
}

#[test]
fn fresh_volume_shape() {
    let mut vol = mem_volume();
    // exactly one allocated block besides the superblock: the root header
    assert!(vol.is_allocated(ROOT_HEADER_ID).unwrap());
    let st = vol.cfs_statfs().unwrap();
    assert_eq!(st.bsize, 4064);
    assert_eq!(st.bfree, st.blocks - 1 - 1);

    let names: Vec<String> = vol
        .cfs_readdir("/")
        .unwrap()
        .into_iter()
        .map(|(n, _, _)| n)
        .collect();
    assert_eq!(names, vec![".", ".."]);
}

#[test]
fn hello_roundtrip() {
    let mut vol = mem_volume();
    let (fh, _) = vol.cfs_create("/hello.txt").unwrap();
    vol.cfs_write("/hello.txt", fh, 0, b"hello").unwrap();
    assert_eq!(vol.cfs_read("/hello.txt", fh, 0, 5).unwrap(), b"hello");
    let attr = vol.cfs_getattr("/hello.txt").unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(attr.kind, FileKind::Regular);
    assert_eq!(attr.nlink, 1);
}

#[test]
fn large_write_truncate_and_eof() {
    let mut vol = mem_volume();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut data = vec![0u8; 5 * MIB as usize];
    rng.fill_bytes(&mut data);

    let f = vol.create_file(FileKind::Regular).unwrap();
    vol.write_bytes(f, 0, &data).unwrap();
    vol.truncate_file(f, MIB).unwrap();

    let tail = vol.read_bytes(f, MIB - 100, 100).unwrap();
    assert_eq!(tail, &data[(MIB - 100) as usize..MIB as usize]);
    // at the end of the file there is nothing left to read
    assert!(vol
        .read_bytes(f, MIB, LOGICAL_BLOCK_SIZE as u64)
        .unwrap()
        .is_empty());
    // growing the file again exposes zeros, not the old ciphertext
    vol.truncate_file(f, MIB + LOGICAL_BLOCK_SIZE as u64).unwrap();
    let grown = vol.read_bytes(f, MIB, LOGICAL_BLOCK_SIZE as u64).unwrap();
    assert_eq!(grown.len(), LOGICAL_BLOCK_SIZE);
    assert!(grown.iter().all(|&b| b == 0));
}

#[test]
fn mkdir_tree_and_free_count() {
    let mut vol = mem_volume();
    let free0 = vol.count_free().unwrap();
    vol.cfs_mkdir("/a").unwrap();
    vol.cfs_mkdir("/a/b").unwrap();
    assert!(matches!(vol.cfs_rmdir("/a"), Err(FsError::NotEmpty)));
    vol.cfs_rmdir("/a/b").unwrap();
    vol.cfs_rmdir("/a").unwrap();
    assert_eq!(vol.count_free().unwrap(), free0);
}

#[test]
fn xattr_surface_laws() {
    let mut vol = mem_volume();
    vol.cfs_create("/f").unwrap();
    vol.cfs_setxattr("/f", b"user.k", b"value", 0).unwrap();
    assert_eq!(vol.cfs_getxattr("/f", b"user.k").unwrap(), b"value");
    assert_eq!(
        vol.cfs_listxattr("/f").unwrap(),
        vec![b"user.k".to_vec()]
    );
    vol.cfs_removexattr("/f", b"user.k").unwrap();
    assert!(matches!(
        vol.cfs_getxattr("/f", b"user.k"),
        Err(FsError::NotFound)
    ));
}

#[test]
fn rename_there_and_back() {
    let mut vol = mem_volume();
    let (fh, _) = vol.cfs_create("/a").unwrap();
    vol.cfs_write("/a", fh, 0, b"x").unwrap();
    vol.cfs_release(fh).unwrap();
    let before: Vec<String> = vol
        .cfs_readdir("/")
        .unwrap()
        .into_iter()
        .map(|(n, _, _)| n)
        .collect();
    vol.cfs_rename("/a", "/b", 0).unwrap();
    vol.cfs_rename("/b", "/a", 0).unwrap();
    let after: Vec<String> = vol
        .cfs_readdir("/")
        .unwrap()
        .into_iter()
        .map(|(n, _, _)| n)
        .collect();
    assert_eq!(before, after);
    assert_eq!(vol.cfs_read("/a", 0, 0, 1).unwrap(), b"x");
}

#[test]
fn persistence_across_sessions() {
    let path = temp_image("persist");
    {
        let dev = FileBlockDev::create_sized(&path, MIB).unwrap();
        let mut vol = CryptFS::create(dev, &opts()).unwrap();
        let (fh, _) = vol.cfs_create("/keep.txt").unwrap();
        vol.cfs_write("/keep.txt", fh, 0, b"durable bytes").unwrap();
        vol.cfs_mkdir("/dir").unwrap();
        vol.close().unwrap();
    }
    {
        let dev = FileBlockDev::open(&path).unwrap();
        let mut vol = CryptFS::open(dev, &opts()).unwrap();
        assert_eq!(
            vol.cfs_read("/keep.txt", 0, 0, 13).unwrap(),
            b"durable bytes"
        );
        assert_eq!(vol.cfs_getattr("/dir").unwrap().kind, FileKind::Directory);
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn wrong_passphrase_is_rejected() {
    let path = temp_image("passphrase");
    {
        let dev = FileBlockDev::create_sized(&path, MIB).unwrap();
        CryptFS::create(dev, &opts()).unwrap().close().unwrap();
    }
    let dev = FileBlockDev::open(&path).unwrap();
    let bad = MountOptions {
        passphrase: "wrong".into(),
        ..Default::default()
    };
    let err = CryptFS::open(dev, &bad).err().expect("open must fail");
    assert!(matches!(err, FsError::BadPassphrase));
    assert_eq!(err.exit_code(), 2);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn tampered_block_reads_as_corrupt() {
    let path = temp_image("tamper");
    {
        let dev = FileBlockDev::create_sized(&path, MIB).unwrap();
        let mut vol = CryptFS::create(dev, &opts()).unwrap();
        let (fh, _) = vol.cfs_create("/hello.txt").unwrap();
        vol.cfs_write("/hello.txt", fh, 0, b"hello").unwrap();
        vol.close().unwrap();
    }
    {
        // flip one byte inside physical block 2 (the file's data block)
        let mut img = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let off = (VOLUME_HEADER_SIZE + 2 * PHYSICAL_BLOCK_SIZE + 77) as u64;
        let mut byte = [0u8; 1];
        img.seek(SeekFrom::Start(off)).unwrap();
        img.read_exact(&mut byte).unwrap();
        byte[0] ^= 0x01;
        img.seek(SeekFrom::Start(off)).unwrap();
        img.write_all(&byte).unwrap();
    }
    {
        let dev = FileBlockDev::open(&path).unwrap();
        let mut vol = CryptFS::open(dev, &opts()).unwrap();
        let err = vol
            .cfs_read("/hello.txt", 0, 0, 5)
            .err()
            .expect("read of tampered block must fail");
        assert!(matches!(err, FsError::CorruptBlock(2)));
        assert_eq!(err.errno(), libc::EIO);
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn tampered_root_poisons_the_volume() {
    let path = temp_image("poison");
    {
        let dev = FileBlockDev::create_sized(&path, MIB).unwrap();
        let mut vol = CryptFS::create(dev, &opts()).unwrap();
        vol.cfs_create("/x").unwrap();
        vol.close().unwrap();
    }
    {
        // root header is logical block 1
        let mut img = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let off = (VOLUME_HEADER_SIZE + PHYSICAL_BLOCK_SIZE + 10) as u64;
        img.seek(SeekFrom::Start(off)).unwrap();
        img.write_all(&[0xff]).unwrap();
    }
    {
        let dev = FileBlockDev::open(&path).unwrap();
        // the open-time root verification already reports corruption
        let err = CryptFS::open(dev, &opts()).err().expect("open must fail");
        assert_eq!(err.exit_code(), 4);
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn deleted_file_returns_blocks() {
    let mut vol = mem_volume();
    let before = vol.count_free().unwrap();
    let (fh, _) = vol.cfs_create("/big").unwrap();
    vol.cfs_write("/big", fh, 0, &vec![0xa5u8; (2 * MIB) as usize])
        .unwrap();
    vol.cfs_release(fh).unwrap();
    assert!(vol.count_free().unwrap() < before);
    vol.cfs_unlink("/big").unwrap();
    assert_eq!(vol.count_free().unwrap(), before);
}
