// Block devices.
//
// The file system sits on top of anything that can read and write
// fixed-size sectors: a memory-backed disk for tests, a file-backed
// disk for mkfs and offline inspection. Transfers are synchronous and
// whole-sector; callers never see partial I/O.

use crate::fs::BSIZE;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

pub trait BlockDevice: Send + Sync {
    fn read(&self, blockno: u32, buf: &mut [u8; BSIZE]);
    fn write(&self, blockno: u32, buf: &[u8; BSIZE]);
}

// A sector-sized buffer aligned so on-disk structs can be viewed
// in place.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub(crate) struct SectorBuf(pub [u8; BSIZE]);

impl SectorBuf {
    pub(crate) const fn zeroed() -> Self {
        Self([0; BSIZE])
    }
}

// Memory-backed disk.
pub struct MemDisk {
    blocks: spin::Mutex<Vec<[u8; BSIZE]>>,
}

impl MemDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            blocks: spin::Mutex::new(vec![[0; BSIZE]; nblocks as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, blockno: u32, buf: &mut [u8; BSIZE]) {
        let blocks = self.blocks.lock();
        buf.copy_from_slice(&blocks[blockno as usize]);
    }

    fn write(&self, blockno: u32, buf: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock();
        blocks[blockno as usize].copy_from_slice(buf);
    }
}

// File-backed disk image.
pub struct FileDisk {
    img: Mutex<File>,
}

impl FileDisk {
    // Create an image of nblocks sectors, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P, nblocks: u32) -> std::io::Result<Self> {
        let img = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        img.set_len(nblocks as u64 * BSIZE as u64)?;
        Ok(Self {
            img: Mutex::new(img),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let img = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            img: Mutex::new(img),
        })
    }
}

impl BlockDevice for FileDisk {
    fn read(&self, blockno: u32, buf: &mut [u8; BSIZE]) {
        let mut img = self.img.lock().unwrap();
        img.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))
            .expect("disk seek");
        img.read_exact(buf).expect("disk read");
    }

    fn write(&self, blockno: u32, buf: &[u8; BSIZE]) {
        let mut img = self.img.lock().unwrap();
        img.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))
            .expect("disk seek");
        img.write_all(buf).expect("disk write");
    }
}
