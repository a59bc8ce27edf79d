// An xv6-flavored on-disk file system, hosted. Five layers:
//   - Blocks: allocator for raw disk blocks.
//   - Log: crash recovery for multi-step updates.
//   - Files: inode allocator, reading, writing, metadata.
//   - Directories: inode with special contents (list of other inodes!)
//   - Names: paths for convenient naming.
//
// Everything is mounted on a BlockDevice; Fs::mount replays the log
// and returns a handle whose methods are the system-call surface.
// Proc carries the per-process pieces (cwd, descriptor table).

pub mod device;
pub mod fcntl;
pub mod file;
pub mod fs;
pub mod mkfs;
pub mod param;
pub mod proc;
pub mod stat;

mod bio;
mod fslog;
mod pipe;
mod sleeplock;
mod sysfile;

pub use device::{BlockDevice, FileDisk, MemDisk};
pub use fcntl::OMode;
pub use file::{Device, File};
pub use mkfs::{mkfs, ImageBuilder};
pub use proc::{Proc, RawFd};
pub use stat::{IType, Stat};

use crate::bio::BCache;
use crate::file::{DevSW, FTable};
use crate::fs::{ITable, SuperBlock};
use crate::fslog::Log;
use crate::param::ROOTDEV;
use core::fmt;
use std::sync::Arc;

// Errors returned to callers. Invariant violations (out of buffers,
// double frees, corrupt metadata reached at dispatch) panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsDirectory,
    NotEmpty,
    BadFileDescriptor,
    TooManyOpenFiles,
    FileTooLarge,
    InvalidArgument,
    PermissionDenied,
    NoDevice,
    BrokenPipe,
    Corrupt,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "no such file or directory",
            Error::AlreadyExists => "file exists",
            Error::NotADirectory => "not a directory",
            Error::IsDirectory => "is a directory",
            Error::NotEmpty => "directory not empty",
            Error::BadFileDescriptor => "bad file descriptor",
            Error::TooManyOpenFiles => "too many open files",
            Error::FileTooLarge => "file too large",
            Error::InvalidArgument => "invalid argument",
            Error::PermissionDenied => "permission denied",
            Error::NoDevice => "no such device",
            Error::BrokenPipe => "broken pipe",
            Error::Corrupt => "file system image is corrupt",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

// A mounted file system. Cloning the handle shares the mount; the
// buffer cache, inode table, open-file table and superblock live
// behind it.
pub struct Fs {
    pub(crate) inner: Arc<FsInner>,
}

impl Clone for Fs {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct FsInner {
    pub(crate) dev: u32,
    pub(crate) sb: SuperBlock,
    pub(crate) bcache: Arc<BCache>,
    pub(crate) log: Log,
    pub(crate) itable: ITable,
    pub(crate) ftable: FTable,
    pub(crate) devsw: DevSW,
}

impl Fs {
    // Read the superblock, replay any committed log records, and hand
    // back a mount handle.
    pub fn mount(disk: Arc<dyn BlockDevice>) -> Result<Fs> {
        let bcache = Arc::new(BCache::new(Arc::clone(&disk)));
        let sb = SuperBlock::read(&bcache, ROOTDEV)?;
        log::info!(
            "fs: mounting {} blocks ({} data, {} inodes, {} log)",
            sb.size,
            sb.nblocks,
            sb.ninodes,
            sb.nlog
        );
        let fslog = Log::new(ROOTDEV, &sb, Arc::clone(&bcache));
        Ok(Fs {
            inner: Arc::new(FsInner {
                dev: ROOTDEV,
                sb,
                bcache,
                log: fslog,
                itable: ITable::new(),
                ftable: FTable::new(),
                devsw: DevSW::new(),
            }),
        })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.inner.sb
    }

    // Install a driver for device inodes with the given major number.
    pub fn register_device(&self, major: u16, driver: Arc<dyn Device>) -> Result<()> {
        self.inner.devsw.set(major, driver)
    }

    pub(crate) fn begin_op(&self) {
        self.inner.log.begin_op();
    }

    pub(crate) fn end_op(&self) {
        self.inner.log.end_op();
    }
}
