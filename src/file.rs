// Support functions for system calls that involve file descriptors:
// the global open-file table, the file object shared by descriptors,
// and the device switch that maps major numbers to drivers.

use crate::fcntl::OMode;
use crate::fs::{Inode, Path, BSIZE};
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
use crate::pipe::Pipe;
use crate::proc::Proc;
use crate::stat::{IType, Stat};
use crate::{Error, Fs, Result};
use array_macro::array;
use std::sync::{Arc, OnceLock};

// Character device drivers, selected by an inode's major number.
pub trait Device: Send + Sync {
    fn read(&self, dst: &mut [u8]) -> Result<usize>;
    fn write(&self, src: &[u8]) -> Result<usize>;
}

pub(crate) struct DevSW {
    table: [OnceLock<Arc<dyn Device>>; NDEV],
}

impl DevSW {
    pub(crate) fn new() -> Self {
        Self {
            table: array![OnceLock::new(); NDEV],
        }
    }

    pub(crate) fn set(&self, major: u16, driver: Arc<dyn Device>) -> Result<()> {
        match self.table.get(major as usize) {
            Some(slot) => slot.set(driver).map_err(|_| Error::AlreadyExists),
            None => Err(Error::NoDevice),
        }
    }

    pub(crate) fn get(&self, major: u16) -> Option<Arc<dyn Device>> {
        self.table.get(major as usize)?.get().cloned()
    }
}

// The shared part of an open file, held by the table and by every
// descriptor that refers to it.
pub(crate) enum VFile {
    Inode(FNod),
    Pipe(Arc<Pipe>),
}

// An inode-backed open file; descriptors that share it (dup) share
// the offset. The offset lock nests inside the inode sleep-lock.
pub(crate) struct FNod {
    off: spin::Mutex<u32>,
    ip: Inode,
}

impl FNod {
    fn new(ip: Inode) -> Self {
        Self {
            off: spin::Mutex::new(0),
            ip,
        }
    }

    fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let mut ig = self.ip.lock();
        let off = *self.off.lock();
        let r = ig.read(dst, off)?;
        *self.off.lock() = off + r as u32;
        Ok(r)
    }

    fn write(&self, fs: &Fs, src: &[u8]) -> Result<usize> {
        // Write a few blocks at a time to avoid exceeding the maximum
        // log transaction size, including inode, indirect block,
        // allocation blocks, and 2 blocks of slop for non-aligned
        // writes. This really belongs lower down, since writei might
        // be writing a device like the console.
        let max = ((MAXOPBLOCKS - 3) / 2) * BSIZE;
        let n = src.len();
        let mut i = 0;
        while i < n {
            let n1 = core::cmp::min(n - i, max);
            fs.begin_op();
            let res = {
                let mut ig = self.ip.lock();
                let off = *self.off.lock();
                let r = ig.write(&src[i..i + n1], off);
                if let Ok(w) = r {
                    *self.off.lock() = off + w as u32;
                }
                r
            };
            fs.end_op();

            match res {
                Ok(w) if w == n1 => i += w,
                Ok(_) => panic!("short filewrite"),
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }
}

// A file descriptor's view of an open file. Clone duplicates the
// descriptor (sharing offset and pipe state); dropping the last
// duplicate closes the underlying object.
pub struct File {
    fs: Fs,
    f: Option<Arc<VFile>>,
    readable: bool,
    writable: bool,
}

impl Clone for File {
    fn clone(&self) -> Self {
        Self {
            fs: self.fs.clone(),
            f: self.f.clone(),
            readable: self.readable,
            writable: self.writable,
        }
    }
}

impl File {
    pub(crate) fn read(&self, dst: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(Error::PermissionDenied);
        }
        match self.f.as_deref().unwrap() {
            VFile::Inode(f) => f.read(dst),
            VFile::Pipe(p) => p.read(dst),
        }
    }

    pub(crate) fn write(&self, src: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::PermissionDenied);
        }
        match self.f.as_deref().unwrap() {
            VFile::Inode(f) => f.write(&self.fs, src),
            VFile::Pipe(p) => p.write(src),
        }
    }

    // Get metadata about an inode-backed file.
    pub(crate) fn stat(&self) -> Result<Stat> {
        match self.f.as_deref().unwrap() {
            VFile::Inode(f) => Ok(f.ip.lock().stat()),
            VFile::Pipe(_) => Err(Error::InvalidArgument),
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let f = self.f.take().unwrap();
        if Arc::strong_count(&f) < 2 {
            panic!("file drop");
        }

        let mut files = self.fs.inner.ftable.files.lock();
        if Arc::strong_count(&f) != 2 {
            // Other descriptors remain. Give our reference up while
            // the table is locked so a racing drop sees the count
            // fall.
            drop(f);
            return;
        }
        // Last descriptor: clear the table slot so only our reference
        // remains.
        for slot in files.iter_mut() {
            if slot.as_ref().map_or(false, |ff| Arc::ptr_eq(&f, ff)) {
                slot.take();
            }
        }
        drop(files);

        match Arc::try_unwrap(f) {
            Ok(VFile::Inode(FNod { ip, .. })) => {
                // Releasing the inode may free it on disk.
                self.fs.begin_op();
                drop(ip);
                self.fs.end_op();
            }
            Ok(VFile::Pipe(pipe)) => pipe.close(self.writable),
            Err(_) => (),
        }
    }
}

// What FTable::alloc should open.
pub(crate) enum FType<'a> {
    Node(&'a Path),
    Pipe(Arc<Pipe>),
}

pub(crate) struct FTable {
    pub(crate) files: spin::Mutex<[Option<Arc<VFile>>; NFILE]>,
}

impl FTable {
    pub(crate) fn new() -> Self {
        Self {
            files: spin::Mutex::new(array![None; NFILE]),
        }
    }

    // Build the open-file object and install it in a free table slot.
    // Must be called inside a transaction when opening by path.
    pub(crate) fn alloc(&self, fs: &Fs, p: &Proc, opts: &OMode, source: FType<'_>) -> Result<File> {
        let vfile = match source {
            FType::Node(path) => {
                let ip = if opts.is_create() {
                    fs.create(p, path, IType::File, 0, 0)?
                } else {
                    fs.namei(p, path)?
                };
                let mut ig = ip.lock();
                match ig.itype {
                    IType::Dir if !opts.is_rdonly() => {
                        return Err(Error::IsDirectory);
                    }
                    IType::Device => {
                        if fs.inner.devsw.get(ig.major).is_none() {
                            return Err(Error::NoDevice);
                        }
                    }
                    _ => (),
                }
                if opts.is_trunc() && ig.itype == IType::File {
                    ig.trunc();
                }
                drop(ig);
                VFile::Inode(FNod::new(ip))
            }
            FType::Pipe(pi) => VFile::Pipe(pi),
        };

        let inner = Arc::new(vfile);
        let mut files = self.files.lock();
        let slot = files
            .iter_mut()
            .find(|f| f.is_none())
            .ok_or(Error::TooManyOpenFiles)?;
        slot.replace(Arc::clone(&inner));
        Ok(File {
            fs: fs.clone(),
            f: Some(inner),
            readable: opts.is_read(),
            writable: opts.is_write(),
        })
    }
}
