// File-system system calls. Argument checking happens here; the real
// work is in fs.rs and file.rs. Every call that might touch the disk
// brackets itself in a transaction.

use crate::fcntl::OMode;
use crate::file::FType;
use crate::fs::Path;
use crate::param::MAXPATH;
use crate::pipe::Pipe;
use crate::proc::{Proc, RawFd};
use crate::stat::{IType, Stat};
use crate::{Error, Fs, Result};

impl Fs {
    fn check_path(path: &str) -> Result<&Path> {
        if path.len() > MAXPATH {
            return Err(Error::InvalidArgument);
        }
        Ok(Path::new(path))
    }

    pub fn open(&self, p: &mut Proc, path: &str, opts: OMode) -> Result<RawFd> {
        let path = Self::check_path(path)?;
        if !opts.is_read() && !opts.is_write() {
            return Err(Error::InvalidArgument);
        }

        self.begin_op();
        let res = self.inner.ftable.alloc(self, p, &opts, FType::Node(path));
        self.end_op();

        // Allocate the descriptor outside the transaction: if the
        // table is full, dropping the file opens a transaction of its
        // own to release the inode.
        p.fdalloc(res?)
    }

    pub fn read(&self, p: &Proc, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        p.file(fd)?.read(buf)
    }

    pub fn write(&self, p: &Proc, fd: RawFd, buf: &[u8]) -> Result<usize> {
        p.file(fd)?.write(buf)
    }

    pub fn close(&self, p: &mut Proc, fd: RawFd) -> Result<()> {
        let f = p
            .ofile
            .get_mut(fd)
            .and_then(|f| f.take())
            .ok_or(Error::BadFileDescriptor)?;
        drop(f);
        Ok(())
    }

    pub fn dup(&self, p: &mut Proc, fd: RawFd) -> Result<RawFd> {
        let f = p.file(fd)?.clone();
        p.fdalloc(f)
    }

    pub fn fstat(&self, p: &Proc, fd: RawFd) -> Result<Stat> {
        p.file(fd)?.stat()
    }

    // Create the path new as a link to the same inode as old.
    pub fn link(&self, p: &Proc, old: &str, new: &str) -> Result<()> {
        let old = Self::check_path(old)?;
        let new = Self::check_path(new)?;

        self.begin_op();
        let res = self.do_link(p, old, new);
        self.end_op();
        res
    }

    pub fn unlink(&self, p: &Proc, path: &str) -> Result<()> {
        let path = Self::check_path(path)?;

        self.begin_op();
        let res = self.do_unlink(p, path);
        self.end_op();
        res
    }

    pub fn mkdir(&self, p: &Proc, path: &str) -> Result<()> {
        let path = Self::check_path(path)?;

        self.begin_op();
        let res = self.create(p, path, IType::Dir, 0, 0).map(drop);
        self.end_op();
        res
    }

    pub fn mknod(&self, p: &Proc, path: &str, major: u16, minor: u16) -> Result<()> {
        let path = Self::check_path(path)?;

        self.begin_op();
        let res = self
            .create(p, path, IType::Device, major, minor)
            .map(drop);
        self.end_op();
        res
    }

    pub fn chdir(&self, p: &mut Proc, path: &str) -> Result<()> {
        let path = Self::check_path(path)?;

        self.begin_op();
        let res = (|| {
            let ip = self.namei(p, path)?;
            {
                let ig = ip.lock();
                if ig.itype != IType::Dir {
                    return Err(Error::NotADirectory);
                }
            }
            // The old cwd is released inside this transaction.
            let old = p.cwd.replace(ip);
            drop(old);
            Ok(())
        })();
        self.end_op();
        res
    }

    // Returns the (read, write) descriptor pair.
    pub fn pipe(&self, p: &mut Proc) -> Result<(RawFd, RawFd)> {
        let (rf, wf) = Pipe::alloc(self, p)?;
        let fd0 = p.fdalloc(rf)?;
        match p.fdalloc(wf) {
            Ok(fd1) => Ok((fd0, fd1)),
            Err(e) => {
                p.ofile[fd0].take();
                Err(e)
            }
        }
    }
}
