// Per-process state the file system cares about: the current working
// directory and the descriptor table mapping small integers to open
// files.

use crate::file::File;
use crate::fs::{Inode, ROOTINO};
use crate::param::NOFILE;
use crate::{Error, Fs, Result};
use array_macro::array;

// Raw file descriptors
pub type RawFd = usize;

pub struct Proc {
    fs: Fs,
    pub(crate) cwd: Option<Inode>,
    pub(crate) ofile: [Option<File>; NOFILE],
}

impl Proc {
    // A fresh process context rooted at /.
    pub fn new(fs: &Fs) -> Proc {
        Proc {
            fs: fs.clone(),
            cwd: Some(fs.iget(fs.inner.dev, ROOTINO)),
            ofile: array![None; NOFILE],
        }
    }

    pub(crate) fn cwd(&self) -> &Inode {
        self.cwd.as_ref().expect("proc has no cwd")
    }

    // Allocate a file descriptor for the given file, taking it over
    // from the caller on success.
    pub(crate) fn fdalloc(&mut self, file: File) -> Result<RawFd> {
        for (fd, f) in self.ofile.iter_mut().enumerate() {
            if f.is_none() {
                f.replace(file);
                return Ok(fd);
            }
        }
        Err(Error::TooManyOpenFiles)
    }

    pub(crate) fn file(&self, fd: RawFd) -> Result<&File> {
        self.ofile
            .get(fd)
            .and_then(|f| f.as_ref())
            .ok_or(Error::BadFileDescriptor)
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        // Descriptors close themselves; the cwd reference may free an
        // unlinked directory, which must happen inside a transaction.
        self.fs.begin_op();
        self.cwd.take();
        self.fs.end_op();
    }
}
