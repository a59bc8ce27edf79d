// Pipes.
//
// A pipe is a fixed-size ring buffer with one read end and one write
// end, each an open file. Writers block while the ring is full and a
// reader still exists; readers block while it is empty and a writer
// still exists. Reading from a pipe whose write end has closed drains
// the ring and then reports end of file.

use crate::fcntl::OMode;
use crate::file::{FType, File};
use crate::proc::Proc;
use crate::{Error, Fs, Result};
use std::sync::{Arc, Condvar, Mutex};

const PIPESIZE: usize = 512;

pub(crate) struct Pipe {
    inner: Mutex<PipeInner>,
    // data arrived, or the write end closed
    read_cv: Condvar,
    // space freed, or the read end closed
    write_cv: Condvar,
}

struct PipeInner {
    data: [u8; PIPESIZE],
    nread: usize,  // number of bytes read
    nwrite: usize, // number of bytes written
    readopen: bool,
    writeopen: bool,
}

impl Pipe {
    fn new() -> Self {
        Self {
            inner: Mutex::new(PipeInner {
                data: [0; PIPESIZE],
                nread: 0,
                nwrite: 0,
                readopen: true,
                writeopen: true,
            }),
            read_cv: Condvar::new(),
            write_cv: Condvar::new(),
        }
    }

    // Allocate a pipe and its two open-file ends: (read, write).
    pub(crate) fn alloc(fs: &Fs, p: &Proc) -> Result<(File, File)> {
        let pi = Arc::new(Pipe::new());
        let rf = fs.inner.ftable.alloc(
            fs,
            p,
            &OMode::new().read(true),
            FType::Pipe(Arc::clone(&pi)),
        )?;
        let wf = fs
            .inner
            .ftable
            .alloc(fs, p, &OMode::new().write(true), FType::Pipe(pi))?;
        Ok((rf, wf))
    }

    pub(crate) fn close(&self, writable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if writable {
            inner.writeopen = false;
            self.read_cv.notify_all();
        } else {
            inner.readopen = false;
            self.write_cv.notify_all();
        }
    }

    pub(crate) fn write(&self, src: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut i = 0;
        while i < src.len() {
            if !inner.readopen {
                return Err(Error::BrokenPipe);
            }
            if inner.nwrite == inner.nread + PIPESIZE {
                self.read_cv.notify_all();
                inner = self.write_cv.wait(inner).unwrap();
            } else {
                let slot = inner.nwrite % PIPESIZE;
                inner.data[slot] = src[i];
                inner.nwrite += 1;
                i += 1;
            }
        }
        self.read_cv.notify_all();
        Ok(i)
    }

    pub(crate) fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        while inner.nread == inner.nwrite && inner.writeopen {
            inner = self.read_cv.wait(inner).unwrap();
        }
        let mut i = 0;
        while i < dst.len() && inner.nread < inner.nwrite {
            let slot = inner.nread % PIPESIZE;
            dst[i] = inner.data[slot];
            inner.nread += 1;
            i += 1;
        }
        self.write_cv.notify_all();
        Ok(i)
    }
}
