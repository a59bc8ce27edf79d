// Buffer cache.
//
// The buffer cache holds cached copies of disk block contents in a
// fixed pool of buffers. Caching disk blocks in memory reduces the
// number of disk reads and also provides a synchronization point for
// blocks used by multiple threads.
//
// Interface:
// * To get a buffer for a particular disk block, call read.
// * After changing buffer data, call BufGuard::write to send it to
//   disk, or hand the guard to Log::write inside a transaction.
// * Dropping the guard releases the buffer.
// * Only one thread at a time can use a buffer, so do not keep
//   guards longer than necessary.
//
// The pool is threaded onto a doubly-linked LRU list, most recently
// used first, kept as prev/next indices beside a sentinel slot. One
// spinlock guards the list, identities and reference counts; a
// per-buffer sleep-lock guards the data and may be held across
// device I/O. The spinlock is never held while blocking on a
// sleep-lock.

use crate::device::BlockDevice;
use crate::fs::BSIZE;
use crate::param::NBUF;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use array_macro::array;
use bitflags::bitflags;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

bitflags! {
    pub(crate) struct BufFlags: u8 {
        const VALID = 1 << 0; // has data been read from disk?
        const DIRTY = 1 << 1; // modified and not yet written back?
    }
}

// Sentinel index for the LRU list.
const HEAD: usize = NBUF;

pub(crate) struct BCache {
    disk: Arc<dyn BlockDevice>,
    ctrl: spin::Mutex<Ctrl>,
    bufs: [SleepLock<BufData>; NBUF],
}

#[repr(C, align(8))]
pub(crate) struct BufData {
    pub data: [u8; BSIZE],
    pub(crate) flags: BufFlags,
    dev: u32,
    blockno: u32,
}

impl BufData {
    fn new() -> Self {
        Self {
            data: [0; BSIZE],
            flags: BufFlags::empty(),
            dev: u32::MAX,
            blockno: u32::MAX,
        }
    }
}

#[derive(Clone, Copy)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: usize,
}

struct Ctrl {
    meta: [BufMeta; NBUF],
    prev: [usize; NBUF + 1],
    next: [usize; NBUF + 1],
}

impl Ctrl {
    fn new() -> Self {
        let mut ctrl = Self {
            meta: [BufMeta {
                dev: u32::MAX,
                blockno: u32::MAX,
                refcnt: 0,
            }; NBUF],
            prev: [HEAD; NBUF + 1],
            next: [HEAD; NBUF + 1],
        };
        let mut last = HEAD;
        for i in 0..NBUF {
            ctrl.next[last] = i;
            ctrl.prev[i] = last;
            last = i;
        }
        ctrl.next[last] = HEAD;
        ctrl.prev[HEAD] = last;
        ctrl
    }

    fn find(&self, dev: u32, blockno: u32) -> Option<usize> {
        let mut i = self.next[HEAD];
        while i != HEAD {
            let m = &self.meta[i];
            if m.dev == dev && m.blockno == blockno {
                return Some(i);
            }
            i = self.next[i];
        }
        None
    }

    // Least recently used unpinned buffer, scanning from the tail.
    fn victim(&self) -> Option<usize> {
        let mut i = self.prev[HEAD];
        while i != HEAD {
            if self.meta[i].refcnt == 0 {
                return Some(i);
            }
            i = self.prev[i];
        }
        None
    }

    fn detach(&mut self, i: usize) {
        let (p, n) = (self.prev[i], self.next[i]);
        self.next[p] = n;
        self.prev[n] = p;
    }

    fn push_front(&mut self, i: usize) {
        let n = self.next[HEAD];
        self.next[HEAD] = i;
        self.prev[i] = HEAD;
        self.next[i] = n;
        self.prev[n] = i;
    }
}

impl BCache {
    pub(crate) fn new(disk: Arc<dyn BlockDevice>) -> Self {
        Self {
            disk,
            ctrl: spin::Mutex::new(Ctrl::new()),
            bufs: array![_ => SleepLock::new(BufData::new(), "buffer"); NBUF],
        }
    }

    // Look through the cache for a block. If not cached, recycle the
    // least recently used unpinned buffer. Either way the block comes
    // back pinned and exclusively locked.
    fn get(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let mut ctrl = self.ctrl.lock();

        if let Some(idx) = ctrl.find(dev, blockno) {
            ctrl.meta[idx].refcnt += 1;
            drop(ctrl);
            // refcnt > 0 pins the identity, so it is safe to block on
            // the sleep-lock without the list lock.
            let guard = self.bufs[idx].lock();
            return BufGuard {
                cache: self,
                idx,
                guard: Some(guard),
            };
        }

        let idx = match ctrl.victim() {
            Some(idx) => idx,
            None => panic!("bget: no buffers"),
        };
        ctrl.meta[idx] = BufMeta {
            dev,
            blockno,
            refcnt: 1,
        };
        // refcnt was zero: nobody holds this lock or is waiting on it.
        let mut guard = self.bufs[idx].try_lock().expect("bget: recycled buffer locked");
        debug_assert!(!guard.flags.contains(BufFlags::DIRTY), "bget: dirty victim");
        guard.dev = dev;
        guard.blockno = blockno;
        guard.flags = BufFlags::empty();
        drop(ctrl);
        BufGuard {
            cache: self,
            idx,
            guard: Some(guard),
        }
    }

    // Return a locked buf with the contents of the indicated block.
    pub(crate) fn read(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let mut b = self.get(dev, blockno);
        if !b.flags.contains(BufFlags::VALID) {
            let data = b.guard.as_mut().unwrap();
            self.disk.read(blockno, &mut data.data);
            data.flags.insert(BufFlags::VALID);
        }
        b
    }

    #[cfg(test)]
    fn cached(&self, dev: u32, blockno: u32) -> bool {
        self.ctrl.lock().find(dev, blockno).is_some()
    }
}

// A pinned, exclusively locked buffer. Dropping the guard unlocks the
// buffer and, once the last reference is gone, moves it to the front
// of the LRU list.
pub(crate) struct BufGuard<'a> {
    cache: &'a BCache,
    idx: usize,
    guard: Option<SleepLockGuard<'a, BufData>>,
}

impl Deref for BufGuard<'_> {
    type Target = BufData;
    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().unwrap()
    }
}

impl BufGuard<'_> {
    pub(crate) fn blockno(&self) -> u32 {
        self.guard.as_ref().unwrap().blockno
    }

    // Write the buffer's contents to disk.
    pub(crate) fn write(&mut self) {
        let data = self.guard.as_mut().unwrap();
        data.flags.insert(BufFlags::DIRTY);
        self.cache.disk.write(data.blockno, &data.data);
        data.flags.remove(BufFlags::DIRTY);
    }

    // Record a modification without writing through; the buffer stays
    // dirty until the log installs it.
    pub(crate) fn mark_dirty(&mut self) {
        self.guard.as_mut().unwrap().flags.insert(BufFlags::DIRTY);
    }

    // Extra reference so the entry survives past this guard. The log
    // pins modified blocks until they reach their home location.
    pub(crate) fn pin(&self) {
        self.cache.ctrl.lock().meta[self.idx].refcnt += 1;
    }

    pub(crate) fn unpin(&self) {
        let mut ctrl = self.cache.ctrl.lock();
        let m = &mut ctrl.meta[self.idx];
        assert!(m.refcnt > 1, "unpin");
        m.refcnt -= 1;
    }

    // View the buffer as a slice of an on-disk struct.
    pub(crate) fn align_to<T: FromBytes>(&self) -> &[T] {
        LayoutVerified::<_, [T]>::new_slice(&self.guard.as_ref().unwrap().data[..])
            .expect("buffer cast")
            .into_slice()
    }

    pub(crate) fn align_to_mut<T: FromBytes + AsBytes>(&mut self) -> &mut [T] {
        LayoutVerified::<_, [T]>::new_slice(&mut self.guard.as_mut().unwrap().data[..])
            .expect("buffer cast")
            .into_mut_slice()
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // Release the sleep-lock before touching the list.
        self.guard.take();
        let mut ctrl = self.cache.ctrl.lock();
        ctrl.meta[self.idx].refcnt -= 1;
        if ctrl.meta[self.idx].refcnt == 0 {
            ctrl.detach(self.idx);
            ctrl.push_front(self.idx);
        }
    }
}
