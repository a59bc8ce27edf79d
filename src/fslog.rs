// Simple logging that allows concurrent FS system calls.
//
// A log transaction contains the updates of multiple FS system
// calls. The logging system only commits when there are no FS system
// calls active. Thus there is never any reasoning required about
// whether a commit might write an uncommitted system call's updates
// to disk.
//
// A system call should call begin_op()/end_op() to mark its start and
// end. Usually begin_op() just increments the count of in-progress FS
// system calls and returns. But if it thinks the log is close to
// running out, it blocks until the last outstanding end_op() commits.
//
// The log is a physical re-do log containing disk blocks. The on-disk
// log format:
//   header block, containing block #s for block A, B, C, ...
//   block A
//   block B
//   block C
//   ...
// Log appends are synchronous.

use crate::bio::{BCache, BufGuard};
use crate::fs::{SuperBlock, BSIZE};
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use static_assertions::const_assert;
use std::sync::{Arc, Condvar, Mutex};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

// Contents of the header block, used both for the on-disk header and
// to keep track in memory of logged block numbers before commit.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(core::mem::size_of::<LogHeader>() <= BSIZE);

pub(crate) struct Log {
    dev: u32,
    start: u32,
    size: u32,
    bcache: Arc<BCache>,
    state: Mutex<LogState>,
    cond: Condvar,
}

struct LogState {
    outstanding: u32,
    committing: bool,
    lh: LogHeader,
}

impl Log {
    // Reads the on-disk header and replays any committed transaction
    // left behind by an unclean shutdown.
    pub(crate) fn new(dev: u32, sb: &SuperBlock, bcache: Arc<BCache>) -> Self {
        let log = Self {
            dev,
            start: sb.logstart,
            size: sb.nlog,
            bcache,
            state: Mutex::new(LogState {
                outstanding: 0,
                committing: false,
                lh: LogHeader {
                    n: 0,
                    block: [0; LOGSIZE],
                },
            }),
            cond: Condvar::new(),
        };
        let mut lh = log.read_head();
        if lh.n > 0 {
            log::info!("fslog: replaying {} blocks", lh.n);
        }
        log.install_trans(&lh, true);
        lh.n = 0;
        log.write_head(&lh);
        log.state.lock().unwrap().lh = lh;
        log
    }

    fn read_head(&self) -> LogHeader {
        let bp = self.bcache.read(self.dev, self.start);
        let (lh, _) = LayoutVerified::<_, LogHeader>::new_from_prefix(&bp.data[..])
            .expect("log header cast");
        *lh.into_ref()
    }

    // Write the in-memory log header to disk. This is the true point
    // at which the current transaction commits.
    fn write_head(&self, lh: &LogHeader) {
        let mut bp = self.bcache.read(self.dev, self.start);
        bp.data[..core::mem::size_of::<LogHeader>()].copy_from_slice(lh.as_bytes());
        bp.write();
    }

    // Copy committed blocks from the log to their home locations.
    fn install_trans(&self, lh: &LogHeader, recovering: bool) {
        for tail in 0..lh.n {
            let lbuf = self.bcache.read(self.dev, self.start + tail + 1);
            let mut dbuf = self.bcache.read(self.dev, lh.block[tail as usize]);
            dbuf.data.copy_from_slice(&lbuf.data);
            dbuf.write();
            if !recovering {
                dbuf.unpin();
            }
        }
    }

    // Copy modified blocks from the cache to the log area.
    fn write_log(&self, lh: &LogHeader) {
        for tail in 0..lh.n {
            let from = self.bcache.read(self.dev, lh.block[tail as usize]);
            let mut to = self.bcache.read(self.dev, self.start + tail + 1);
            to.data.copy_from_slice(&from.data);
            to.write();
        }
    }

    fn commit(&self, lh: &mut LogHeader) {
        if lh.n > 0 {
            self.write_log(lh); // modified blocks from cache to log
            self.write_head(lh); // header to disk -- the real commit
            self.install_trans(lh, false); // now install to home locations
            lh.n = 0;
            self.write_head(lh); // erase the transaction from the log
        }
    }

    // Called at the start of each FS system call.
    pub(crate) fn begin_op(&self) {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.committing {
                st = self.cond.wait(st).unwrap();
            } else if st.lh.n as usize + (st.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE {
                // this op might exhaust log space; wait for commit
                st = self.cond.wait(st).unwrap();
            } else {
                st.outstanding += 1;
                break;
            }
        }
    }

    // Called at the end of each FS system call; commits if this was
    // the last outstanding operation.
    pub(crate) fn end_op(&self) {
        let mut st = self.state.lock().unwrap();
        st.outstanding -= 1;
        assert!(!st.committing, "log committing");

        if st.outstanding == 0 {
            st.committing = true;
            let mut lh = st.lh;
            drop(st);
            // Commit without holding the state lock, since the writes
            // below block on buffer locks and device I/O.
            self.commit(&mut lh);
            let mut st = self.state.lock().unwrap();
            st.lh = lh;
            st.committing = false;
        } else {
            // begin_op() may be waiting for log space, and decrementing
            // outstanding has decreased the amount of reserved space.
        }
        self.cond.notify_all();
    }

    // Caller has modified bp.data and is done with the buffer.
    // Record the block number and pin the buffer in the cache until
    // the commit installs it. Replaces BufGuard::write(); a typical
    // use is:
    //   let mut bp = bcache.read(...);
    //   // modify bp.data
    //   log.write(bp);
    pub(crate) fn write(&self, mut b: BufGuard<'_>) {
        let mut st = self.state.lock().unwrap();
        assert!(
            (st.lh.n as usize) < LOGSIZE && st.lh.n < self.size - 1,
            "too big a transaction"
        );
        assert!(st.outstanding >= 1, "log write outside of transaction");

        b.mark_dirty();
        let blockno = b.blockno();
        let n = st.lh.n as usize;
        for i in 0..n {
            if st.lh.block[i] == blockno {
                // absorption: already part of this transaction
                return;
            }
        }
        st.lh.block[n] = blockno;
        st.lh.n += 1;
        b.pin();
    }
}
