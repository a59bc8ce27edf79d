// Sleeping locks.
//
// Long-term locks that may be held across disk I/O. Contending
// threads block on a condition variable instead of spinning, so a
// holder may sleep without starving the rest of the system.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug)]
pub struct SleepLock<T> {
    lk: Mutex<SleepLockInfo>, // protects locked and holder
    cond: Condvar,
    data: UnsafeCell<T>,
    name: &'static str,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

#[derive(Debug)]
struct SleepLockInfo {
    locked: bool,
    holder: Option<ThreadId>,
}

pub struct SleepLockGuard<'a, T> {
    sleep_lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub fn new(data: T, name: &'static str) -> Self {
        Self {
            lk: Mutex::new(SleepLockInfo {
                locked: false,
                holder: None,
            }),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
            name,
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut lk = self.lk.lock().unwrap();
        while lk.locked {
            lk = self.cond.wait(lk).unwrap();
        }
        lk.locked = true;
        lk.holder = Some(thread::current().id());
        SleepLockGuard { sleep_lock: self }
    }

    // Take the lock only if it is free. Used where the caller can
    // prove no contention, e.g. a cache entry with no references.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        let mut lk = self.lk.lock().unwrap();
        if lk.locked {
            return None;
        }
        lk.locked = true;
        lk.holder = Some(thread::current().id());
        Some(SleepLockGuard { sleep_lock: self })
    }

    pub fn holding(&self) -> bool {
        let lk = self.lk.lock().unwrap();
        lk.locked && lk.holder == Some(thread::current().id())
    }
}

impl<'a, T: 'a> SleepLockGuard<'a, T> {
    pub fn sleep_lock(&self) -> &'a SleepLock<T> {
        self.sleep_lock
    }
}

impl<'a, T: 'a> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.sleep_lock.data.get() }
    }
}

impl<'a, T: 'a> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.sleep_lock.data.get() }
    }
}

impl<'a, T: 'a> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        assert!(
            self.sleep_lock.holding(),
            "release {}",
            self.sleep_lock.name
        );
        let mut lk = self.sleep_lock.lk.lock().unwrap();
        lk.locked = false;
        lk.holder = None;
        drop(lk);
        self.sleep_lock.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn exclusive_across_threads() {
        let lock = Arc::new(SleepLock::new(0u32, "test"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let mut g = lock.lock();
                    *g += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 800);
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = SleepLock::new((), "test");
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }
}
