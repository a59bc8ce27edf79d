// File system implementation. Five layers:
//   - Blocks: allocator for raw disk blocks.
//   - Log: crash recovery for multi-step updates.
//   - Files: inode allocator, reading, writing, metadata.
//   - Directories: inode with special contents (list of other inodes!)
//   - Names: paths like /usr/rtm/octofs/fs.rs for convenient naming.
//
// This file contains the low-level file system manipulation
// routines. The (higher-level) system call implementations are in
// sysfile.rs.

use crate::bio::BCache;
use crate::param::NINODE;
use crate::proc::Proc;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::stat::{IType, Stat};
use crate::{Error, Fs, FsInner, Result};
use array_macro::array;
use static_assertions::{const_assert, const_assert_eq};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

pub const ROOTINO: u32 = 1; // root i-number
pub const BSIZE: usize = 512; // block size

// Disk layout:
// [ boot block | super block | log | inode blocks |
//                                          free bit map | data blocks ]
//
// mkfs computes the super block and builds an initial file system.
// The super block describes the disk layout:
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes)]
pub struct SuperBlock {
    pub size: u32,       // Size of file system image (blocks)
    pub nblocks: u32,    // Number of data blocks
    pub ninodes: u32,    // Number of inodes
    pub nlog: u32,       // Number of log blocks
    pub logstart: u32,   // Block number of first log block
    pub inodestart: u32, // Block number of first inode block
    pub bmapstart: u32,  // Block number of first free map block
}

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

// On-disk inode structure
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes)]
pub struct DInode {
    pub itype: u16,                // File type
    pub major: u16,                // Major device number (DEVICE only)
    pub minor: u16,                // Minor device number (DEVICE only)
    pub nlink: u16,                // Number of links to inode in file system
    pub size: u32,                 // Size of file (bytes)
    pub addrs: [u32; NDIRECT + 1], // Data block addresses
}

// Inodes per block
pub const IPB: usize = BSIZE / core::mem::size_of::<DInode>();

// Bitmap bits per block
pub const BPB: u32 = (BSIZE * 8) as u32;

// Directory is a file containing a sequence of dirent structures.
pub const DIRSIZ: usize = 14;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes)]
pub struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

pub const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();

const_assert_eq!(core::mem::size_of::<DInode>(), 64);
const_assert!(BSIZE % core::mem::size_of::<DInode>() == 0);
const_assert!(BSIZE % DIRENT_SIZE == 0);

impl Dirent {
    // Fill in name, NUL-padded. A full-width name has no terminator.
    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        self.name = [0; DIRSIZ];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    // Compare with a path element. Elements longer than DIRSIZ match
    // on their first DIRSIZ bytes, the way path lookup truncates.
    fn name_matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        let bytes = &bytes[..bytes.len().min(DIRSIZ)];
        self.name[..bytes.len()] == *bytes
            && (bytes.len() == DIRSIZ || self.name[bytes.len()] == 0)
    }
}

impl SuperBlock {
    pub(crate) fn read(bcache: &BCache, dev: u32) -> Result<Self> {
        let bp = bcache.read(dev, 1);
        let (sb, _) = LayoutVerified::<_, SuperBlock>::new_from_prefix(&bp.data[..])
            .expect("superblock cast");
        let sb = *sb.into_ref();
        drop(bp);
        sb.validate()?;
        Ok(sb)
    }

    // The layout is fully determined by size, ninodes and nlog; refuse
    // to mount an image whose start offsets disagree with them.
    fn validate(&self) -> Result<()> {
        let ninodeblocks = self.ninodes / IPB as u32 + 1;
        let nbitmap = self.size / BPB + 1;
        let nmeta = 2 + self.nlog + ninodeblocks + nbitmap;
        if self.nlog < 2
            || self.logstart != 2
            || self.inodestart != 2 + self.nlog
            || self.bmapstart != self.inodestart + ninodeblocks
            || self.size <= nmeta
            || self.nblocks != self.size - nmeta
        {
            return Err(Error::Corrupt);
        }
        Ok(())
    }

    // Block containing inode i
    pub fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + self.inodestart
    }

    // Block of free map containing bit for block b
    pub fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}

// Blocks.

impl FsInner {
    // Zero a block.
    fn bzero(&self, dev: u32, bno: u32) {
        let mut bp = self.bcache.read(dev, bno);
        bp.data.fill(0);
        self.log.write(bp);
    }

    // Allocate a zeroed disk block.
    pub(crate) fn balloc(&self, dev: u32) -> u32 {
        for base in (0..self.sb.size).step_by(BPB as usize) {
            let mut bp = self.bcache.read(dev, self.sb.bblock(base));
            let mut bi = 0;
            while bi < BPB && base + bi < self.sb.size {
                let m = 1u8 << (bi % 8);
                if bp.data[(bi / 8) as usize] & m == 0 {
                    // Is block free?
                    bp.data[(bi / 8) as usize] |= m; // Mark block in use.
                    self.log.write(bp);
                    self.bzero(dev, base + bi);
                    return base + bi;
                }
                bi += 1;
            }
        }
        panic!("balloc: out of blocks");
    }

    // Free a disk block.
    pub(crate) fn bfree(&self, dev: u32, b: u32) {
        let mut bp = self.bcache.read(dev, self.sb.bblock(b));
        let bi = b % BPB;
        let m = 1u8 << (bi % 8);
        if bp.data[(bi / 8) as usize] & m == 0 {
            panic!("freeing free block");
        }
        bp.data[(bi / 8) as usize] &= !m;
        self.log.write(bp);
    }
}

// Inodes.
//
// An inode describes a single unnamed file. The inode disk structure
// holds metadata: the file's type, its size, the number of links
// referring to it, and the list of blocks holding the file's content.
//
// The inodes are laid out sequentially on disk at sb.inodestart. Each
// inode has a number, indicating its position on the disk.
//
// The in-memory table provides a place for synchronizing access to
// inodes used by multiple threads. Entries are reference-counted
// through Arc; the count tracks the number of in-memory pointers to
// the entry (open files and current directories). An entry whose last
// pointer goes away is removed from the table, and if its link count
// is also zero the on-disk inode is freed.
//
// The table spinlock protects slot allocation. A per-inode sleep-lock
// protects every field other than dev and inum; the valid flag says
// whether those fields have been read from disk.
//
// A typical sequence is:
//   let ip = fs.iget(dev, inum);  // reference the inode
//   let mut g = ip.lock();        // read fields, maybe from disk
//   // examine and modify g ...
//   drop(g);
//   drop(ip);
//
// lock() is separate from iget() so that system calls can keep a
// long-term reference to an inode (as for an open file) and only lock
// it for short periods (e.g., in read()). The separation also helps
// avoid deadlock and races during pathname lookup.

pub(crate) struct ITable {
    slots: spin::Mutex<[Option<Arc<MInode>>; NINODE]>,
}

// In-memory inode: stable identity plus the locked body.
#[derive(Debug)]
pub(crate) struct MInode {
    dev: u32,
    inum: u32,
    data: SleepLock<IData>,
}

#[derive(Debug, Default)]
pub(crate) struct IData {
    pub(crate) dev: u32,
    pub(crate) inum: u32,
    valid: bool,
    pub(crate) itype: IType,
    pub(crate) major: u16,
    pub(crate) minor: u16,
    pub(crate) nlink: u16,
    pub(crate) size: u32,
    pub(crate) addrs: [u32; NDIRECT + 1],
}

impl MInode {
    fn new(dev: u32, inum: u32) -> Self {
        Self {
            dev,
            inum,
            data: SleepLock::new(
                IData {
                    dev,
                    inum,
                    ..Default::default()
                },
                "inode",
            ),
        }
    }
}

// A reference to an in-memory inode. Dropping the last reference
// releases the table entry, freeing the on-disk inode if its link
// count has reached zero; drops that might free must therefore happen
// inside a transaction.
pub(crate) struct Inode {
    fs: Fs,
    ip: Option<Arc<MInode>>,
}

impl Inode {
    pub(crate) fn dup(&self) -> Inode {
        Inode {
            fs: self.fs.clone(),
            ip: self.ip.clone(),
        }
    }

    pub(crate) fn dev(&self) -> u32 {
        self.ip.as_ref().unwrap().dev
    }

    pub(crate) fn inum(&self) -> u32 {
        self.ip.as_ref().unwrap().inum
    }

    // Lock the inode, reading it from disk if it has not been loaded.
    pub(crate) fn lock(&self) -> InodeGuard<'_> {
        let ip = self.ip.as_ref().unwrap();
        let mut guard = ip.data.lock();
        if !guard.valid {
            let sb = &self.fs.inner.sb;
            let bp = self.fs.inner.bcache.read(ip.dev, sb.iblock(ip.inum));
            let dip = &bp.align_to::<DInode>()[ip.inum as usize % IPB];
            guard.itype = IType::from_u16(dip.itype);
            guard.major = dip.major;
            guard.minor = dip.minor;
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addrs.copy_from_slice(&dip.addrs);
            drop(bp);
            guard.valid = true;
            assert!(guard.itype != IType::None, "ilock: no type");
        }
        InodeGuard {
            fs: &self.fs,
            guard,
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if let Some(ip) = self.ip.take() {
            self.fs.inner.itable.put(&self.fs, ip);
        }
    }
}

impl ITable {
    pub(crate) fn new() -> Self {
        Self {
            slots: spin::Mutex::new(array![None; NINODE]),
        }
    }

    // Find the inode with number inum on device dev and return its
    // in-memory copy. Does not lock the inode and does not read it
    // from disk.
    pub(crate) fn get(&self, fs: &Fs, dev: u32, inum: u32) -> Inode {
        let mut slots = self.slots.lock();

        // Is the inode already in the table?
        let mut empty: Option<usize> = None;
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Some(ip) if ip.dev == dev && ip.inum == inum => {
                    return Inode {
                        fs: fs.clone(),
                        ip: Some(Arc::clone(ip)),
                    };
                }
                None if empty.is_none() => empty = Some(i),
                _ => (),
            }
        }

        // Recycle a table entry.
        let i = match empty {
            Some(i) => i,
            None => panic!("iget: no inodes"),
        };
        let ip = Arc::new(MInode::new(dev, inum));
        slots[i] = Some(Arc::clone(&ip));
        Inode {
            fs: fs.clone(),
            ip: Some(ip),
        }
    }

    // Drop a reference to an in-memory inode. If that was the last
    // reference, the table entry can be recycled. If that was the
    // last reference and the inode has no links to it, free the inode
    // (and its content) on disk; that path must run inside a
    // transaction because it logs.
    fn put(&self, fs: &Fs, inode: Arc<MInode>) {
        let slots = self.slots.lock();

        if Arc::strong_count(&inode) != 2 {
            // Other references remain. Give ours up while the table is
            // locked so a racing put sees the count drop.
            drop(inode);
            return;
        }

        // Only the table still refers to it, so nobody can hold the
        // sleep-lock and this cannot block.
        let idata = inode.data.try_lock().expect("iput: inode busy");
        drop(slots);

        if idata.valid && idata.nlink == 0 {
            // Inode has no links and no other references: truncate and
            // free it on disk.
            let mut ig = InodeGuard { fs, guard: idata };
            ig.trunc();
            ig.itype = IType::None;
            ig.update();
            ig.valid = false;
            drop(ig);
        } else {
            drop(idata);
        }

        let mut slots = self.slots.lock();
        if Arc::strong_count(&inode) == 2 {
            for slot in slots.iter_mut() {
                if slot.as_ref().map_or(false, |ip| Arc::ptr_eq(ip, &inode)) {
                    slot.take();
                }
            }
        }
        drop(inode);
    }
}

impl Fs {
    pub(crate) fn iget(&self, dev: u32, inum: u32) -> Inode {
        self.inner.itable.get(self, dev, inum)
    }

    // Allocate an inode on device dev, marking it in use by giving it
    // the requested type. Returns an unlocked but referenced inode.
    pub(crate) fn ialloc(&self, dev: u32, itype: IType) -> Inode {
        let sb = self.inner.sb;
        for inum in 1..sb.ninodes {
            let mut bp = self.inner.bcache.read(dev, sb.iblock(inum));
            let slot = inum as usize % IPB;
            let dinodes = bp.align_to_mut::<DInode>();
            if dinodes[slot].itype == 0 {
                // a free inode
                dinodes[slot] = DInode {
                    itype: itype.as_u16(),
                    ..Default::default()
                };
                self.inner.log.write(bp);
                return self.iget(dev, inum);
            }
        }
        panic!("ialloc: no inodes");
    }
}

// A locked inode. Mutations go through the guard; update() writes the
// cached fields back to the inode's disk slot.
pub(crate) struct InodeGuard<'a> {
    fs: &'a Fs,
    guard: SleepLockGuard<'a, IData>,
}

impl Deref for InodeGuard<'_> {
    type Target = IData;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl InodeGuard<'_> {
    // Copy a modified in-memory inode to disk. Must be called after
    // every change to a field that lives on disk.
    pub(crate) fn update(&self) {
        let inner = &self.fs.inner;
        let mut bp = inner.bcache.read(self.dev, inner.sb.iblock(self.inum));
        let slot = self.inum as usize % IPB;
        let dip = &mut bp.align_to_mut::<DInode>()[slot];
        dip.itype = self.itype.as_u16();
        dip.major = self.major;
        dip.minor = self.minor;
        dip.nlink = self.nlink;
        dip.size = self.size;
        dip.addrs.copy_from_slice(&self.addrs);
        inner.log.write(bp);
    }

    // Truncate inode (discard contents).
    pub(crate) fn trunc(&mut self) {
        let fs = self.fs;
        let dev = self.dev;

        for i in 0..NDIRECT {
            if self.addrs[i] > 0 {
                fs.inner.bfree(dev, self.addrs[i]);
                self.addrs[i] = 0;
            }
        }

        if self.addrs[NDIRECT] > 0 {
            {
                let bp = fs.inner.bcache.read(dev, self.addrs[NDIRECT]);
                for &addr in bp.align_to::<u32>() {
                    if addr > 0 {
                        fs.inner.bfree(dev, addr);
                    }
                }
            }
            fs.inner.bfree(dev, self.addrs[NDIRECT]);
            self.addrs[NDIRECT] = 0;
        }

        self.size = 0;
        self.update();
    }

    // Inode content.
    //
    // The content (data) associated with each inode is stored in
    // blocks on the disk. The first NDIRECT block numbers are listed
    // in addrs[]; the next NINDIRECT are listed in block
    // addrs[NDIRECT].
    //
    // Return the disk block address of the nth block in the inode,
    // allocating it if there is no such block yet.
    pub(crate) fn bmap(&mut self, bn: u32) -> u32 {
        let fs = self.fs;
        let dev = self.dev;
        let mut bn = bn as usize;

        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = fs.inner.balloc(dev);
                self.addrs[bn] = addr;
            }
            return addr;
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            // Load indirect block, allocating if necessary.
            let mut addr = self.addrs[NDIRECT];
            if addr == 0 {
                addr = fs.inner.balloc(dev);
                self.addrs[NDIRECT] = addr;
            }
            let mut bp = fs.inner.bcache.read(dev, addr);
            let mut baddr = bp.align_to::<u32>()[bn];
            if baddr == 0 {
                baddr = fs.inner.balloc(dev);
                bp.align_to_mut::<u32>()[bn] = baddr;
                fs.inner.log.write(bp);
            }
            return baddr;
        }

        panic!("bmap: out of range");
    }

    // Copy stat information from the inode.
    pub(crate) fn stat(&self) -> Stat {
        Stat {
            dev: self.dev,
            ino: self.inum,
            itype: self.itype,
            nlink: self.nlink,
            size: self.size,
        }
    }

    // Read data from the inode into dst, starting at byte offset off.
    // Device inodes dispatch to the registered driver instead.
    pub(crate) fn read(&mut self, dst: &mut [u8], off: u32) -> Result<usize> {
        if self.itype == IType::Device {
            let drv = self.fs.inner.devsw.get(self.major).ok_or(Error::NoDevice)?;
            return drv.read(dst);
        }

        let size = self.size as usize;
        let off = off as usize;
        let mut n = dst.len();
        if off > size || off.checked_add(n).is_none() {
            return Err(Error::InvalidArgument);
        }
        if off + n > size {
            n = size - off;
        }

        let mut tot = 0;
        while tot < n {
            let addr = self.bmap(((off + tot) / BSIZE) as u32);
            let bp = self.fs.inner.bcache.read(self.dev, addr);
            let boff = (off + tot) % BSIZE;
            let m = core::cmp::min(n - tot, BSIZE - boff);
            dst[tot..tot + m].copy_from_slice(&bp.data[boff..boff + m]);
            tot += m;
        }
        Ok(n)
    }

    // Write data to the inode at byte offset off, extending the file
    // (up to MAXFILE blocks) if the write runs past the end.
    pub(crate) fn write(&mut self, src: &[u8], off: u32) -> Result<usize> {
        if self.itype == IType::Device {
            let drv = self.fs.inner.devsw.get(self.major).ok_or(Error::NoDevice)?;
            return drv.write(src);
        }

        let off = off as usize;
        let n = src.len();
        if off > self.size as usize {
            return Err(Error::InvalidArgument);
        }
        match off.checked_add(n) {
            Some(end) if end <= MAXFILE * BSIZE => (),
            _ => return Err(Error::FileTooLarge),
        }

        let mut tot = 0;
        while tot < n {
            let addr = self.bmap(((off + tot) / BSIZE) as u32);
            let mut bp = self.fs.inner.bcache.read(self.dev, addr);
            let boff = (off + tot) % BSIZE;
            let m = core::cmp::min(n - tot, BSIZE - boff);
            bp.data[boff..boff + m].copy_from_slice(&src[tot..tot + m]);
            self.fs.inner.log.write(bp);
            tot += m;
        }

        if off + n > self.size as usize {
            self.size = (off + n) as u32;
        }

        // Write the inode back even if the size didn't change, because
        // bmap() may have added a block to addrs[].
        self.update();

        Ok(n)
    }

    // Directories.

    // Look for a directory entry by name; returns the entry's inode
    // and its byte offset in the directory.
    pub(crate) fn dirlookup(&mut self, name: &str) -> Result<(Inode, u32)> {
        if self.itype != IType::Dir {
            panic!("dirlookup not DIR");
        }
        let fs = self.fs;
        let mut de = Dirent::default();
        let mut off = 0;
        while off < self.size {
            let n = self.read(de.as_bytes_mut(), off).expect("dirlookup read");
            assert_eq!(n, DIRENT_SIZE, "dirlookup read");
            if de.inum != 0 && de.name_matches(name) {
                // entry matches path element
                return Ok((fs.iget(self.dev, de.inum as u32), off));
            }
            off += DIRENT_SIZE as u32;
        }
        Err(Error::NotFound)
    }

    // Write a new directory entry (name, inum) into the directory,
    // reusing the first free slot or appending at the end. The caller
    // is responsible for the inode's link count.
    pub(crate) fn dirlink(&mut self, name: &str, inum: u32) -> Result<()> {
        if name.as_bytes().len() > DIRSIZ {
            return Err(Error::InvalidArgument);
        }

        // Check that name is not present.
        match self.dirlookup(name) {
            Ok(_) => return Err(Error::AlreadyExists),
            Err(Error::NotFound) => (),
            Err(e) => return Err(e),
        }

        // Look for an empty dirent.
        let mut de = Dirent::default();
        let mut off = 0;
        while off < self.size {
            let n = self.read(de.as_bytes_mut(), off).expect("dirlink read");
            assert_eq!(n, DIRENT_SIZE, "dirlink read");
            if de.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        de.inum = inum as u16;
        de.set_name(name);
        let n = self.write(de.as_bytes(), off).expect("dirlink write");
        assert_eq!(n, DIRENT_SIZE, "dirlink");
        Ok(())
    }

    // Is the directory empty except for "." and ".." ?
    pub(crate) fn dirempty(&mut self) -> bool {
        let mut de = Dirent::default();
        let mut off = (2 * DIRENT_SIZE) as u32;
        while off < self.size {
            let n = self.read(de.as_bytes_mut(), off).expect("dirempty read");
            assert_eq!(n, DIRENT_SIZE, "dirempty read");
            if de.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }
}

// Paths.

// A slice of a path (akin to str).
#[repr(transparent)]
pub(crate) struct Path {
    inner: str,
}

impl AsRef<Path> for str {
    fn as_ref(&self) -> &Path {
        Path::new(self)
    }
}

impl Path {
    pub(crate) fn new<S: AsRef<str> + ?Sized>(s: &S) -> &Path {
        unsafe { &*(s.as_ref() as *const str as *const Path) }
    }

    fn is_absolute(&self) -> bool {
        self.inner.starts_with('/')
    }

    // Get the next path element and the remainder, collapsing
    // repeated separators.
    //
    // Examples:
    //   skip_elem("a/bb/c") = Some(("a", "bb/c"))
    //   skip_elem("///a//bb") = Some(("a", "/bb"))
    //   skip_elem("a") = Some(("a", ""))
    //   skip_elem("") = skip_elem("////") = None
    fn skip_elem(&self) -> Option<(&str, &Path)> {
        let s = self.inner.trim_start_matches('/');
        if s.is_empty() {
            return None;
        }
        match s.split_once('/') {
            Some((name, rest)) => Some((name, Path::new(rest))),
            None => Some((s, Path::new(""))),
        }
    }
}

impl Fs {
    // Look up and return the inode for a path name. If parent is
    // true, stop one level early and also return the final element.
    // Must be called inside a transaction since dropped intermediate
    // inodes go through put().
    fn namex<'p>(&self, p: &Proc, path: &'p Path, parent: bool) -> Result<(Inode, &'p str)> {
        let absolute = path.is_absolute();
        let mut ip = if absolute {
            self.iget(self.inner.dev, ROOTINO)
        } else {
            p.cwd().dup()
        };
        let mut path = path;
        let mut walked = false;

        loop {
            let (name, rest) = match path.skip_elem() {
                Some(x) => x,
                None => break,
            };
            walked = true;

            let mut dg = ip.lock();
            if dg.itype != IType::Dir {
                return Err(Error::NotADirectory);
            }
            if parent && rest.skip_elem().is_none() {
                drop(dg);
                return Ok((ip, name));
            }
            let (next, _) = dg.dirlookup(name)?;
            drop(dg);
            ip = next;
            path = rest;
        }

        if parent || (!walked && !absolute) {
            // nameiparent of "/" has no answer; an empty relative
            // path names nothing.
            return Err(Error::NotFound);
        }
        Ok((ip, ""))
    }

    pub(crate) fn namei(&self, p: &Proc, path: &Path) -> Result<Inode> {
        self.namex(p, path, false).map(|(ip, _)| ip)
    }

    pub(crate) fn nameiparent<'p>(&self, p: &Proc, path: &'p Path) -> Result<(Inode, &'p str)> {
        self.namex(p, path, true)
    }

    // Create the path new as a link to the same inode as old.
    pub(crate) fn do_link(&self, p: &Proc, old: &Path, new: &Path) -> Result<()> {
        let ip = self.namei(p, old)?;
        {
            let mut ig = ip.lock();
            if ig.itype == IType::Dir {
                return Err(Error::IsDirectory);
            }
            ig.nlink += 1;
            ig.update();
        }

        let res = (|| {
            let (dp, name) = self.nameiparent(p, new)?;
            if dp.dev() != ip.dev() {
                return Err(Error::InvalidArgument);
            }
            let mut dg = dp.lock();
            dg.dirlink(name, ip.inum())
        })();

        if res.is_err() {
            let mut ig = ip.lock();
            ig.nlink -= 1;
            ig.update();
        }
        res
    }

    pub(crate) fn do_unlink(&self, p: &Proc, path: &Path) -> Result<()> {
        let (dp, name) = self.nameiparent(p, path)?;

        // Cannot unlink "." or "..".
        if name == "." || name == ".." {
            return Err(Error::InvalidArgument);
        }

        let mut dg = dp.lock();
        let (ip, off) = dg.dirlookup(name)?;
        let mut ig = ip.lock();

        assert!(ig.nlink >= 1, "unlink: nlink < 1");
        if ig.itype == IType::Dir && !ig.dirempty() {
            return Err(Error::NotEmpty);
        }

        let de = Dirent::default();
        let n = dg.write(de.as_bytes(), off).expect("unlink: writei");
        assert_eq!(n, DIRENT_SIZE, "unlink: writei");
        if ig.itype == IType::Dir {
            dg.nlink -= 1;
            dg.update();
        }
        drop(dg);

        ig.nlink -= 1;
        ig.update();
        Ok(())
    }

    pub(crate) fn create(
        &self,
        p: &Proc,
        path: &Path,
        itype: IType,
        major: u16,
        minor: u16,
    ) -> Result<Inode> {
        let (dp, name) = self.nameiparent(p, path)?;
        let mut dg = dp.lock();

        match dg.dirlookup(name) {
            Ok((ip, _)) => {
                drop(dg);
                let ig = ip.lock();
                if itype == IType::File && ig.itype == IType::File {
                    drop(ig);
                    return Ok(ip);
                }
                return Err(Error::AlreadyExists);
            }
            Err(Error::NotFound) => (),
            Err(e) => return Err(e),
        }

        if name.as_bytes().len() > DIRSIZ {
            return Err(Error::InvalidArgument);
        }

        let ip = self.ialloc(dp.dev(), itype);
        let mut ig = ip.lock();
        ig.major = major;
        ig.minor = minor;
        ig.nlink = 1;
        ig.update();

        if itype == IType::Dir {
            // Create . and .. entries; no nlink++ for "." to avoid a
            // cyclic reference count.
            ig.dirlink(".", ip.inum()).expect("create dots");
            ig.dirlink("..", dp.inum()).expect("create dots");
        }

        dg.dirlink(name, ip.inum()).expect("create: dirlink");

        if itype == IType::Dir {
            dg.nlink += 1; // for ".."
            dg.update();
        }

        drop(ig);
        drop(dg);
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::mkfs::mkfs;
    use crate::param::{FSSIZE, LOGSIZE};

    fn fresh() -> (Fs, Proc) {
        let disk = Arc::new(MemDisk::new(FSSIZE as u32));
        mkfs(&*disk, FSSIZE as u32, 200, LOGSIZE as u32).unwrap();
        let fs = Fs::mount(disk).unwrap();
        let p = Proc::new(&fs);
        (fs, p)
    }

    #[test]
    fn skip_elem_splits_paths() {
        let cases = [
            ("a/bb/c", Some(("a", "bb/c"))),
            ("///a//bb", Some(("a", "/bb"))),
            ("a", Some(("a", ""))),
            ("", None),
            ("////", None),
        ];
        for (input, want) in cases {
            let got = Path::new(input)
                .skip_elem()
                .map(|(name, rest)| (name, &rest.inner));
            assert_eq!(got, want.map(|(n, r)| (n, r)), "skip_elem({:?})", input);
        }
    }

    #[test]
    fn read_clamps_at_end_of_file() {
        let (fs, p) = fresh();
        fs.begin_op();
        let ip = fs.create(&p, Path::new("/f"), IType::File, 0, 0).unwrap();
        {
            let mut ig = ip.lock();
            assert_eq!(ig.write(b"hello", 0).unwrap(), 5);

            let mut buf = [0u8; 16];
            assert_eq!(ig.read(&mut buf, 0).unwrap(), 5);
            assert_eq!(&buf[..5], b"hello");
            // reading at the end returns zero bytes
            assert_eq!(ig.read(&mut buf, 5).unwrap(), 0);
            // reading past the end is an error
            assert!(ig.read(&mut buf, 6).is_err());
        }
        drop(ip);
        fs.end_op();
    }

    #[test]
    fn write_rejects_gap_and_giant_offsets() {
        let (fs, p) = fresh();
        fs.begin_op();
        let ip = fs.create(&p, Path::new("/f"), IType::File, 0, 0).unwrap();
        {
            let mut ig = ip.lock();
            // cannot start a write beyond the current size
            assert!(matches!(ig.write(b"x", 1), Err(Error::InvalidArgument)));
            // cannot grow past the maximum file size
            let big = vec![0u8; MAXFILE * BSIZE + 1];
            assert!(matches!(ig.write(&big, 0), Err(Error::FileTooLarge)));
        }
        drop(ip);
        fs.end_op();
    }

    #[test]
    fn indirect_block_is_allocated_lazily() {
        let (fs, p) = fresh();
        let chunk = [7u8; BSIZE];

        fs.begin_op();
        let ip = fs.create(&p, Path::new("/big"), IType::File, 0, 0).unwrap();
        drop(ip);
        fs.end_op();

        for i in 0..NDIRECT {
            fs.begin_op();
            let ip = fs.namei(&p, Path::new("/big")).unwrap();
            let mut ig = ip.lock();
            ig.write(&chunk, (i * BSIZE) as u32).unwrap();
            assert_eq!(ig.addrs[NDIRECT], 0);
            drop(ig);
            drop(ip);
            fs.end_op();
        }

        // The first write past the direct blocks brings in the
        // indirect block.
        fs.begin_op();
        let ip = fs.namei(&p, Path::new("/big")).unwrap();
        let mut ig = ip.lock();
        ig.write(&chunk, (NDIRECT * BSIZE) as u32).unwrap();
        assert_ne!(ig.addrs[NDIRECT], 0);
        assert_eq!(ig.size as usize, (NDIRECT + 1) * BSIZE);
        drop(ig);
        drop(ip);
        fs.end_op();
    }

    #[test]
    fn dirlink_reuses_freed_slots() {
        let (fs, p) = fresh();

        fs.begin_op();
        drop(fs.create(&p, Path::new("/a"), IType::File, 0, 0).unwrap());
        drop(fs.create(&p, Path::new("/b"), IType::File, 0, 0).unwrap());
        fs.end_op();

        let root = fs.iget(fs.inner.dev, ROOTINO);
        let a_off = {
            let mut rg = root.lock();
            let (ip, off) = rg.dirlookup("a").unwrap();
            drop(rg);
            fs.begin_op();
            drop(ip);
            fs.end_op();
            off
        };

        fs.begin_op();
        fs.do_unlink(&p, Path::new("/a")).unwrap();
        drop(fs.create(&p, Path::new("/c"), IType::File, 0, 0).unwrap());
        fs.end_op();

        let mut rg = root.lock();
        let (ip, c_off) = rg.dirlookup("c").unwrap();
        assert_eq!(c_off, a_off);
        drop(rg);
        fs.begin_op();
        drop(ip);
        fs.end_op();
    }

    #[test]
    fn names_use_all_fourteen_bytes() {
        let (fs, p) = fresh();
        let name = "abcdefghijklmn"; // exactly DIRSIZ
        assert_eq!(name.len(), DIRSIZ);
        let path = format!("/{}", name);

        fs.begin_op();
        drop(fs.create(&p, Path::new(&path), IType::File, 0, 0).unwrap());
        let found = fs.namei(&p, Path::new(&path));
        assert!(found.is_ok());
        drop(found);
        fs.end_op();

        // One byte longer cannot be linked.
        fs.begin_op();
        let too_long = fs.create(&p, Path::new("/abcdefghijklmno"), IType::File, 0, 0);
        assert!(matches!(too_long, Err(Error::InvalidArgument)));
        fs.end_op();
    }

    #[test]
    fn freed_inode_returns_to_pool() {
        let (fs, p) = fresh();

        fs.begin_op();
        let ip = fs.create(&p, Path::new("/gone"), IType::File, 0, 0).unwrap();
        let inum = ip.inum();
        drop(ip);
        fs.end_op();

        fs.begin_op();
        fs.do_unlink(&p, Path::new("/gone")).unwrap();
        fs.end_op();

        // The on-disk slot is free again.
        let bp = fs.inner.bcache.read(fs.inner.dev, fs.inner.sb.iblock(inum));
        let dip = bp.align_to::<DInode>()[inum as usize % IPB];
        assert_eq!(dip.itype, 0);
        drop(bp);

        // And the allocator hands the number out again.
        fs.begin_op();
        let ip = fs.create(&p, Path::new("/next"), IType::File, 0, 0).unwrap();
        assert_eq!(ip.inum(), inum);
        drop(ip);
        fs.end_op();
    }
}
