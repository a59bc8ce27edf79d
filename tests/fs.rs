// End-to-end tests driving the system-call surface over a
// memory-backed disk.

use octofs::fs::{DInode, SuperBlock, BSIZE, IPB, MAXFILE, NDIRECT};
use octofs::param::{FSSIZE, LOGSIZE, NOFILE};
use octofs::{mkfs, BlockDevice, Error, Fs, IType, MemDisk, OMode, Proc};
use std::sync::Arc;
use std::thread;

const NINODES: u32 = 200;

fn fresh() -> (Arc<MemDisk>, Fs, Proc) {
    let disk = Arc::new(MemDisk::new(FSSIZE as u32));
    mkfs(&*disk, FSSIZE as u32, NINODES, LOGSIZE as u32).unwrap();
    let fs = Fs::mount(disk.clone()).unwrap();
    let p = Proc::new(&fs);
    (disk, fs, p)
}

fn rdonly() -> OMode {
    OMode::new().read(true)
}

fn rdwr() -> OMode {
    OMode::new().read(true).write(true)
}

fn free_inode_count(disk: &MemDisk, sb: &SuperBlock) -> usize {
    let isize = core::mem::size_of::<DInode>();
    let mut free = 0;
    let mut buf = [0u8; BSIZE];
    for inum in 1..sb.ninodes {
        disk.read(sb.iblock(inum), &mut buf);
        let off = (inum as usize % IPB) * isize;
        let itype = u16::from_le_bytes([buf[off], buf[off + 1]]);
        if itype == 0 {
            free += 1;
        }
    }
    free
}

#[test]
fn create_read_delete() {
    let (_disk, fs, mut p) = fresh();

    let fd = fs.open(&mut p, "/a", rdwr().create(true)).unwrap();
    assert_eq!(fs.write(&p, fd, b"hello").unwrap(), 5);
    fs.close(&mut p, fd).unwrap();

    let fd = fs.open(&mut p, "/a", rdonly()).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    fs.close(&mut p, fd).unwrap();

    fs.unlink(&p, "/a").unwrap();
    assert_eq!(fs.open(&mut p, "/a", rdonly()).unwrap_err(), Error::NotFound);
}

#[test]
fn large_file_with_indirect_blocks() {
    let (_disk, fs, mut p) = fresh();
    let n = (NDIRECT + 3) * BSIZE;
    let data: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();

    let fd = fs.open(&mut p, "/big", rdwr().create(true)).unwrap();
    assert_eq!(fs.write(&p, fd, &data).unwrap(), n);
    fs.close(&mut p, fd).unwrap();

    let fd = fs.open(&mut p, "/big", rdonly()).unwrap();
    let st = fs.fstat(&p, fd).unwrap();
    assert_eq!(st.itype, IType::File);
    assert_eq!(st.size as usize, n);

    let mut back = vec![0u8; n];
    let mut got = 0;
    while got < n {
        let r = fs.read(&p, fd, &mut back[got..]).unwrap();
        assert!(r > 0);
        got += r;
    }
    assert_eq!(got, n);
    assert_eq!(back, data);
    fs.close(&mut p, fd).unwrap();
}

#[test]
fn file_stops_growing_at_max_size() {
    let (_disk, fs, mut p) = fresh();
    let total = MAXFILE * BSIZE;
    let chunk = vec![0x5au8; 8 * BSIZE];

    let fd = fs.open(&mut p, "/max", rdwr().create(true)).unwrap();
    let mut written = 0;
    while written < total {
        let n = chunk.len().min(total - written);
        assert_eq!(fs.write(&p, fd, &chunk[..n]).unwrap(), n);
        written += n;
    }
    assert_eq!(fs.fstat(&p, fd).unwrap().size as usize, total);
    assert_eq!(fs.write(&p, fd, b"x").unwrap_err(), Error::FileTooLarge);
    fs.close(&mut p, fd).unwrap();
}

#[test]
fn directory_semantics() {
    let (_disk, fs, mut p) = fresh();

    fs.mkdir(&p, "/d").unwrap();
    assert_eq!(fs.mkdir(&p, "/d").unwrap_err(), Error::AlreadyExists);

    let fd = fs
        .open(&mut p, "/d/f", OMode::new().write(true).create(true))
        .unwrap();
    assert_eq!(fs.write(&p, fd, b"x").unwrap(), 1);
    fs.close(&mut p, fd).unwrap();

    assert_eq!(fs.unlink(&p, "/d").unwrap_err(), Error::NotEmpty);
    fs.unlink(&p, "/d/f").unwrap();
    fs.unlink(&p, "/d").unwrap();
    assert_eq!(fs.open(&mut p, "/d", rdonly()).unwrap_err(), Error::NotFound);
}

#[test]
fn hard_link_identity() {
    let (disk, fs, mut p) = fresh();

    let fd = fs.open(&mut p, "/x", rdwr().create(true)).unwrap();
    fs.write(&p, fd, b"abc").unwrap();
    fs.close(&mut p, fd).unwrap();
    let before = free_inode_count(&disk, fs.superblock());

    fs.link(&p, "/x", "/y").unwrap();
    let fd = fs.open(&mut p, "/y", rdonly()).unwrap();
    assert_eq!(fs.fstat(&p, fd).unwrap().nlink, 2);
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
    fs.close(&mut p, fd).unwrap();

    fs.unlink(&p, "/x").unwrap();
    let fd = fs.open(&mut p, "/y", rdonly()).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
    fs.close(&mut p, fd).unwrap();

    fs.unlink(&p, "/y").unwrap();
    assert_eq!(fs.open(&mut p, "/x", rdonly()).unwrap_err(), Error::NotFound);
    assert_eq!(fs.open(&mut p, "/y", rdonly()).unwrap_err(), Error::NotFound);
    assert_eq!(free_inode_count(&disk, fs.superblock()), before + 1);
}

#[test]
fn link_rejects_directories_and_duplicates() {
    let (_disk, fs, mut p) = fresh();

    fs.mkdir(&p, "/d").unwrap();
    assert_eq!(fs.link(&p, "/d", "/d2").unwrap_err(), Error::IsDirectory);

    let fd = fs.open(&mut p, "/x", rdwr().create(true)).unwrap();
    fs.close(&mut p, fd).unwrap();
    let fd = fs.open(&mut p, "/y", rdwr().create(true)).unwrap();
    fs.close(&mut p, fd).unwrap();

    assert_eq!(fs.link(&p, "/x", "/y").unwrap_err(), Error::AlreadyExists);
    // the failed link rolled its nlink bump back
    let fd = fs.open(&mut p, "/x", rdonly()).unwrap();
    assert_eq!(fs.fstat(&p, fd).unwrap().nlink, 1);
    fs.close(&mut p, fd).unwrap();
}

#[test]
fn dup_shares_the_offset() {
    let (_disk, fs, mut p) = fresh();

    let fd = fs.open(&mut p, "/p", rdwr().create(true)).unwrap();
    let fd2 = fs.dup(&mut p, fd).unwrap();
    fs.write(&p, fd, b"ab").unwrap();
    fs.write(&p, fd2, b"cd").unwrap();
    fs.close(&mut p, fd).unwrap();
    fs.close(&mut p, fd2).unwrap();

    let fd = fs.open(&mut p, "/p", rdonly()).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"abcd");
    fs.close(&mut p, fd).unwrap();
}

#[test]
fn reopen_starts_at_offset_zero() {
    let (_disk, fs, mut p) = fresh();

    let fd = fs.open(&mut p, "/f", rdwr().create(true)).unwrap();
    fs.write(&p, fd, b"abc").unwrap();
    fs.close(&mut p, fd).unwrap();

    let fd = fs.open(&mut p, "/f", rdonly()).unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"abc");
    fs.close(&mut p, fd).unwrap();
}

#[test]
fn truncate_on_open_discards_content() {
    let (_disk, fs, mut p) = fresh();

    let fd = fs.open(&mut p, "/t", rdwr().create(true)).unwrap();
    fs.write(&p, fd, b"old contents").unwrap();
    fs.close(&mut p, fd).unwrap();

    let fd = fs
        .open(&mut p, "/t", OMode::new().write(true).truncate(true))
        .unwrap();
    assert_eq!(fs.fstat(&p, fd).unwrap().size, 0);
    fs.write(&p, fd, b"new").unwrap();
    fs.close(&mut p, fd).unwrap();

    let fd = fs.open(&mut p, "/t", rdonly()).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"new");
    fs.close(&mut p, fd).unwrap();
}

#[test]
fn remount_preserves_committed_state() {
    let disk = Arc::new(MemDisk::new(FSSIZE as u32));
    mkfs(&*disk, FSSIZE as u32, NINODES, LOGSIZE as u32).unwrap();

    {
        let fs = Fs::mount(disk.clone()).unwrap();
        let mut p = Proc::new(&fs);
        let fd = fs.open(&mut p, "/persist", rdwr().create(true)).unwrap();
        fs.write(&p, fd, b"written before remount").unwrap();
        fs.close(&mut p, fd).unwrap();
        fs.mkdir(&p, "/dir").unwrap();
    }

    let fs = Fs::mount(disk).unwrap();
    let mut p = Proc::new(&fs);
    let fd = fs.open(&mut p, "/persist", rdonly()).unwrap();
    let mut buf = [0u8; 64];
    let n = fs.read(&p, fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"written before remount");
    fs.close(&mut p, fd).unwrap();

    fs.chdir(&mut p, "/dir").unwrap();
}

#[test]
fn chdir_resolves_relative_paths() {
    let (_disk, fs, mut p) = fresh();

    fs.mkdir(&p, "/d").unwrap();
    fs.chdir(&mut p, "/d").unwrap();

    let fd = fs.open(&mut p, "f", rdwr().create(true)).unwrap();
    fs.write(&p, fd, b"rel").unwrap();
    fs.close(&mut p, fd).unwrap();

    let fd = fs.open(&mut p, "/d/f", rdonly()).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 3);
    fs.close(&mut p, fd).unwrap();

    // .. climbs back to the root
    fs.chdir(&mut p, "..").unwrap();
    assert!(fs.open(&mut p, "d/f", rdonly()).is_ok());

    assert_eq!(
        fs.chdir(&mut p, "/d/f").unwrap_err(),
        Error::NotADirectory
    );
}

#[test]
fn path_edge_cases() {
    let (_disk, fs, mut p) = fresh();

    // consecutive separators collapse; "////" names the root
    let fd = fs.open(&mut p, "////", rdonly()).unwrap();
    assert_eq!(fs.fstat(&p, fd).unwrap().itype, IType::Dir);
    fs.close(&mut p, fd).unwrap();

    assert_eq!(fs.open(&mut p, "", rdonly()).unwrap_err(), Error::NotFound);

    fs.mkdir(&p, "/e").unwrap();
    assert!(fs.open(&mut p, "///e//.", rdonly()).is_ok());

    // a directory may only be opened read-only
    assert_eq!(fs.open(&mut p, "/e", rdwr()).unwrap_err(), Error::IsDirectory);

    // traversing through a file fails
    let fd = fs.open(&mut p, "/plain", rdwr().create(true)).unwrap();
    fs.close(&mut p, fd).unwrap();
    assert_eq!(
        fs.open(&mut p, "/plain/x", rdonly()).unwrap_err(),
        Error::NotADirectory
    );

    assert_eq!(fs.unlink(&p, "/e/.").unwrap_err(), Error::InvalidArgument);
}

#[test]
fn descriptor_permissions_and_exhaustion() {
    let (_disk, fs, mut p) = fresh();

    let fd = fs
        .open(&mut p, "/f", OMode::new().write(true).create(true))
        .unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap_err(), Error::PermissionDenied);
    fs.close(&mut p, fd).unwrap();

    let fd = fs.open(&mut p, "/f", rdonly()).unwrap();
    assert_eq!(fs.write(&p, fd, b"no").unwrap_err(), Error::PermissionDenied);
    fs.close(&mut p, fd).unwrap();

    assert_eq!(fs.read(&p, 9, &mut buf).unwrap_err(), Error::BadFileDescriptor);
    assert_eq!(fs.close(&mut p, 99).unwrap_err(), Error::BadFileDescriptor);

    let mut fds = Vec::new();
    for _ in 0..NOFILE {
        fds.push(fs.open(&mut p, "/f", rdonly()).unwrap());
    }
    assert_eq!(
        fs.open(&mut p, "/f", rdonly()).unwrap_err(),
        Error::TooManyOpenFiles
    );
    for fd in fds {
        fs.close(&mut p, fd).unwrap();
    }
}

#[test]
fn pipe_moves_bytes_and_signals_eof() {
    let (_disk, fs, mut p) = fresh();

    let (rfd, wfd) = fs.pipe(&mut p).unwrap();
    assert_eq!(fs.write(&p, wfd, b"ping").unwrap(), 4);
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(&p, rfd, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");

    fs.write(&p, wfd, b"tail").unwrap();
    fs.close(&mut p, wfd).unwrap();
    assert_eq!(fs.read(&p, rfd, &mut buf).unwrap(), 4);
    // write end closed and drained: end of file
    assert_eq!(fs.read(&p, rfd, &mut buf).unwrap(), 0);
    fs.close(&mut p, rfd).unwrap();

    let (rfd, wfd) = fs.pipe(&mut p).unwrap();
    fs.close(&mut p, rfd).unwrap();
    assert_eq!(fs.write(&p, wfd, b"x").unwrap_err(), Error::BrokenPipe);
    fs.close(&mut p, wfd).unwrap();
}

#[test]
fn pipe_blocks_until_drained() {
    let (_disk, fs, mut p) = fresh();
    let (rfd, wfd) = fs.pipe(&mut p).unwrap();

    // 4x the ring size, so the writer has to block
    let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
    let p = &p;

    thread::scope(|s| {
        let writer = s.spawn(|| {
            assert_eq!(fs.write(p, wfd, &data).unwrap(), data.len());
        });

        let mut back = Vec::new();
        let mut buf = [0u8; 256];
        while back.len() < data.len() {
            let n = fs.read(p, rfd, &mut buf).unwrap();
            assert!(n > 0);
            back.extend_from_slice(&buf[..n]);
        }
        assert_eq!(back, data);
        writer.join().unwrap();
    });
}

#[test]
fn concurrent_writers_stay_isolated() {
    let (_disk, fs, _p) = fresh();

    thread::scope(|s| {
        for t in 0..4usize {
            let fs = fs.clone();
            s.spawn(move || {
                let mut p = Proc::new(&fs);
                let path = format!("/w{}", t);
                let data: Vec<u8> = (0..4 * BSIZE).map(|i| ((i + t) % 251) as u8).collect();

                let fd = fs.open(&mut p, &path, rdwr().create(true)).unwrap();
                fs.write(&p, fd, &data).unwrap();
                fs.close(&mut p, fd).unwrap();

                let fd = fs.open(&mut p, &path, rdonly()).unwrap();
                let mut back = vec![0u8; data.len()];
                let mut got = 0;
                while got < data.len() {
                    let n = fs.read(&p, fd, &mut back[got..]).unwrap();
                    assert!(n > 0);
                    got += n;
                }
                assert_eq!(back, data);
                fs.close(&mut p, fd).unwrap();
            });
        }
    });
}

#[test]
fn device_nodes_dispatch_to_drivers() {
    struct ZeroDev;
    impl octofs::Device for ZeroDev {
        fn read(&self, dst: &mut [u8]) -> octofs::Result<usize> {
            dst.fill(b'z');
            Ok(dst.len())
        }
        fn write(&self, src: &[u8]) -> octofs::Result<usize> {
            Ok(src.len())
        }
    }

    let (_disk, fs, mut p) = fresh();
    fs.register_device(1, Arc::new(ZeroDev)).unwrap();

    fs.mknod(&p, "/zero", 1, 0).unwrap();
    let fd = fs.open(&mut p, "/zero", rdwr()).unwrap();
    assert_eq!(fs.fstat(&p, fd).unwrap().itype, IType::Device);
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"zzzzz");
    assert_eq!(fs.write(&p, fd, b"sink").unwrap(), 4);
    fs.close(&mut p, fd).unwrap();

    // a node with no registered driver cannot be opened
    fs.mknod(&p, "/nodrv", 7, 0).unwrap();
    assert_eq!(fs.open(&mut p, "/nodrv", rdonly()).unwrap_err(), Error::NoDevice);
}

#[test]
fn new_directories_start_with_dot_entries() {
    let (_disk, fs, mut p) = fresh();
    fs.mkdir(&p, "/d").unwrap();

    let fd = fs.open(&mut p, "/d", rdonly()).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(fs.read(&p, fd, &mut buf).unwrap(), 32);
    fs.close(&mut p, fd).unwrap();

    // entry 0 is "." and entry 1 is "..", both non-free
    assert_ne!(u16::from_le_bytes([buf[0], buf[1]]), 0);
    assert_eq!(&buf[2..4], b".\0");
    assert_ne!(u16::from_le_bytes([buf[16], buf[17]]), 0);
    assert_eq!(&buf[18..21], b"..\0");
}

#[test]
fn bitmap_matches_reachable_blocks() {
    use std::collections::HashSet;

    let (disk, fs, mut p) = fresh();

    // Grow a file into the indirect block, add a directory, and leave
    // a deleted file behind.
    let data = vec![0x42u8; (NDIRECT + 2) * BSIZE];
    let fd = fs.open(&mut p, "/big", rdwr().create(true)).unwrap();
    fs.write(&p, fd, &data).unwrap();
    fs.close(&mut p, fd).unwrap();
    fs.mkdir(&p, "/d").unwrap();
    let fd = fs.open(&mut p, "/d/gone", rdwr().create(true)).unwrap();
    fs.write(&p, fd, b"temp").unwrap();
    fs.close(&mut p, fd).unwrap();
    fs.unlink(&p, "/d/gone").unwrap();

    let sb = fs.superblock();
    let isize = core::mem::size_of::<DInode>();
    let nmeta = sb.size - sb.nblocks;

    // Every block reachable from a live inode.
    let mut reachable = HashSet::new();
    let mut buf = [0u8; BSIZE];
    let mut ind = [0u8; BSIZE];
    for inum in 1..sb.ninodes {
        disk.read(sb.iblock(inum), &mut buf);
        let off = (inum as usize % IPB) * isize;
        if u16::from_le_bytes([buf[off], buf[off + 1]]) == 0 {
            continue;
        }
        for k in 0..=NDIRECT {
            let a = off + 12 + 4 * k;
            let addr = u32::from_le_bytes([buf[a], buf[a + 1], buf[a + 2], buf[a + 3]]);
            if addr != 0 {
                reachable.insert(addr);
                if k == NDIRECT {
                    disk.read(addr, &mut ind);
                    for w in ind.chunks_exact(4) {
                        let ia = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
                        if ia != 0 {
                            reachable.insert(ia);
                        }
                    }
                }
            }
        }
    }

    // Every data-area bit set in the bitmap.
    let mut marked = HashSet::new();
    for b in nmeta..sb.size {
        disk.read(sb.bblock(b), &mut buf);
        let bi = (b % (8 * BSIZE as u32)) as usize;
        if buf[bi / 8] & (1 << (bi % 8)) != 0 {
            marked.insert(b);
        }
    }

    assert_eq!(marked, reachable);
}

#[test]
fn unlinked_file_lives_until_closed() {
    let (disk, fs, mut p) = fresh();

    let fd = fs.open(&mut p, "/ghost", rdwr().create(true)).unwrap();
    fs.write(&p, fd, b"still here").unwrap();

    fs.unlink(&p, "/ghost").unwrap();
    assert_eq!(fs.open(&mut p, "/ghost", rdonly()).unwrap_err(), Error::NotFound);

    // The open descriptor keeps the inode and its data alive.
    let fd2 = fs.dup(&mut p, fd).unwrap();
    fs.close(&mut p, fd).unwrap();
    assert_eq!(fs.fstat(&p, fd2).unwrap().nlink, 0);

    let before = free_inode_count(&disk, fs.superblock());
    fs.close(&mut p, fd2).unwrap();
    // The last close frees the inode on disk.
    assert_eq!(free_inode_count(&disk, fs.superblock()), before + 1);
}
