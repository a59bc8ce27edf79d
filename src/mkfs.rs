// Build an empty file system image on a block device: superblock,
// cleared log, inode table with a root directory, and a bitmap
// accounting for every metadata block. Blocks and inodes are handed
// out sequentially while building; the bitmap is written last, once
// the final allocation frontier is known.

use crate::device::{BlockDevice, SectorBuf};
use crate::fs::{
    DInode, Dirent, SuperBlock, BPB, BSIZE, DIRENT_SIZE, DIRSIZ, IPB, MAXFILE, NDIRECT, ROOTINO,
};
use crate::stat::IType;
use crate::{Error, Result};
use zerocopy::{AsBytes, LayoutVerified};

pub struct ImageBuilder<'a> {
    dev: &'a dyn BlockDevice,
    sb: SuperBlock,
    freeinode: u32,
    freeblock: u32,
}

impl<'a> ImageBuilder<'a> {
    // Lay out the image and create the root directory.
    pub fn new(dev: &'a dyn BlockDevice, size: u32, ninodes: u32, nlog: u32) -> Result<Self> {
        let nbitmap = size / BPB + 1;
        let ninodeblocks = ninodes / IPB as u32 + 1;
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;
        if nlog < 2 || size <= nmeta + 1 {
            return Err(Error::InvalidArgument);
        }

        let sb = SuperBlock {
            size,
            nblocks: size - nmeta,
            ninodes,
            nlog,
            logstart: 2,
            inodestart: 2 + nlog,
            bmapstart: 2 + nlog + ninodeblocks,
        };
        log::debug!(
            "mkfs: meta {} (boot, super, log {}, inode {}, bitmap {}) data {} total {}",
            nmeta,
            nlog,
            ninodeblocks,
            nbitmap,
            sb.nblocks,
            size
        );

        let mut builder = Self {
            dev,
            sb,
            freeinode: 1,
            freeblock: nmeta, // the first block we can allocate
        };

        let zero = SectorBuf::zeroed();
        for sec in 0..size {
            builder.wsect(sec, &zero);
        }

        let mut buf = SectorBuf::zeroed();
        buf.0[..core::mem::size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());
        builder.wsect(1, &buf);

        let root = builder.ialloc(IType::Dir)?;
        assert_eq!(root, ROOTINO, "mkfs: root inode");
        builder.dirent(root, ".", root)?;
        builder.dirent(root, "..", root)?;

        Ok(builder)
    }

    // Add a regular file to the root directory.
    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<u32> {
        let inum = self.ialloc(IType::File)?;
        self.iappend(inum, data)?;
        self.dirent(ROOTINO, name, inum)?;
        Ok(inum)
    }

    // Write the bitmap covering everything allocated so far.
    pub fn finish(self) -> Result<SuperBlock> {
        let used = self.freeblock;
        log::debug!("mkfs: first {} blocks allocated", used);
        assert!(used < BPB, "mkfs: bitmap spans one block");
        let mut buf = SectorBuf::zeroed();
        for b in 0..used as usize {
            buf.0[b / 8] |= 1 << (b % 8);
        }
        self.wsect(self.sb.bmapstart, &buf);
        Ok(self.sb)
    }

    fn wsect(&self, sec: u32, buf: &SectorBuf) {
        self.dev.write(sec, &buf.0);
    }

    fn rsect(&self, sec: u32, buf: &mut SectorBuf) {
        self.dev.read(sec, &mut buf.0);
    }

    fn winode(&self, inum: u32, din: &DInode) {
        let bn = self.sb.iblock(inum);
        let mut buf = SectorBuf::zeroed();
        self.rsect(bn, &mut buf);
        {
            let dinodes = LayoutVerified::<_, [DInode]>::new_slice(&mut buf.0[..])
                .expect("inode cast")
                .into_mut_slice();
            dinodes[inum as usize % IPB] = *din;
        }
        self.wsect(bn, &buf);
    }

    fn rinode(&self, inum: u32) -> DInode {
        let bn = self.sb.iblock(inum);
        let mut buf = SectorBuf::zeroed();
        self.rsect(bn, &mut buf);
        let dinodes = LayoutVerified::<_, [DInode]>::new_slice(&buf.0[..])
            .expect("inode cast")
            .into_slice();
        dinodes[inum as usize % IPB]
    }

    fn ialloc(&mut self, itype: IType) -> Result<u32> {
        if self.freeinode >= self.sb.ninodes {
            return Err(Error::InvalidArgument);
        }
        let inum = self.freeinode;
        self.freeinode += 1;
        let din = DInode {
            itype: itype.as_u16(),
            nlink: 1,
            size: 0,
            ..Default::default()
        };
        self.winode(inum, &din);
        Ok(inum)
    }

    fn balloc(&mut self) -> Result<u32> {
        if self.freeblock >= self.sb.size {
            return Err(Error::InvalidArgument);
        }
        let b = self.freeblock;
        self.freeblock += 1;
        Ok(b)
    }

    fn dirent(&mut self, dir: u32, name: &str, inum: u32) -> Result<()> {
        if name.as_bytes().len() > DIRSIZ {
            return Err(Error::InvalidArgument);
        }
        let mut de = Dirent {
            inum: inum as u16,
            name: [0; DIRSIZ],
        };
        de.name[..name.len()].copy_from_slice(name.as_bytes());
        assert_eq!(de.as_bytes().len(), DIRENT_SIZE);
        self.iappend(dir, de.as_bytes())
    }

    fn iappend(&mut self, inum: u32, data: &[u8]) -> Result<()> {
        let mut din = self.rinode(inum);
        let mut off = din.size as usize;
        let mut p = 0;
        let mut n = data.len();

        while n > 0 {
            let fbn = off / BSIZE;
            assert!(fbn < MAXFILE, "iappend: file too big");
            let x = if fbn < NDIRECT {
                if din.addrs[fbn] == 0 {
                    din.addrs[fbn] = self.balloc()?;
                }
                din.addrs[fbn]
            } else {
                if din.addrs[NDIRECT] == 0 {
                    din.addrs[NDIRECT] = self.balloc()?;
                }
                let idx = fbn - NDIRECT;
                let mut ind = SectorBuf::zeroed();
                self.rsect(din.addrs[NDIRECT], &mut ind);
                let mut addr = {
                    let addrs = LayoutVerified::<_, [u32]>::new_slice(&ind.0[..])
                        .expect("indirect cast")
                        .into_slice();
                    addrs[idx]
                };
                if addr == 0 {
                    addr = self.balloc()?;
                    {
                        let addrs = LayoutVerified::<_, [u32]>::new_slice(&mut ind.0[..])
                            .expect("indirect cast")
                            .into_mut_slice();
                        addrs[idx] = addr;
                    }
                    self.wsect(din.addrs[NDIRECT], &ind);
                }
                addr
            };

            let n1 = core::cmp::min(n, (fbn + 1) * BSIZE - off);
            let mut buf = SectorBuf::zeroed();
            self.rsect(x, &mut buf);
            let boff = off - fbn * BSIZE;
            buf.0[boff..boff + n1].copy_from_slice(&data[p..p + n1]);
            self.wsect(x, &buf);

            n -= n1;
            off += n1;
            p += n1;
        }

        din.size = off as u32;
        self.winode(inum, &din);
        Ok(())
    }
}

// Write an empty file system onto dev.
pub fn mkfs(dev: &dyn BlockDevice, size: u32, ninodes: u32, nlog: u32) -> Result<SuperBlock> {
    ImageBuilder::new(dev, size, ninodes, nlog)?.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::param::LOGSIZE;

    #[test]
    fn layout_is_self_consistent() {
        let disk = MemDisk::new(2000);
        let sb = mkfs(&disk, 2000, 200, LOGSIZE as u32).unwrap();
        assert_eq!(sb.size, 2000);
        assert_eq!(sb.logstart, 2);
        assert_eq!(sb.inodestart, 2 + sb.nlog);
        assert_eq!(sb.bmapstart, sb.inodestart + sb.ninodes / IPB as u32 + 1);
        assert_eq!(
            sb.nblocks,
            sb.size - (2 + sb.nlog + sb.ninodes / IPB as u32 + 1 + sb.size / BPB + 1)
        );
    }

    #[test]
    fn root_directory_has_dot_entries() {
        let disk = MemDisk::new(2000);
        let sb = mkfs(&disk, 2000, 200, LOGSIZE as u32).unwrap();

        let mut buf = SectorBuf::zeroed();
        disk.read(sb.iblock(ROOTINO), &mut buf.0);
        let dinodes = LayoutVerified::<_, [DInode]>::new_slice(&buf.0[..])
            .unwrap()
            .into_slice();
        let root = dinodes[ROOTINO as usize % IPB];
        assert_eq!(root.itype, IType::Dir.as_u16());
        assert_eq!(root.size as usize, 2 * DIRENT_SIZE);

        let mut data = SectorBuf::zeroed();
        disk.read(root.addrs[0], &mut data.0);
        let entries = LayoutVerified::<_, [Dirent]>::new_slice(&data.0[..])
            .unwrap()
            .into_slice();
        assert_eq!(entries[0].inum, ROOTINO as u16);
        assert_eq!(&entries[0].name[..2], b".\0");
        assert_eq!(entries[1].inum, ROOTINO as u16);
        assert_eq!(&entries[1].name[..3], b"..\0");
    }

    #[test]
    fn seeded_file_survives() {
        let disk = MemDisk::new(2000);
        let mut b = ImageBuilder::new(&disk, 2000, 200, LOGSIZE as u32).unwrap();
        let data: Vec<u8> = (0..3 * BSIZE).map(|i| (i % 251) as u8).collect();
        b.add_file("seed", &data).unwrap();
        b.finish().unwrap();

        let fs = crate::Fs::mount(std::sync::Arc::new(disk)).unwrap();
        let mut p = crate::proc::Proc::new(&fs);
        let fd = fs
            .open(&mut p, "/seed", crate::fcntl::OMode::new().read(true))
            .unwrap();
        let mut back = vec![0u8; data.len() + 10];
        let n = fs.read(&p, fd, &mut back).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(&back[..n], &data[..]);
    }
}
