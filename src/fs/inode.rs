//! Inode layer: the on-disk record, the in-memory inode, and the per
//! partition open-inode cache.
//!
//! A record is 60 bytes, packed back to back in the inode table, so a slot
//! may straddle a sector boundary; `inode_open` and `inode_sync` read and
//! write the full sector span of the slot.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::err::{KernelError, Result};
use crate::fs::superblock::SuperBlock;
use crate::ide::Partition;
use crate::kernel::Kernel;
use crate::param::{NDIRECT, NINDIRECT, SECTOR_SIZE};
use crate::sync::SleepLock;

/// On-disk inode record: number, byte size, 12 direct LBAs plus the LBA of
/// the single indirect table.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct DiskInode {
    pub i_no: u32,
    pub i_size: u32,
    pub i_sectors: [u32; NDIRECT + 1],
}

pub const INODE_RECORD_SIZE: usize = core::mem::size_of::<DiskInode>();
const_assert_eq!(INODE_RECORD_SIZE, 60);

/// In-memory inode, shared through the partition's open-inode list.
pub struct Inode {
    pub i_no: u32,
    /// Opens across all tasks; the in-memory copy dies when it hits zero.
    pub(crate) open_cnt: AtomicU32,
    /// Single-writer flag, toggled with interrupts off.
    pub(crate) write_deny: AtomicBool,
    pub(crate) inner: SleepLock<InodeInner>,
}

pub(crate) struct InodeInner {
    pub i_size: u32,
    pub i_sectors: [u32; NDIRECT + 1],
}

impl Inode {
    fn from_disk(dino: &DiskInode) -> Arc<Self> {
        Arc::new(Self {
            i_no: dino.i_no,
            open_cnt: AtomicU32::new(1),
            write_deny: AtomicBool::new(false),
            inner: SleepLock::new(
                "inode",
                InodeInner {
                    i_size: dino.i_size,
                    i_sectors: dino.i_sectors,
                },
            ),
        })
    }

    /// Fresh in-memory inode for a file being created.
    pub(crate) fn init(i_no: u32) -> Arc<Self> {
        let mut dino = DiskInode::default();
        dino.i_no = i_no;
        Self::from_disk(&dino)
    }

    pub fn open_cnt(&self) -> u32 {
        self.open_cnt.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u32 {
        self.inner.lock().i_size
    }

    pub(crate) fn to_disk(&self) -> DiskInode {
        let inner = self.inner.lock();
        DiskInode {
            i_no: self.i_no,
            i_size: inner.i_size,
            i_sectors: inner.i_sectors,
        }
    }
}

/// Where an inode record sits: start LBA of its span, byte offset within,
/// and whether the record runs into the following sector.
fn inode_locate(sb: &SuperBlock, i_no: u32) -> (u32, usize, bool) {
    let byte_off = i_no as usize * INODE_RECORD_SIZE;
    let sec = byte_off / SECTOR_SIZE;
    let off_in_sec = byte_off % SECTOR_SIZE;
    let crosses = off_in_sec + INODE_RECORD_SIZE > SECTOR_SIZE;
    (sb.inode_table_lba + sec as u32, off_in_sec, crosses)
}

impl Kernel {
    /// Share the partition's cached copy of inode `i_no`, loading it from
    /// the inode table on first open.
    pub(crate) fn inode_open(&self, part: &Arc<Partition>, i_no: u32) -> Arc<Inode> {
        let mut pi = part.inner.lock();
        if let Some(found) = pi.open_inodes.iter().find(|i| i.i_no == i_no) {
            found.open_cnt.fetch_add(1, Ordering::SeqCst);
            return Arc::clone(found);
        }

        let sb = pi.sb.expect("partition not mounted");
        let (lba, off, crosses) = inode_locate(&sb, i_no);
        let sects = if crosses { 2 } else { 1 };
        let mut buf = vec![0u8; sects * SECTOR_SIZE];
        self.ide.read(part.disk, lba, &mut buf, sects as u32);
        let mut dino = DiskInode::default();
        dino.as_bytes_mut()
            .copy_from_slice(&buf[off..off + INODE_RECORD_SIZE]);
        debug_assert_eq!(dino.i_no, i_no);

        let inode = Inode::from_disk(&dino);
        pi.open_inodes.push(Arc::clone(&inode));
        inode
    }

    /// Drop one open; the last close unlinks the in-memory copy from the
    /// partition list. The on-disk record is untouched.
    pub(crate) fn inode_close(&self, part: &Arc<Partition>, inode: &Arc<Inode>) {
        let mut pi = part.inner.lock();
        if inode.open_cnt.fetch_sub(1, Ordering::SeqCst) == 1 {
            pi.open_inodes.retain(|i| i.i_no != inode.i_no);
        }
    }

    /// Persist the three on-disk fields of `dino` into its inode-table slot,
    /// read-modify-writing the sector span around it.
    pub(crate) fn inode_sync(&self, part: &Arc<Partition>, dino: &DiskInode) {
        let sb = part.inner.lock().sb.expect("partition not mounted");
        let (lba, off, crosses) = inode_locate(&sb, dino.i_no);
        let sects = if crosses { 2 } else { 1 };
        let mut buf = vec![0u8; sects * SECTOR_SIZE];
        self.ide.read(part.disk, lba, &mut buf, sects as u32);
        buf[off..off + INODE_RECORD_SIZE].copy_from_slice(dino.as_bytes());
        self.ide.write(part.disk, lba, &buf, sects as u32);
    }

    /// Give the on-disk inode and every block it addresses back to the
    /// bitmaps, syncing each touched bitmap sector. In-memory copies are the
    /// caller's business.
    pub(crate) fn inode_release(&self, part: &Arc<Partition>, i_no: u32) {
        let inode = self.inode_open(part, i_no);
        let (sectors, data_start) = {
            let inner = inode.inner.lock();
            let sb = part.inner.lock().sb.expect("partition not mounted");
            (inner.i_sectors, sb.data_start_lba)
        };

        let mut blocks: Vec<u32> = sectors[..NDIRECT].iter().copied().collect();
        if sectors[NDIRECT] != 0 {
            let mut buf = vec![0u8; SECTOR_SIZE];
            self.ide.read(part.disk, sectors[NDIRECT], &mut buf, 1);
            for chunk in buf.chunks_exact(4).take(NINDIRECT) {
                blocks.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            // The indirect table's own sector goes back too.
            blocks.push(sectors[NDIRECT]);
        }

        for lba in blocks.into_iter().filter(|&l| l != 0) {
            let bit = (lba - data_start) as usize;
            part.inner.lock().block_bitmap.set(bit, false);
            self.bitmap_sync(part, bit, BitmapKind::Block);
        }

        part.inner.lock().inode_bitmap.set(i_no as usize, false);
        self.bitmap_sync(part, i_no as usize, BitmapKind::Inode);

        self.inode_close(part, &inode);
    }

    /// Claim a free inode number; in-memory only, the caller syncs.
    pub(crate) fn inode_bitmap_alloc(&self, part: &Arc<Partition>) -> Result<u32> {
        let mut pi = part.inner.lock();
        let bit = pi.inode_bitmap.scan(1).ok_or(KernelError::NoSpace)?;
        pi.inode_bitmap.set(bit, true);
        Ok(bit as u32)
    }

    /// Claim a free data block, returning its LBA; in-memory only.
    pub(crate) fn block_bitmap_alloc(&self, part: &Arc<Partition>) -> Result<u32> {
        let mut pi = part.inner.lock();
        let bit = pi.block_bitmap.scan(1).ok_or(KernelError::NoSpace)?;
        pi.block_bitmap.set(bit, true);
        let sb = pi.sb.expect("partition not mounted");
        Ok(sb.data_start_lba + bit as u32)
    }

    /// Persist the one bitmap sector holding `bit_idx`.
    pub(crate) fn bitmap_sync(&self, part: &Arc<Partition>, bit_idx: usize, kind: BitmapKind) {
        let off_sec = bit_idx / crate::param::BITS_PER_SECTOR;
        let off_size = off_sec * SECTOR_SIZE;
        let (lba, sector) = {
            let pi = part.inner.lock();
            let sb = pi.sb.expect("partition not mounted");
            let (base_lba, bits) = match kind {
                BitmapKind::Inode => (sb.inode_bitmap_lba, pi.inode_bitmap.bytes()),
                BitmapKind::Block => (sb.block_bitmap_lba, pi.block_bitmap.bytes()),
            };
            let mut sector = vec![0u8; SECTOR_SIZE];
            sector.copy_from_slice(&bits[off_size..off_size + SECTOR_SIZE]);
            (base_lba + off_sec as u32, sector)
        };
        self.ide.write(part.disk, lba, &sector, 1);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitmapKind {
    Inode,
    Block,
}
