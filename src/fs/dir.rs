//! Directory layer: fixed-size entries inside a directory's file body.
//!
//! Entries never straddle a sector boundary; a free slot is one whose type
//! tag is unknown. Every directory starts life with `.` and `..` in its
//! first data block.

use std::sync::Arc;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::err::{KernelError, Result};
use crate::fs::inode::{BitmapKind, DiskInode, Inode};
use crate::fs::FileType;
use crate::ide::Partition;
use crate::kernel::Kernel;
use crate::param::{MAX_FILE_BLOCKS, MAX_FILE_NAME_LEN, NDIRECT, NINDIRECT, SECTOR_SIZE};

/// On-disk directory entry: null-padded name, inode number, type tag.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct DirEntry {
    pub filename: [u8; MAX_FILE_NAME_LEN + 1],
    pub i_no: u32,
    pub f_type: u8,
}

pub const DIR_ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();
const_assert_eq!(DIR_ENTRY_SIZE, 21);

/// Whole entries per sector; the tail bytes stay unused.
pub const DIR_ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;

impl Default for DirEntry {
    fn default() -> Self {
        Self {
            filename: [0; MAX_FILE_NAME_LEN + 1],
            i_no: 0,
            f_type: FileType::Unknown as u8,
        }
    }
}

impl DirEntry {
    pub fn new(name: &str, i_no: u32, f_type: FileType) -> Result<Self> {
        if name.len() > MAX_FILE_NAME_LEN {
            return Err(KernelError::NameTooLong);
        }
        let mut e = DirEntry {
            filename: [0; MAX_FILE_NAME_LEN + 1],
            i_no,
            f_type: f_type as u8,
        };
        e.filename[..name.len()].copy_from_slice(name.as_bytes());
        Ok(e)
    }

    pub fn is_free(&self) -> bool {
        self.f_type == FileType::Unknown as u8
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_tag(self.f_type)
    }

    pub fn inode_no(&self) -> u32 {
        self.i_no
    }

    pub fn name(&self) -> String {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.filename.len());
        String::from_utf8_lossy(&self.filename[..end]).into_owned()
    }
}

/// An open directory: shared inode plus a read cursor.
pub struct Dir {
    pub part: Arc<Partition>,
    pub inode: Arc<Inode>,
    dir_pos: u32,
}

impl Dir {
    pub fn inode_no(&self) -> u32 {
        self.inode.i_no
    }

    pub fn rewind(&mut self) {
        self.dir_pos = 0;
    }
}

impl Kernel {
    pub(crate) fn dir_open(&self, part: &Arc<Partition>, i_no: u32) -> Dir {
        Dir {
            part: Arc::clone(part),
            inode: self.inode_open(part, i_no),
            dir_pos: 0,
        }
    }

    pub(crate) fn dir_close(&self, dir: Dir) {
        self.inode_close(&dir.part, &dir.inode);
    }

    /// All 140 potential block LBAs of `inode`, indirect table included
    /// when present. Zero means unallocated.
    pub(crate) fn collect_blocks(&self, part: &Arc<Partition>, inode: &Arc<Inode>) -> Vec<u32> {
        let (direct, indirect_lba) = {
            let inner = inode.inner.lock();
            (inner.i_sectors, inner.i_sectors[NDIRECT])
        };
        let mut blocks = vec![0u32; MAX_FILE_BLOCKS];
        blocks[..NDIRECT].copy_from_slice(&direct[..NDIRECT]);
        if indirect_lba != 0 {
            let mut buf = vec![0u8; SECTOR_SIZE];
            self.ide.read(part.disk, indirect_lba, &mut buf, 1);
            for (slot, chunk) in blocks[NDIRECT..].iter_mut().zip(buf.chunks_exact(4)) {
                *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        blocks
    }

    /// Case-sensitive exact lookup of `name` in `dir`.
    pub(crate) fn search_dir_entry(
        &self,
        part: &Arc<Partition>,
        dir: &Dir,
        name: &str,
    ) -> Option<DirEntry> {
        let blocks = self.collect_blocks(part, &dir.inode);
        let mut buf = vec![0u8; SECTOR_SIZE];
        for &lba in blocks.iter().filter(|&&l| l != 0) {
            self.ide.read(part.disk, lba, &mut buf, 1);
            for idx in 0..DIR_ENTRIES_PER_SECTOR {
                let entry = read_entry(&buf, idx);
                if !entry.is_free() && entry.name() == name {
                    return Some(entry);
                }
            }
        }
        None
    }

    /// Install `new_entry` into the first free slot of `dir`, lazily growing
    /// the directory's data blocks (and indirect table) as needed. Every
    /// block allocation syncs its bitmap sector before the referring
    /// metadata is written.
    pub(crate) fn sync_dir_entry(&self, dir: &Dir, new_entry: &DirEntry) -> Result<()> {
        let part = &dir.part;
        let data_start = self.data_start_lba(part);
        let mut inner = dir.inode.inner.lock();
        debug_assert_eq!(inner.i_size as usize % DIR_ENTRY_SIZE, 0);

        let mut all_blocks = vec![0u32; MAX_FILE_BLOCKS];
        all_blocks[..NDIRECT].copy_from_slice(&inner.i_sectors[..NDIRECT]);
        let mut indirect_loaded = false;

        let mut io_buf = vec![0u8; SECTOR_SIZE];
        for block_idx in 0..MAX_FILE_BLOCKS {
            if block_idx >= NDIRECT && inner.i_sectors[NDIRECT] != 0 && !indirect_loaded {
                self.ide
                    .read(part.disk, inner.i_sectors[NDIRECT], &mut io_buf, 1);
                for (slot, chunk) in all_blocks[NDIRECT..].iter_mut().zip(io_buf.chunks_exact(4))
                {
                    *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                indirect_loaded = true;
            }

            if all_blocks[block_idx] == 0 {
                let block_lba = self.block_bitmap_alloc(part)?;
                self.bitmap_sync(part, (block_lba - data_start) as usize, BitmapKind::Block);

                if block_idx < NDIRECT {
                    inner.i_sectors[block_idx] = block_lba;
                    all_blocks[block_idx] = block_lba;
                } else if block_idx == NDIRECT && inner.i_sectors[NDIRECT] == 0 {
                    // The fresh block becomes the indirect table; a second
                    // one carries the entry. Roll the table back if the
                    // second allocation fails.
                    inner.i_sectors[NDIRECT] = block_lba;
                    let data_lba = match self.block_bitmap_alloc(part) {
                        Ok(lba) => lba,
                        Err(e) => {
                            let bit = (block_lba - data_start) as usize;
                            part.inner.lock().block_bitmap.set(bit, false);
                            self.bitmap_sync(part, bit, BitmapKind::Block);
                            inner.i_sectors[NDIRECT] = 0;
                            return Err(e);
                        }
                    };
                    self.bitmap_sync(part, (data_lba - data_start) as usize, BitmapKind::Block);
                    all_blocks[NDIRECT] = data_lba;
                    self.write_indirect_table(part, inner.i_sectors[NDIRECT], &all_blocks[NDIRECT..]);
                } else {
                    all_blocks[block_idx] = block_lba;
                    self.write_indirect_table(part, inner.i_sectors[NDIRECT], &all_blocks[NDIRECT..]);
                }

                // Sole entry of a freshly zeroed block.
                io_buf.iter_mut().for_each(|b| *b = 0);
                io_buf[..DIR_ENTRY_SIZE].copy_from_slice(new_entry.as_bytes());
                self.ide.write(part.disk, all_blocks[block_idx], &io_buf, 1);
                inner.i_size += DIR_ENTRY_SIZE as u32;
                return Ok(());
            }

            self.ide.read(part.disk, all_blocks[block_idx], &mut io_buf, 1);
            for idx in 0..DIR_ENTRIES_PER_SECTOR {
                if read_entry(&io_buf, idx).is_free() {
                    write_entry(&mut io_buf, idx, new_entry);
                    self.ide.write(part.disk, all_blocks[block_idx], &io_buf, 1);
                    inner.i_size += DIR_ENTRY_SIZE as u32;
                    return Ok(());
                }
            }
        }
        kprintln!(self.console(), "directory is full!");
        Err(KernelError::NoSpace)
    }

    /// Remove the entry with inode number `i_no` from `dir`, reclaiming the
    /// data block (and possibly the indirect table) once it holds nothing
    /// but `.`/`..`.
    pub(crate) fn delete_dir_entry(&self, part: &Arc<Partition>, dir: &Dir, i_no: u32) -> Result<()> {
        let data_start = self.data_start_lba(part);
        let blocks_snapshot = self.collect_blocks(part, &dir.inode);
        let mut inner = dir.inode.inner.lock();
        let mut all_blocks = blocks_snapshot;

        let mut io_buf = vec![0u8; SECTOR_SIZE];
        for block_idx in 0..MAX_FILE_BLOCKS {
            if all_blocks[block_idx] == 0 {
                continue;
            }
            self.ide.read(part.disk, all_blocks[block_idx], &mut io_buf, 1);

            let mut is_dir_first_block = false;
            let mut entry_cnt = 0;
            let mut found_idx: Option<usize> = None;
            for idx in 0..DIR_ENTRIES_PER_SECTOR {
                let entry = read_entry(&io_buf, idx);
                if entry.is_free() {
                    continue;
                }
                let name = entry.name();
                if name == "." {
                    is_dir_first_block = true;
                } else if name != ".." {
                    entry_cnt += 1;
                    if entry.inode_no() == i_no {
                        debug_assert!(found_idx.is_none());
                        found_idx = Some(idx);
                    }
                }
            }

            let found_idx = match found_idx {
                Some(idx) => idx,
                None => continue,
            };
            debug_assert!(entry_cnt >= 1);

            if entry_cnt == 1 && !is_dir_first_block {
                // Only the doomed entry lives here: free the whole block.
                let bit = (all_blocks[block_idx] - data_start) as usize;
                part.inner.lock().block_bitmap.set(bit, false);
                self.bitmap_sync(part, bit, BitmapKind::Block);

                if block_idx < NDIRECT {
                    inner.i_sectors[block_idx] = 0;
                } else {
                    let indirect_blocks = all_blocks[NDIRECT..]
                        .iter()
                        .filter(|&&l| l != 0)
                        .count();
                    debug_assert!(indirect_blocks >= 1);
                    if indirect_blocks > 1 {
                        all_blocks[block_idx] = 0;
                        self.write_indirect_table(
                            part,
                            inner.i_sectors[NDIRECT],
                            &all_blocks[NDIRECT..],
                        );
                    } else {
                        // Last indirect block: the table itself goes too.
                        let bit = (inner.i_sectors[NDIRECT] - data_start) as usize;
                        part.inner.lock().block_bitmap.set(bit, false);
                        self.bitmap_sync(part, bit, BitmapKind::Block);
                        inner.i_sectors[NDIRECT] = 0;
                    }
                }
            } else {
                write_entry(&mut io_buf, found_idx, &DirEntry::default());
                self.ide.write(part.disk, all_blocks[block_idx], &io_buf, 1);
            }

            debug_assert!(inner.i_size as usize >= DIR_ENTRY_SIZE);
            inner.i_size -= DIR_ENTRY_SIZE as u32;
            let dino = DiskInode {
                i_no: dir.inode.i_no,
                i_size: inner.i_size,
                i_sectors: inner.i_sectors,
            };
            drop(inner);
            self.inode_sync(part, &dino);
            return Ok(());
        }
        Err(KernelError::NotFound)
    }

    /// One populated entry per call, advancing the directory cursor.
    pub(crate) fn dir_read(&self, dir: &mut Dir) -> Option<DirEntry> {
        let part = Arc::clone(&dir.part);
        let i_size = dir.inode.inner.lock().i_size;
        if dir.dir_pos >= i_size {
            return None;
        }
        let blocks = self.collect_blocks(&part, &dir.inode);
        let mut buf = vec![0u8; SECTOR_SIZE];
        let mut cur_pos = 0u32;
        for &lba in blocks.iter().filter(|&&l| l != 0) {
            self.ide.read(part.disk, lba, &mut buf, 1);
            for idx in 0..DIR_ENTRIES_PER_SECTOR {
                let entry = read_entry(&buf, idx);
                if entry.is_free() {
                    continue;
                }
                if cur_pos < dir.dir_pos {
                    cur_pos += DIR_ENTRY_SIZE as u32;
                    continue;
                }
                dir.dir_pos += DIR_ENTRY_SIZE as u32;
                return Some(entry);
            }
        }
        None
    }

    /// Empty means nothing beyond `.` and `..`.
    pub(crate) fn dir_is_empty(&self, dir: &Dir) -> bool {
        dir.inode.inner.lock().i_size == 2 * DIR_ENTRY_SIZE as u32
    }

    /// Remove the empty directory `child` from `parent`: drop its entry,
    /// then give its inode and blocks back.
    pub(crate) fn dir_remove(&self, parent: &Dir, child: &Dir) -> Result<()> {
        {
            let inner = child.inode.inner.lock();
            for &lba in &inner.i_sectors[1..NDIRECT] {
                debug_assert_eq!(lba, 0, "non-empty directory in dir_remove");
            }
        }
        self.delete_dir_entry(&parent.part, parent, child.inode.i_no)?;
        self.inode_release(&parent.part, child.inode.i_no);
        Ok(())
    }

    pub(crate) fn read_indirect_table(
        &self,
        part: &Arc<Partition>,
        table_lba: u32,
        all_blocks: &mut [u32],
    ) {
        let mut buf = vec![0u8; SECTOR_SIZE];
        self.ide.read(part.disk, table_lba, &mut buf, 1);
        for (slot, chunk) in all_blocks[NDIRECT..].iter_mut().zip(buf.chunks_exact(4)) {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    pub(crate) fn write_indirect_table(&self, part: &Arc<Partition>, table_lba: u32, lbas: &[u32]) {
        debug_assert_eq!(lbas.len(), NINDIRECT);
        let mut buf = vec![0u8; SECTOR_SIZE];
        for (chunk, lba) in buf.chunks_exact_mut(4).zip(lbas.iter()) {
            chunk.copy_from_slice(&lba.to_le_bytes());
        }
        self.ide.write(part.disk, table_lba, &buf, 1);
    }

    pub(crate) fn data_start_lba(&self, part: &Arc<Partition>) -> u32 {
        part.inner
            .lock()
            .sb
            .expect("partition not mounted")
            .data_start_lba
    }
}

fn read_entry(sector: &[u8], idx: usize) -> DirEntry {
    let off = idx * DIR_ENTRY_SIZE;
    let mut e = DirEntry::default();
    e.as_bytes_mut()
        .copy_from_slice(&sector[off..off + DIR_ENTRY_SIZE]);
    e
}

fn write_entry(sector: &mut [u8], idx: usize, entry: &DirEntry) {
    let off = idx * DIR_ENTRY_SIZE;
    sector[off..off + DIR_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
}
