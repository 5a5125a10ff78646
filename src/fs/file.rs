//! File layer: the global open-file table and block allocation on the
//! write path.
//!
//! Writes are append-only: the position snaps to the file size and grows
//! with it. Reads honor the descriptor position set by `lseek`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;

use crate::err::{KernelError, Result};
use crate::fs::dir::{Dir, DirEntry};
use crate::fs::inode::{BitmapKind, DiskInode, Inode};
use crate::fs::FileType;
use crate::ide::Partition;
use crate::intr;
use crate::kernel::Kernel;
use crate::param::{
    BLOCK_SIZE, MAX_FILES_OPEN_PER_PROC, MAX_FILE_BLOCKS, MAX_FILE_BYTES, MAX_FILE_OPEN, NDIRECT,
};
use crate::pipe::Pipe;
use crate::proc;
use crate::sync::SleepLockGuard;

bitflags! {
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREAT = 0x4;
    }
}

impl OpenFlags {
    pub(crate) fn wants_write(self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

/// What a global open-file slot points at.
pub(crate) enum FileKind {
    File {
        part: Arc<Partition>,
        inode: Arc<Inode>,
    },
    Pipe {
        ring: Arc<Pipe>,
        /// Distinct per-pipe open count; the ring dies when it hits zero.
        open_cnt: u32,
    },
}

/// One entry of the global open-file table.
pub(crate) struct FileSlot {
    pub kind: Option<FileKind>,
    /// Byte position for files.
    pub pos: u32,
    pub flags: OpenFlags,
}

impl FileSlot {
    pub(crate) fn empty() -> Self {
        Self {
            kind: None,
            pos: 0,
            flags: OpenFlags::O_RDONLY,
        }
    }
}

impl Kernel {
    /// Claim the first free global slot, returning it locked. Slots 0..=2
    /// stand for the standard streams and are never handed out.
    pub(crate) fn get_free_slot_in_global(
        &self,
    ) -> Result<(usize, SleepLockGuard<'_, FileSlot>)> {
        for idx in 3..MAX_FILE_OPEN {
            let slot = self.file_table[idx].lock();
            if slot.kind.is_none() {
                return Ok((idx, slot));
            }
        }
        kprintln!(self.console(), "exceed max open files");
        Err(KernelError::TooManyOpenFiles)
    }

    /// Install a global index into the current task's descriptor table.
    pub(crate) fn pcb_fd_install(&self, global_idx: usize) -> Result<i32> {
        let cur = proc::current();
        let mut fds = cur.fd_table.lock();
        for local in 3..MAX_FILES_OPEN_PER_PROC {
            if fds[local] == -1 {
                fds[local] = global_idx as i32;
                return Ok(local as i32);
            }
        }
        kprintln!(self.console(), "exceed max open files_per_proc");
        Err(KernelError::TooManyOpenFiles)
    }

    /// Map a local descriptor to its global table index (or the raw std
    /// stream number it was redirected to).
    pub(crate) fn fd_local2global(&self, fd: i32) -> Result<usize> {
        if fd < 0 || fd as usize >= MAX_FILES_OPEN_PER_PROC {
            return Err(KernelError::BadFileDescriptor);
        }
        let cur = proc::current();
        let val = cur.fd_table.lock()[fd as usize];
        if val < 0 {
            return Err(KernelError::BadFileDescriptor);
        }
        debug_assert!((val as usize) < MAX_FILE_OPEN);
        Ok(val as usize)
    }

    /// Create `name` under `parent` and leave it open: claim an inode
    /// number, build the in-memory inode, claim a global slot, install the
    /// directory entry, then persist parent inode, new inode and inode
    /// bitmap. Failures unwind in reverse order.
    pub(crate) fn file_create(
        &self,
        parent: &Dir,
        name: &str,
        flags: OpenFlags,
    ) -> Result<usize> {
        let part = Arc::clone(&parent.part);
        if name.len() > crate::param::MAX_FILE_NAME_LEN {
            return Err(KernelError::NameTooLong);
        }

        let i_no = self.inode_bitmap_alloc(&part)?;
        let inode_bit = scopeguard::guard((), |_| {
            part.inner.lock().inode_bitmap.set(i_no as usize, false);
        });

        let inode = Inode::init(i_no);

        let (global_idx, mut slot) = self.get_free_slot_in_global()?;
        slot.kind = Some(FileKind::File {
            part: Arc::clone(&part),
            inode: Arc::clone(&inode),
        });
        slot.pos = 0;
        slot.flags = flags;

        let entry = DirEntry::new(name, i_no, FileType::Regular)?;
        if let Err(e) = self.sync_dir_entry(parent, &entry) {
            kprintln!(self.console(), "sync dir_entry to disk failed");
            slot.kind = None;
            return Err(e);
        }

        self.inode_sync(&part, &parent.inode.to_disk());
        self.inode_sync(&part, &inode.to_disk());
        self.bitmap_sync(&part, i_no as usize, BitmapKind::Inode);

        // The new file is born open: share it through the partition cache.
        part.inner.lock().open_inodes.push(Arc::clone(&inode));

        scopeguard::ScopeGuard::into_inner(inode_bit);
        drop(slot);
        Ok(global_idx)
    }

    /// Open inode `inode_no`: claim a slot, share the cached inode, and for
    /// writers take `write_deny` atomically or fail busy.
    pub(crate) fn file_open(
        &self,
        part: &Arc<Partition>,
        inode_no: u32,
        flags: OpenFlags,
    ) -> Result<usize> {
        let (global_idx, mut slot) = self.get_free_slot_in_global()?;
        let inode = self.inode_open(part, inode_no);

        if flags.wants_write() {
            let guard = intr::off();
            if inode.write_deny.load(Ordering::SeqCst) {
                drop(guard);
                kprintln!(self.console(), "file can't be written now, try again later");
                slot.kind = None;
                drop(slot);
                self.inode_close(part, &inode);
                return Err(KernelError::Busy);
            }
            inode.write_deny.store(true, Ordering::SeqCst);
        }

        slot.kind = Some(FileKind::File {
            part: Arc::clone(part),
            inode,
        });
        slot.pos = 0;
        slot.flags = flags;
        Ok(global_idx)
    }

    /// Release a slot's file: clear the writer flag, drop the cached inode.
    pub(crate) fn file_close(&self, slot: &mut FileSlot) {
        if let Some(FileKind::File { part, inode }) = slot.kind.take() {
            inode.write_deny.store(false, Ordering::SeqCst);
            self.inode_close(&part, &inode);
        }
        slot.pos = 0;
    }

    /// Append `buf` to the slot's file, allocating data blocks (and the
    /// indirect table) as the file grows. Every allocation syncs its bitmap
    /// sector; the inode is synced once at the end.
    pub(crate) fn file_write(&self, slot: &mut FileSlot, buf: &[u8]) -> Result<usize> {
        let (part, inode) = match &slot.kind {
            Some(FileKind::File { part, inode }) => (Arc::clone(part), Arc::clone(inode)),
            _ => return Err(KernelError::BadFileDescriptor),
        };
        let count = buf.len();
        let data_start = self.data_start_lba(&part);
        let mut inner = inode.inner.lock();

        if inner.i_size as usize + count > MAX_FILE_BYTES {
            kprintln!(
                self.console(),
                "file_write: exceed maximum file size {} bytes",
                MAX_FILE_BYTES
            );
            return Err(KernelError::TooLarge);
        }
        if count == 0 {
            return Ok(0);
        }

        // First write ever claims the first direct block.
        if inner.i_sectors[0] == 0 {
            let lba = self.block_bitmap_alloc(&part)?;
            inner.i_sectors[0] = lba;
            self.bitmap_sync(&part, (lba - data_start) as usize, BitmapKind::Block);
        }

        // Block counts: a file of `n` bytes occupies ceil(n / 512) blocks,
        // with the empty file pinned to its first (already claimed) block.
        let used = core::cmp::max(1, (inner.i_size as usize + BLOCK_SIZE - 1) / BLOCK_SIZE);
        let will = (inner.i_size as usize + count + BLOCK_SIZE - 1) / BLOCK_SIZE;
        debug_assert!(will <= MAX_FILE_BLOCKS);

        let mut all_blocks = vec![0u32; MAX_FILE_BLOCKS];
        if will == used {
            // The write stays inside the last already-used block.
            if used <= NDIRECT {
                all_blocks[used - 1] = inner.i_sectors[used - 1];
            } else {
                debug_assert_ne!(inner.i_sectors[NDIRECT], 0);
                self.read_indirect_table(&part, inner.i_sectors[NDIRECT], &mut all_blocks);
            }
        } else if will <= NDIRECT {
            // Everything fits in direct blocks.
            all_blocks[used - 1] = inner.i_sectors[used - 1];
            for bi in used..will {
                let lba = self.block_bitmap_alloc(&part)?;
                debug_assert_eq!(inner.i_sectors[bi], 0);
                inner.i_sectors[bi] = lba;
                all_blocks[bi] = lba;
                self.bitmap_sync(&part, (lba - data_start) as usize, BitmapKind::Block);
            }
        } else if used <= NDIRECT {
            // The write crosses into the indirect region for the first time.
            all_blocks[used - 1] = inner.i_sectors[used - 1];
            let table = self.block_bitmap_alloc(&part)?;
            debug_assert_eq!(inner.i_sectors[NDIRECT], 0);
            inner.i_sectors[NDIRECT] = table;
            self.bitmap_sync(&part, (table - data_start) as usize, BitmapKind::Block);
            for bi in used..will {
                let lba = self.block_bitmap_alloc(&part)?;
                if bi < NDIRECT {
                    debug_assert_eq!(inner.i_sectors[bi], 0);
                    inner.i_sectors[bi] = lba;
                }
                all_blocks[bi] = lba;
                self.bitmap_sync(&part, (lba - data_start) as usize, BitmapKind::Block);
            }
            self.write_indirect_table(&part, table, &all_blocks[NDIRECT..]);
        } else {
            // Entirely within the indirect region.
            debug_assert_ne!(inner.i_sectors[NDIRECT], 0);
            self.read_indirect_table(&part, inner.i_sectors[NDIRECT], &mut all_blocks);
            for bi in used..will {
                let lba = self.block_bitmap_alloc(&part)?;
                all_blocks[bi] = lba;
                self.bitmap_sync(&part, (lba - data_start) as usize, BitmapKind::Block);
            }
            self.write_indirect_table(&part, inner.i_sectors[NDIRECT], &all_blocks[NDIRECT..]);
        }

        // Append chunk by chunk; the first chunk read-modify-writes the
        // last used block so unrelated bytes survive.
        let mut io_buf = vec![0u8; BLOCK_SIZE];
        let mut written = 0usize;
        let mut first_write_block = true;
        while written < count {
            let sec_idx = inner.i_size as usize / BLOCK_SIZE;
            let sec_lba = all_blocks[sec_idx];
            let sec_off = inner.i_size as usize % BLOCK_SIZE;
            let chunk = core::cmp::min(count - written, BLOCK_SIZE - sec_off);

            if first_write_block {
                self.ide.read(part.disk, sec_lba, &mut io_buf, 1);
                first_write_block = false;
            } else {
                io_buf.iter_mut().for_each(|b| *b = 0);
            }
            io_buf[sec_off..sec_off + chunk].copy_from_slice(&buf[written..written + chunk]);
            self.ide.write(part.disk, sec_lba, &io_buf, 1);

            inner.i_size += chunk as u32;
            written += chunk;
        }
        slot.pos = inner.i_size;

        let dino = DiskInode {
            i_no: inode.i_no,
            i_size: inner.i_size,
            i_sectors: inner.i_sectors,
        };
        drop(inner);
        self.inode_sync(&part, &dino);
        Ok(written)
    }

    /// Read from the descriptor position, clipped to the file size.
    pub(crate) fn file_read(&self, slot: &mut FileSlot, buf: &mut [u8]) -> Result<usize> {
        let (part, inode) = match &slot.kind {
            Some(FileKind::File { part, inode }) => (Arc::clone(part), Arc::clone(inode)),
            _ => return Err(KernelError::BadFileDescriptor),
        };
        let inner = inode.inner.lock();

        let pos = slot.pos as usize;
        let mut size = buf.len();
        if pos + size > inner.i_size as usize {
            size = inner.i_size as usize - pos;
            if size == 0 {
                return Err(KernelError::Eof);
            }
        }

        // Block indices of the first and last byte touched.
        let start_idx = pos / BLOCK_SIZE;
        let end_idx = (pos + size - 1) / BLOCK_SIZE;
        let read_blocks = end_idx - start_idx;
        let mut all_blocks = vec![0u32; MAX_FILE_BLOCKS];

        if read_blocks == 0 {
            if end_idx < NDIRECT {
                all_blocks[end_idx] = inner.i_sectors[end_idx];
            } else {
                debug_assert_ne!(inner.i_sectors[NDIRECT], 0);
                self.read_indirect_table(&part, inner.i_sectors[NDIRECT], &mut all_blocks);
            }
        } else if end_idx < NDIRECT {
            for bi in start_idx..=end_idx {
                all_blocks[bi] = inner.i_sectors[bi];
            }
        } else if start_idx < NDIRECT {
            for bi in start_idx..NDIRECT {
                all_blocks[bi] = inner.i_sectors[bi];
            }
            debug_assert_ne!(inner.i_sectors[NDIRECT], 0);
            self.read_indirect_table(&part, inner.i_sectors[NDIRECT], &mut all_blocks);
        } else {
            debug_assert_ne!(inner.i_sectors[NDIRECT], 0);
            self.read_indirect_table(&part, inner.i_sectors[NDIRECT], &mut all_blocks);
        }

        let mut io_buf = vec![0u8; BLOCK_SIZE];
        let mut read = 0usize;
        while read < size {
            let sec_idx = slot.pos as usize / BLOCK_SIZE;
            let sec_lba = all_blocks[sec_idx];
            let sec_off = slot.pos as usize % BLOCK_SIZE;
            let chunk = core::cmp::min(size - read, BLOCK_SIZE - sec_off);

            self.ide.read(part.disk, sec_lba, &mut io_buf, 1);
            buf[read..read + chunk].copy_from_slice(&io_buf[sec_off..sec_off + chunk]);

            slot.pos += chunk as u32;
            read += chunk;
        }
        Ok(read)
    }

    /// Bump refcounts for every open descriptor in a forked child's table:
    /// pipes get a ring count, files an inode open count.
    pub(crate) fn dup_open_files(&self, fds: &[i32; MAX_FILES_OPEN_PER_PROC]) {
        for local in 3..MAX_FILES_OPEN_PER_PROC {
            let global = fds[local];
            if global < 3 {
                continue;
            }
            let mut slot = self.file_table[global as usize].lock();
            match &mut slot.kind {
                Some(FileKind::Pipe { open_cnt, .. }) => *open_cnt += 1,
                Some(FileKind::File { inode, .. }) => {
                    inode.open_cnt.fetch_add(1, Ordering::SeqCst);
                }
                None => {}
            }
        }
    }
}
