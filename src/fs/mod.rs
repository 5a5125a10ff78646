//! File system facade: format, mount, and the path-level operations the
//! syscall layer exposes.

pub(crate) mod bitmap;
pub mod dir;
pub mod file;
pub mod inode;
pub mod path;
pub mod superblock;

use std::sync::Arc;

use zerocopy::AsBytes;

use crate::err::{KernelError, Result};
use crate::ide::Partition;
use crate::kernel::Kernel;
use crate::param::{MAX_FILE_OPEN, MAX_PATH_LEN, SECTOR_SIZE};
use crate::proc;

use bitmap::Bitmap;
use dir::{Dir, DirEntry, DIR_ENTRY_SIZE};
use file::FileKind;
use inode::{BitmapKind, DiskInode};
use path::SearchRecord;
pub use superblock::SuperBlock;
use superblock::FS_MAGIC;

pub use file::OpenFlags;

/// Directory-entry type tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Free slot.
    Unknown = 0,
    Regular = 1,
    Directory = 2,
}

impl FileType {
    pub(crate) fn from_tag(tag: u8) -> Self {
        match tag {
            1 => FileType::Regular,
            2 => FileType::Directory,
            _ => FileType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set = 1,
    Cur = 2,
    End = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub size: u32,
    pub file_type: FileType,
}

/// The partition mounted when the file system comes up.
const DEFAULT_PART: &str = "sdb1";

impl Kernel {
    pub(crate) fn cur_part(&self) -> Result<Arc<Partition>> {
        self.cur_part
            .lock()
            .clone()
            .ok_or(KernelError::NotFound)
    }

    /// In-memory super block of a mounted partition.
    pub fn superblock(&self, part: &Arc<Partition>) -> Option<SuperBlock> {
        part.inner.lock().sb
    }

    /// State of one bit of the in-memory block bitmap.
    pub fn block_bit(&self, part: &Arc<Partition>, idx: usize) -> bool {
        part.inner.lock().block_bitmap.test(idx)
    }

    /// State of one bit of the in-memory inode bitmap.
    pub fn inode_bit(&self, part: &Arc<Partition>, idx: usize) -> bool {
        part.inner.lock().inode_bitmap.test(idx)
    }

    /// Inodes currently cached in the partition's open-inode list.
    pub fn open_inode_count(&self, part: &Arc<Partition>) -> usize {
        part.inner.lock().open_inodes.len()
    }

    /// Open count of the cached inode `i_no`, if it is in the cache.
    pub fn inode_open_cnt(&self, part: &Arc<Partition>, i_no: u32) -> Option<u32> {
        part.inner
            .lock()
            .open_inodes
            .iter()
            .find(|i| i.i_no == i_no)
            .map(|i| i.open_cnt())
    }

    /// Block addresses of inode `i_no`, direct slots plus the indirect
    /// table LBA.
    pub fn inode_sectors(&self, part: &Arc<Partition>, i_no: u32) -> [u32; 13] {
        let inode = self.inode_open(part, i_no);
        let sectors = inode.inner.lock().i_sectors;
        self.inode_close(part, &inode);
        sectors
    }

    /// Lay a fresh file system down on `part`: super block, bitmaps, inode
    /// table, and a root directory holding `.` and `..`.
    pub fn partition_format(&self, part: &Arc<Partition>) {
        let sb = SuperBlock::for_partition(part.start_lba, part.sec_cnt);
        kprintln!(self.console(), "{} info:", part.name);
        kprintln!(self.console(), "   magic:{:#x}", sb.magic);
        kprintln!(self.console(), "   part_lba_base:{:#x}", sb.part_lba_base);
        kprintln!(self.console(), "   all_sectors:{:#x}", sb.sec_cnt);
        kprintln!(self.console(), "   inode_cnt:{:#x}", sb.inode_cnt);
        kprintln!(self.console(), "   block_bitmap_lba:{:#x}", sb.block_bitmap_lba);
        kprintln!(self.console(), "   block_bitmap_sectors:{:#x}", sb.block_bitmap_sects);
        kprintln!(self.console(), "   inode_bitmap_lba:{:#x}", sb.inode_bitmap_lba);
        kprintln!(self.console(), "   inode_bitmap_sectors:{:#x}", sb.inode_bitmap_sects);
        kprintln!(self.console(), "   inode_table_lba:{:#x}", sb.inode_table_lba);
        kprintln!(self.console(), "   inode_table_sectors:{:#x}", sb.inode_table_sects);
        kprintln!(self.console(), "   data_start_lba:{:#x}", sb.data_start_lba);

        // 1. Super block into the partition's second sector.
        let mut sb_sec = vec![0u8; SECTOR_SIZE];
        sb_sec[..superblock::SUPER_BLOCK_SIZE].copy_from_slice(sb.as_bytes());
        self.ide.write(part.disk, part.start_lba + 1, &sb_sec, 1);

        // 2. Block bitmap: bit 0 is the root directory's data block; bits
        // past the usable range are pre-claimed so scans never hand them out.
        let mut buf = vec![0u8; sb.block_bitmap_sects as usize * SECTOR_SIZE];
        buf[0] |= 0x01;
        let bit_len = sb.block_bitmap_bit_len() as usize;
        let last_byte = bit_len / 8;
        let last_bit = bit_len % 8;
        for b in buf[last_byte..].iter_mut() {
            *b = 0xFF;
        }
        if last_byte < buf.len() {
            for bit in 0..last_bit {
                buf[last_byte] &= !(1u8 << bit);
            }
        }
        self.ide
            .write(part.disk, sb.block_bitmap_lba, &buf, sb.block_bitmap_sects);

        // 3. Inode bitmap: only the root inode in use.
        let mut buf = vec![0u8; sb.inode_bitmap_sects as usize * SECTOR_SIZE];
        buf[0] |= 0x01;
        self.ide
            .write(part.disk, sb.inode_bitmap_lba, &buf, sb.inode_bitmap_sects);

        // 4. Inode table: slot 0 is the root directory.
        let mut buf = vec![0u8; sb.inode_table_sects as usize * SECTOR_SIZE];
        let mut root = DiskInode::default();
        root.i_size = sb.dir_entry_size * 2;
        root.i_sectors[0] = sb.data_start_lba;
        buf[..root.as_bytes().len()].copy_from_slice(root.as_bytes());
        self.ide
            .write(part.disk, sb.inode_table_lba, &buf, sb.inode_table_sects);

        // 5. Root directory block: `.` and `..`, both inode 0.
        let mut buf = vec![0u8; SECTOR_SIZE];
        let dot = DirEntry::new(".", 0, FileType::Directory).unwrap();
        let dotdot = DirEntry::new("..", 0, FileType::Directory).unwrap();
        buf[..DIR_ENTRY_SIZE].copy_from_slice(dot.as_bytes());
        buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(dotdot.as_bytes());
        self.ide.write(part.disk, sb.data_start_lba, &buf, 1);

        kprintln!(self.console(), "   root_dir_lba:{:#x}", sb.data_start_lba);
        kprintln!(self.console(), "{} format done", part.name);
    }

    /// Pull a partition's metadata into memory and make it current.
    pub fn mount_partition(&self, name: &str) -> Result<Arc<Partition>> {
        let part = self
            .partitions
            .lock()
            .iter()
            .find(|p| p.name.as_str() == name)
            .cloned()
            .ok_or(KernelError::NotFound)?;

        let mut buf = vec![0u8; SECTOR_SIZE];
        self.ide.read(part.disk, part.start_lba + 1, &mut buf, 1);
        let mut sb = SuperBlock::default();
        sb.as_bytes_mut()
            .copy_from_slice(&buf[..superblock::SUPER_BLOCK_SIZE]);
        if sb.magic != FS_MAGIC {
            return Err(KernelError::InvalidArgument);
        }

        let mut bbm = vec![0u8; sb.block_bitmap_sects as usize * SECTOR_SIZE];
        self.ide
            .read(part.disk, sb.block_bitmap_lba, &mut bbm, sb.block_bitmap_sects);
        let mut ibm = vec![0u8; sb.inode_bitmap_sects as usize * SECTOR_SIZE];
        self.ide
            .read(part.disk, sb.inode_bitmap_lba, &mut ibm, sb.inode_bitmap_sects);

        {
            let mut pi = part.inner.lock();
            pi.sb = Some(sb);
            pi.block_bitmap = Bitmap::from_bytes(bbm);
            pi.inode_bitmap = Bitmap::from_bytes(ibm);
            pi.open_inodes = Vec::new();
        }
        *self.cur_part.lock() = Some(Arc::clone(&part));
        kprintln!(self.console(), "mount {} done!", name);
        Ok(part)
    }

    /// Scan every discovered partition, laying a file system down where the
    /// magic is missing, then mount the default partition and open its root.
    pub fn filesys_init(&self) -> Result<()> {
        kprintln!(self.console(), "searching filesystem......");
        let parts: Vec<Arc<Partition>> = self.partitions.lock().clone();
        let mut buf = vec![0u8; SECTOR_SIZE];
        for part in &parts {
            self.ide.read(part.disk, part.start_lba + 1, &mut buf, 1);
            let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if magic == FS_MAGIC {
                kprintln!(self.console(), "{} has filesystem", part.name);
            } else {
                kprintln!(self.console(), "formatting partition {}......", part.name);
                self.partition_format(part);
            }
        }

        let part = self.mount_partition(DEFAULT_PART)?;
        let root = self.dir_open(&part, 0);
        *self.root_dir.lock() = Some(root);
        kprintln!(self.console(), "filesystem_init done!");
        Ok(())
    }

    /// Walk `path` from the root. On success the record's parent directory
    /// is left open so a creating caller can use it; the caller closes it.
    pub(crate) fn search_file(&self, path: &str) -> Result<(Option<u32>, SearchRecord)> {
        let part = self.cur_part()?;
        if path == "/" || path == "/." || path == "/.." {
            return Ok((
                Some(0),
                SearchRecord {
                    parent: self.dir_open(&part, 0),
                    file_type: FileType::Directory,
                    searched_path: String::new(),
                },
            ));
        }
        if !path.starts_with('/') || path.len() < 2 || path.len() >= MAX_PATH_LEN {
            return Err(KernelError::InvalidArgument);
        }

        let mut parent = self.dir_open(&part, 0);
        let mut searched = String::new();
        let mut comps = path::components(path).peekable();
        while let Some(name) = comps.next() {
            searched.push('/');
            searched.push_str(name);

            match self.search_dir_entry(&part, &parent, name) {
                Some(entry) => {
                    let is_last = comps.peek().is_none();
                    match entry.file_type() {
                        FileType::Directory if !is_last => {
                            let next = self.dir_open(&part, entry.inode_no());
                            self.dir_close(core::mem::replace(&mut parent, next));
                        }
                        file_type => {
                            // The leaf (or a regular file cutting the walk
                            // short); the caller tells them apart by depth.
                            let file_type = if file_type == FileType::Directory {
                                FileType::Directory
                            } else {
                                FileType::Regular
                            };
                            return Ok((
                                Some(entry.inode_no()),
                                SearchRecord {
                                    parent,
                                    file_type,
                                    searched_path: searched,
                                },
                            ));
                        }
                    }
                }
                None => {
                    return Ok((
                        None,
                        SearchRecord {
                            parent,
                            file_type: FileType::Unknown,
                            searched_path: searched,
                        },
                    ));
                }
            }
        }
        // Nothing but separators: this is the root again.
        Ok((
            Some(0),
            SearchRecord {
                parent,
                file_type: FileType::Directory,
                searched_path: searched,
            },
        ))
    }

    /// Open (or with `O_CREAT`, create) the regular file at `path`,
    /// returning a local descriptor.
    pub fn sys_open(&self, path: &str, flags: OpenFlags) -> Result<i32> {
        if path.ends_with('/') {
            kprintln!(self.console(), "can't open a directory {}", path);
            return Err(KernelError::InvalidArgument);
        }
        let pathname_depth = path::depth(path);

        let (found, rec) = self.search_file(path)?;
        if rec.file_type == FileType::Directory {
            kprintln!(
                self.console(),
                "can't open a directory with open(), use opendir() instead"
            );
            self.dir_close(rec.parent);
            return Err(KernelError::IsADirectory);
        }

        let searched_depth = path::depth(&rec.searched_path);
        if pathname_depth != searched_depth {
            kprintln!(
                self.console(),
                "cannot access {}: subpath {} does not exist",
                path,
                rec.searched_path
            );
            self.dir_close(rec.parent);
            return Err(KernelError::NotFound);
        }

        if found.is_none() && !flags.contains(OpenFlags::O_CREAT) {
            kprintln!(
                self.console(),
                "in path {}, file {} does not exist",
                rec.searched_path,
                path::last_component(path).unwrap_or("")
            );
            self.dir_close(rec.parent);
            return Err(KernelError::NotFound);
        }
        if found.is_some() && flags.contains(OpenFlags::O_CREAT) {
            kprintln!(self.console(), "{} already exists!", path);
            self.dir_close(rec.parent);
            return Err(KernelError::Exists);
        }

        let global_idx = if flags.contains(OpenFlags::O_CREAT) {
            let name = path::last_component(path).ok_or(KernelError::InvalidArgument)?;
            let res = self.file_create(&rec.parent, name, flags);
            self.dir_close(rec.parent);
            res?
        } else {
            let part = Arc::clone(&rec.parent.part);
            let ino = found.unwrap();
            self.dir_close(rec.parent);
            self.file_open(&part, ino, flags)?
        };

        match self.pcb_fd_install(global_idx) {
            Ok(fd) => Ok(fd),
            Err(e) => {
                let mut slot = self.file_table[global_idx].lock();
                self.file_close(&mut slot);
                Err(e)
            }
        }
    }

    /// Close a local descriptor: a pipe end drops the ring's open count, a
    /// file goes through `file_close`; either way the local slot frees.
    pub fn sys_close(&self, fd: i32) -> Result<()> {
        if fd <= 2 {
            return Err(KernelError::BadFileDescriptor);
        }
        let cur = proc::current();
        let val = {
            let fds = cur.fd_table.lock();
            if fd as usize >= fds.len() {
                return Err(KernelError::BadFileDescriptor);
            }
            fds[fd as usize]
        };
        if val == -1 {
            return Err(KernelError::BadFileDescriptor);
        }

        if val >= 3 {
            let mut slot = self.file_table[val as usize].lock();
            let is_pipe = matches!(slot.kind, Some(FileKind::Pipe { .. }));
            if is_pipe {
                if let Some(FileKind::Pipe { open_cnt, .. }) = &mut slot.kind {
                    *open_cnt -= 1;
                    if *open_cnt == 0 {
                        // Last end gone: the ring page goes with the slot.
                        slot.kind = None;
                        slot.pos = 0;
                    }
                }
            } else {
                self.file_close(&mut slot);
            }
        }
        cur.fd_table.lock()[fd as usize] = -1;
        Ok(())
    }

    /// Write to a descriptor: console for the standard streams, the ring
    /// for pipes (including redirected ones), otherwise the file layer.
    pub fn sys_write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
        if fd < 0 {
            kprintln!(self.console(), "sys_write: fd error");
            return Err(KernelError::BadFileDescriptor);
        }
        if self.fd_is_pipe(fd)? {
            return self.pipe_write(fd, buf);
        }
        let global = self.fd_local2global(fd)?;
        if global == 1 || global == 2 {
            self.console().put_str(&String::from_utf8_lossy(buf));
            return Ok(buf.len());
        }
        if global == 0 {
            return Err(KernelError::BadFileDescriptor);
        }

        let mut slot = self.file_table[global].lock();
        if !slot.flags.wants_write() {
            kprintln!(
                self.console(),
                "sys_write: not allowed to write file without O_RDWR or O_WRONLY"
            );
            return Err(KernelError::InvalidArgument);
        }
        self.file_write(&mut slot, buf)
    }

    /// Read from a descriptor: the keyboard queue for stdin, the ring for
    /// pipes, otherwise the file layer.
    pub fn sys_read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        if fd < 0 {
            kprintln!(self.console(), "sys_read: fd error");
            return Err(KernelError::BadFileDescriptor);
        }
        if self.fd_is_pipe(fd)? {
            return self.pipe_read(fd, buf);
        }
        let global = self.fd_local2global(fd)?;
        if global == 0 {
            for b in buf.iter_mut() {
                *b = self.console().getchar();
            }
            return Ok(buf.len());
        }
        if global == 1 || global == 2 {
            return Err(KernelError::BadFileDescriptor);
        }

        let mut slot = self.file_table[global].lock();
        self.file_read(&mut slot, buf)
    }

    /// Move a file descriptor's read position. Writes ignore it (appends
    /// only); reads honor it.
    pub fn sys_lseek(&self, fd: i32, offset: i32, whence: SeekWhence) -> Result<i32> {
        if fd < 0 {
            return Err(KernelError::BadFileDescriptor);
        }
        let global = self.fd_local2global(fd)?;
        if global < 3 {
            return Err(KernelError::BadFileDescriptor);
        }
        let mut slot = self.file_table[global].lock();
        let file_size = match &slot.kind {
            Some(FileKind::File { inode, .. }) => inode.size() as i32,
            _ => return Err(KernelError::BadFileDescriptor),
        };
        let new_pos = match whence {
            SeekWhence::Set => offset,
            SeekWhence::Cur => slot.pos as i32 + offset,
            SeekWhence::End => file_size + offset,
        };
        // End-of-file itself is a valid position; reads there report Eof.
        if new_pos < 0 || new_pos > file_size {
            return Err(KernelError::InvalidArgument);
        }
        slot.pos = new_pos as u32;
        Ok(new_pos)
    }

    /// Delete the regular file at `path`. Open files refuse to go.
    pub fn sys_unlink(&self, path: &str) -> Result<()> {
        if path.len() >= MAX_PATH_LEN {
            return Err(KernelError::InvalidArgument);
        }
        let pathname_depth = path::depth(path);
        let (found, rec) = self.search_file(path)?;

        let ino = match found {
            Some(i) => i,
            None => {
                kprintln!(self.console(), "file {} not found!", path);
                self.dir_close(rec.parent);
                return Err(KernelError::NotFound);
            }
        };
        debug_assert_ne!(ino, 0);
        if rec.file_type == FileType::Directory {
            kprintln!(
                self.console(),
                "can't delete a directory with unlink(), use rmdir() instead"
            );
            self.dir_close(rec.parent);
            return Err(KernelError::IsADirectory);
        }
        if path::depth(&rec.searched_path) != pathname_depth {
            self.dir_close(rec.parent);
            return Err(KernelError::NotFound);
        }

        // Refuse while any global slot still holds the inode.
        for idx in 3..MAX_FILE_OPEN {
            let slot = self.file_table[idx].lock();
            if let Some(FileKind::File { inode, .. }) = &slot.kind {
                if inode.i_no == ino {
                    drop(slot);
                    kprintln!(self.console(), "file {} is in use, not allowed to delete!", path);
                    self.dir_close(rec.parent);
                    return Err(KernelError::Busy);
                }
            }
        }

        let part = Arc::clone(&rec.parent.part);
        if let Err(e) = self.delete_dir_entry(&part, &rec.parent, ino) {
            self.dir_close(rec.parent);
            return Err(e);
        }
        self.inode_release(&part, ino);
        self.dir_close(rec.parent);
        Ok(())
    }

    /// Create a directory at `path`; the parent must exist, the leaf must
    /// not. Failures unwind the claimed bitmap bits.
    pub fn sys_mkdir(&self, path: &str) -> Result<()> {
        let pathname_depth = path::depth(path);
        let (found, rec) = self.search_file(path)?;

        if found.is_some() {
            kprintln!(self.console(), "sys_mkdir: file or directory {} exists!", path);
            self.dir_close(rec.parent);
            return Err(KernelError::Exists);
        }
        if path::depth(&rec.searched_path) != pathname_depth {
            kprintln!(
                self.console(),
                "sys_mkdir: cannot access {}, subpath {} does not exist",
                path,
                rec.searched_path
            );
            self.dir_close(rec.parent);
            return Err(KernelError::NotFound);
        }

        let part = Arc::clone(&rec.parent.part);
        let dirname = match path::last_component(&rec.searched_path) {
            Some(n) => n.to_string(),
            None => {
                self.dir_close(rec.parent);
                return Err(KernelError::InvalidArgument);
            }
        };

        let inode_no = match self.inode_bitmap_alloc(&part) {
            Ok(no) => no,
            Err(e) => {
                kprintln!(self.console(), "sys_mkdir: inode allocation failed");
                self.dir_close(rec.parent);
                return Err(e);
            }
        };

        let block_lba = match self.block_bitmap_alloc(&part) {
            Ok(lba) => lba,
            Err(e) => {
                kprintln!(self.console(), "sys_mkdir: block allocation failed");
                part.inner.lock().inode_bitmap.set(inode_no as usize, false);
                self.dir_close(rec.parent);
                return Err(e);
            }
        };
        let data_start = self.data_start_lba(&part);
        let block_bitmap_idx = (block_lba - data_start) as usize;
        debug_assert_ne!(block_bitmap_idx, 0);

        let mut new_dir_inode = DiskInode::default();
        new_dir_inode.i_no = inode_no;
        new_dir_inode.i_size = 2 * DIR_ENTRY_SIZE as u32;
        new_dir_inode.i_sectors[0] = block_lba;

        // The new directory's first block: `.` and `..`.
        let mut io_buf = vec![0u8; SECTOR_SIZE];
        let dot = DirEntry::new(".", inode_no, FileType::Directory).unwrap();
        let dotdot =
            DirEntry::new("..", rec.parent.inode_no(), FileType::Directory).unwrap();
        io_buf[..DIR_ENTRY_SIZE].copy_from_slice(dot.as_bytes());
        io_buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(dotdot.as_bytes());
        self.ide.write(part.disk, block_lba, &io_buf, 1);

        let entry = match DirEntry::new(&dirname, inode_no, FileType::Directory) {
            Ok(e) => e,
            Err(e) => {
                part.inner.lock().block_bitmap.set(block_bitmap_idx, false);
                part.inner.lock().inode_bitmap.set(inode_no as usize, false);
                self.dir_close(rec.parent);
                return Err(e);
            }
        };
        if let Err(e) = self.sync_dir_entry(&rec.parent, &entry) {
            kprintln!(self.console(), "sys_mkdir: sync_dir_entry to disk failed!");
            part.inner.lock().block_bitmap.set(block_bitmap_idx, false);
            part.inner.lock().inode_bitmap.set(inode_no as usize, false);
            self.dir_close(rec.parent);
            return Err(e);
        }

        self.bitmap_sync(&part, block_bitmap_idx, BitmapKind::Block);
        self.inode_sync(&part, &rec.parent.inode.to_disk());
        self.inode_sync(&part, &new_dir_inode);
        self.bitmap_sync(&part, inode_no as usize, BitmapKind::Inode);

        self.dir_close(rec.parent);
        Ok(())
    }

    /// Remove the empty directory at `path`. The root stays.
    pub fn sys_rmdir(&self, path: &str) -> Result<()> {
        let (found, rec) = self.search_file(path)?;
        let ino = match found {
            Some(i) => i,
            None => {
                kprintln!(
                    self.console(),
                    "sys_rmdir: subpath {} does not exist!",
                    rec.searched_path
                );
                self.dir_close(rec.parent);
                return Err(KernelError::NotFound);
            }
        };
        if ino == 0 {
            self.dir_close(rec.parent);
            return Err(KernelError::InvalidArgument);
        }
        if rec.file_type == FileType::Regular {
            kprintln!(self.console(), "sys_rmdir: {} is a regular file!", path);
            self.dir_close(rec.parent);
            return Err(KernelError::NotADirectory);
        }

        let part = Arc::clone(&rec.parent.part);
        let child = self.dir_open(&part, ino);
        let result = if !self.dir_is_empty(&child) {
            kprintln!(self.console(), "sys_rmdir: dir {} is not empty!", path);
            Err(KernelError::NotEmpty)
        } else {
            self.dir_remove(&rec.parent, &child)
        };
        self.dir_close(child);
        self.dir_close(rec.parent);
        result
    }

    /// Open a directory handle with a read cursor.
    pub fn sys_opendir(&self, path: &str) -> Result<Dir> {
        if path.len() >= MAX_PATH_LEN {
            return Err(KernelError::InvalidArgument);
        }
        let part = self.cur_part()?;
        if path == "/" || path == "/." || path == "/.." {
            return Ok(self.dir_open(&part, 0));
        }

        let (found, rec) = self.search_file(path)?;
        let result = match found {
            None => {
                kprintln!(
                    self.console(),
                    "sys_opendir: in {}, subpath does not exist",
                    rec.searched_path
                );
                Err(KernelError::NotFound)
            }
            Some(ino) => match rec.file_type {
                FileType::Regular => {
                    kprintln!(self.console(), "sys_opendir: {} is a regular file", path);
                    Err(KernelError::NotADirectory)
                }
                _ => Ok(self.dir_open(&part, ino)),
            },
        };
        self.dir_close(rec.parent);
        result
    }

    pub fn sys_closedir(&self, dir: Dir) -> Result<()> {
        self.dir_close(dir);
        Ok(())
    }

    /// Next populated entry under the directory cursor.
    pub fn sys_readdir(&self, dir: &mut Dir) -> Option<DirEntry> {
        self.dir_read(dir)
    }

    pub fn sys_rewinddir(&self, dir: &mut Dir) {
        dir.rewind();
    }

    /// Make `path` the task's working directory; regular files refuse.
    pub fn sys_chdir(&self, path: &str) -> Result<()> {
        let (found, rec) = self.search_file(path)?;
        let result = match found {
            Some(ino) if rec.file_type != FileType::Regular => {
                proc::current()
                    .cwd_inode_no
                    .store(ino, core::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
            Some(_) => {
                kprintln!(self.console(), "sys_chdir: {} is a regular file!", path);
                Err(KernelError::NotADirectory)
            }
            None => Err(KernelError::NotFound),
        };
        self.dir_close(rec.parent);
        result
    }

    /// Absolute path of the task's working directory, rebuilt by walking
    /// `..` upward and matching the child's inode number in each parent.
    pub fn sys_getcwd(&self) -> Result<String> {
        let part = self.cur_part()?;
        let mut child = proc::current()
            .cwd_inode_no
            .load(core::sync::atomic::Ordering::SeqCst);
        debug_assert!((child as usize) < crate::param::MAX_FILES_PER_PART);
        if child == 0 {
            return Ok("/".to_string());
        }

        let mut names: Vec<String> = Vec::new();
        while child != 0 {
            let parent_ino = self.parent_dir_inode_nr(&part, child);
            let name = self
                .child_dir_name(&part, parent_ino, child)
                .ok_or(KernelError::NotFound)?;
            names.push(name);
            child = parent_ino;
        }

        let mut out = String::new();
        for name in names.iter().rev() {
            out.push('/');
            out.push_str(name);
        }
        Ok(out)
    }

    /// Inode number of `..` in directory `child`, read out of its first
    /// data block.
    fn parent_dir_inode_nr(&self, part: &Arc<Partition>, child: u32) -> u32 {
        let inode = self.inode_open(part, child);
        let block_lba = inode.inner.lock().i_sectors[0];
        self.inode_close(part, &inode);
        debug_assert!(block_lba >= self.data_start_lba(part));

        let mut buf = vec![0u8; SECTOR_SIZE];
        self.ide.read(part.disk, block_lba, &mut buf, 1);
        let mut dotdot = DirEntry::default();
        dotdot
            .as_bytes_mut()
            .copy_from_slice(&buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]);
        debug_assert_eq!(dotdot.file_type(), FileType::Directory);
        dotdot.inode_no()
    }

    /// Name of the entry with inode `child` inside directory `parent_ino`.
    fn child_dir_name(&self, part: &Arc<Partition>, parent_ino: u32, child: u32) -> Option<String> {
        let parent = self.dir_open(part, parent_ino);
        let blocks = self.collect_blocks(part, &parent.inode);
        let mut buf = vec![0u8; SECTOR_SIZE];
        let mut found = None;
        'outer: for &lba in blocks.iter().filter(|&&l| l != 0) {
            self.ide.read(part.disk, lba, &mut buf, 1);
            for idx in 0..dir::DIR_ENTRIES_PER_SECTOR {
                let off = idx * DIR_ENTRY_SIZE;
                let mut e = DirEntry::default();
                e.as_bytes_mut()
                    .copy_from_slice(&buf[off..off + DIR_ENTRY_SIZE]);
                if !e.is_free() && e.inode_no() == child {
                    let name = e.name();
                    if name != "." && name != ".." {
                        found = Some(name);
                        break 'outer;
                    }
                }
            }
        }
        self.dir_close(parent);
        found
    }

    /// Inode number, size and type of `path`; the root answers directly.
    pub fn sys_stat(&self, path: &str) -> Result<Stat> {
        let part = self.cur_part()?;
        if path == "/" || path == "/." || path == "/.." {
            let inode = self.inode_open(&part, 0);
            let size = inode.size();
            self.inode_close(&part, &inode);
            return Ok(Stat {
                ino: 0,
                size,
                file_type: FileType::Directory,
            });
        }

        let (found, rec) = self.search_file(path)?;
        let result = match found {
            Some(ino) => {
                let inode = self.inode_open(&part, ino);
                let size = inode.size();
                self.inode_close(&part, &inode);
                Ok(Stat {
                    ino,
                    size,
                    file_type: rec.file_type,
                })
            }
            None => Err(KernelError::NotFound),
        };
        self.dir_close(rec.parent);
        result
    }
}
