//! `execv`: replace the calling task's image with an ELF32 executable read
//! from the file system.
//!
//! Loading claims pages in the task's page directory without touching the
//! user vaddr bitmap (the bitmap tracks heap growth, not image layout),
//! copies each LOAD segment to its virtual address, then rewrites the
//! interrupt-exit frame so the return path lands at the image entry with
//! `ebx` = argv and `ecx` = argc. The hardware jump through that frame is
//! outside the core; on failure the address space is left as-is.

use zerocopy::AsBytes;

use crate::elf::{ElfHdr, ProgHdr, ELF_HDR_SIZE, PROG_HDR_SIZE, PT_LOAD};
use crate::err::{KernelError, Result};
use crate::fs::{OpenFlags, SeekWhence};
use crate::kernel::Kernel;
use crate::param::{PAGE_SIZE, USER_STACK_TOP};
use crate::proc;

impl Kernel {
    /// Load the executable at `path` over the current task. On success the
    /// task's frame and name describe the new image.
    pub fn sys_execv(&self, path: &str, argv: &[&str]) -> Result<()> {
        let entry_point = self.load(path)?;
        let me = proc::current();

        {
            let mut name = me.name.lock();
            name.clear();
            for c in path.chars() {
                if name.try_push(c).is_err() {
                    break;
                }
            }
        }

        let argv_vaddr = self.stage_argv(argv)?;

        let mut frame = me.frame.lock();
        frame.ebx = argv_vaddr;
        frame.ecx = argv.len() as u32;
        frame.eip = entry_point;
        frame.esp = USER_STACK_TOP;
        Ok(())
    }

    /// Read and validate the image, loading every LOAD segment. Returns the
    /// entry point.
    fn load(&self, path: &str) -> Result<u32> {
        let fd = self.sys_open(path, OpenFlags::O_RDONLY)?;
        let result = self.load_from_fd(fd);
        let _ = self.sys_close(fd);
        result
    }

    fn load_from_fd(&self, fd: i32) -> Result<u32> {
        let mut hdr_buf = [0u8; ELF_HDR_SIZE];
        if self.sys_read(fd, &mut hdr_buf)? != ELF_HDR_SIZE {
            return Err(KernelError::NoExec);
        }
        let mut ehdr = ElfHdr::default();
        ehdr.as_bytes_mut().copy_from_slice(&hdr_buf);
        ehdr.validate()?;

        let mut ph_off = ehdr.e_phoff;
        for _ in 0..ehdr.e_phnum {
            let mut ph_buf = [0u8; PROG_HDR_SIZE];
            self.sys_lseek(fd, ph_off as i32, SeekWhence::Set)?;
            if self.sys_read(fd, &mut ph_buf)? != PROG_HDR_SIZE {
                return Err(KernelError::NoExec);
            }
            let mut phdr = ProgHdr::default();
            phdr.as_bytes_mut().copy_from_slice(&ph_buf);

            if phdr.p_type == PT_LOAD {
                self.segment_load(fd, phdr.p_offset, phdr.p_filesz, phdr.p_vaddr)?;
            }
            ph_off += ehdr.e_phentsize as u32;
        }
        Ok(ehdr.e_entry)
    }

    /// Bring `filesz` bytes at file `offset` to `vaddr`, claiming any page
    /// whose directory or table entry is absent.
    fn segment_load(&self, fd: i32, offset: u32, filesz: u32, vaddr: u32) -> Result<()> {
        let me = proc::current();
        let first_page = vaddr & !(PAGE_SIZE as u32 - 1);
        let end = vaddr + filesz.max(1);

        {
            let mut mem = me.mem.lock();
            let mem = mem.as_mut().ok_or(KernelError::NoExec)?;
            let mut page = first_page;
            while page < end {
                mem.claim_page(page)?;
                page += PAGE_SIZE as u32;
            }
        }

        self.sys_lseek(fd, offset as i32, SeekWhence::Set)?;
        let mut data = vec![0u8; filesz as usize];
        if self.sys_read(fd, &mut data)? != filesz as usize {
            return Err(KernelError::NoExec);
        }

        let mut mem = me.mem.lock();
        let mem = mem.as_mut().ok_or(KernelError::NoExec)?;
        mem.write_bytes(vaddr, &data)
    }

    /// Copy the argument strings and their pointer array to the top of the
    /// user stack; `ebx` will carry the array's address.
    fn stage_argv(&self, argv: &[&str]) -> Result<u32> {
        let me = proc::current();
        let mut mem = me.mem.lock();
        let mem = mem.as_mut().ok_or(KernelError::NoExec)?;

        let page_va = USER_STACK_TOP - PAGE_SIZE as u32;
        mem.claim_page(page_va)?;

        // Strings first, then the NULL-terminated pointer table below them.
        let strings_bytes: usize = argv.iter().map(|s| s.len() + 1).sum();
        let table_bytes = (argv.len() + 1) * 4;
        if strings_bytes + table_bytes > PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }

        let mut str_va = USER_STACK_TOP - strings_bytes as u32;
        let table_va = str_va - table_bytes as u32;
        let mut table: Vec<u8> = Vec::with_capacity(table_bytes);
        for s in argv {
            table.extend_from_slice(&str_va.to_le_bytes());
            mem.write_bytes(str_va, s.as_bytes())?;
            mem.write_bytes(str_va + s.len() as u32, &[0])?;
            str_va += s.len() as u32 + 1;
        }
        table.extend_from_slice(&0u32.to_le_bytes());
        mem.write_bytes(table_va, &table)?;
        Ok(table_va)
    }
}
