//! Format of an ELF32 executable file.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::err::{KernelError, Result};

/// `\x7F E L F`, 32-bit, little-endian, header version 1.
pub const ELF_IDENT_PREFIX: [u8; 7] = [0x7F, b'E', b'L', b'F', 1, 1, 1];

/// Executable file.
pub const ET_EXEC: u16 = 2;
/// Intel 386.
pub const EM_386: u16 = 3;
/// Loadable program segment.
pub const PT_LOAD: u32 = 1;

/// File header, 52 bytes.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ElfHdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

pub const ELF_HDR_SIZE: usize = core::mem::size_of::<ElfHdr>();
const_assert_eq!(ELF_HDR_SIZE, 52);

/// Program header, 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ProgHdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

pub const PROG_HDR_SIZE: usize = core::mem::size_of::<ProgHdr>();
const_assert_eq!(PROG_HDR_SIZE, 32);

impl ElfHdr {
    /// Reject anything but a little-endian i386 executable with sane
    /// program headers.
    pub fn validate(&self) -> Result<()> {
        if self.e_ident[..7] != ELF_IDENT_PREFIX
            || self.e_type != ET_EXEC
            || self.e_machine != EM_386
            || self.e_version != 1
            || self.e_phnum > 1024
            || self.e_phentsize as usize != PROG_HDR_SIZE
        {
            return Err(KernelError::NoExec);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_header() -> ElfHdr {
        let mut h = ElfHdr::default();
        h.e_ident[..7].copy_from_slice(&ELF_IDENT_PREFIX);
        h.e_type = ET_EXEC;
        h.e_machine = EM_386;
        h.e_version = 1;
        h.e_phentsize = PROG_HDR_SIZE as u16;
        h.e_phnum = 1;
        h
    }

    #[test]
    fn validates_i386_executable() {
        assert!(good_header().validate().is_ok());
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut h = good_header();
        h.e_machine = 0x3E; // x86-64
        assert_eq!(h.validate(), Err(KernelError::NoExec));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut h = good_header();
        h.e_ident[0] = 0;
        assert!(h.validate().is_err());
    }
}
