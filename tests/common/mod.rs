//! Shared harness: an in-memory machine with a bare system disk and a
//! partitioned data disk, booted the way the kernel comes up on hardware.

#![allow(dead_code)]

use std::sync::Arc;

use minos::{Kernel, MemMachine};

pub const SECTOR_SIZE: usize = 512;

/// 80 MiB data disk.
pub const DATA_DISK_SECTORS: u32 = 80 * 1024 * 1024 / SECTOR_SIZE as u32;

/// First primary partition: everything past the first MiB.
pub const PART_START_LBA: u32 = 2048;
pub const PART_SECTORS: u32 = DATA_DISK_SECTORS - PART_START_LBA;

pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Build a boot sector holding up to four `(fs_type, start_lba, sec_cnt)`
/// partition-table entries.
pub fn boot_sector(entries: &[(u8, u32, u32)]) -> Vec<u8> {
    assert!(entries.len() <= 4);
    let mut sec = vec![0u8; SECTOR_SIZE];
    for (i, &(fs_type, start_lba, sec_cnt)) in entries.iter().enumerate() {
        let off = 446 + i * 16;
        sec[off + 4] = fs_type;
        put_u32(&mut sec, off + 8, start_lba);
        put_u32(&mut sec, off + 12, sec_cnt);
    }
    sec[510] = 0x55;
    sec[511] = 0xAA;
    sec
}

/// Machine with a bare system disk and an MBR-partitioned data disk.
pub fn machine_with_data_disk() -> Arc<MemMachine> {
    let machine = Arc::new(MemMachine::new());
    machine.attach_disk(0, 0, 2048);
    machine.attach_disk(0, 1, DATA_DISK_SECTORS);
    let mbr = boot_sector(&[(0x83, PART_START_LBA, PART_SECTORS)]);
    machine.write_raw(0, 1, 0, &mbr);
    machine
}

/// Boot a kernel on a fresh machine; the calling thread becomes init.
pub fn boot() -> (Arc<MemMachine>, Arc<Kernel>) {
    let machine = machine_with_data_disk();
    let kernel = Kernel::new(machine.clone() as Arc<dyn minos::Machine>);
    kernel.bootstrap("init");
    (machine, kernel)
}
