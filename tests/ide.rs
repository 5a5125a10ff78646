//! Driver-level tests: PIO transfers, command chunking, identify, and the
//! partition scan (primary + extended chains).

mod common;

use std::sync::Arc;

use minos::{DiskId, Kernel, Machine, MemMachine};

fn driver_only(machine: &Arc<MemMachine>) -> Arc<Kernel> {
    let kernel = Kernel::new(machine.clone() as Arc<dyn Machine>);
    kernel.adopt_thread("init");
    kernel.init_devices();
    kernel
}

#[test]
fn single_sector_roundtrip() {
    let machine = Arc::new(MemMachine::new());
    machine.attach_disk(0, 0, 2048);
    let kernel = driver_only(&machine);

    let disk = DiskId { channel: 0, dev: 0 };
    let mut sector = vec![0u8; 512];
    for (i, b) in sector.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    kernel.disk_write(disk, 7, &sector);

    let mut out = vec![0u8; 512];
    kernel.disk_read(disk, 7, &mut out);
    assert_eq!(out, sector);
    assert_eq!(machine.read_raw(0, 0, 7 * 512, 512), sector);
}

#[test]
fn requests_over_256_sectors_are_chunked() {
    let machine = Arc::new(MemMachine::new());
    machine.attach_disk(0, 0, 2048);
    let kernel = driver_only(&machine);

    let disk = DiskId { channel: 0, dev: 0 };
    let mut buf = vec![0u8; 300 * 512];
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i / 512) as u8;
    }
    kernel.disk_write(disk, 100, &buf);

    let mut out = vec![0u8; 300 * 512];
    kernel.disk_read(disk, 100, &mut out);
    assert_eq!(out, buf);
}

#[test]
fn identify_reports_the_geometry() {
    let machine = Arc::new(MemMachine::new());
    machine.attach_disk(0, 0, 4096);
    machine.attach_disk(0, 1, 8192);
    let kernel = driver_only(&machine);

    let ident = kernel.disk_ident(DiskId { channel: 0, dev: 0 }).unwrap();
    assert_eq!(ident.sectors, 4096);
    assert_eq!(ident.model, "MINOS VIRTUAL ATA DISK");
    let ident = kernel.disk_ident(DiskId { channel: 0, dev: 1 }).unwrap();
    assert_eq!(ident.sectors, 8192);
}

#[test]
fn spurious_irq_is_ignored() {
    let machine = Arc::new(MemMachine::new());
    machine.attach_disk(0, 0, 2048);
    let kernel = driver_only(&machine);

    // No command outstanding: the handler must not post the semaphore.
    use minos::IrqHandler;
    kernel.handle_irq(14);
    kernel.handle_irq(15);

    // The channel still works afterwards.
    let disk = DiskId { channel: 0, dev: 0 };
    let sector = vec![0xA5u8; 512];
    kernel.disk_write(disk, 1, &sector);
    let mut out = vec![0u8; 512];
    kernel.disk_read(disk, 1, &mut out);
    assert_eq!(out, sector);
}

#[test]
fn scan_finds_primary_partitions() {
    let machine = common::machine_with_data_disk();
    let kernel = driver_only(&machine);

    let part = kernel.partition("sdb1").expect("primary partition found");
    assert_eq!(part.start_lba, common::PART_START_LBA);
    assert_eq!(part.sec_cnt, common::PART_SECTORS);
    assert_eq!(part.disk, DiskId { channel: 0, dev: 1 });
}

#[test]
fn scan_walks_extended_partition_chains() {
    let machine = Arc::new(MemMachine::new());
    machine.attach_disk(0, 0, 2048);
    machine.attach_disk(0, 1, 65536);

    // MBR: one primary, one extended container at LBA 16384.
    let ext_base = 16384;
    let mbr = common::boot_sector(&[(0x83, 2048, 8192), (0x05, ext_base, 32768)]);
    machine.write_raw(0, 1, 0, &mbr);

    // First EBR: logical partition at +64, next EBR at +8192 (relative to
    // the extended base).
    let ebr1 = common::boot_sector(&[(0x83, 64, 4096), (0x05, 8192, 8192)]);
    machine.write_raw(0, 1, ext_base as usize * 512, &ebr1);

    // Second EBR: the last logical partition.
    let ebr2 = common::boot_sector(&[(0x83, 64, 2048)]);
    machine.write_raw(0, 1, (ext_base + 8192) as usize * 512, &ebr2);

    let kernel = driver_only(&machine);

    let p1 = kernel.partition("sdb1").expect("primary");
    assert_eq!(p1.start_lba, 2048);

    let p5 = kernel.partition("sdb5").expect("first logical");
    assert_eq!(p5.start_lba, ext_base + 64);
    assert_eq!(p5.sec_cnt, 4096);

    let p6 = kernel.partition("sdb6").expect("second logical");
    assert_eq!(p6.start_lba, ext_base + 8192 + 64);
    assert_eq!(p6.sec_cnt, 2048);
}

#[test]
fn boot_log_reports_partitions() {
    let machine = common::machine_with_data_disk();
    let kernel = driver_only(&machine);
    let _ = kernel;
    let console = machine.take_console();
    assert!(console.contains("ide_init start"));
    assert!(console.contains("sdb1"));
    assert!(console.contains("ide_init done"));
}
