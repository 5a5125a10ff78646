//! IDE/ATA programmed-I/O driver with interrupt-synchronized completion,
//! plus MBR partition discovery.
//!
//! Two channels at the legacy port bases, one outstanding command per
//! channel enforced by the channel mutex. A request writes the command,
//! flags `expecting_intr`, and sleeps on `disk_done`; the IRQ handler
//! acknowledges the device and posts the semaphore. Spurious IRQs are
//! harmless because the requester always holds the channel mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrayvec::ArrayString;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::console::Console;
use crate::fs::bitmap::Bitmap;
use crate::fs::inode::Inode;
use crate::fs::superblock::SuperBlock;
use crate::hal::Machine;
use crate::param::{MAX_LOGIC_PARTS, MAX_PRIMARY_PARTS, SECTOR_SIZE};
use crate::sync::{Mutex, Semaphore, SleepLock};

// Register offsets from the channel port base.
const REG_DATA: u16 = 0;
const REG_ERROR: u16 = 1;
const REG_SECT_CNT: u16 = 2;
const REG_LBA_L: u16 = 3;
const REG_LBA_M: u16 = 4;
const REG_LBA_H: u16 = 5;
const REG_DEV: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_CMD: u16 = 7;
const REG_ALT_STATUS: u16 = 0x206;

// Status bits.
const BIT_STAT_BSY: u8 = 0x80;
const BIT_STAT_DRDY: u8 = 0x40;
const BIT_STAT_DRQ: u8 = 0x08;

// Device register bits.
const BIT_DEV_MBS: u8 = 0xA0;
const BIT_DEV_LBA: u8 = 0x40;
const BIT_DEV_DEV: u8 = 0x10;

// Commands.
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_READ_SECTOR: u8 = 0x20;
const CMD_WRITE_SECTOR: u8 = 0x30;

const CH_PORT_BASES: [u16; 2] = [0x1F0, 0x170];
const CH_IRQS: [u8; 2] = [14, 15];

/// Largest sector run one ATA command carries; a count byte of 0 means 256.
const MAX_SECS_PER_CMD: u32 = 256;

/// Position of a drive: channel index and master/slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskId {
    pub channel: usize,
    pub dev: usize,
}

/// Identify-command results worth keeping.
#[derive(Debug, Clone)]
pub struct DiskIdent {
    pub serial: String,
    pub model: String,
    pub sectors: u32,
}

pub struct Disk {
    pub name: ArrayString<8>,
    pub dev_no: u8,
    ident: spin::Mutex<Option<DiskIdent>>,
}

impl Disk {
    pub fn ident(&self) -> Option<DiskIdent> {
        self.ident.lock().clone()
    }
}

pub struct IdeChannel {
    pub name: ArrayString<8>,
    port_base: u16,
    pub irq_no: u8,
    /// Serializes commands on the channel.
    lock: Mutex,
    /// One-shot completion token pair: set with the command, consumed by the
    /// IRQ handler.
    expecting_intr: AtomicBool,
    disk_done: Semaphore,
    pub disks: [Disk; 2],
}

/// A discovered partition and its in-memory file system state.
pub struct Partition {
    pub name: ArrayString<8>,
    pub disk: DiskId,
    pub start_lba: u32,
    pub sec_cnt: u32,
    pub(crate) inner: SleepLock<PartInner>,
}

pub(crate) struct PartInner {
    pub sb: Option<SuperBlock>,
    pub block_bitmap: Bitmap,
    pub inode_bitmap: Bitmap,
    pub open_inodes: Vec<Arc<Inode>>,
}

impl Partition {
    fn new(name: ArrayString<8>, disk: DiskId, start_lba: u32, sec_cnt: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            disk,
            start_lba,
            sec_cnt,
            inner: SleepLock::new(
                "partition",
                PartInner {
                    sb: None,
                    block_bitmap: Bitmap::new(0),
                    inode_bitmap: Bitmap::new(0),
                    open_inodes: Vec::new(),
                },
            ),
        })
    }
}

/// A 16-byte MBR partition-table entry.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes, Unaligned)]
struct PartTableEntry {
    bootable: u8,
    start_head: u8,
    start_sec: u8,
    start_chs: u8,
    fs_type: u8,
    end_head: u8,
    end_sec: u8,
    end_chs: u8,
    start_lba: u32,
    sec_cnt: u32,
}

const_assert_eq!(core::mem::size_of::<PartTableEntry>(), 16);

/// Byte offset of the partition table inside a boot sector; the signature
/// bytes 0x55 0xAA follow at offset 510.
const PART_TABLE_OFFSET: usize = 446;
const BOOT_SIGNATURE: u16 = 0xAA55;
const FS_TYPE_EXTENDED: u8 = 0x05;

/// The four partition-table entries of a boot sector, or None when the
/// signature is missing.
fn parse_boot_sector(sector: &[u8]) -> Option<[PartTableEntry; 4]> {
    debug_assert_eq!(sector.len(), SECTOR_SIZE);
    let signature = u16::from_le_bytes([sector[510], sector[511]]);
    if signature != BOOT_SIGNATURE {
        return None;
    }
    let mut table = [PartTableEntry::default(); 4];
    for (i, entry) in table.iter_mut().enumerate() {
        let off = PART_TABLE_OFFSET + i * 16;
        entry.as_bytes_mut().copy_from_slice(&sector[off..off + 16]);
    }
    Some(table)
}

struct ScanState {
    /// Base LBA of the outer extended partition; nested EBR entries are
    /// relative to it.
    ext_lba_base: u32,
    p_no: u8,
    l_no: u8,
    found: Vec<Arc<Partition>>,
}

pub struct Ide {
    hal: Arc<dyn Machine>,
    pub channels: [IdeChannel; 2],
}

impl Ide {
    pub fn new(hal: Arc<dyn Machine>) -> Self {
        let make_channel = |no: usize| {
            let mut name = ArrayString::new();
            let _ = core::fmt::Write::write_fmt(&mut name, format_args!("ide{}", no));
            let make_disk = |dev: usize| {
                let mut dname = ArrayString::new();
                let letter = (b'a' + (no * 2 + dev) as u8) as char;
                let _ = core::fmt::Write::write_fmt(&mut dname, format_args!("sd{}", letter));
                Disk {
                    name: dname,
                    dev_no: dev as u8,
                    ident: spin::Mutex::new(None),
                }
            };
            IdeChannel {
                name,
                port_base: CH_PORT_BASES[no],
                irq_no: CH_IRQS[no],
                lock: Mutex::new("ide_channel"),
                expecting_intr: AtomicBool::new(false),
                disk_done: Semaphore::new("disk_done", 0),
                disks: [make_disk(0), make_disk(1)],
            }
        };
        Self {
            hal,
            channels: [make_channel(0), make_channel(1)],
        }
    }

    fn channel(&self, disk: DiskId) -> &IdeChannel {
        &self.channels[disk.channel]
    }

    fn select_disk(&self, disk: DiskId) {
        let ch = self.channel(disk);
        let mut reg = BIT_DEV_MBS | BIT_DEV_LBA;
        if disk.dev == 1 {
            reg |= BIT_DEV_DEV;
        }
        self.hal.outb(ch.port_base + REG_DEV, reg);
    }

    /// Program the sector count and the 28-bit LBA, rewriting the device
    /// register to carry LBA[27:24].
    fn select_sector(&self, disk: DiskId, lba: u32, sec_cnt: u32) {
        debug_assert!(sec_cnt <= MAX_SECS_PER_CMD);
        let ch = self.channel(disk);
        // A count of 256 wraps to 0, which the device reads as 256.
        self.hal.outb(ch.port_base + REG_SECT_CNT, sec_cnt as u8);
        self.hal.outb(ch.port_base + REG_LBA_L, lba as u8);
        self.hal.outb(ch.port_base + REG_LBA_M, (lba >> 8) as u8);
        self.hal.outb(ch.port_base + REG_LBA_H, (lba >> 16) as u8);
        let mut dev = BIT_DEV_MBS | BIT_DEV_LBA | ((lba >> 24) as u8 & 0x0F);
        if disk.dev == 1 {
            dev |= BIT_DEV_DEV;
        }
        self.hal.outb(ch.port_base + REG_DEV, dev);
    }

    fn cmd_out(&self, ch: &IdeChannel, cmd: u8) {
        // The handler keys off this flag; set it before the device can fire.
        ch.expecting_intr.store(true, Ordering::SeqCst);
        self.hal.outb(ch.port_base + REG_CMD, cmd);
    }

    /// Poll until BSY drops, up to 30 seconds; true when DRQ asserted.
    fn busy_wait(&self, disk: DiskId) -> bool {
        let ch = self.channel(disk);
        let mut time_left: i32 = 30_000;
        while time_left > 0 {
            let status = self.hal.inb(ch.port_base + REG_STATUS);
            if status & BIT_STAT_BSY == 0 {
                return status & BIT_STAT_DRQ != 0;
            }
            self.hal.msleep(10);
            time_left -= 10;
        }
        false
    }

    /// Read `sec_cnt` sectors starting at `lba` into `buf`.
    pub fn read(&self, disk: DiskId, lba: u32, buf: &mut [u8], sec_cnt: u32) {
        assert!(sec_cnt > 0);
        assert_eq!(buf.len(), sec_cnt as usize * SECTOR_SIZE);
        let ch = self.channel(disk);
        ch.lock.acquire();
        self.select_disk(disk);

        let mut secs_done = 0u32;
        while secs_done < sec_cnt {
            let secs_op = core::cmp::min(MAX_SECS_PER_CMD, sec_cnt - secs_done);
            self.select_sector(disk, lba + secs_done, secs_op);
            self.cmd_out(ch, CMD_READ_SECTOR);

            // The device is busy now; sleep until its IRQ posts completion.
            ch.disk_done.down();

            if !self.busy_wait(disk) {
                panic!(
                    "{} read sector {} failed",
                    ch.disks[disk.dev].name,
                    lba + secs_done
                );
            }
            let off = secs_done as usize * SECTOR_SIZE;
            let len = secs_op as usize * SECTOR_SIZE;
            self.hal.insw(ch.port_base + REG_DATA, &mut buf[off..off + len]);
            secs_done += secs_op;
        }
        ch.lock.release();
    }

    /// Write `sec_cnt` sectors from `buf` starting at `lba`.
    pub fn write(&self, disk: DiskId, lba: u32, buf: &[u8], sec_cnt: u32) {
        assert!(sec_cnt > 0);
        assert_eq!(buf.len(), sec_cnt as usize * SECTOR_SIZE);
        let ch = self.channel(disk);
        ch.lock.acquire();
        self.select_disk(disk);

        let mut secs_done = 0u32;
        while secs_done < sec_cnt {
            let secs_op = core::cmp::min(MAX_SECS_PER_CMD, sec_cnt - secs_done);
            self.select_sector(disk, lba + secs_done, secs_op);
            self.cmd_out(ch, CMD_WRITE_SECTOR);

            if !self.busy_wait(disk) {
                panic!(
                    "{} write sector {} failed",
                    ch.disks[disk.dev].name,
                    lba + secs_done
                );
            }
            let off = secs_done as usize * SECTOR_SIZE;
            let len = secs_op as usize * SECTOR_SIZE;
            self.hal.outsw(ch.port_base + REG_DATA, &buf[off..off + len]);

            // Block until the device has drained the sector data.
            ch.disk_done.down();
            secs_done += secs_op;
        }
        ch.lock.release();
    }

    /// IRQ 14/15 entry: acknowledge the device and post the waiter.
    pub fn intr_hd_handler(&self, irq_no: u8) {
        assert!(irq_no == 14 || irq_no == 15);
        let ch = &self.channels[(irq_no - 14) as usize];
        debug_assert_eq!(ch.irq_no, irq_no);
        // The requester holds the channel mutex, so a pending flag always
        // belongs to its command; anything else is spurious and ignored.
        if ch.expecting_intr.swap(false, Ordering::SeqCst) {
            ch.disk_done.up();
            // Reading the status register lets the device retire the IRQ.
            let _ = self.hal.inb(ch.port_base + REG_STATUS);
        }
    }

    /// Issue identify and record serial, model and usable sector count.
    fn identify_disk(&self, disk: DiskId, console: &Console) {
        let ch = self.channel(disk);
        ch.lock.acquire();
        self.select_disk(disk);
        self.cmd_out(ch, CMD_IDENTIFY);
        ch.disk_done.down();
        if !self.busy_wait(disk) {
            panic!("{} identify failed", ch.disks[disk.dev].name);
        }
        let mut id = [0u8; SECTOR_SIZE];
        self.hal.insw(ch.port_base + REG_DATA, &mut id);
        ch.lock.release();

        let serial = swap_pairs_bytes(&id[10 * 2..20 * 2]);
        let model = swap_pairs_bytes(&id[27 * 2..47 * 2]);
        let sectors = u32::from_le_bytes([id[120], id[121], id[122], id[123]]);
        kprintln!(console, "    disk {} info:", ch.disks[disk.dev].name);
        kprintln!(console, "      SN: {}", serial);
        kprintln!(console, "      MODULE: {}", model);
        kprintln!(console, "      SECTORS: {}", sectors);
        kprintln!(console, "      CAPACITY: {}MB", sectors / 2048);
        *ch.disks[disk.dev].ident.lock() = Some(DiskIdent {
            serial,
            model,
            sectors,
        });
    }

    /// Walk the MBR and any extended boot records of `disk`.
    fn partition_scan(&self, disk: DiskId, ext_lba: u32, st: &mut ScanState) {
        let mut buf = vec![0u8; SECTOR_SIZE];
        self.read(disk, ext_lba, &mut buf, 1);
        let table = match parse_boot_sector(&buf) {
            Some(table) => table,
            None => return,
        };

        for entry in table.iter() {
            let fs_type = entry.fs_type;
            let start_lba = entry.start_lba;
            let sec_cnt = entry.sec_cnt;
            if fs_type == FS_TYPE_EXTENDED {
                if st.ext_lba_base != 0 {
                    // Nested EBR entries are relative to the outer base.
                    self.partition_scan(disk, start_lba + st.ext_lba_base, st);
                } else {
                    st.ext_lba_base = start_lba;
                    self.partition_scan(disk, start_lba, st);
                }
            } else if fs_type != 0 {
                let disk_name = &self.channel(disk).disks[disk.dev].name;
                if ext_lba == 0 {
                    let mut name = ArrayString::new();
                    let _ = core::fmt::Write::write_fmt(
                        &mut name,
                        format_args!("{}{}", disk_name, st.p_no + 1),
                    );
                    st.found
                        .push(Partition::new(name, disk, start_lba, sec_cnt));
                    st.p_no += 1;
                    assert!((st.p_no as usize) <= MAX_PRIMARY_PARTS);
                } else {
                    let mut name = ArrayString::new();
                    let _ = core::fmt::Write::write_fmt(
                        &mut name,
                        format_args!("{}{}", disk_name, st.l_no + 5),
                    );
                    st.found
                        .push(Partition::new(name, disk, ext_lba + start_lba, sec_cnt));
                    st.l_no += 1;
                    if st.l_no as usize >= MAX_LOGIC_PARTS {
                        return;
                    }
                }
            }
        }
    }

    /// Probe every enumerated drive and collect the partitions of all disks
    /// except the bare system disk (channel 0, master).
    pub fn init(&self, console: &Console) -> Vec<Arc<Partition>> {
        kprintln!(console, "ide_init start");
        let hd_cnt = self.hal.disk_count();
        assert!(hd_cnt > 0, "no disks enumerated");
        kprintln!(console, "   ide_init hd_cnt: {}", hd_cnt);

        let channel_cnt = ((hd_cnt as usize) + 1) / 2;
        let mut remaining = hd_cnt as usize;
        let mut partitions = Vec::new();
        for channel_no in 0..channel_cnt.min(2) {
            for dev_no in 0..2 {
                if remaining == 0 {
                    break;
                }
                remaining -= 1;
                let disk = DiskId {
                    channel: channel_no,
                    dev: dev_no,
                };
                self.identify_disk(disk, console);
                if channel_no == 0 && dev_no == 0 {
                    // The bare system disk carries no partition table.
                    continue;
                }
                let mut st = ScanState {
                    ext_lba_base: 0,
                    p_no: 0,
                    l_no: 0,
                    found: Vec::new(),
                };
                self.partition_scan(disk, 0, &mut st);
                partitions.extend(st.found);
            }
        }

        kprintln!(console, "");
        kprintln!(console, " all partition info");
        for part in &partitions {
            kprintln!(
                console,
                "    {} start_lba:{:#x}, sec_cnt:{:#x}",
                part.name,
                part.start_lba,
                part.sec_cnt
            );
        }
        kprintln!(console, "ide_init done");
        partitions
    }
}

/// ATA identify strings arrive with each byte pair swapped.
fn swap_pairs_bytes(src: &[u8]) -> String {
    let mut out = Vec::with_capacity(src.len());
    for pair in src.chunks_exact(2) {
        out.push(pair[1]);
        out.push(pair[0]);
    }
    String::from_utf8_lossy(&out).trim_end().to_string()
}
