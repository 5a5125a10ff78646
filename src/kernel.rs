//! The kernel object: every long-lived piece of global state, built
//! explicitly so initialization order is visible at the call site.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use array_macro::array;

use crate::console::Console;
use crate::fs::dir::Dir;
use crate::fs::file::FileSlot;
use crate::hal::{IrqHandler, Machine};
use crate::ide::{DiskId, Ide, Partition};
use crate::param::MAX_FILE_OPEN;
use crate::proc::{self, Pid, Task, TaskStatus};
use crate::sync::SleepLock;
use crate::vm::UserMemory;

pub struct Kernel {
    pub(crate) hal: Arc<dyn Machine>,
    console: Console,
    pub(crate) ide: Ide,
    /// Partitions discovered by the disk scan.
    pub(crate) partitions: spin::Mutex<Vec<Arc<Partition>>>,
    /// The mounted partition all path operations run against.
    pub(crate) cur_part: spin::Mutex<Option<Arc<Partition>>>,
    /// Root directory held open for the kernel's lifetime.
    pub(crate) root_dir: spin::Mutex<Option<Dir>>,
    /// Global open-file table; slots 0..=2 stand for the std streams.
    pub(crate) file_table: [SleepLock<FileSlot>; MAX_FILE_OPEN],
    /// Every live task.
    pub(crate) tasks: spin::Mutex<Vec<Arc<Task>>>,
    next_pid: AtomicI32,
}

impl Kernel {
    pub fn new(hal: Arc<dyn Machine>) -> Arc<Self> {
        let kernel = Arc::new(Self {
            console: Console::new(Arc::clone(&hal)),
            ide: Ide::new(Arc::clone(&hal)),
            partitions: spin::Mutex::new(Vec::new()),
            cur_part: spin::Mutex::new(None),
            root_dir: spin::Mutex::new(None),
            file_table: array![_ => SleepLock::new("file_table", FileSlot::empty()); MAX_FILE_OPEN],
            tasks: spin::Mutex::new(Vec::new()),
            next_pid: AtomicI32::new(proc::INIT_PID),
            hal,
        });
        kernel
            .hal
            .set_irq_handler(Arc::clone(&kernel) as Arc<dyn IrqHandler>);
        kernel
    }

    /// Register the calling thread as the init task (pid 1). Everything
    /// else, `fork` included, needs a current task.
    pub fn adopt_thread(self: &Arc<Self>, name: &str) {
        let init = Task::new(self.alloc_pid(), 0, name, Some(UserMemory::new()));
        init.set_status(TaskStatus::Running);
        self.tasks.lock().push(Arc::clone(&init));
        proc::set_current(init);
    }

    /// Probe the disks and register their partitions.
    pub fn init_devices(&self) {
        let parts = self.ide.init(&self.console);
        *self.partitions.lock() = parts;
    }

    /// Full bring-up: init task, disks, then the file system.
    pub fn bootstrap(self: &Arc<Self>, name: &str) {
        self.adopt_thread(name);
        self.init_devices();
        self.filesys_init().expect("file system init failed");
    }

    pub(crate) fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Look a discovered partition up by name.
    pub fn partition(&self, name: &str) -> Option<Arc<Partition>> {
        self.partitions
            .lock()
            .iter()
            .find(|p| p.name.as_str() == name)
            .cloned()
    }

    /// The partition mounted by `filesys_init`, if any.
    pub fn current_partition(&self) -> Option<Arc<Partition>> {
        self.cur_part.lock().clone()
    }

    /// The task list entry for `pid`, while it has not been reaped.
    pub fn task(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().iter().find(|t| t.pid == pid).cloned()
    }

    /// Raw sector read through the driver; `buf` must be sector-aligned.
    pub fn disk_read(&self, disk: DiskId, lba: u32, buf: &mut [u8]) {
        let sec_cnt = (buf.len() / crate::param::SECTOR_SIZE) as u32;
        self.ide.read(disk, lba, buf, sec_cnt);
    }

    /// Raw sector write through the driver; `buf` must be sector-aligned.
    pub fn disk_write(&self, disk: DiskId, lba: u32, buf: &[u8]) {
        let sec_cnt = (buf.len() / crate::param::SECTOR_SIZE) as u32;
        self.ide.write(disk, lba, buf, sec_cnt);
    }

    /// Identify data recorded for a probed drive.
    pub fn disk_ident(&self, disk: DiskId) -> Option<crate::ide::DiskIdent> {
        self.ide.channels[disk.channel].disks[disk.dev].ident()
    }
}

impl IrqHandler for Kernel {
    fn handle_irq(&self, irq_no: u8) {
        self.ide.intr_hd_handler(irq_no);
    }
}
