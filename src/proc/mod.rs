//! Tasks and the process lifecycle: fork, wait, exit.
//!
//! A task is a host thread carrying a task control block. The scheduler of
//! the real machine degenerates here to block/unblock on a per-task parker;
//! the status field still walks the usual states, and `wait` and `exit`
//! coordinate through the interrupt-off section so the HANGING/WAITING
//! handshake cannot lose a wakeup.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex as HostMutex};

use arrayvec::ArrayString;

use crate::err::{KernelError, Result};
use crate::intr;
use crate::kernel::Kernel;
use crate::param::{MAX_FILES_OPEN_PER_PROC, TASK_NAME_LEN};
use crate::sync::SleepLock;
use crate::vm::UserMemory;

pub type Pid = i32;

/// Pid of the init task, which adopts orphans.
pub const INIT_PID: Pid = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Ready,
    Blocked,
    /// Blocked in `wait` until a child hangs.
    Waiting,
    /// Exited; parked until the parent reaps the TCB.
    Hanging,
    /// Reaped. The task is off the all-tasks list and its thread may end.
    Died,
}

/// Interrupt-exit frame at the top of a task's kernel stack.
///
/// `fork` forges one with `eax = 0` for the child; `exec` rewrites `eip`,
/// `esp` and the argument registers so the return path lands in the new
/// image.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntrFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

pub struct Task {
    pub pid: Pid,
    parent: AtomicI32,
    pub name: spin::Mutex<ArrayString<TASK_NAME_LEN>>,
    status: spin::Mutex<TaskStatus>,
    exit_status: AtomicI32,
    /// Local fd table: -1 free, 0..=2 a std stream, otherwise a global index.
    pub fd_table: spin::Mutex<[i32; MAX_FILES_OPEN_PER_PROC]>,
    pub cwd_inode_no: AtomicU32,
    pub frame: spin::Mutex<IntrFrame>,
    pub mem: SleepLock<Option<UserMemory>>,
    parker: Parker,
}

impl Task {
    pub(crate) fn new(pid: Pid, parent: Pid, name: &str, mem: Option<UserMemory>) -> Arc<Self> {
        let mut fd_table = [-1i32; MAX_FILES_OPEN_PER_PROC];
        fd_table[0] = 0;
        fd_table[1] = 1;
        fd_table[2] = 2;
        Arc::new(Self {
            pid,
            parent: AtomicI32::new(parent),
            name: spin::Mutex::new(truncate_name(name)),
            status: spin::Mutex::new(TaskStatus::Ready),
            exit_status: AtomicI32::new(0),
            fd_table: spin::Mutex::new(fd_table),
            cwd_inode_no: AtomicU32::new(0),
            frame: spin::Mutex::new(IntrFrame::default()),
            mem: SleepLock::new("task_mem", mem),
            parker: Parker::new(),
        })
    }

    pub fn parent(&self) -> Pid {
        self.parent.load(Ordering::SeqCst)
    }

    pub(crate) fn set_parent(&self, pid: Pid) {
        self.parent.store(pid, Ordering::SeqCst);
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, s: TaskStatus) {
        *self.status.lock() = s;
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::SeqCst)
    }

    /// Park until some other task unblocks us.
    pub(crate) fn block(&self) {
        self.parker.park();
        self.set_status(TaskStatus::Running);
    }

    /// Mark ready and wake the parked thread.
    pub(crate) fn unblock(&self) {
        self.set_status(TaskStatus::Ready);
        self.parker.unpark();
    }

    /// Final park of an exiting task; returns once the parent reaped us.
    fn park_until_died(&self) {
        loop {
            self.parker.park();
            if self.status() == TaskStatus::Died {
                return;
            }
        }
    }
}

struct Parker {
    token: HostMutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            token: HostMutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn park(&self) {
        let mut woke = self.token.lock().unwrap();
        while !*woke {
            woke = self.cv.wait(woke).unwrap();
        }
        *woke = false;
    }

    fn unpark(&self) {
        *self.token.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

fn truncate_name(name: &str) -> ArrayString<TASK_NAME_LEN> {
    let mut out = ArrayString::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Task>>> = RefCell::new(None);
}

/// The task running on this thread.
pub fn current() -> Arc<Task> {
    CURRENT
        .with(|c| c.borrow().clone())
        .expect("no kernel task registered on this thread")
}

pub(crate) fn set_current(task: Arc<Task>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(task));
}

impl Kernel {
    pub fn sys_getpid(&self) -> Pid {
        current().pid
    }

    /// Create a child that shares the parent's open files and sees a copy of
    /// its address space.
    ///
    /// Kernel side this is a full fork: fresh TCB copied from the parent,
    /// `_fork`-suffixed name, duplicated vaddr bitmap and page directory,
    /// forged interrupt frame with `eax = 0`, shared open-file refcounts,
    /// and insertion into the task list. The child's return path out of the
    /// forged frame is modeled by `child_body`, which runs on the child
    /// task's thread and whose return value becomes its exit status.
    pub fn sys_fork<F>(self: &Arc<Self>, child_body: F) -> Result<Pid>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let parent = current();
        let pid = self.alloc_pid();

        let name = {
            let parent_name = parent.name.lock();
            let mut n = String::from(parent_name.as_str());
            n.push_str("_fork");
            n
        };

        // Duplicate the address space: fresh bitmap buffer, then every page
        // marked in it.
        let mem_copy = {
            let parent_mem = parent.mem.lock();
            parent_mem.as_ref().map(|m| m.duplicate())
        };

        let child = Task::new(pid, parent.pid, &name, mem_copy);
        child
            .cwd_inode_no
            .store(parent.cwd_inode_no.load(Ordering::SeqCst), Ordering::SeqCst);
        {
            let mut frame = *parent.frame.lock();
            frame.eax = 0;
            *child.frame.lock() = frame;
        }
        {
            let parent_fds = *parent.fd_table.lock();
            *child.fd_table.lock() = parent_fds;
            // Open files are shared: bump each refcount once for the child.
            self.dup_open_files(&parent_fds);
        }

        self.tasks.lock().push(Arc::clone(&child));

        let kernel = Arc::clone(self);
        let task = Arc::clone(&child);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                set_current(Arc::clone(&task));
                task.set_status(TaskStatus::Running);
                let status = child_body();
                if task.status() != TaskStatus::Died {
                    kernel.sys_exit(status);
                }
            })
            .expect("spawning child task failed");

        Ok(pid)
    }

    /// Reap one HANGING child, blocking while children exist but none has
    /// exited. Returns the child's pid and stores its exit status.
    pub fn sys_wait(&self, status_out: &mut i32) -> Result<Pid> {
        let me = current();
        loop {
            let guard = intr::off();
            let mut tasks = self.tasks.lock();
            if let Some(pos) = tasks
                .iter()
                .position(|t| t.parent() == me.pid && t.status() == TaskStatus::Hanging)
            {
                let child = tasks.remove(pos);
                *status_out = child.exit_status();
                let pid = child.pid;
                // Reap: the TCB leaves the list and the child's thread may end.
                child.set_status(TaskStatus::Died);
                child.parker.unpark();
                return Ok(pid);
            }
            if !tasks.iter().any(|t| t.parent() == me.pid) {
                return Err(KernelError::NoChild);
            }
            me.set_status(TaskStatus::Waiting);
            drop(tasks);
            drop(guard);
            me.block();
        }
    }

    /// Terminate the calling task: record the status, hand children to init,
    /// release pages and descriptors, wake a waiting parent, then hang until
    /// reaped. Returns only after the parent has reaped the task.
    pub fn sys_exit(&self, status: i32) {
        let me = current();
        me.exit_status.store(status, Ordering::SeqCst);
        assert!(me.pid != INIT_PID, "init does not exit");

        {
            let _guard = intr::off();
            let tasks = self.tasks.lock();
            for t in tasks.iter() {
                if t.parent() == me.pid {
                    t.set_parent(INIT_PID);
                }
            }
        }

        self.release_task_resources(&me);

        {
            let _guard = intr::off();
            let tasks = self.tasks.lock();
            me.set_status(TaskStatus::Hanging);
            if let Some(parent) = tasks.iter().find(|t| t.pid == me.parent()) {
                if parent.status() == TaskStatus::Waiting {
                    parent.unblock();
                }
            }
        }

        me.park_until_died();
    }

    fn release_task_resources(&self, task: &Arc<Task>) {
        // Pages first: every present PTE of every present PDE, then the
        // tables, then the vaddr bitmap buffer.
        {
            let mut mem = task.mem.lock();
            if let Some(m) = mem.take() {
                drop(m.release());
            }
        }
        // Close descriptors; pipes drop their ring once the count hits zero.
        let open: Vec<i32> = {
            let fds = task.fd_table.lock();
            (3..MAX_FILES_OPEN_PER_PROC as i32)
                .filter(|&fd| fds[fd as usize] != -1)
                .collect()
        };
        for fd in open {
            let _ = self.sys_close(fd);
        }
    }
}
