//! Half-duplex pipe: one kernel page as a byte ring, two descriptors on a
//! single global slot.
//!
//! Reads and writes move `min(count, available)` bytes but never zero: an
//! empty ring blocks the reader, a full ring blocks the writer, each woken
//! through its own one-shot semaphore.

use std::sync::Arc;

use crate::err::{KernelError, Result};
use crate::fs::file::{FileKind, OpenFlags};
use crate::kernel::Kernel;
use crate::param::PAGE_SIZE;
use crate::sync::Semaphore;

/// Ring capacity: one kernel page.
pub const PIPE_BUF_SIZE: usize = PAGE_SIZE;

pub struct Pipe {
    ring: spin::Mutex<PipeRing>,
    read_wait: Semaphore,
    write_wait: Semaphore,
}

struct PipeRing {
    data: Box<[u8; PIPE_BUF_SIZE]>,
    /// Total bytes written.
    head: usize,
    /// Total bytes read.
    tail: usize,
    reader_waiting: bool,
    writer_waiting: bool,
}

impl PipeRing {
    fn len(&self) -> usize {
        self.head - self.tail
    }

    fn space(&self) -> usize {
        PIPE_BUF_SIZE - self.len()
    }
}

impl Pipe {
    pub fn new() -> Self {
        Self {
            ring: spin::Mutex::new(PipeRing {
                data: Box::new([0u8; PIPE_BUF_SIZE]),
                head: 0,
                tail: 0,
                reader_waiting: false,
                writer_waiting: false,
            }),
            read_wait: Semaphore::new("pipe_read", 0),
            write_wait: Semaphore::new("pipe_write", 0),
        }
    }

    /// Take up to `buf.len()` bytes, sleeping while the ring is empty.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            let mut ring = self.ring.lock();
            let avail = ring.len();
            if avail > 0 {
                let n = core::cmp::min(buf.len(), avail);
                for b in buf[..n].iter_mut() {
                    *b = ring.data[ring.tail % PIPE_BUF_SIZE];
                    ring.tail += 1;
                }
                let wake_writer = ring.writer_waiting;
                ring.writer_waiting = false;
                drop(ring);
                if wake_writer {
                    self.write_wait.up();
                }
                return n;
            }
            ring.reader_waiting = true;
            drop(ring);
            self.read_wait.down();
        }
    }

    /// Store up to `buf.len()` bytes, sleeping while the ring is full.
    pub fn write(&self, buf: &[u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            let mut ring = self.ring.lock();
            let space = ring.space();
            if space > 0 {
                let n = core::cmp::min(buf.len(), space);
                for &b in buf[..n].iter() {
                    let slot = ring.head % PIPE_BUF_SIZE;
                    ring.data[slot] = b;
                    ring.head += 1;
                }
                let wake_reader = ring.reader_waiting;
                ring.reader_waiting = false;
                drop(ring);
                if wake_reader {
                    self.read_wait.up();
                }
                return n;
            }
            ring.writer_waiting = true;
            drop(ring);
            self.write_wait.down();
        }
    }

    /// Buffered byte count, for tests.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Create a pipe: one global slot, one ring, two local descriptors
    /// sharing it with an open count of two.
    pub fn sys_pipe(&self) -> Result<[i32; 2]> {
        let (global_idx, mut slot) = self.get_free_slot_in_global()?;
        slot.kind = Some(FileKind::Pipe {
            ring: Arc::new(Pipe::new()),
            open_cnt: 2,
        });
        slot.pos = 0;
        slot.flags = OpenFlags::O_RDWR;
        drop(slot);

        let fd0 = match self.pcb_fd_install(global_idx) {
            Ok(fd) => fd,
            Err(e) => {
                self.file_table[global_idx].lock().kind = None;
                return Err(e);
            }
        };
        let fd1 = match self.pcb_fd_install(global_idx) {
            Ok(fd) => fd,
            Err(e) => {
                let cur = crate::proc::current();
                cur.fd_table.lock()[fd0 as usize] = -1;
                self.file_table[global_idx].lock().kind = None;
                return Err(e);
            }
        };
        Ok([fd0, fd1])
    }

    /// Whether local descriptor `fd` leads to a pipe slot.
    pub(crate) fn fd_is_pipe(&self, fd: i32) -> Result<bool> {
        let global = self.fd_local2global(fd)?;
        if global < 3 {
            return Ok(false);
        }
        let slot = self.file_table[global].lock();
        Ok(matches!(slot.kind, Some(FileKind::Pipe { .. })))
    }

    pub(crate) fn pipe_read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        let ring = self.pipe_ring(fd)?;
        Ok(ring.read(buf))
    }

    pub(crate) fn pipe_write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
        let ring = self.pipe_ring(fd)?;
        Ok(ring.write(buf))
    }

    /// Clone the ring out of the slot so ring waits never hold the slot
    /// lock (the other end needs it to find the ring).
    fn pipe_ring(&self, fd: i32) -> Result<Arc<Pipe>> {
        let global = self.fd_local2global(fd)?;
        let slot = self.file_table[global].lock();
        match &slot.kind {
            Some(FileKind::Pipe { ring, .. }) => Ok(Arc::clone(ring)),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Point `old_local` at whatever `new_local` holds: a raw std stream
    /// number, or the global slot behind `new_local`. Shell pipelines are
    /// spliced with this.
    pub fn sys_fd_redirect(&self, old_local: i32, new_local: i32) -> Result<()> {
        let cur = crate::proc::current();
        let mut fds = cur.fd_table.lock();
        let old = old_local as usize;
        if old >= fds.len() || new_local < 0 {
            return Err(KernelError::BadFileDescriptor);
        }
        if new_local < 3 {
            fds[old] = new_local;
        } else {
            let new_global = fds[new_local as usize];
            fds[old] = new_global;
        }
        Ok(())
    }
}
