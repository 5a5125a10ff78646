//! Console sink and keyboard input queue.
//!
//! Out-of-scope collaborators of the core, reduced to the contracts the file
//! descriptor layer consumes: fd 1/2 append to the console, fd 0 drains the
//! keyboard queue one byte at a time, blocking while it is empty.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::hal::Machine;
use crate::sync::Semaphore;

/// Print to the kernel console.
macro_rules! kprint {
    ($console:expr, $($arg:tt)*) => {
        $console.write_fmt(core::format_args!($($arg)*))
    };
}

/// Print a line to the kernel console.
macro_rules! kprintln {
    ($console:expr) => { kprint!($console, "\n") };
    ($console:expr, $($arg:tt)*) => {
        $console.write_fmt(core::format_args!("{}\n", core::format_args!($($arg)*)))
    };
}

pub struct Console {
    hal: Arc<dyn Machine>,
    kbd: KbdQueue,
}

impl Console {
    pub fn new(hal: Arc<dyn Machine>) -> Self {
        Self {
            hal,
            kbd: KbdQueue::new(),
        }
    }

    pub fn put_str(&self, s: &str) {
        self.hal.console_write(s);
    }

    pub fn write_fmt(&self, args: core::fmt::Arguments<'_>) {
        self.put_str(&args.to_string());
    }

    /// Feed a byte into the keyboard queue, as the keyboard ISR would.
    pub fn push_key(&self, b: u8) {
        self.kbd.push(b);
    }

    /// Pop one byte, blocking while the queue is empty.
    pub fn getchar(&self) -> u8 {
        self.kbd.pop()
    }
}

struct KbdQueue {
    inner: spin::Mutex<KbdInner>,
    avail: Semaphore,
}

struct KbdInner {
    buf: VecDeque<u8>,
    reader_waiting: bool,
}

impl KbdQueue {
    fn new() -> Self {
        Self {
            inner: spin::Mutex::new(KbdInner {
                buf: VecDeque::new(),
                reader_waiting: false,
            }),
            avail: Semaphore::new("kbd", 0),
        }
    }

    fn push(&self, b: u8) {
        let mut inner = self.inner.lock();
        inner.buf.push_back(b);
        if inner.reader_waiting {
            inner.reader_waiting = false;
            drop(inner);
            self.avail.up();
        }
    }

    fn pop(&self) -> u8 {
        loop {
            let mut inner = self.inner.lock();
            if let Some(b) = inner.buf.pop_front() {
                return b;
            }
            inner.reader_waiting = true;
            drop(inner);
            self.avail.down();
        }
    }
}
