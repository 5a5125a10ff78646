use std::collections::VecDeque;
use std::sync::Arc;

use crate::intr;
use crate::proc::{self, Task, TaskStatus};

/// Binary semaphore with a FIFO queue of blocked tasks.
///
/// Invariant: `value` is 0 or 1, and 0 exactly while some task owns the
/// permit. `up` before any `down` parks a token, which is what makes the
/// disk driver's completion handshake work when the IRQ lands before the
/// requester blocks.
pub struct Semaphore {
    name: &'static str,
    inner: spin::Mutex<SemaInner>,
}

struct SemaInner {
    value: u8,
    waiters: VecDeque<Arc<Task>>,
}

impl Semaphore {
    pub fn new(name: &'static str, value: u8) -> Self {
        debug_assert!(value <= 1);
        Self {
            name,
            inner: spin::Mutex::new(SemaInner {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take the permit, blocking the current task while `value` is zero.
    pub fn down(&self) {
        loop {
            let guard = intr::off();
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                return;
            }
            let cur = proc::current();
            debug_assert!(
                !inner.waiters.iter().any(|t| t.pid == cur.pid),
                "task {} enqueued twice on {}",
                cur.pid,
                self.name
            );
            inner.waiters.push_back(Arc::clone(&cur));
            cur.set_status(TaskStatus::Blocked);
            drop(inner);
            drop(guard);
            // Resumes with interrupts re-enabled once unblocked.
            cur.block();
        }
    }

    /// Release the permit and unblock the head waiter, if any.
    pub fn up(&self) {
        let _guard = intr::off();
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.waiters.pop_front() {
            waiter.unblock();
        }
        inner.value = 1;
    }

    /// Current value, for assertions.
    pub fn value(&self) -> u8 {
        self.inner.lock().value
    }
}
