//! Synchronization primitives.
//!
//! Three layers, each built on the one below:
//! a binary [`Semaphore`] with a FIFO queue of blocked tasks, a reentrant
//! [`Mutex`] (owner + depth over the semaphore), and a data-carrying
//! [`SleepLock`] for state that is held across disk I/O.

mod mutex;
mod semaphore;
mod sleeplock;

pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use sleeplock::{SleepLock, SleepLockGuard};
