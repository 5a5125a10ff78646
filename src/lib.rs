//! minos: a teaching operating system core.
//!
//! The crate models the heart of a small 32-bit x86 kernel: an ATA PIO disk
//! driver with interrupt-synchronized completion, an inode-based on-disk file
//! system with direct + single-indirect addressing, the per-task file
//! descriptor plumbing (pipes, redirection, fork/exec/wait/exit), and the
//! synchronization primitives tying them together.
//!
//! Hardware sits behind [`hal::Machine`]; [`hal::MemMachine`] provides an
//! in-memory machine with a port-level IDE controller emulation so the whole
//! stack runs hosted. Kernel tasks are host threads carrying a task control
//! block; blocking is driven by the binary semaphore in [`sync`].

#![allow(dead_code)]

#[macro_use]
mod console;

pub mod elf;
pub mod err;
pub mod fs;
pub mod hal;
pub mod param;
pub mod pipe;
pub mod proc;
pub mod sync;
pub mod syscall;
pub mod vm;

mod exec;
mod ide;
mod intr;
mod kernel;

pub use console::Console;
pub use err::{KernelError, Result};
pub use fs::{FileType, OpenFlags, SeekWhence, Stat};
pub use hal::{IrqHandler, Machine, MemMachine};
pub use ide::{DiskId, DiskIdent, Partition};
pub use kernel::Kernel;
pub use proc::{IntrFrame, Pid, Task, TaskStatus};
pub use syscall::SyscallNr;
