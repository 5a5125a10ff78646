use core::fmt;

/// Error kinds surfaced by the kernel entry points.
///
/// Every syscall in the numbered table reports `-1` to user space; the enum
/// keeps the cause visible to kernel code and to tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No such file or directory, or an intermediate path component missing.
    NotFound,
    /// Exclusive create on an existing path.
    Exists,
    /// A non-directory showed up where a directory was required.
    NotADirectory,
    /// A directory showed up where a regular file was required.
    IsADirectory,
    /// Block or inode bitmap exhausted.
    NoSpace,
    /// The file appears in the global open-file table (unlink) or a second
    /// writer hit `write_deny`.
    Busy,
    /// Write would push the file past the direct + indirect limit.
    TooLarge,
    /// Bad flags, trailing slash, or other malformed argument.
    InvalidArgument,
    /// Local descriptor out of range or not open.
    BadFileDescriptor,
    /// Global open-file table or per-task descriptor table full.
    TooManyOpenFiles,
    /// Path component longer than the directory entry can hold.
    NameTooLong,
    /// `rmdir` on a directory still holding entries.
    NotEmpty,
    /// `wait` with no children at all.
    NoChild,
    /// The image fails ELF32 validation.
    NoExec,
    /// Read position already at end of file.
    Eof,
    /// Device-level failure.
    Io,
}

impl KernelError {
    /// The value every entry point hands back to user space on failure.
    pub fn as_ret(self) -> i32 {
        -1
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::NotFound => "not found",
            KernelError::Exists => "already exists",
            KernelError::NotADirectory => "not a directory",
            KernelError::IsADirectory => "is a directory",
            KernelError::NoSpace => "no space left on partition",
            KernelError::Busy => "resource busy",
            KernelError::TooLarge => "file too large",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::BadFileDescriptor => "bad file descriptor",
            KernelError::TooManyOpenFiles => "too many open files",
            KernelError::NameTooLong => "name too long",
            KernelError::NotEmpty => "directory not empty",
            KernelError::NoChild => "no child processes",
            KernelError::NoExec => "exec format error",
            KernelError::Eof => "end of file",
            KernelError::Io => "i/o error",
        };
        f.write_str(s)
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
