/// Sector size in bytes. One block is one sector throughout.
pub const SECTOR_SIZE: usize = 512;

/// Block size equals sector size in this file system.
pub const BLOCK_SIZE: usize = SECTOR_SIZE;

/// Bits held by one bitmap sector.
pub const BITS_PER_SECTOR: usize = SECTOR_SIZE * 8;

/// Direct block slots per inode.
pub const NDIRECT: usize = 12;

/// Block addresses held by the single indirect table sector.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Largest number of blocks a single file can address.
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT;

/// Largest file size in bytes (12 direct + 128 indirect sectors).
pub const MAX_FILE_BYTES: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

/// Inodes per partition, fixed by the on-disk format.
pub const MAX_FILES_PER_PART: usize = 4096;

/// Open files per system (global open-file table capacity).
pub const MAX_FILE_OPEN: usize = 32;

/// Open files per process, stdin/stdout/stderr included.
pub const MAX_FILES_OPEN_PER_PROC: usize = 8;

/// Maximum file name length, excluding the terminating NUL.
pub const MAX_FILE_NAME_LEN: usize = 15;

/// Maximum path length accepted by the facade.
pub const MAX_PATH_LEN: usize = 512;

/// Maximum task name length.
pub const TASK_NAME_LEN: usize = 16;

/// Primary partitions per disk.
pub const MAX_PRIMARY_PARTS: usize = 4;

/// Logical partitions per disk.
pub const MAX_LOGIC_PARTS: usize = 8;

/// Page size of the modeled address space.
pub const PAGE_SIZE: usize = 4096;

/// Bottom of the user image, matching the ELF link base.
pub const USER_VADDR_START: u32 = 0x0804_8000;

/// Top of user space; the user stack pointer starts here.
pub const USER_STACK_TOP: u32 = 0xC000_0000;

/// Reserved local descriptors.
pub const STDIN_FD: i32 = 0;
pub const STDOUT_FD: i32 = 1;
pub const STDERR_FD: i32 = 2;
