//! Regular-file paths: create/open semantics, append writes across the
//! direct/indirect boundary, reads, seek, unlink.

mod common;

use minos::{FileType, KernelError, OpenFlags, SeekWhence};
use rand::{Rng, SeedableRng};

const NDIRECT_BYTES: u32 = 12 * 512;
const MAX_FILE_BYTES: usize = (12 + 128) * 512;

#[test]
fn create_write_read_roundtrip() {
    let (_machine, kernel) = common::boot();

    let fd = kernel
        .sys_open("/a.txt", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    assert_eq!(fd, 3);
    assert_eq!(kernel.sys_write(fd, b"hello").unwrap(), 5);
    kernel.sys_close(fd).unwrap();

    let fd = kernel.sys_open("/a.txt", OpenFlags::O_RDONLY).unwrap();
    assert_eq!(fd, 3);
    let mut out = [0u8; 5];
    assert_eq!(kernel.sys_read(fd, &mut out).unwrap(), 5);
    assert_eq!(&out, b"hello");
    // The position is at the end now.
    assert_eq!(kernel.sys_read(fd, &mut out), Err(KernelError::Eof));
    kernel.sys_close(fd).unwrap();

    let st = kernel.sys_stat("/a.txt").unwrap();
    assert_eq!(st.size, 5);
    assert_eq!(st.file_type, FileType::Regular);
}

#[test]
fn exclusive_create_and_reopen() {
    let (_machine, kernel) = common::boot();

    let fd = kernel
        .sys_open("/x", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_close(fd).unwrap();

    // O_CREAT on an existing path fails; a plain open succeeds.
    assert_eq!(
        kernel.sys_open("/x", OpenFlags::O_CREAT | OpenFlags::O_RDWR),
        Err(KernelError::Exists)
    );
    let fd = kernel.sys_open("/x", OpenFlags::O_RDWR).unwrap();
    kernel.sys_close(fd).unwrap();
}

#[test]
fn open_rejects_bad_paths() {
    let (_machine, kernel) = common::boot();

    assert_eq!(
        kernel.sys_open("/dir/", OpenFlags::O_CREAT),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(
        kernel.sys_open("/no/such/file", OpenFlags::O_RDONLY),
        Err(KernelError::NotFound)
    );
    assert_eq!(
        kernel.sys_open("/absent", OpenFlags::O_RDONLY),
        Err(KernelError::NotFound)
    );
}

#[test]
fn second_writer_is_denied() {
    let (_machine, kernel) = common::boot();

    let fd = kernel
        .sys_open("/w", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_close(fd).unwrap();

    let fd = kernel.sys_open("/w", OpenFlags::O_RDWR).unwrap();
    // A second writer bounces off write_deny; a reader does not.
    assert_eq!(
        kernel.sys_open("/w", OpenFlags::O_WRONLY),
        Err(KernelError::Busy)
    );
    let rd = kernel.sys_open("/w", OpenFlags::O_RDONLY).unwrap();
    kernel.sys_close(rd).unwrap();
    kernel.sys_close(fd).unwrap();

    // Closing the writer clears the flag.
    let fd = kernel.sys_open("/w", OpenFlags::O_WRONLY).unwrap();
    kernel.sys_close(fd).unwrap();
}

#[test]
fn small_file_stays_in_direct_blocks() {
    let (_machine, kernel) = common::boot();
    let part = kernel.current_partition().unwrap();

    let fd = kernel
        .sys_open("/small", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let data = vec![7u8; NDIRECT_BYTES as usize - 100];
    kernel.sys_write(fd, &data).unwrap();
    kernel.sys_close(fd).unwrap();

    let ino = kernel.sys_stat("/small").unwrap().ino;
    let sectors = kernel.inode_sectors(&part, ino);
    assert_ne!(sectors[0], 0);
    assert_eq!(sectors[12], 0);
}

#[test]
fn large_write_uses_the_indirect_table() {
    let (_machine, kernel) = common::boot();
    let part = kernel.current_partition().unwrap();

    let fd = kernel
        .sys_open("/big", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x1959);
    let data: Vec<u8> = (0..60_000).map(|_| rng.gen()).collect();
    assert_eq!(kernel.sys_write(fd, &data).unwrap(), 60_000);

    // 60000 > 12 * 512, so the indirect table must be in play.
    let ino = kernel.sys_stat("/big").unwrap().ino;
    let sectors = kernel.inode_sectors(&part, ino);
    assert_ne!(sectors[12], 0);

    assert_eq!(kernel.sys_lseek(fd, 0, SeekWhence::End).unwrap(), 60_000);
    assert_eq!(kernel.sys_lseek(fd, 0, SeekWhence::Set).unwrap(), 0);
    let mut out = vec![0u8; 60_000];
    assert_eq!(kernel.sys_read(fd, &mut out).unwrap(), 60_000);
    assert_eq!(out, data);
    kernel.sys_close(fd).unwrap();
}

#[test]
fn lseek_end_means_file_size() {
    let (_machine, kernel) = common::boot();

    let fd = kernel
        .sys_open("/seek", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_write(fd, b"0123456789").unwrap();

    assert_eq!(kernel.sys_lseek(fd, 0, SeekWhence::End).unwrap(), 10);
    assert_eq!(kernel.sys_lseek(fd, 2, SeekWhence::Set).unwrap(), 2);
    assert_eq!(kernel.sys_lseek(fd, 3, SeekWhence::Cur).unwrap(), 5);
    let mut out = [0u8; 5];
    kernel.sys_read(fd, &mut out).unwrap();
    assert_eq!(&out, b"56789");

    assert_eq!(
        kernel.sys_lseek(fd, -1, SeekWhence::Set),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(
        kernel.sys_lseek(fd, 11, SeekWhence::Set),
        Err(KernelError::InvalidArgument)
    );
    kernel.sys_close(fd).unwrap();
}

#[test]
fn writes_append_regardless_of_seek() {
    let (_machine, kernel) = common::boot();

    let fd = kernel
        .sys_open("/app", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_write(fd, b"aaaa").unwrap();
    kernel.sys_lseek(fd, 0, SeekWhence::Set).unwrap();
    kernel.sys_write(fd, b"bbbb").unwrap();
    kernel.sys_close(fd).unwrap();

    let st = kernel.sys_stat("/app").unwrap();
    assert_eq!(st.size, 8);
    let fd = kernel.sys_open("/app", OpenFlags::O_RDONLY).unwrap();
    let mut out = [0u8; 8];
    kernel.sys_read(fd, &mut out).unwrap();
    assert_eq!(&out, b"aaaabbbb");
    kernel.sys_close(fd).unwrap();
}

#[test]
fn max_file_size_round_trips_and_overflow_fails() {
    let (_machine, kernel) = common::boot();

    let fd = kernel
        .sys_open("/full", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let data: Vec<u8> = (0..MAX_FILE_BYTES).map(|_| rng.gen()).collect();
    assert_eq!(kernel.sys_write(fd, &data).unwrap(), MAX_FILE_BYTES);

    // One more byte would overflow 140 blocks.
    assert_eq!(kernel.sys_write(fd, b"x"), Err(KernelError::TooLarge));

    kernel.sys_lseek(fd, 0, SeekWhence::Set).unwrap();
    let mut out = vec![0u8; MAX_FILE_BYTES];
    assert_eq!(kernel.sys_read(fd, &mut out).unwrap(), MAX_FILE_BYTES);
    assert_eq!(out, data);
    kernel.sys_close(fd).unwrap();
}

#[test]
fn unlink_returns_every_bit() {
    let (machine, kernel) = common::boot();
    let part = kernel.current_partition().unwrap();
    let sb = kernel.superblock(&part).unwrap();

    let fd = kernel
        .sys_open("/doomed", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let data = vec![9u8; 20_000]; // direct + indirect blocks
    kernel.sys_write(fd, &data).unwrap();

    let ino = kernel.sys_stat("/doomed").unwrap().ino;
    let sectors = kernel.inode_sectors(&part, ino);

    // Unlinking an open file is refused.
    assert_eq!(kernel.sys_unlink("/doomed"), Err(KernelError::Busy));
    kernel.sys_close(fd).unwrap();
    kernel.sys_unlink("/doomed").unwrap();

    assert_eq!(kernel.sys_open("/doomed", OpenFlags::O_RDONLY), Err(KernelError::NotFound));
    assert_eq!(kernel.sys_stat("/doomed"), Err(KernelError::NotFound));

    // Inode bit and every data bit are back, in memory and on disk.
    assert!(!kernel.inode_bit(&part, ino as usize));
    for &lba in sectors.iter().filter(|&&l| l != 0) {
        let bit = (lba - sb.data_start_lba) as usize;
        assert!(!kernel.block_bit(&part, bit), "block bit {} still set", bit);
    }
    let ibm = machine.read_raw(0, 1, sb.inode_bitmap_lba as usize * 512, 1);
    assert_eq!(ibm[0] & (1 << (ino % 8)), 0);

    // Unlinking again fails cleanly.
    assert_eq!(kernel.sys_unlink("/doomed"), Err(KernelError::NotFound));
}

#[test]
fn read_write_through_redirected_fd() {
    let (machine, kernel) = common::boot();

    // stdout redirected onto a file-backed descriptor still reaches the
    // console when pointed back at stream 1.
    kernel.sys_fd_redirect(1, 1).unwrap();
    assert_eq!(kernel.sys_write(1, b"to console").unwrap(), 10);
    let out = machine.take_console();
    assert!(out.ends_with("to console"));

    // stdin reads drain the keyboard queue.
    for b in b"ok" {
        kernel.console().push_key(*b);
    }
    let mut buf = [0u8; 2];
    assert_eq!(kernel.sys_read(0, &mut buf).unwrap(), 2);
    assert_eq!(&buf, b"ok");
}
