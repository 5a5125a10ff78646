//! Directory operations: mkdir/rmdir, traversal, the working directory.

mod common;

use minos::{FileType, KernelError, OpenFlags};

#[test]
fn mkdir_chdir_getcwd() {
    let (_machine, kernel) = common::boot();

    kernel.sys_mkdir("/d").unwrap();
    kernel.sys_mkdir("/d/e").unwrap();
    kernel.sys_chdir("/d/e").unwrap();
    assert_eq!(kernel.sys_getcwd().unwrap(), "/d/e");

    kernel.sys_chdir("/d").unwrap();
    assert_eq!(kernel.sys_getcwd().unwrap(), "/d");
    kernel.sys_chdir("/").unwrap();
    assert_eq!(kernel.sys_getcwd().unwrap(), "/");
}

#[test]
fn mkdir_twice_fails() {
    let (_machine, kernel) = common::boot();
    kernel.sys_mkdir("/dup").unwrap();
    assert_eq!(kernel.sys_mkdir("/dup"), Err(KernelError::Exists));
}

#[test]
fn mkdir_needs_existing_parent() {
    let (_machine, kernel) = common::boot();
    assert_eq!(kernel.sys_mkdir("/no/sub"), Err(KernelError::NotFound));
}

#[test]
fn rmdir_semantics() {
    let (_machine, kernel) = common::boot();

    kernel.sys_mkdir("/victim").unwrap();
    kernel.sys_mkdir("/victim/inner").unwrap();

    assert_eq!(kernel.sys_rmdir("/victim"), Err(KernelError::NotEmpty));
    kernel.sys_rmdir("/victim/inner").unwrap();
    kernel.sys_rmdir("/victim").unwrap();
    assert_eq!(kernel.sys_rmdir("/victim"), Err(KernelError::NotFound));

    // Regular files and the root are off limits.
    let fd = kernel
        .sys_open("/f", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_close(fd).unwrap();
    assert_eq!(kernel.sys_rmdir("/f"), Err(KernelError::NotADirectory));
    assert_eq!(kernel.sys_rmdir("/"), Err(KernelError::InvalidArgument));
}

#[test]
fn new_directory_starts_with_dot_entries() {
    let (_machine, kernel) = common::boot();

    kernel.sys_mkdir("/sub").unwrap();
    let st = kernel.sys_stat("/sub").unwrap();
    assert_eq!(st.file_type, FileType::Directory);
    assert_eq!(st.size, 2 * 21);

    let mut dir = kernel.sys_opendir("/sub").unwrap();
    let dot = kernel.sys_readdir(&mut dir).unwrap();
    assert_eq!(dot.name(), ".");
    assert_eq!(dot.inode_no(), st.ino);
    let dotdot = kernel.sys_readdir(&mut dir).unwrap();
    assert_eq!(dotdot.name(), "..");
    assert_eq!(dotdot.inode_no(), 0);
    assert!(kernel.sys_readdir(&mut dir).is_none());
    kernel.sys_closedir(dir).unwrap();
}

#[test]
fn readdir_sees_created_files() {
    let (_machine, kernel) = common::boot();

    kernel.sys_mkdir("/ls").unwrap();
    for name in ["/ls/one", "/ls/two", "/ls/three"] {
        let fd = kernel
            .sys_open(name, OpenFlags::O_CREAT | OpenFlags::O_RDWR)
            .unwrap();
        kernel.sys_close(fd).unwrap();
    }

    let mut dir = kernel.sys_opendir("/ls").unwrap();
    let mut names = Vec::new();
    while let Some(e) = kernel.sys_readdir(&mut dir) {
        names.push(e.name());
    }
    kernel.sys_closedir(dir).unwrap();
    assert_eq!(names, [".", "..", "one", "two", "three"]);
}

#[test]
fn files_work_inside_subdirectories() {
    let (_machine, kernel) = common::boot();

    kernel.sys_mkdir("/a").unwrap();
    kernel.sys_mkdir("/a/b").unwrap();
    let fd = kernel
        .sys_open("/a/b/c.txt", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_write(fd, b"nested").unwrap();
    kernel.sys_close(fd).unwrap();

    // Relative-to-cwd paths are not a thing; the absolute path resolves.
    let fd = kernel.sys_open("/a/b/c.txt", OpenFlags::O_RDONLY).unwrap();
    let mut out = [0u8; 6];
    kernel.sys_read(fd, &mut out).unwrap();
    assert_eq!(&out, b"nested");
    kernel.sys_close(fd).unwrap();

    kernel.sys_unlink("/a/b/c.txt").unwrap();
    kernel.sys_rmdir("/a/b").unwrap();
    kernel.sys_rmdir("/a").unwrap();
}

#[test]
fn opendir_rejects_regular_files() {
    let (_machine, kernel) = common::boot();

    let fd = kernel
        .sys_open("/plain", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_close(fd).unwrap();
    assert!(matches!(
        kernel.sys_opendir("/plain"),
        Err(KernelError::NotADirectory)
    ));
    assert!(matches!(
        kernel.sys_opendir("/missing"),
        Err(KernelError::NotFound)
    ));
}

#[test]
fn paths_collapse_duplicate_slashes() {
    let (_machine, kernel) = common::boot();

    kernel.sys_mkdir("/p").unwrap();
    let fd = kernel
        .sys_open("/p//q", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_close(fd).unwrap();
    assert!(kernel.sys_stat("/p/q").is_ok());
}

#[test]
fn chdir_rejects_regular_files() {
    let (_machine, kernel) = common::boot();

    let fd = kernel
        .sys_open("/reg", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    kernel.sys_close(fd).unwrap();
    assert_eq!(kernel.sys_chdir("/reg"), Err(KernelError::NotADirectory));
    assert_eq!(kernel.sys_chdir("/gone"), Err(KernelError::NotFound));
}

#[test]
fn directory_grows_past_one_block() {
    let (_machine, kernel) = common::boot();

    // 24 entries fit in one sector; `.` and `..` occupy two slots, so 30
    // files force a second data block.
    kernel.sys_mkdir("/many").unwrap();
    for i in 0..30 {
        let path = format!("/many/f{:02}", i);
        let fd = kernel
            .sys_open(&path, OpenFlags::O_CREAT | OpenFlags::O_RDWR)
            .unwrap();
        kernel.sys_close(fd).unwrap();
    }

    let st = kernel.sys_stat("/many").unwrap();
    assert_eq!(st.size, (30 + 2) * 21);

    let mut dir = kernel.sys_opendir("/many").unwrap();
    let mut count = 0;
    while kernel.sys_readdir(&mut dir).is_some() {
        count += 1;
    }
    kernel.sys_closedir(dir).unwrap();
    assert_eq!(count, 32);

    // Deleting every file shrinks the directory back to `.` and `..` and
    // lets rmdir through.
    for i in 0..30 {
        kernel.sys_unlink(&format!("/many/f{:02}", i)).unwrap();
    }
    assert_eq!(kernel.sys_stat("/many").unwrap().size, 2 * 21);
    kernel.sys_rmdir("/many").unwrap();
}
