//! ELF32 loading through `execv`.

mod common;

use minos::{KernelError, OpenFlags};

const ENTRY: u32 = 0x0804_8000;
const PHOFF: u32 = 52;
const PAYLOAD_OFF: u32 = 84;

fn u16le(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn u32le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// A minimal i386 executable: one LOAD segment carrying `payload`.
fn build_elf(payload: &[u8]) -> Vec<u8> {
    let mut img = Vec::new();
    // e_ident
    img.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1]);
    img.extend_from_slice(&[0u8; 9]);
    u16le(&mut img, 2); // ET_EXEC
    u16le(&mut img, 3); // EM_386
    u32le(&mut img, 1); // version
    u32le(&mut img, ENTRY);
    u32le(&mut img, PHOFF);
    u32le(&mut img, 0); // shoff
    u32le(&mut img, 0); // flags
    u16le(&mut img, 52); // ehsize
    u16le(&mut img, 32); // phentsize
    u16le(&mut img, 1); // phnum
    u16le(&mut img, 0); // shentsize
    u16le(&mut img, 0); // shnum
    u16le(&mut img, 0); // shstrndx
    assert_eq!(img.len(), 52);

    // Program header: PT_LOAD.
    u32le(&mut img, 1);
    u32le(&mut img, PAYLOAD_OFF);
    u32le(&mut img, ENTRY);
    u32le(&mut img, ENTRY);
    u32le(&mut img, payload.len() as u32);
    u32le(&mut img, payload.len() as u32);
    u32le(&mut img, 5); // R+X
    u32le(&mut img, 0x1000);
    assert_eq!(img.len(), PAYLOAD_OFF as usize);

    img.extend_from_slice(payload);
    img
}

fn install(kernel: &minos::Kernel, path: &str, image: &[u8]) {
    let fd = kernel
        .sys_open(path, OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    assert_eq!(kernel.sys_write(fd, image).unwrap(), image.len());
    kernel.sys_close(fd).unwrap();
}

#[test]
fn execv_loads_segments_and_rewrites_the_frame() {
    let (_machine, kernel) = common::boot();

    let payload: Vec<u8> = (0..600u32).map(|i| (i * 7) as u8).collect();
    install(&kernel, "/prog", &build_elf(&payload));

    kernel.sys_execv("/prog", &["prog", "arg1"]).unwrap();

    let me = minos::proc::current();
    assert_eq!(me.name.lock().as_str(), "/prog");

    let frame = *me.frame.lock();
    assert_eq!(frame.eip, ENTRY);
    assert_eq!(frame.esp, 0xC000_0000);
    assert_eq!(frame.ecx, 2); // argc
    assert_ne!(frame.ebx, 0); // argv

    // The segment landed at its virtual address.
    let mut out = vec![0u8; payload.len()];
    {
        let mem = me.mem.lock();
        mem.as_ref().unwrap().read_bytes(ENTRY, &mut out).unwrap();
    }
    assert_eq!(out, payload);

    // argv strings are reachable through the staged pointer table.
    let mem = me.mem.lock();
    let mem = mem.as_ref().unwrap();
    let mut table = [0u8; 8];
    mem.read_bytes(frame.ebx, &mut table).unwrap();
    let argv0 = u32::from_le_bytes([table[0], table[1], table[2], table[3]]);
    let mut s = [0u8; 4];
    mem.read_bytes(argv0, &mut s).unwrap();
    assert_eq!(&s, b"prog");
}

#[test]
fn execv_rejects_non_elf_images() {
    let (_machine, kernel) = common::boot();

    install(&kernel, "/junk", b"#!/bin/sh\necho hi\n");
    assert_eq!(
        kernel.sys_execv("/junk", &["junk"]),
        Err(KernelError::NoExec)
    );
    assert_eq!(
        kernel.sys_execv("/missing", &["missing"]),
        Err(KernelError::NotFound)
    );
}

#[test]
fn execv_rejects_wrong_machine() {
    let (_machine, kernel) = common::boot();

    let payload = [0u8; 16];
    let mut image = build_elf(&payload);
    image[18] = 0x3E; // e_machine = x86-64
    install(&kernel, "/wrong", &image);
    assert_eq!(
        kernel.sys_execv("/wrong", &["wrong"]),
        Err(KernelError::NoExec)
    );
}
