//! Packs the boot catalog image (triton.img) into OUT_DIR.
//!
//! The catalog layout matches sys::fs: one 4KB boot block (counts +
//! 64-byte dentries), one 4KB inode block per file, then data blocks.
//! The user programs are tiny hand-assembled x86_64 images: signature
//! bytes, entry point at bytes 24..28, code from offset 0x30.

use std::env;
use std::fs;
use std::path::PathBuf;

const BLOCK_SIZE: usize = 4096;
const DENTRY_SIZE: usize = 64;
const FILE_NAME_LEN: usize = 32;

const IMAGE_BASE: u32 = 0x0804_8000;
const CODE_OFFSET: u32 = 0x30;
const ENTRY: u32 = IMAGE_BASE + CODE_OFFSET;

/// Shell scratch buffer, past the loaded image
const LINE_BUF: u32 = 0x0804_9000;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let image = build_catalog(&[
        Entry::directory("."),
        Entry::device("rtc"),
        Entry::file("shell", &executable(&shell_code())),
        Entry::file("hello", &executable(&hello_code())),
        Entry::file("frame0.txt", FRAME0),
    ]);
    fs::write(out_dir.join("triton.img"), image).unwrap();
    println!("cargo:rerun-if-changed=build.rs");
}

const FRAME0: &[u8] = b"        o
       o    ~~~~~~~~~~~~~~~~
      o      Triton kernel
   o  ^^^   ~~~~~~~~~~~~~~~~
  <' ) )~
   \\ ( ( ~
    ^^^^^
";

// ---------------------------------------------------------------------------
// User program stubs
// ---------------------------------------------------------------------------

fn mov_eax(v: u32) -> Vec<u8> {
    [vec![0xB8], v.to_le_bytes().to_vec()].concat()
}
fn mov_ebx(v: u32) -> Vec<u8> {
    [vec![0xBB], v.to_le_bytes().to_vec()].concat()
}
fn mov_ecx(v: u32) -> Vec<u8> {
    [vec![0xB9], v.to_le_bytes().to_vec()].concat()
}
fn mov_edx(v: u32) -> Vec<u8> {
    [vec![0xBA], v.to_le_bytes().to_vec()].concat()
}
const INT80: [u8; 2] = [0xCD, 0x80];

/// write(1, prompt, 8); n = read(0, LINE_BUF, 128); LINE_BUF[n-1] = 0;
/// execute(LINE_BUF); loop
fn shell_code() -> Vec<u8> {
    let prompt = b"triton> ";
    // Prompt string sits right after the jmp (offset 63 of the code)
    let prompt_addr = ENTRY + 63;

    let mut code = Vec::new();
    code.extend(mov_eax(4)); // WRITE
    code.extend(mov_ebx(1));
    code.extend(mov_ecx(prompt_addr));
    code.extend(mov_edx(prompt.len() as u32));
    code.extend(INT80);
    code.extend(mov_eax(3)); // READ
    code.extend(mov_ebx(0));
    code.extend(mov_ecx(LINE_BUF));
    code.extend(mov_edx(128));
    code.extend(INT80);
    // mov byte [rcx + rax - 1], 0 : strip the newline
    code.extend([0xC6, 0x44, 0x01, 0xFF, 0x00]);
    code.extend(mov_eax(2)); // EXECUTE
    code.extend(mov_ebx(LINE_BUF));
    code.extend(INT80);
    // jmp back to the top (rel8 from the next instruction)
    let rel = -(code.len() as i32 + 2);
    code.extend([0xEB, rel as u8]);
    assert_eq!(code.len(), 63);
    code.extend(prompt);
    code
}

/// write(1, msg, len); halt(0)
fn hello_code() -> Vec<u8> {
    let msg = b"Hello from userspace!\n";
    let msg_addr = ENTRY + 34;

    let mut code = Vec::new();
    code.extend(mov_eax(4)); // WRITE
    code.extend(mov_ebx(1));
    code.extend(mov_ecx(msg_addr));
    code.extend(mov_edx(msg.len() as u32));
    code.extend(INT80);
    code.extend(mov_eax(1)); // HALT
    code.extend(mov_ebx(0));
    code.extend(INT80);
    assert_eq!(code.len(), 34);
    code.extend(msg);
    code
}

/// Wrap code in the executable container: signature, entry point at
/// bytes 24..28, code at CODE_OFFSET.
fn executable(code: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; CODE_OFFSET as usize];
    image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[24..28].copy_from_slice(&ENTRY.to_le_bytes());
    image.extend_from_slice(code);
    image
}

// ---------------------------------------------------------------------------
// Catalog packing
// ---------------------------------------------------------------------------

struct Entry {
    name: &'static str,
    file_type: u32,
    data: Vec<u8>,
}

impl Entry {
    fn device(name: &'static str) -> Self {
        Self { name, file_type: 0, data: Vec::new() }
    }
    fn directory(name: &'static str) -> Self {
        Self { name, file_type: 1, data: Vec::new() }
    }
    fn file(name: &'static str, data: &[u8]) -> Self {
        Self { name, file_type: 2, data: data.to_vec() }
    }
}

fn build_catalog(entries: &[Entry]) -> Vec<u8> {
    let files: Vec<&Entry> = entries.iter().filter(|e| e.file_type == 2).collect();
    let inode_count = files.len();
    let data_block_count: usize =
        files.iter().map(|f| (f.data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE).sum();

    let mut image = vec![0u8; (1 + inode_count + data_block_count) * BLOCK_SIZE];
    image[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    image[4..8].copy_from_slice(&(inode_count as u32).to_le_bytes());
    image[8..12].copy_from_slice(&(data_block_count as u32).to_le_bytes());

    let mut next_inode = 0u32;
    let mut next_dblock = 0u32;
    for (i, entry) in entries.iter().enumerate() {
        let base = DENTRY_SIZE + i * DENTRY_SIZE;
        let name = entry.name.as_bytes();
        assert!(name.len() <= FILE_NAME_LEN);
        image[base..base + name.len()].copy_from_slice(name);
        image[base + 32..base + 36].copy_from_slice(&entry.file_type.to_le_bytes());

        if entry.file_type == 2 {
            image[base + 36..base + 40].copy_from_slice(&next_inode.to_le_bytes());

            let inode_base = (1 + next_inode as usize) * BLOCK_SIZE;
            image[inode_base..inode_base + 4]
                .copy_from_slice(&(entry.data.len() as u32).to_le_bytes());

            for (chunk_no, chunk) in entry.data.chunks(BLOCK_SIZE).enumerate() {
                let slot = inode_base + 4 + chunk_no * 4;
                image[slot..slot + 4].copy_from_slice(&next_dblock.to_le_bytes());
                let dbase = (1 + inode_count + next_dblock as usize) * BLOCK_SIZE;
                image[dbase..dbase + chunk.len()].copy_from_slice(chunk);
                next_dblock += 1;
            }
            next_inode += 1;
        }
    }
    image
}
