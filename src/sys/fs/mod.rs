//! fs — read-only file catalog
//!
//! The boot image is a flat catalog, read in place, never written:
//!
//! LAYOUT (4096-byte blocks):
//!   Block 0   : boot block
//!   Block 1+i : inode i (one block each)
//!   After the inodes: data blocks
//!
//! BOOT BLOCK:
//!   [0..4]    dentry_count
//!   [4..8]    inode_count
//!   [8..12]   data_block_count
//!   [12..64]  reserved
//!   [64..]    63 directory entries, 64 bytes each:
//!               [0..32]  name (NUL-padded, 32-byte names allowed unterminated)
//!               [32..36] file type (0 = rtc device, 1 = directory, 2 = file)
//!               [36..40] inode index
//!               [40..64] reserved
//!
//! INODE BLOCK:
//!   [0..4]  length in bytes
//!   [4..]   u32 data block indices
//!
//! Executables are ordinary files whose first bytes carry the 0x7F 'E'
//! 'L' 'F' signature and whose entry point sits at image bytes 24..28.

use lazy_static::lazy_static;
use spin::RwLock;

pub const BLOCK_SIZE: usize = 4096;
pub const FILE_NAME_LEN: usize = 32;
pub const DENTRY_SIZE: usize = 64;
pub const MAX_DENTRIES: usize = 63;

/// Leading signature of an executable image
pub const EXEC_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
/// Byte range of the entry point inside an executable image
const ENTRY_OFFSET: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    RtcDevice,
    Directory,
    Regular,
}

impl FileType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FileType::RtcDevice),
            1 => Some(FileType::Directory),
            2 => Some(FileType::Regular),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Dentry {
    pub name: [u8; FILE_NAME_LEN],
    pub file_type: FileType,
    pub inode: usize,
}

impl Dentry {
    /// Name as a str, trimmed at the first NUL
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(FILE_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Catalog reader
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct Catalog<'a> {
    image: &'a [u8],
    dentry_count: usize,
    inode_count: usize,
    data_block_count: usize,
}

impl<'a> Catalog<'a> {
    pub fn parse(image: &'a [u8]) -> Option<Self> {
        if image.len() < BLOCK_SIZE {
            return None;
        }
        let dentry_count = read_u32(image, 0)? as usize;
        let inode_count = read_u32(image, 4)? as usize;
        let data_block_count = read_u32(image, 8)? as usize;
        if dentry_count > MAX_DENTRIES {
            return None;
        }
        let total_blocks = 1 + inode_count + data_block_count;
        if image.len() < total_blocks * BLOCK_SIZE {
            return None;
        }
        Some(Self { image, dentry_count, inode_count, data_block_count })
    }

    pub fn dentry_count(&self) -> usize {
        self.dentry_count
    }

    pub fn dentry_by_index(&self, index: usize) -> Option<Dentry> {
        if index >= self.dentry_count {
            return None;
        }
        let base = DENTRY_SIZE + index * DENTRY_SIZE;
        let mut name = [0u8; FILE_NAME_LEN];
        name.copy_from_slice(&self.image[base..base + FILE_NAME_LEN]);
        let file_type = FileType::from_raw(read_u32(self.image, base + 32)?)?;
        let inode = read_u32(self.image, base + 36)? as usize;
        if file_type == FileType::Regular && inode >= self.inode_count {
            return None;
        }
        Some(Dentry { name, file_type, inode })
    }

    /// Lookup by name; comparison covers at most 32 bytes, matching the
    /// unterminated-name quirk of the on-disk format.
    pub fn dentry_by_name(&self, name: &str) -> Option<Dentry> {
        if name.is_empty() || name.len() > FILE_NAME_LEN {
            return None;
        }
        (0..self.dentry_count)
            .filter_map(|i| self.dentry_by_index(i))
            .find(|d| {
                let stored = d.name_str();
                stored == name
            })
    }

    pub fn file_length(&self, inode: usize) -> usize {
        if inode >= self.inode_count {
            return 0;
        }
        read_u32(self.image, (1 + inode) * BLOCK_SIZE).unwrap_or(0) as usize
    }

    /// Copy up to `buf.len()` bytes of `inode`'s data starting at
    /// `offset`. Returns bytes copied (0 at or past end of file), or
    /// none for a malformed inode.
    pub fn read_data(&self, inode: usize, offset: usize, buf: &mut [u8]) -> Option<usize> {
        if inode >= self.inode_count {
            return None;
        }
        let length = self.file_length(inode);
        if offset >= length {
            return Some(0);
        }
        let to_read = buf.len().min(length - offset);
        let inode_base = (1 + inode) * BLOCK_SIZE;

        let mut copied = 0;
        while copied < to_read {
            let file_pos = offset + copied;
            let block_index = file_pos / BLOCK_SIZE;
            let block_offset = file_pos % BLOCK_SIZE;

            let dblock = read_u32(self.image, inode_base + 4 + block_index * 4)? as usize;
            if dblock >= self.data_block_count {
                return None;
            }
            let dblock_base = (1 + self.inode_count + dblock) * BLOCK_SIZE + block_offset;

            let chunk = (BLOCK_SIZE - block_offset).min(to_read - copied);
            buf[copied..copied + chunk]
                .copy_from_slice(&self.image[dblock_base..dblock_base + chunk]);
            copied += chunk;
        }
        Some(copied)
    }

    /// True iff `name` exists with the expected type
    pub fn check_file_type(&self, name: &str, expected: FileType) -> bool {
        matches!(self.dentry_by_name(name), Some(d) if d.file_type == expected)
    }

    /// Executable signature probe on the image's leading bytes
    pub fn check_image(&self, inode: usize) -> bool {
        let mut head = [0u8; 4];
        matches!(self.read_data(inode, 0, &mut head), Some(4) if head == EXEC_MAGIC)
    }

    /// Declared entry point from image bytes 24..28
    pub fn entry_point(&self, inode: usize) -> Option<u64> {
        let mut buf = [0u8; 4];
        match self.read_data(inode, ENTRY_OFFSET, &mut buf) {
            Some(4) => Some(u32::from_le_bytes(buf) as u64),
            _ => None,
        }
    }
}

fn read_u32(image: &[u8], offset: usize) -> Option<u32> {
    let bytes = image.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

// ---------------------------------------------------------------------------
// Kernel-wide catalog instance
// ---------------------------------------------------------------------------

lazy_static! {
    static ref CATALOG: RwLock<Option<Catalog<'static>>> = RwLock::new(None);
}

pub fn init(image: &'static [u8]) {
    match Catalog::parse(image) {
        Some(catalog) => {
            crate::klog!("fs: catalog mounted ({} entries)", catalog.dentry_count());
            *CATALOG.write() = Some(catalog);
        }
        None => crate::kerror!("fs: boot image is not a valid catalog"),
    }
}

pub fn with_catalog<T>(f: impl FnOnce(&Catalog<'static>) -> T) -> Option<T> {
    CATALOG.read().as_ref().map(f)
}

// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testimg {
    //! In-test catalog images, packed in the same layout build.rs uses.

    pub struct ImageBuilder {
        entries: Vec<(String, u32, Vec<u8>)>,
    }

    impl ImageBuilder {
        pub fn new() -> Self {
            Self { entries: Vec::new() }
        }

        pub fn device(mut self, name: &str) -> Self {
            self.entries.push((name.into(), 0, Vec::new()));
            self
        }

        pub fn directory(mut self, name: &str) -> Self {
            self.entries.push((name.into(), 1, Vec::new()));
            self
        }

        pub fn file(mut self, name: &str, data: &[u8]) -> Self {
            self.entries.push((name.into(), 2, data.to_vec()));
            self
        }

        pub fn build(self) -> Vec<u8> {
            use super::{BLOCK_SIZE, DENTRY_SIZE, FILE_NAME_LEN};

            let files: Vec<&(String, u32, Vec<u8>)> =
                self.entries.iter().filter(|e| e.1 == 2).collect();
            let inode_count = files.len();
            let data_block_count: usize = files
                .iter()
                .map(|f| (f.2.len() + BLOCK_SIZE - 1) / BLOCK_SIZE)
                .sum();

            let total = 1 + inode_count + data_block_count;
            let mut image = vec![0u8; total * BLOCK_SIZE];

            image[0..4].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
            image[4..8].copy_from_slice(&(inode_count as u32).to_le_bytes());
            image[8..12].copy_from_slice(&(data_block_count as u32).to_le_bytes());

            let mut next_inode = 0u32;
            let mut next_dblock = 0u32;
            for (i, (name, ftype, data)) in self.entries.iter().enumerate() {
                let base = DENTRY_SIZE + i * DENTRY_SIZE;
                let name_bytes = name.as_bytes();
                image[base..base + name_bytes.len().min(FILE_NAME_LEN)]
                    .copy_from_slice(&name_bytes[..name_bytes.len().min(FILE_NAME_LEN)]);
                image[base + 32..base + 36].copy_from_slice(&ftype.to_le_bytes());

                if *ftype == 2 {
                    image[base + 36..base + 40]
                        .copy_from_slice(&next_inode.to_le_bytes());

                    let inode_base = (1 + next_inode as usize) * BLOCK_SIZE;
                    image[inode_base..inode_base + 4]
                        .copy_from_slice(&(data.len() as u32).to_le_bytes());

                    for (chunk_no, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
                        let entry = inode_base + 4 + chunk_no * 4;
                        image[entry..entry + 4].copy_from_slice(&next_dblock.to_le_bytes());
                        let dbase = (1 + inode_count + next_dblock as usize) * BLOCK_SIZE;
                        image[dbase..dbase + chunk.len()].copy_from_slice(chunk);
                        next_dblock += 1;
                    }
                    next_inode += 1;
                }
            }
            image
        }
    }

    /// A minimal executable image: signature, entry point at bytes
    /// 24..28, padding up to `len`.
    pub fn stub_executable(entry: u32, len: usize) -> Vec<u8> {
        let mut img = vec![0u8; len.max(28)];
        img[0..4].copy_from_slice(&super::EXEC_MAGIC);
        img[24..28].copy_from_slice(&entry.to_le_bytes());
        img
    }
}

#[cfg(test)]
mod tests {
    use super::testimg::{stub_executable, ImageBuilder};
    use super::*;

    fn sample() -> Vec<u8> {
        ImageBuilder::new()
            .directory(".")
            .device("rtc")
            .file("frame0.txt", b"hello from the catalog")
            .file("shell", &stub_executable(0x0804_8030, 6000))
            .build()
    }

    #[test]
    fn parses_and_lists_entries() {
        let image = sample();
        let cat = Catalog::parse(&image).unwrap();
        assert_eq!(cat.dentry_count(), 4);
        assert_eq!(cat.dentry_by_index(0).unwrap().name_str(), ".");
        assert_eq!(cat.dentry_by_index(3).unwrap().name_str(), "shell");
        assert!(cat.dentry_by_index(4).is_none());
    }

    #[test]
    fn lookup_by_name_and_type() {
        let image = sample();
        let cat = Catalog::parse(&image).unwrap();
        assert!(cat.check_file_type("shell", FileType::Regular));
        assert!(cat.check_file_type("rtc", FileType::RtcDevice));
        assert!(!cat.check_file_type("rtc", FileType::Regular));
        assert!(!cat.check_file_type("missing", FileType::Regular));
        assert!(cat.dentry_by_name("").is_none());
    }

    #[test]
    fn reads_file_data_across_block_boundaries() {
        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let image = ImageBuilder::new().file("big", &big).build();
        let cat = Catalog::parse(&image).unwrap();
        let inode = cat.dentry_by_name("big").unwrap().inode;
        assert_eq!(cat.file_length(inode), big.len());

        let mut buf = vec![0u8; big.len()];
        assert_eq!(cat.read_data(inode, 0, &mut buf), Some(big.len()));
        assert_eq!(buf, big);

        // Offsetted read straddling the first block boundary
        let mut window = [0u8; 100];
        assert_eq!(cat.read_data(inode, 4050, &mut window), Some(100));
        assert_eq!(&window[..], &big[4050..4150]);

        // Past-end read is empty, not an error
        assert_eq!(cat.read_data(inode, big.len(), &mut window), Some(0));
    }

    #[test]
    fn executable_probe_accepts_only_signed_images() {
        let image = ImageBuilder::new()
            .file("prog", &stub_executable(0x0804_8123, 100))
            .file("plain", b"just text, no signature")
            .build();
        let cat = Catalog::parse(&image).unwrap();
        let prog = cat.dentry_by_name("prog").unwrap().inode;
        let plain = cat.dentry_by_name("plain").unwrap().inode;
        assert!(cat.check_image(prog));
        assert_eq!(cat.entry_point(prog), Some(0x0804_8123));
        assert!(!cat.check_image(plain));
    }

    #[test]
    fn rejects_truncated_images() {
        let image = sample();
        assert!(Catalog::parse(&image[..BLOCK_SIZE - 1]).is_none());
        assert!(Catalog::parse(&image[..2 * BLOCK_SIZE]).is_none());
    }
}
