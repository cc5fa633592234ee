//! On-disk layout
//!
//! Block 0 is unused, block 1 holds the superblock, blocks `2..2 + nbitblocks`
//! hold the free-block bitmap and everything after is data. All integers are
//! little-endian.

use core_types::memory::PGSIZE;
use serde::{Deserialize, Serialize};

/// Bytes per block; one block fills one page
pub const BLKSIZE: u32 = PGSIZE;
/// Bits in one bitmap block
pub const BLKBITSIZE: u32 = BLKSIZE * 8;

/// Longest path component, including the terminating NUL
pub const MAXNAMELEN: usize = 128;
/// Longest complete path, including the terminating NUL
pub const MAXPATHLEN: usize = 1024;

/// Direct block pointers in a file record
pub const NDIRECT: u32 = 10;
/// Block pointers in the indirect block
pub const NINDIRECT: u32 = BLKSIZE / 4;
pub const MAXFILESIZE: u32 = NINDIRECT * BLKSIZE;

/// Size of a file record
pub const FILE_RECORD_SIZE: u32 = 256;
/// File records per directory block
pub const BLKFILES: u32 = BLKSIZE / FILE_RECORD_SIZE;

pub const FS_MAGIC: u32 = 0x4A05_30AE;
pub const SUPER_BLOCK: u32 = 1;
pub const BITMAP_START: u32 = 2;

/// Block `n`, when cached, is mapped in the server at `DISKMAP + n * BLKSIZE`
pub const DISKMAP: u32 = 0x1000_0000;
/// Largest disk the server can map
pub const DISKSIZE: u32 = 0xC000_0000;

// file record field offsets
pub(crate) const OFF_SIZE: u32 = 128;
pub(crate) const OFF_TYPE: u32 = 132;
pub(crate) const OFF_DIRECT: u32 = 136;
pub(crate) const OFF_INDIRECT: u32 = OFF_DIRECT + 4 * NDIRECT;

// superblock field offsets
pub(crate) const OFF_MAGIC: u32 = 0;
pub(crate) const OFF_NBLOCKS: u32 = 4;
pub(crate) const OFF_ROOT: u32 = 8;

/// Number of bitmap blocks for a disk of `nblocks` blocks
pub fn bitmap_blocks(nblocks: u32) -> u32 {
    nblocks.div_ceil(BLKBITSIZE)
}

/// Number of blocks needed to hold `size` bytes
pub fn blocks_for(size: u32) -> u32 {
    size.div_ceil(BLKSIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileType {
    #[default]
    Regular,
    Directory,
}

impl FileType {
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Regular => 0,
            Self::Directory => 1,
        }
    }

    /// Anything but the directory tag reads as a regular file
    pub fn from_raw(raw: u32) -> Self {
        if raw == 1 {
            Self::Directory
        } else {
            Self::Regular
        }
    }
}

/// A decoded file record
///
/// The in-memory parent reference is not part of the record; the file layer
/// tracks it next to the record's address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub size: u32,
    pub ftype: FileType,
    pub direct: [u32; NDIRECT as usize],
    pub indirect: u32,
}

impl FileRecord {
    pub fn new(name: &str, ftype: FileType) -> Self {
        Self {
            name: name.to_string(),
            ftype,
            ..Self::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.ftype == FileType::Directory
    }

    pub fn encode(&self) -> [u8; FILE_RECORD_SIZE as usize] {
        let mut out = [0u8; FILE_RECORD_SIZE as usize];
        let name = self.name.as_bytes();
        let len = name.len().min(MAXNAMELEN - 1);
        out[..len].copy_from_slice(&name[..len]);
        put_u32(&mut out, OFF_SIZE, self.size);
        put_u32(&mut out, OFF_TYPE, self.ftype.to_raw());
        for (i, bno) in self.direct.iter().enumerate() {
            put_u32(&mut out, OFF_DIRECT + 4 * i as u32, *bno);
        }
        put_u32(&mut out, OFF_INDIRECT, self.indirect);
        out
    }

    /// Decodes a record; `bytes` must hold at least one full record
    pub fn decode(bytes: &[u8]) -> Self {
        let mut direct = [0u32; NDIRECT as usize];
        for (i, bno) in direct.iter_mut().enumerate() {
            *bno = get_u32(bytes, OFF_DIRECT + 4 * i as u32);
        }
        Self {
            name: name_from_bytes(&bytes[..MAXNAMELEN]),
            size: get_u32(bytes, OFF_SIZE),
            ftype: FileType::from_raw(get_u32(bytes, OFF_TYPE)),
            direct,
            indirect: get_u32(bytes, OFF_INDIRECT),
        }
    }
}

/// Reads a NUL-terminated name
pub fn name_from_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub(crate) fn get_u32(bytes: &[u8], off: u32) -> u32 {
    let off = off as usize;
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn put_u32(bytes: &mut [u8], off: u32, value: u32) {
    let off = off as usize;
    bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
}
