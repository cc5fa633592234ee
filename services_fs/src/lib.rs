//! # File Server
//!
//! A user-level file system. The server is an ordinary environment: it caches
//! disk blocks in its own address space, keeps all file system state to
//! itself and answers requests from other environments over IPC.
//!
//! ## Philosophy
//!
//! - **The page table is the buffer cache**: block `n` is cached iff the page
//!   at `DISKMAP + n * BLKSIZE` is mapped, and the page's Dirty bit is the
//!   only record that it needs writing back.
//! - **One thread of control**: requests are served one at a time, so no
//!   file system structure is ever shared.
//! - **Records stay on disk**: a file is named by the address of its record
//!   inside the cached block that holds it, never copied out and back.
//!
//! ## Layout
//!
//! - [`layout`]: on-disk constants and the file record codec
//! - [`bcache`]: block mapping, load, write-back and mount checks
//! - [`bitmap`]: free-block bitmap
//! - [`file`]: block walk, file size, flush, create, open, remove
//! - [`dir`]: directory scan and path resolution
//! - [`protocol`]: request codes, request bodies and the descriptor page
//! - [`serve`]: the request loop, run as a [`sim_kernel::Program`]
//! - [`format`]: disk image builder

pub mod bcache;
pub mod bitmap;
pub mod dir;
pub mod file;
pub mod format;
pub mod layout;
pub mod protocol;
pub mod serve;

#[cfg(test)]
mod test_utils;

pub use dir::Lookup;
pub use file::FileRef;
pub use format::{FormatConfig, FormatError, ImageBuilder, RecordAt};
pub use layout::{FileRecord, FileType};
pub use protocol::{Fd, FsRequest};
pub use serve::{FileServer, ServeConfig};

use hal::BlockDevice;

/// File system state private to the server environment
///
/// Methods take the server's [`kernel_api::KernelApi`] handle: every block
/// access goes through the server's own page tables.
pub struct FileSystem {
    device: Box<dyn BlockDevice>,
    /// Block count from the superblock, once it has been validated
    nblocks: Option<u32>,
    bitmap_loaded: bool,
}

impl FileSystem {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        Self {
            device,
            nblocks: None,
            bitmap_loaded: false,
        }
    }

    /// Number of blocks in the mounted file system, 0 before mount
    pub fn nblocks(&self) -> u32 {
        self.nblocks.unwrap_or(0)
    }

    pub fn is_mounted(&self) -> bool {
        self.nblocks.is_some() && self.bitmap_loaded
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }
}
