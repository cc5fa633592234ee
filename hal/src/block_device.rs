//! Block devices
//!
//! Fixed-size block reads and writes, nothing more. The file server's buffer
//! cache sits directly on top of this trait.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

/// Standard block size (4 KiB, one page)
pub const BLOCK_SIZE: usize = 4096;

/// Block device errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("block index out of bounds")]
    OutOfBounds,

    #[error("buffer smaller than a block")]
    InvalidSize,

    #[error("I/O error: {0:?}")]
    Io(io::ErrorKind),
}

/// A device addressed in `BLOCK_SIZE` blocks
pub trait BlockDevice {
    fn block_count(&self) -> u64;

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Reads block `block_idx` into the first `BLOCK_SIZE` bytes of `buffer`
    ///
    /// Fails with `OutOfBounds` past the end of the device and with
    /// `InvalidSize` when `buffer` cannot hold a block.
    fn read_block(&mut self, block_idx: u64, buffer: &mut [u8]) -> Result<(), BlockError>;

    /// Writes the first `BLOCK_SIZE` bytes of `buffer` to block `block_idx`
    fn write_block(&mut self, block_idx: u64, buffer: &[u8]) -> Result<(), BlockError>;

    /// Pushes completed writes down to stable storage
    fn flush(&mut self) -> Result<(), BlockError> {
        Ok(())
    }
}

fn check_request(block_count: u64, block_idx: u64, len: usize) -> Result<(), BlockError> {
    if block_idx >= block_count {
        return Err(BlockError::OutOfBounds);
    }
    if len < BLOCK_SIZE {
        return Err(BlockError::InvalidSize);
    }
    Ok(())
}

/// In-memory block device
///
/// Cloning a `RamDisk` yields another handle onto the same blocks, so a test
/// can hand one handle to the file server and inspect the device through the
/// other.
#[derive(Debug, Clone)]
pub struct RamDisk {
    blocks: Arc<Mutex<Vec<[u8; BLOCK_SIZE]>>>,
}

impl RamDisk {
    /// Create a new zero-filled RAM disk with the specified number of blocks
    pub fn new(block_count: usize) -> Self {
        Self {
            blocks: Arc::new(Mutex::new(vec![[0u8; BLOCK_SIZE]; block_count])),
        }
    }

    /// Create a RAM disk holding a disk image
    ///
    /// A trailing partial block is zero-padded.
    pub fn from_image(image: &[u8]) -> Self {
        let blocks = image
            .chunks(BLOCK_SIZE)
            .map(|chunk| {
                let mut block = [0u8; BLOCK_SIZE];
                block[..chunk.len()].copy_from_slice(chunk);
                block
            })
            .collect();
        Self {
            blocks: Arc::new(Mutex::new(blocks)),
        }
    }

    /// Copy of the whole device contents
    pub fn image(&self) -> Vec<u8> {
        self.lock().iter().flat_map(|b| b.iter().copied()).collect()
    }

    /// Copy of one block, bypassing any cache above the device
    pub fn peek(&self, block_idx: u64) -> Option<Vec<u8>> {
        self.lock().get(block_idx as usize).map(|b| b.to_vec())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<[u8; BLOCK_SIZE]>> {
        self.blocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlockDevice for RamDisk {
    fn block_count(&self) -> u64 {
        self.lock().len() as u64
    }

    fn read_block(&mut self, block_idx: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        check_request(self.block_count(), block_idx, buffer.len())?;
        let blocks = self.lock();
        buffer[..BLOCK_SIZE].copy_from_slice(&blocks[block_idx as usize]);
        Ok(())
    }

    fn write_block(&mut self, block_idx: u64, buffer: &[u8]) -> Result<(), BlockError> {
        check_request(self.block_count(), block_idx, buffer.len())?;
        let mut blocks = self.lock();
        blocks[block_idx as usize].copy_from_slice(&buffer[..BLOCK_SIZE]);
        Ok(())
    }
}

/// Block device backed by a host file (a disk image)
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    block_count: u64,
}

impl FileDisk {
    /// Opens an existing image; its length must be a whole number of blocks
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "image size is not a multiple of the block size",
            ));
        }
        Ok(Self {
            file,
            block_count: len / BLOCK_SIZE as u64,
        })
    }

    /// Creates (or truncates) an image of `block_count` zeroed blocks
    pub fn create<P: AsRef<Path>>(path: P, block_count: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;
        Ok(Self { file, block_count })
    }

    fn seek_to(&mut self, block_idx: u64) -> Result<(), BlockError> {
        self.file
            .seek(SeekFrom::Start(block_idx * BLOCK_SIZE as u64))
            .map(|_| ())
            .map_err(|e| BlockError::Io(e.kind()))
    }
}

impl BlockDevice for FileDisk {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, block_idx: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        check_request(self.block_count(), block_idx, buffer.len())?;
        self.seek_to(block_idx)?;
        self.file
            .read_exact(&mut buffer[..BLOCK_SIZE])
            .map_err(|e| BlockError::Io(e.kind()))
    }

    fn write_block(&mut self, block_idx: u64, buffer: &[u8]) -> Result<(), BlockError> {
        check_request(self.block_count(), block_idx, buffer.len())?;
        self.seek_to(block_idx)?;
        self.file
            .write_all(&buffer[..BLOCK_SIZE])
            .map_err(|e| BlockError::Io(e.kind()))
    }

    fn flush(&mut self) -> Result<(), BlockError> {
        self.file.sync_data().map_err(|e| BlockError::Io(e.kind()))
    }
}
