//! Disk image builder
//!
//! Lays out a fresh file system in memory: block 0 unused, the superblock,
//! the bitmap, then file data allocated front to back. Nothing is ever
//! freed, so the image is compact and every block past the last one used
//! is free.

use crate::bcache::MAX_BLOCKS;
use crate::layout::{
    bitmap_blocks, blocks_for, get_u32, name_from_bytes, put_u32, FileRecord, FileType,
    BITMAP_START, BLKBITSIZE, BLKFILES, BLKSIZE, FILE_RECORD_SIZE, FS_MAGIC, MAXFILESIZE,
    MAXNAMELEN, NDIRECT, OFF_DIRECT, OFF_INDIRECT, OFF_MAGIC, OFF_NBLOCKS, OFF_ROOT, OFF_SIZE,
    OFF_TYPE, SUPER_BLOCK,
};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Image builder configuration
#[derive(Debug, Clone)]
pub struct FormatConfig {
    /// Size of the image in blocks
    pub nblocks: u32,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self { nblocks: 1024 }
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{0} blocks cannot hold a file system")]
    TooSmall(u32),

    #[error("{0} blocks exceed the cache window")]
    TooLarge(u32),

    #[error("out of blocks")]
    DiskFull,

    #[error("file {name} is {size} bytes, too large")]
    FileTooLarge { name: String, size: usize },

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("{0} already exists")]
    Exists(String),

    #[error("not a directory")]
    NotADirectory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte offset of a file record inside the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordAt(pub usize);

/// Builds a file system image
pub struct ImageBuilder {
    image: Vec<u8>,
    nblocks: u32,
    /// Next block to hand out
    nextb: u32,
}

impl ImageBuilder {
    pub fn new(config: FormatConfig) -> Result<Self, FormatError> {
        let nblocks = config.nblocks;
        if nblocks > MAX_BLOCKS {
            return Err(FormatError::TooLarge(nblocks));
        }
        let nextb = BITMAP_START + bitmap_blocks(nblocks);
        if nblocks <= nextb {
            return Err(FormatError::TooSmall(nblocks));
        }

        let mut builder = Self {
            image: vec![0u8; nblocks as usize * BLKSIZE as usize],
            nblocks,
            nextb,
        };
        let sb = builder.block_offset(SUPER_BLOCK);
        put_u32(&mut builder.image, (sb + OFF_MAGIC as usize) as u32, FS_MAGIC);
        put_u32(&mut builder.image, (sb + OFF_NBLOCKS as usize) as u32, nblocks);
        let root = FileRecord::new("/", FileType::Directory).encode();
        let at = sb + OFF_ROOT as usize;
        builder.image[at..at + root.len()].copy_from_slice(&root);
        Ok(builder)
    }

    /// The root directory record, inside the superblock
    pub fn root(&self) -> RecordAt {
        RecordAt(BLKSIZE as usize * SUPER_BLOCK as usize + OFF_ROOT as usize)
    }

    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// Blocks handed out so far, reserved ones included
    pub fn blocks_used(&self) -> u32 {
        self.nextb
    }

    /// Adds a regular file holding `data` to `dir`
    pub fn add_file(&mut self, dir: RecordAt, name: &str, data: &[u8]) -> Result<RecordAt, FormatError> {
        if data.len() > MAXFILESIZE as usize {
            return Err(FormatError::FileTooLarge {
                name: name.to_string(),
                size: data.len(),
            });
        }
        let f = self.new_record(dir, name, FileType::Regular)?;
        for (filebno, chunk) in data.chunks(BLKSIZE as usize).enumerate() {
            let bno = self.alloc()?;
            let off = self.block_offset(bno);
            self.image[off..off + chunk.len()].copy_from_slice(chunk);
            self.set_block(f, filebno as u32, bno)?;
        }
        self.put(f, OFF_SIZE, data.len() as u32);
        log::debug!("{} {} bytes", name, data.len());
        Ok(f)
    }

    /// Adds an empty directory to `dir`
    pub fn add_dir(&mut self, dir: RecordAt, name: &str) -> Result<RecordAt, FormatError> {
        self.new_record(dir, name, FileType::Directory)
    }

    /// Copies a host file into `dir` under its own name
    pub fn add_host_file(&mut self, dir: RecordAt, path: &Path) -> Result<RecordAt, FormatError> {
        let data = fs::read(path)?;
        let name = host_name(path)?;
        self.add_file(dir, &name, &data)
    }

    /// Copies a host directory tree into `dir`, entries in name order
    pub fn add_host_tree(&mut self, dir: RecordAt, path: &Path) -> Result<(), FormatError> {
        let mut entries = fs::read_dir(path)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let host = entry.path();
            if entry.file_type()?.is_dir() {
                let sub = self.add_dir(dir, &host_name(&host)?)?;
                self.add_host_tree(sub, &host)?;
            } else {
                self.add_host_file(dir, &host)?;
            }
        }
        Ok(())
    }

    /// Decodes the record at `at`
    pub fn record(&self, at: RecordAt) -> FileRecord {
        FileRecord::decode(&self.image[at.0..at.0 + FILE_RECORD_SIZE as usize])
    }

    /// Writes the bitmap and returns the image
    ///
    /// Blocks below the allocation point are in use, the rest are free.
    pub fn finish(mut self) -> Vec<u8> {
        for blockno in self.nextb..self.nblocks {
            let bitmap = self.block_offset(BITMAP_START + blockno / BLKBITSIZE);
            let bit = blockno % BLKBITSIZE;
            self.image[bitmap + (bit / 8) as usize] |= 1 << (bit % 8);
        }
        log::info!(
            "formatted {} blocks, {} in use",
            self.nblocks,
            self.nextb
        );
        self.image
    }

    fn block_offset(&self, blockno: u32) -> usize {
        blockno as usize * BLKSIZE as usize
    }

    fn alloc(&mut self) -> Result<u32, FormatError> {
        if self.nextb >= self.nblocks {
            return Err(FormatError::DiskFull);
        }
        let bno = self.nextb;
        self.nextb += 1;
        Ok(bno)
    }

    fn get(&self, f: RecordAt, field: u32) -> u32 {
        get_u32(&self.image, (f.0 + field as usize) as u32)
    }

    fn put(&mut self, f: RecordAt, field: u32, value: u32) {
        put_u32(&mut self.image, (f.0 + field as usize) as u32, value);
    }

    fn block_of(&self, f: RecordAt, filebno: u32) -> u32 {
        if filebno < NDIRECT {
            return self.get(f, OFF_DIRECT + 4 * filebno);
        }
        match self.get(f, OFF_INDIRECT) {
            0 => 0,
            ind => get_u32(&self.image, (self.block_offset(ind) + 4 * filebno as usize) as u32),
        }
    }

    fn set_block(&mut self, f: RecordAt, filebno: u32, bno: u32) -> Result<(), FormatError> {
        if filebno < NDIRECT {
            self.put(f, OFF_DIRECT + 4 * filebno, bno);
            return Ok(());
        }
        let mut ind = self.get(f, OFF_INDIRECT);
        if ind == 0 {
            ind = self.alloc()?;
            self.put(f, OFF_INDIRECT, ind);
        }
        let at = self.block_offset(ind) + 4 * filebno as usize;
        put_u32(&mut self.image, at as u32, bno);
        Ok(())
    }

    /// Record slots of directory `dir`
    fn slots(&self, dir: RecordAt) -> Vec<RecordAt> {
        (0..blocks_for(self.get(dir, OFF_SIZE)))
            .flat_map(|filebno| {
                let base = self.block_offset(self.block_of(dir, filebno));
                (0..BLKFILES).map(move |slot| RecordAt(base + (slot * FILE_RECORD_SIZE) as usize))
            })
            .collect()
    }

    fn new_record(&mut self, dir: RecordAt, name: &str, ftype: FileType) -> Result<RecordAt, FormatError> {
        if FileType::from_raw(self.get(dir, OFF_TYPE)) != FileType::Directory {
            return Err(FormatError::NotADirectory);
        }
        if name.is_empty() || name.len() >= MAXNAMELEN {
            return Err(FormatError::NameTooLong(name.to_string()));
        }

        let mut free = None;
        for slot in self.slots(dir) {
            let existing = name_from_bytes(&self.image[slot.0..slot.0 + MAXNAMELEN]);
            if existing == name {
                return Err(FormatError::Exists(name.to_string()));
            }
            if existing.is_empty() && free.is_none() {
                free = Some(slot);
            }
        }

        let slot = match free {
            Some(slot) => slot,
            None => {
                let size = self.get(dir, OFF_SIZE);
                let bno = self.alloc()?;
                self.set_block(dir, size / BLKSIZE, bno)?;
                self.put(dir, OFF_SIZE, size + BLKSIZE);
                RecordAt(self.block_offset(bno))
            }
        };
        let record = FileRecord::new(name, ftype).encode();
        self.image[slot.0..slot.0 + record.len()].copy_from_slice(&record);
        Ok(slot)
    }
}

fn host_name(path: &Path) -> Result<String, FormatError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| FormatError::NameTooLong(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bit(image: &[u8], blockno: u32) -> bool {
        let at = (BITMAP_START * BLKSIZE) as usize;
        image[at + (blockno / 8) as usize] & (1 << (blockno % 8)) != 0
    }

    #[test]
    fn test_empty_image_layout() {
        let image = ImageBuilder::new(FormatConfig { nblocks: 64 }).unwrap().finish();
        assert_eq!(image.len(), 64 * BLKSIZE as usize);
        let sb = BLKSIZE;
        assert_eq!(get_u32(&image, sb + OFF_MAGIC), FS_MAGIC);
        assert_eq!(get_u32(&image, sb + OFF_NBLOCKS), 64);
        let root = FileRecord::decode(&image[(sb + OFF_ROOT) as usize..]);
        assert!(root.is_dir());
        assert_eq!(root.size, 0);

        // boot block, superblock and bitmap are in use
        for b in 0..3 {
            assert!(!bit(&image, b));
        }
        assert!(bit(&image, 3));
        assert!(bit(&image, 63));
        assert!(!bit(&image, 64));
    }

    #[test]
    fn test_file_data_and_directory_growth() {
        let mut builder = ImageBuilder::new(FormatConfig { nblocks: 128 }).unwrap();
        let root = builder.root();
        let data = vec![7u8; BLKSIZE as usize + 10];
        let f = builder.add_file(root, "two-blocks", &data).unwrap();

        let record = builder.record(f);
        assert_eq!(record.size, BLKSIZE + 10);
        assert_ne!(record.direct[0], 0);
        assert_ne!(record.direct[1], 0);
        assert_eq!(record.direct[2], 0);
        assert_eq!(builder.record(root).size, BLKSIZE);

        for i in 0..BLKFILES {
            builder.add_dir(root, &format!("d{}", i)).unwrap();
        }
        assert_eq!(builder.record(root).size, 2 * BLKSIZE);
    }

    #[test]
    fn test_large_file_uses_indirect_block() {
        let mut builder = ImageBuilder::new(FormatConfig { nblocks: 64 }).unwrap();
        let root = builder.root();
        let data = vec![1u8; (NDIRECT as usize + 2) * BLKSIZE as usize];
        let f = builder.add_file(root, "big", &data).unwrap();
        let record = builder.record(f);
        assert_ne!(record.indirect, 0);
        assert_ne!(builder.block_of(f, NDIRECT + 1), 0);
    }

    #[test]
    fn test_builder_errors() {
        assert!(matches!(
            ImageBuilder::new(FormatConfig { nblocks: 3 }),
            Err(FormatError::TooSmall(3))
        ));
        assert!(matches!(
            ImageBuilder::new(FormatConfig { nblocks: MAX_BLOCKS + 1 }),
            Err(FormatError::TooLarge(_))
        ));

        let mut builder = ImageBuilder::new(FormatConfig { nblocks: 8 }).unwrap();
        let root = builder.root();
        let f = builder.add_file(root, "x", b"x").unwrap();
        assert!(matches!(builder.add_file(root, "x", b"y"), Err(FormatError::Exists(_))));
        assert!(matches!(builder.add_dir(f, "y"), Err(FormatError::NotADirectory)));
        assert!(matches!(
            builder.add_file(root, &"n".repeat(MAXNAMELEN), b""),
            Err(FormatError::NameTooLong(_))
        ));
        assert!(matches!(
            builder.add_file(root, "full", &[0u8; 8 * BLKSIZE as usize]),
            Err(FormatError::DiskFull)
        ));
    }

    #[test]
    fn test_host_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("motd"), b"hello\n").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("inner"), b"inner\n").unwrap();

        let mut builder = ImageBuilder::new(FormatConfig { nblocks: 64 }).unwrap();
        let root = builder.root();
        builder.add_host_tree(root, dir.path()).unwrap();
        let names: Vec<String> = builder
            .slots(root)
            .into_iter()
            .map(|slot| builder.record(slot).name)
            .filter(|name| !name.is_empty())
            .collect();
        assert_eq!(names, vec!["motd".to_string(), "sub".to_string()]);
    }
}
