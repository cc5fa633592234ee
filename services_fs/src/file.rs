//! Files
//!
//! A file is its 256-byte record inside a cached block: the root's record
//! sits in the superblock, every other record in a block of its parent
//! directory. Field updates go straight to the cached block and mark it
//! dirty.
//!
//! Block pointers work like a two-level page table for the file: indices
//! below `NDIRECT` live in the record, indices below `NINDIRECT` in the
//! indirect block (which reserves, but never uses, its first `NDIRECT`
//! slots). A zero pointer means the block is not allocated.

use crate::layout::{
    blocks_for, FileRecord, FileType, BLKSIZE, FILE_RECORD_SIZE, MAXNAMELEN, NDIRECT, NINDIRECT,
    OFF_DIRECT, OFF_INDIRECT, OFF_ROOT, OFF_SIZE, OFF_TYPE, SUPER_BLOCK,
};
use crate::FileSystem;
use kernel_api::{KernelApi, KernelError, UserError};

/// A file, named by the address of its record in the server's cache
///
/// `dir` is the record address of the directory the file was found in. It is
/// only known for files reached through a path walk and is never stored on
/// disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef {
    pub addr: u32,
    pub dir: Option<u32>,
}

impl FileRef {
    pub fn new(addr: u32, dir: Option<u32>) -> Self {
        Self { addr, dir }
    }

    /// The containing directory, if known
    pub fn parent(&self) -> Option<FileRef> {
        self.dir.map(|addr| FileRef::new(addr, None))
    }

    pub fn size(&self, env: &mut dyn KernelApi) -> Result<u32, UserError> {
        env.read_u32(self.addr + OFF_SIZE)
    }

    pub(crate) fn set_size_field(&self, env: &mut dyn KernelApi, size: u32) -> Result<(), UserError> {
        env.write_u32(self.addr + OFF_SIZE, size)
    }

    pub fn file_type(&self, env: &mut dyn KernelApi) -> Result<FileType, UserError> {
        Ok(FileType::from_raw(env.read_u32(self.addr + OFF_TYPE)?))
    }

    pub(crate) fn set_type(&self, env: &mut dyn KernelApi, ftype: FileType) -> Result<(), UserError> {
        env.write_u32(self.addr + OFF_TYPE, ftype.to_raw())
    }

    pub fn is_dir(&self, env: &mut dyn KernelApi) -> Result<bool, UserError> {
        Ok(self.file_type(env)? == FileType::Directory)
    }

    pub fn name(&self, env: &mut dyn KernelApi) -> Result<String, UserError> {
        let mut raw = [0u8; MAXNAMELEN];
        env.read_bytes(self.addr, &mut raw)?;
        Ok(crate::layout::name_from_bytes(&raw))
    }

    /// True if the record's name is exactly `name`
    pub(crate) fn name_is(&self, env: &mut dyn KernelApi, name: &str) -> Result<bool, UserError> {
        let mut raw = [0u8; MAXNAMELEN];
        env.read_bytes(self.addr, &mut raw)?;
        let len = raw.iter().position(|b| *b == 0).unwrap_or(MAXNAMELEN);
        Ok(&raw[..len] == name.as_bytes())
    }

    pub(crate) fn set_name(&self, env: &mut dyn KernelApi, name: &str) -> Result<(), UserError> {
        let mut raw = [0u8; MAXNAMELEN];
        let len = name.len().min(MAXNAMELEN - 1);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        env.write_bytes(self.addr, &raw)
    }

    /// The whole record, decoded
    pub fn record(&self, env: &mut dyn KernelApi) -> Result<FileRecord, UserError> {
        let mut raw = [0u8; FILE_RECORD_SIZE as usize];
        env.read_bytes(self.addr, &mut raw)?;
        Ok(FileRecord::decode(&raw))
    }

    fn indirect(&self, env: &mut dyn KernelApi) -> Result<u32, UserError> {
        env.read_u32(self.addr + OFF_INDIRECT)
    }

    fn set_indirect(&self, env: &mut dyn KernelApi, bno: u32) -> Result<(), UserError> {
        env.write_u32(self.addr + OFF_INDIRECT, bno)
    }
}

impl FileSystem {
    /// The root directory, whose record lives in the superblock
    pub fn root(&self) -> FileRef {
        FileRef::new(self.diskaddr(SUPER_BLOCK) + OFF_ROOT, None)
    }

    /// Address of the pointer slot for block `filebno` of `f`
    ///
    /// `None` when the slot would be in an indirect block the file does not
    /// have. Indices at or past `NINDIRECT` are invalid.
    pub fn block_slot(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        filebno: u32,
    ) -> Result<Option<u32>, UserError> {
        self.walk(env, f, filebno, false)
    }

    /// Like [`FileSystem::block_slot`], allocating a zeroed indirect block if
    /// the file needs one
    pub fn block_slot_alloc(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        filebno: u32,
    ) -> Result<u32, UserError> {
        self.walk(env, f, filebno, true)?
            .ok_or(UserError::Kernel(KernelError::NotFound))
    }

    fn walk(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        filebno: u32,
        alloc: bool,
    ) -> Result<Option<u32>, UserError> {
        if filebno < NDIRECT {
            return Ok(Some(f.addr + OFF_DIRECT + 4 * filebno));
        }
        if filebno >= NINDIRECT {
            return Err(KernelError::InvalidArgument.into());
        }

        let mut indirect = f.indirect(env)?;
        if indirect == 0 {
            if !alloc {
                return Ok(None);
            }
            indirect = self.alloc_block(env)?;
            f.set_indirect(env, indirect)?;
        }
        let addr = self.read_block(env, indirect)?;
        Ok(Some(addr + 4 * filebno))
    }

    /// Disk block holding block `filebno` of `f`
    ///
    /// With `alloc`, a missing block is allocated; otherwise a missing block
    /// is `NotFound`.
    pub fn file_map_block(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        filebno: u32,
        alloc: bool,
    ) -> Result<u32, UserError> {
        let slot = if alloc {
            self.block_slot_alloc(env, f, filebno)?
        } else {
            match self.block_slot(env, f, filebno)? {
                Some(slot) => slot,
                None => return Err(KernelError::NotFound.into()),
            }
        };
        let mut bno = env.read_u32(slot)?;
        if bno == 0 {
            if !alloc {
                return Err(KernelError::NotFound.into());
            }
            bno = self.alloc_block(env)?;
            env.write_u32(slot, bno)?;
        }
        Ok(bno)
    }

    /// Releases block `filebno` of `f`; a missing block is not an error
    pub fn file_clear_block(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        filebno: u32,
    ) -> Result<(), UserError> {
        let Some(slot) = self.block_slot(env, f, filebno)? else {
            return Ok(());
        };
        let bno = env.read_u32(slot)?;
        if bno != 0 {
            self.free_block(env, bno)?;
            env.write_u32(slot, 0)?;
        }
        Ok(())
    }

    /// Cached address of block `filebno` of `f`, allocating it if needed
    pub fn file_get_block(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        filebno: u32,
    ) -> Result<u32, UserError> {
        let bno = self.file_map_block(env, f, filebno, true)?;
        self.read_block(env, bno)
    }

    /// Marks the block holding byte `offset` of `f` dirty
    ///
    /// Used when the block was modified through another environment's
    /// mapping, which the server's Dirty bit cannot see.
    pub fn file_dirty(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        offset: u32,
    ) -> Result<(), UserError> {
        let addr = self.file_get_block(env, f, offset / BLKSIZE)?;
        let word = env.read_u32(addr)?;
        env.write_u32(addr, word)
    }

    /// Frees the blocks `f` needs at its current size but not at `newsize`
    ///
    /// Leaves the size field alone. Failures to clear single blocks are
    /// logged and skipped.
    fn file_truncate_blocks(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        newsize: u32,
    ) -> Result<(), UserError> {
        let old_nblocks = blocks_for(f.size(env)?);
        let new_nblocks = blocks_for(newsize);
        for bno in new_nblocks..old_nblocks {
            match self.file_clear_block(env, f, bno) {
                Ok(()) => {}
                Err(UserError::Kernel(err)) => {
                    log::warn!("file_clear_block {}: {}", bno, err);
                }
                Err(err) => return Err(err),
            }
        }

        let indirect = f.indirect(env)?;
        if new_nblocks <= NDIRECT && indirect != 0 {
            self.free_block(env, indirect)?;
            f.set_indirect(env, 0)?;
        }
        Ok(())
    }

    /// Sets the size of `f`, freeing blocks past the new end
    ///
    /// Growing allocates nothing; blocks appear as they are first mapped.
    pub fn file_set_size(
        &mut self,
        env: &mut dyn KernelApi,
        f: FileRef,
        newsize: u32,
    ) -> Result<(), UserError> {
        if f.size(env)? > newsize {
            self.file_truncate_blocks(env, f, newsize)?;
        }
        f.set_size_field(env, newsize)?;
        self.flush_container(env, f)
    }

    /// Writes back the dirty blocks of `f`
    pub fn file_flush(&mut self, env: &mut dyn KernelApi, f: FileRef) -> Result<(), UserError> {
        for filebno in 0..blocks_for(f.size(env)?) {
            let bno = match self.file_map_block(env, f, filebno, false) {
                Ok(bno) => bno,
                Err(UserError::Kernel(_)) => continue,
                Err(err) => return Err(err),
            };
            if self.block_is_dirty(env, bno) {
                self.write_block(env, bno)?;
            }
        }
        Ok(())
    }

    /// Writes back the blocks that hold the record of `f`
    ///
    /// That is the parent directory's blocks or, for the root, the
    /// superblock.
    fn flush_container(&mut self, env: &mut dyn KernelApi, f: FileRef) -> Result<(), UserError> {
        match f.parent() {
            Some(dir) => self.file_flush(env, dir),
            None => {
                if self.block_is_dirty(env, SUPER_BLOCK) {
                    self.write_block(env, SUPER_BLOCK)?;
                }
                Ok(())
            }
        }
    }

    /// Flushes a file that is being closed, and its directory
    pub fn file_close(&mut self, env: &mut dyn KernelApi, f: FileRef) -> Result<(), UserError> {
        self.file_flush(env, f)?;
        self.flush_container(env, f)
    }

    /// Opens `path`
    pub fn file_open(&mut self, env: &mut dyn KernelApi, path: &str) -> Result<FileRef, UserError> {
        match self.walk_path(env, path)? {
            crate::Lookup::Found(file) => Ok(file),
            crate::Lookup::Missing { .. } => Err(KernelError::NotFound.into()),
        }
    }

    /// Creates `path` as an empty file of type `ftype`
    ///
    /// Every directory on the way must exist. An existing file is
    /// `FileExists`.
    pub fn file_create(
        &mut self,
        env: &mut dyn KernelApi,
        path: &str,
        ftype: FileType,
    ) -> Result<FileRef, UserError> {
        let (dir, name) = match self.walk_path(env, path)? {
            crate::Lookup::Found(_) => return Err(KernelError::FileExists.into()),
            crate::Lookup::Missing { dir, name } => (dir, name),
        };
        let f = self.dir_alloc_file(env, dir)?;
        f.set_name(env, &name)?;
        f.set_type(env, ftype)?;
        // the directory may have grown: persist the new record and the size
        self.file_flush(env, dir)?;
        self.flush_container(env, dir)?;
        log::debug!("created {} ({:?})", path, ftype);
        Ok(f)
    }

    /// Removes `path` by truncating it to nothing and clearing its name
    pub fn file_remove(&mut self, env: &mut dyn KernelApi, path: &str) -> Result<(), UserError> {
        let f = self.file_open(env, path)?;
        self.file_truncate_blocks(env, f, 0)?;
        f.set_name(env, "")?;
        f.set_size_field(env, 0)?;
        self.flush_container(env, f)?;
        log::debug!("removed {}", path);
        Ok(())
    }
}
