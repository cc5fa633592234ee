//! Directories and path resolution
//!
//! A directory is a file whose blocks are arrays of `BLKFILES` records. Its
//! size is always a whole number of blocks; an empty name marks a free slot.

use crate::file::FileRef;
use crate::layout::{FileType, BLKFILES, BLKSIZE, FILE_RECORD_SIZE, MAXNAMELEN};
use crate::FileSystem;
use kernel_api::{KernelApi, KernelError, UserError};

/// Result of resolving a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(FileRef),
    /// Every directory on the path exists but the final component does not
    Missing { dir: FileRef, name: String },
}

impl FileSystem {
    /// Finds the record called `name` in `dir`
    pub fn dir_lookup(
        &mut self,
        env: &mut dyn KernelApi,
        dir: FileRef,
        name: &str,
    ) -> Result<FileRef, UserError> {
        let size = dir.size(env)?;
        assert!(size % BLKSIZE == 0, "directory size {} is not block aligned", size);
        for filebno in 0..size / BLKSIZE {
            let blk = self.file_get_block(env, dir, filebno)?;
            for slot in 0..BLKFILES {
                let f = FileRef::new(blk + slot * FILE_RECORD_SIZE, Some(dir.addr));
                if f.name_is(env, name)? {
                    return Ok(f);
                }
            }
        }
        Err(KernelError::NotFound.into())
    }

    /// Finds a free record slot in `dir`, growing it by one block if it has
    /// none
    pub fn dir_alloc_file(&mut self, env: &mut dyn KernelApi, dir: FileRef) -> Result<FileRef, UserError> {
        let size = dir.size(env)?;
        assert!(size % BLKSIZE == 0, "directory size {} is not block aligned", size);
        let nblock = size / BLKSIZE;
        for filebno in 0..nblock {
            let blk = self.file_get_block(env, dir, filebno)?;
            for slot in 0..BLKFILES {
                let f = FileRef::new(blk + slot * FILE_RECORD_SIZE, Some(dir.addr));
                if f.name_is(env, "")? {
                    return Ok(f);
                }
            }
        }

        let blk = self.file_get_block(env, dir, nblock)?;
        dir.set_size_field(env, size + BLKSIZE)?;
        Ok(FileRef::new(blk, Some(dir.addr)))
    }

    /// Resolves `path` from the root
    ///
    /// Leading and repeated slashes are ignored; the empty path is the root.
    /// Components of `MAXNAMELEN` bytes or more are `BadPath`. Passing
    /// through a regular file, or missing any component but the last, is
    /// `NotFound`.
    pub fn walk_path(&mut self, env: &mut dyn KernelApi, path: &str) -> Result<Lookup, UserError> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        let mut f = self.root();

        while let Some(name) = components.next() {
            if name.len() >= MAXNAMELEN {
                return Err(KernelError::BadPath.into());
            }
            let dir = f;
            if dir.file_type(env)? != FileType::Directory {
                return Err(KernelError::NotFound.into());
            }
            match self.dir_lookup(env, dir, name) {
                Ok(found) => f = found,
                Err(UserError::Kernel(KernelError::NotFound)) if components.peek().is_none() => {
                    return Ok(Lookup::Missing {
                        dir,
                        name: name.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Lookup::Found(f))
    }

    /// Names of the files in `dir`, in slot order
    pub fn dir_list(&mut self, env: &mut dyn KernelApi, dir: FileRef) -> Result<Vec<String>, UserError> {
        let mut names = Vec::new();
        for filebno in 0..dir.size(env)? / BLKSIZE {
            let blk = self.file_get_block(env, dir, filebno)?;
            for slot in 0..BLKFILES {
                let name = FileRef::new(blk + slot * FILE_RECORD_SIZE, None).name(env)?;
                if !name.is_empty() {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }
}
