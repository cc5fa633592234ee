//! File operations on top of the descriptor table
//!
//! Files are memory mapped: `open` maps every block of the file into the
//! descriptor's data window, `read` and `write` copy to and from that window,
//! and the window follows the file size as it changes.

use crate::fd::{fd2data, fd_alloc, fd_lookup, fd_va};
use crate::fsipc::{
    fsipc_close, fsipc_dirty, fsipc_map, fsipc_open, fsipc_remove, fsipc_set_size, fsipc_sync,
};
use core_types::memory::{round_up, PGSIZE};
use core_types::{EnvId, FileId, PteFlags};
use kernel_api::{KernelApi, KernelError, UserError};
use serde::{Deserialize, Serialize};
use services_fs::layout::MAXFILESIZE;
use services_fs::protocol::{is_writable, Fd, DEV_FILE};

/// What `stat` reports about an open file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub name: String,
    pub size: u32,
    pub is_dir: bool,
}

/// Handle on the file server
///
/// Holds nothing but the server's identity: all per-file state lives in the
/// caller's descriptor pages, so a forked child can keep using the files
/// its parent opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileClient {
    server: EnvId,
}

impl FileClient {
    pub fn new(server: EnvId) -> Self {
        Self { server }
    }

    pub fn server(&self) -> EnvId {
        self.server
    }

    /// Opens `path` and returns the descriptor number
    pub fn open(&self, env: &mut dyn KernelApi, path: &str, omode: u32) -> Result<u32, UserError> {
        let fdnum = fd_alloc(env)?;
        fsipc_open(env, self.server, path, omode, fd_va(fdnum))?;
        let fd = fd_lookup(env, fdnum)?;
        if let Err(err) = self.fmap(env, fdnum, &fd, 0, fd.file.size) {
            if let Err(close) = self.close(env, fdnum) {
                log::warn!("[{}] close of fd {} after failed open: {}", env.getenvid(), fdnum, close);
            }
            return Err(err);
        }
        log::debug!("[{}] open {} -> fd {}", env.getenvid(), path, fdnum);
        Ok(fdnum)
    }

    fn file_fd(&self, env: &mut dyn KernelApi, fdnum: u32) -> Result<Fd, UserError> {
        let fd = fd_lookup(env, fdnum)?;
        if fd.dev_id != DEV_FILE {
            return Err(KernelError::InvalidArgument.into());
        }
        Ok(fd)
    }

    /// Reads up to `buf.len()` bytes at `offset`; 0 at or past the end
    pub fn read(&self, env: &mut dyn KernelApi, fdnum: u32, buf: &mut [u8], offset: u32) -> Result<usize, UserError> {
        let fd = self.file_fd(env, fdnum)?;
        let size = fd.file.size;
        if offset >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - offset) as usize);
        env.read_bytes(fd2data(fdnum) + offset, &mut buf[..n])?;
        Ok(n)
    }

    /// The whole file
    pub fn read_all(&self, env: &mut dyn KernelApi, fdnum: u32) -> Result<Vec<u8>, UserError> {
        let size = self.file_fd(env, fdnum)?.file.size;
        let mut buf = vec![0u8; size as usize];
        let n = self.read(env, fdnum, &mut buf, 0)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes `data` at `offset`, growing the file as needed
    pub fn write(&self, env: &mut dyn KernelApi, fdnum: u32, data: &[u8], offset: u32) -> Result<usize, UserError> {
        let fd = self.file_fd(env, fdnum)?;
        if !is_writable(fd.omode) {
            return Err(KernelError::InvalidArgument.into());
        }
        let tot = u64::from(offset) + data.len() as u64;
        if tot > u64::from(MAXFILESIZE) {
            return Err(KernelError::DiskFull.into());
        }
        if tot > u64::from(fd.file.size) {
            self.ftruncate(env, fdnum, tot as u32)?;
        }
        env.write_bytes(fd2data(fdnum) + offset, data)?;
        Ok(data.len())
    }

    /// Sets the size of the file, mapping or unmapping blocks to match
    pub fn ftruncate(&self, env: &mut dyn KernelApi, fdnum: u32, newsize: u32) -> Result<(), UserError> {
        if newsize > MAXFILESIZE {
            return Err(KernelError::DiskFull.into());
        }
        let fd = self.file_fd(env, fdnum)?;
        let oldsize = fd.file.size;
        fsipc_set_size(env, self.server, FileId(fd.fileid), newsize)?;
        let fd = fd_lookup(env, fdnum)?;
        assert_eq!(fd.file.size, newsize, "server did not update the descriptor");

        self.fmap(env, fdnum, &fd, oldsize, newsize)?;
        self.funmap(env, fdnum, &fd, oldsize, newsize, false)
    }

    pub fn stat(&self, env: &mut dyn KernelApi, fdnum: u32) -> Result<Stat, UserError> {
        let fd = self.file_fd(env, fdnum)?;
        Ok(Stat {
            is_dir: fd.file.is_dir(),
            name: fd.file.name,
            size: fd.file.size,
        })
    }

    /// Unmaps the file (reporting blocks written through the mapping), tells
    /// the server and releases the descriptor
    pub fn close(&self, env: &mut dyn KernelApi, fdnum: u32) -> Result<(), UserError> {
        let fd = self.file_fd(env, fdnum)?;
        let unmapped = self.funmap(env, fdnum, &fd, fd.file.size, 0, true);
        let closed = fsipc_close(env, self.server, FileId(fd.fileid));
        env.sys_page_unmap(EnvId::CURRENT, fd_va(fdnum))?;
        unmapped.and(closed)
    }

    pub fn remove(&self, env: &mut dyn KernelApi, path: &str) -> Result<(), UserError> {
        fsipc_remove(env, self.server, path)
    }

    /// Asks the server to write back every dirty block
    pub fn sync(&self, env: &mut dyn KernelApi) -> Result<(), UserError> {
        fsipc_sync(env, self.server)
    }

    /// Maps the blocks needed to grow the window from `oldsize` to
    /// `newsize`; nothing if the file shrinks
    ///
    /// On failure the pages mapped so far are unmapped again.
    fn fmap(&self, env: &mut dyn KernelApi, fdnum: u32, fd: &Fd, oldsize: u32, newsize: u32) -> Result<(), UserError> {
        let data = fd2data(fdnum);
        let start = round_up(oldsize, PGSIZE);
        let mut offset = start;
        while offset < newsize {
            if let Err(err) = fsipc_map(env, self.server, FileId(fd.fileid), offset, data + offset) {
                if let Err(unmap) = self.funmap(env, fdnum, fd, offset, start, false) {
                    log::warn!("[{}] unmap of fd {} after failed map: {}", env.getenvid(), fdnum, unmap);
                }
                return Err(err);
            }
            offset += PGSIZE;
        }
        Ok(())
    }

    /// Unmaps the pages no longer needed when the window shrinks from
    /// `oldsize` to `newsize`; nothing if the file grows
    ///
    /// With `dirty`, pages written through this mapping are reported to the
    /// server first. Every page is unmapped even if a report fails; the first
    /// failure is returned.
    fn funmap(
        &self,
        env: &mut dyn KernelApi,
        fdnum: u32,
        fd: &Fd,
        oldsize: u32,
        newsize: u32,
        dirty: bool,
    ) -> Result<(), UserError> {
        let data = fd2data(fdnum);
        let mut result = Ok(());
        let mut offset = round_up(newsize, PGSIZE);
        while offset < oldsize {
            let va = data + offset;
            if env.va_is_mapped(va) {
                if dirty && env.vpt(va).flags().contains(PteFlags::DIRTY) {
                    if let Err(err) = fsipc_dirty(env, self.server, FileId(fd.fileid), offset) {
                        if result.is_ok() {
                            result = Err(err);
                        }
                    }
                }
                env.sys_page_unmap(EnvId::CURRENT, va)?;
            }
            offset += PGSIZE;
        }
        result
    }
}
