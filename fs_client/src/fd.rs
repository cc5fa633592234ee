//! Descriptor table
//!
//! Descriptor `i` is the page at `FDTABLE + i * PGSIZE`; it is in use while
//! that page is mapped. Its file data is mapped in a window of `PTSIZE`
//! bytes at `FILEBASE + i * PTSIZE`.

use core_types::memory::{PGSIZE, PTSIZE};
use kernel_api::{KernelApi, KernelError, UserError};
use services_fs::protocol::{Fd, FDTABLE, FILEBASE, MAXFD};

/// Address of descriptor page `fdnum`
pub fn fd_va(fdnum: u32) -> u32 {
    FDTABLE + fdnum * PGSIZE
}

/// Start of the data window of `fdnum`
pub fn fd2data(fdnum: u32) -> u32 {
    FILEBASE + fdnum * PTSIZE
}

/// Lowest unused descriptor number
///
/// Nothing is mapped; the caller is expected to get a page in place.
pub fn fd_alloc(env: &dyn KernelApi) -> Result<u32, UserError> {
    (0..MAXFD)
        .find(|fdnum| !env.va_is_mapped(fd_va(*fdnum)))
        .ok_or(UserError::Kernel(KernelError::TooManyOpenFiles))
}

/// Reads the descriptor page of an open descriptor
pub fn fd_lookup(env: &mut dyn KernelApi, fdnum: u32) -> Result<Fd, UserError> {
    if fdnum >= MAXFD || !env.va_is_mapped(fd_va(fdnum)) {
        return Err(KernelError::InvalidArgument.into());
    }
    let mut raw = vec![0u8; Fd::encoded_len()];
    env.read_bytes(fd_va(fdnum), &mut raw)?;
    Ok(Fd::decode(&raw))
}
