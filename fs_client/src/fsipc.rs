//! Request marshalling
//!
//! Every request is built in the caller's `FSIPCBUF` page and sent to the
//! server along with it; the call then waits for the reply.

use core_types::memory::PGSIZE;
use core_types::{EnvId, FileId, PteFlags};
use kernel_api::{KernelApi, KernelError, UserError};
use services_fs::layout::MAXPATHLEN;
use services_fs::protocol::{FsRequest, FSIPCBUF};
use user_lib::{ipc_recv, ipc_send};

/// Sends `req` and waits for the reply
///
/// A page in the reply lands at `dstva`. Returns the permissions of that
/// page, empty if none came.
pub fn fsipc(
    env: &mut dyn KernelApi,
    server: EnvId,
    req: &FsRequest,
    dstva: Option<u32>,
) -> Result<PteFlags, UserError> {
    if !env.va_is_mapped(FSIPCBUF) {
        env.sys_page_alloc(EnvId::CURRENT, FSIPCBUF, PteFlags::user_write())?;
    }
    let mut page = vec![0u8; PGSIZE as usize];
    let body = req.encode();
    page[..body.len()].copy_from_slice(&body);
    env.write_bytes(FSIPCBUF, &page)?;

    log::trace!("[{}] fsipc {:?} -> {}", env.getenvid(), req, server);
    ipc_send(env, server, req.code(), Some(FSIPCBUF), PteFlags::user_write())?;
    let msg = ipc_recv(env, dstva)?;
    KernelError::check(msg.value as i32)?;
    Ok(msg.perm)
}

fn check_path(path: &str) -> Result<(), UserError> {
    if path.len() >= MAXPATHLEN {
        return Err(KernelError::BadPath.into());
    }
    Ok(())
}

/// Opens `path`; the descriptor page is mapped at `fd_va`
pub fn fsipc_open(
    env: &mut dyn KernelApi,
    server: EnvId,
    path: &str,
    omode: u32,
    fd_va: u32,
) -> Result<(), UserError> {
    check_path(path)?;
    let req = FsRequest::Open {
        path: path.to_string(),
        omode,
    };
    fsipc(env, server, &req, Some(fd_va))?;
    Ok(())
}

/// Maps the block holding byte `offset` of the file at `dstva`
pub fn fsipc_map(
    env: &mut dyn KernelApi,
    server: EnvId,
    fileid: FileId,
    offset: u32,
    dstva: u32,
) -> Result<(), UserError> {
    let perm = fsipc(env, server, &FsRequest::MapBlock { fileid, offset }, Some(dstva))?;
    if !perm.contains(PteFlags::PRESENT | PteFlags::USER | PteFlags::SHARE) {
        log::error!("fsipc_map: unexpected permissions {:?}", perm);
        return Err(KernelError::InvalidArgument.into());
    }
    Ok(())
}

pub fn fsipc_set_size(env: &mut dyn KernelApi, server: EnvId, fileid: FileId, size: u32) -> Result<(), UserError> {
    fsipc(env, server, &FsRequest::SetSize { fileid, size }, None).map(|_| ())
}

pub fn fsipc_close(env: &mut dyn KernelApi, server: EnvId, fileid: FileId) -> Result<(), UserError> {
    fsipc(env, server, &FsRequest::Close { fileid }, None).map(|_| ())
}

/// Tells the server the block holding byte `offset` was written through a
/// client mapping
pub fn fsipc_dirty(env: &mut dyn KernelApi, server: EnvId, fileid: FileId, offset: u32) -> Result<(), UserError> {
    fsipc(env, server, &FsRequest::Dirty { fileid, offset }, None).map(|_| ())
}

pub fn fsipc_remove(env: &mut dyn KernelApi, server: EnvId, path: &str) -> Result<(), UserError> {
    check_path(path)?;
    let req = FsRequest::Remove {
        path: path.to_string(),
    };
    fsipc(env, server, &req, None).map(|_| ())
}

pub fn fsipc_sync(env: &mut dyn KernelApi, server: EnvId) -> Result<(), UserError> {
    fsipc(env, server, &FsRequest::Sync, None).map(|_| ())
}
