//! User-level IPC helpers

use core_types::memory::UTOP;
use core_types::{EnvId, PteFlags};
use kernel_api::{KernelApi, KernelError, UserError};

/// A delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub value: u32,
    pub from: EnvId,
    /// Permissions of the page that came with the message; empty if none
    pub perm: PteFlags,
}

impl Message {
    pub fn has_page(&self) -> bool {
        !self.perm.is_empty()
    }
}

/// Waits for a message
///
/// With `dst_va`, a page sent along with the message is mapped there.
pub fn ipc_recv(env: &mut dyn KernelApi, dst_va: Option<u32>) -> Result<Message, UserError> {
    env.sys_ipc_recv(dst_va.unwrap_or(UTOP))?;
    let ipc = env.thisenv().ipc;
    Ok(Message {
        value: ipc.value,
        from: ipc.from,
        perm: ipc.perm,
    })
}

/// Sends `value` (and the page at `src_va`, if any) to `to`
///
/// Retries, yielding in between, until the target is receiving. Any other
/// failure is fatal: the calling environment is destroyed.
pub fn ipc_send(
    env: &mut dyn KernelApi,
    to: EnvId,
    value: u32,
    src_va: Option<u32>,
    perm: PteFlags,
) -> Result<(), UserError> {
    let src_va = src_va.unwrap_or(UTOP);
    loop {
        match env.sys_ipc_try_send(to, value, src_va, perm) {
            Ok(_) => return Ok(()),
            Err(UserError::Kernel(KernelError::IpcNotReceiving)) => env.sys_yield()?,
            Err(UserError::Kernel(err)) => {
                log::error!("[{}] ipc_send to {}: {}", env.getenvid(), to, err);
                env.sys_env_destroy(EnvId::CURRENT)?;
                return Err(err.into());
            }
            Err(err) => return Err(err),
        }
    }
}
