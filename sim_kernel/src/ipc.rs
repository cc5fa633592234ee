//! Rendezvous IPC
//!
//! A message is one 32-bit value plus, optionally, one page mapping. There
//! is no queue: a send succeeds only while the target is blocked in
//! receive, and whichever sender gets there first wins. A failed send has
//! no effect on the target.

use crate::audit::KernelEvent;
use crate::syscall_gate::check_perm;
use crate::Kernel;
use core_types::memory::{is_page_aligned, UTOP};
use core_types::{EnvId, PteFlags};
use kernel_api::{EnvStatus, KernelError, SyscallResult};

impl Kernel {
    /// Delivers `value` (and the page at `src_va`) to `target`
    ///
    /// A page moves only when `src_va` and the receiver's `dstva` are both
    /// below `UTOP`. Returns 1 if a page was transferred, 0 otherwise.
    pub fn ipc_try_send(
        &mut self,
        caller: EnvId,
        target: EnvId,
        value: u32,
        src_va: u32,
        perm: PteFlags,
    ) -> SyscallResult {
        let to = self.envid2env(caller, target, false)?;
        let Some(receiver) = self.env(to) else {
            return Err(KernelError::UnknownEnvironment);
        };
        if !receiver.ipc.recving {
            return Err(KernelError::IpcNotReceiving);
        }
        let dstva = receiver.ipc.dstva;

        let mut transferred = PteFlags::empty();
        if src_va < UTOP && dstva < UTOP {
            if !is_page_aligned(src_va) {
                return Err(KernelError::InvalidArgument);
            }
            check_perm(perm)?;
            self.page_map(caller, src_va, to, dstva, perm)?;
            transferred = perm;
        }

        if let Some(receiver) = self.env_mut(to) {
            receiver.ipc.recving = false;
            receiver.ipc.from = caller;
            receiver.ipc.value = value;
            receiver.ipc.perm = transferred;
            receiver.status = EnvStatus::Runnable;
            receiver.tf.regs.eax = 0;
        }

        let page_transferred = !transferred.is_empty();
        log::debug!(
            "[{}] ipc to {}: value {:#x}{}",
            caller,
            to,
            value,
            if page_transferred { " with page" } else { "" }
        );
        self.audit.record(KernelEvent::IpcDelivered {
            from: caller,
            to,
            value,
            page_transferred,
        });
        Ok(u32::from(page_transferred))
    }

    /// Marks `caller` as waiting for a message
    ///
    /// A `dst_va` at or above `UTOP` means no page is wanted. The caller
    /// stops being runnable until a send completes.
    pub fn ipc_recv(&mut self, caller: EnvId, dst_va: u32) -> SyscallResult {
        if dst_va < UTOP && !is_page_aligned(dst_va) {
            return Err(KernelError::InvalidArgument);
        }
        let env = self.env_mut(caller).ok_or(KernelError::UnknownEnvironment)?;
        env.ipc.recving = true;
        env.ipc.dstva = dst_va;
        env.status = EnvStatus::NotRunnable;
        env.tf.regs.eax = 0;
        Ok(0)
    }
}
