//! Syscall gate
//!
//! Every system call enters the kernel through [`Kernel::syscall`], on
//! behalf of an explicitly named caller. Arguments are validated here, in
//! the kernel, never trusted from user level:
//!
//! - Virtual addresses must be page-aligned and below `UTOP`.
//! - Page permissions must include `PRESENT | USER` and nothing outside
//!   `USER_SETTABLE`.
//! - Environment arguments resolve through `envid2env`; most calls may only
//!   touch the caller or its immediate children.
//!
//! Blocking is not the gate's business: `Yield` and `IpcRecv` only update
//! kernel state, and the [`Machine`](crate::Machine) performs the switch.

use crate::Kernel;
use core_types::memory::{is_page_aligned, UTOP};
use core_types::{EnvId, PteFlags};
use kernel_api::{EnvStatus, KernelError, Syscall, SyscallResult, TrapFrame};

/// Validates permissions passed to the page-mapping calls
pub fn check_perm(perm: PteFlags) -> Result<(), KernelError> {
    let required = PteFlags::PRESENT | PteFlags::USER;
    if !perm.contains(required) || !PteFlags::USER_SETTABLE.contains(perm) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

/// Validates a user page address
pub fn check_user_va(va: u32) -> Result<(), KernelError> {
    if va >= UTOP || !is_page_aligned(va) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

impl Kernel {
    /// Executes one system call for `caller`
    pub fn syscall(&mut self, caller: EnvId, call: Syscall) -> SyscallResult {
        let name = call.name();
        let result = self.dispatch_syscall(caller, call);
        match &result {
            Ok(value) => log::trace!("[{}] {} -> {:#x}", caller, name, value),
            Err(err) => log::trace!("[{}] {} -> {}", caller, name, err),
        }
        result
    }

    fn dispatch_syscall(&mut self, caller: EnvId, call: Syscall) -> SyscallResult {
        self.envid2env(caller, EnvId::CURRENT, false)?;
        match call {
            Syscall::Cputs { text } => {
                log::info!(target: "console", "{}", text);
                self.console.push_str(&text);
                Ok(0)
            }
            Syscall::Getenvid => Ok(caller.raw()),
            Syscall::Yield => Ok(0),
            Syscall::EnvDestroy { envid } => {
                let id = self.envid2env(caller, envid, true)?;
                if id == caller {
                    log::info!("[{}] exiting gracefully", caller);
                } else {
                    log::info!("[{}] destroying {}", caller, id);
                }
                self.env_destroy(id);
                Ok(0)
            }
            Syscall::Exofork => self.exofork(caller).map(|child| child.raw()),
            Syscall::EnvSetStatus { envid, status } => {
                if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
                    return Err(KernelError::InvalidArgument);
                }
                let id = self.envid2env(caller, envid, true)?;
                if let Some(env) = self.env_mut(id) {
                    env.status = status;
                }
                Ok(0)
            }
            Syscall::EnvSetTrapframe { envid, tf } => {
                let id = self.envid2env(caller, envid, true)?;
                self.set_trapframe(id, tf);
                Ok(0)
            }
            Syscall::EnvSetPgfaultUpcall { envid, upcall } => {
                let id = self.envid2env(caller, envid, true)?;
                if let Some(env) = self.env_mut(id) {
                    env.pgfault_upcall = upcall;
                }
                Ok(0)
            }
            Syscall::PageAlloc { envid, va, perm } => {
                let id = self.envid2env(caller, envid, true)?;
                self.page_alloc(id, va, perm)?;
                Ok(0)
            }
            Syscall::PageMap {
                src_env,
                src_va,
                dst_env,
                dst_va,
                perm,
            } => {
                let src = self.envid2env(caller, src_env, true)?;
                let dst = self.envid2env(caller, dst_env, true)?;
                check_user_va(src_va)?;
                check_user_va(dst_va)?;
                self.page_map(src, src_va, dst, dst_va, perm)?;
                Ok(0)
            }
            Syscall::PageUnmap { envid, va } => {
                let id = self.envid2env(caller, envid, true)?;
                check_user_va(va)?;
                self.page_unmap(id, va);
                Ok(0)
            }
            Syscall::IpcTrySend {
                envid,
                value,
                src_va,
                perm,
            } => self.ipc_try_send(caller, envid, value, src_va, perm),
            Syscall::IpcRecv { dst_va } => self.ipc_recv(caller, dst_va),
        }
    }

    /// Creates a register-level copy of `parent` with an empty user space
    fn exofork(&mut self, parent: EnvId) -> Result<EnvId, KernelError> {
        let (tf, handler) = match self.env(parent) {
            Some(env) => (env.tf, env.user_handler),
            None => return Err(KernelError::UnknownEnvironment),
        };
        let child = self.env_alloc(parent)?;
        if let Some(env) = self.env_mut(child) {
            env.status = EnvStatus::NotRunnable;
            env.tf = tf;
            env.tf.regs.eax = 0;
            env.user_handler = handler;
        }
        Ok(child)
    }

    fn set_trapframe(&mut self, id: EnvId, mut tf: TrapFrame) {
        tf.sanitize();
        if let Some(env) = self.env_mut(id) {
            env.tf = tf;
        }
    }

    /// Allocates a zeroed page and maps it at `va` in `id`
    pub fn page_alloc(&mut self, id: EnvId, va: u32, perm: PteFlags) -> Result<(), KernelError> {
        check_user_va(va)?;
        check_perm(perm)?;
        let frame = self.pages.alloc()?;
        let Some(env) = self.envs.get_mut(id.raw()) else {
            self.pages.free(frame);
            return Err(KernelError::UnknownEnvironment);
        };
        if let Err(err) = env.space.insert(&mut self.pages, frame, va, perm) {
            self.pages.free(frame);
            return Err(err);
        }
        self.pages.zero(frame);
        Ok(())
    }

    /// Maps the page at `src_va` in `src` at `dst_va` in `dst`
    ///
    /// Fails with `InvalidArgument` if nothing is mapped at `src_va` or if
    /// `perm` asks for write access to a read-only source page.
    pub fn page_map(
        &mut self,
        src: EnvId,
        src_va: u32,
        dst: EnvId,
        dst_va: u32,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        check_perm(perm)?;
        let source = self.env(src).ok_or(KernelError::UnknownEnvironment)?;
        let (frame, flags) = source
            .space
            .lookup(&self.pages, src_va)
            .ok_or(KernelError::InvalidArgument)?;
        if perm.contains(PteFlags::WRITABLE) && !flags.contains(PteFlags::WRITABLE) {
            return Err(KernelError::InvalidArgument);
        }
        let target = self
            .envs
            .get_mut(dst.raw())
            .ok_or(KernelError::UnknownEnvironment)?;
        target.space.insert(&mut self.pages, frame, dst_va, perm)
    }

    pub fn page_unmap(&mut self, id: EnvId, va: u32) {
        if let Some(env) = self.envs.get_mut(id.raw()) {
            env.space.remove(&mut self.pages, va);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelConfig;
    use core_types::memory::{PGSIZE, UTEXT};

    fn boot() -> (Kernel, EnvId) {
        let mut k = Kernel::new(KernelConfig {
            nenv: 8,
            npages: 256,
            ..KernelConfig::default()
        })
        .unwrap();
        let id = k.env_create().unwrap();
        k.env_run(id);
        (k, id)
    }

    fn alloc(k: &mut Kernel, caller: EnvId, va: u32, perm: PteFlags) -> SyscallResult {
        k.syscall(
            caller,
            Syscall::PageAlloc {
                envid: EnvId::CURRENT,
                va,
                perm,
            },
        )
    }

    #[test]
    fn test_check_perm() {
        assert!(check_perm(PteFlags::user_read()).is_ok());
        assert!(check_perm(PteFlags::user_write() | PteFlags::SHARE | PteFlags::COW).is_ok());
        assert_eq!(check_perm(PteFlags::PRESENT), Err(KernelError::InvalidArgument));
        assert_eq!(
            check_perm(PteFlags::user_write() | PteFlags::DIRTY),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_getenvid_and_cputs() {
        let (mut k, id) = boot();
        assert_eq!(k.syscall(id, Syscall::Getenvid), Ok(id.raw()));
        k.syscall(
            id,
            Syscall::Cputs {
                text: "hello".to_string(),
            },
        )
        .unwrap();
        assert_eq!(k.console(), "hello");
    }

    #[test]
    fn test_page_alloc_zeroes_and_validates() {
        let (mut k, id) = boot();
        assert_eq!(alloc(&mut k, id, UTEXT, PteFlags::user_write()), Ok(0));
        let (frame, _) = k.env(id).unwrap().space.lookup(k.pages(), UTEXT).unwrap();
        assert!(k.pages().bytes(frame).iter().all(|&b| b == 0));

        assert_eq!(
            alloc(&mut k, id, UTEXT + 1, PteFlags::user_write()),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            alloc(&mut k, id, UTOP, PteFlags::user_write()),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            alloc(&mut k, id, UTEXT, PteFlags::WRITABLE | PteFlags::PRESENT),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_page_map_rejects_write_escalation() {
        let (mut k, id) = boot();
        alloc(&mut k, id, UTEXT, PteFlags::user_read()).unwrap();
        let map = |perm| Syscall::PageMap {
            src_env: EnvId::CURRENT,
            src_va: UTEXT,
            dst_env: EnvId::CURRENT,
            dst_va: UTEXT + PGSIZE,
            perm,
        };
        assert_eq!(
            k.syscall(id, map(PteFlags::user_write())),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(k.syscall(id, map(PteFlags::user_read())), Ok(0));
        let (frame, _) = k.env(id).unwrap().space.lookup(k.pages(), UTEXT).unwrap();
        assert_eq!(k.pages().refcount(frame), 2);
    }

    #[test]
    fn test_page_map_unmapped_source() {
        let (mut k, id) = boot();
        let result = k.syscall(
            id,
            Syscall::PageMap {
                src_env: EnvId::CURRENT,
                src_va: UTEXT,
                dst_env: EnvId::CURRENT,
                dst_va: UTEXT,
                perm: PteFlags::user_read(),
            },
        );
        assert_eq!(result, Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_exofork_copies_registers_and_blocks_child() {
        let (mut k, id) = boot();
        k.env_mut(id).unwrap().tf.regs.eax = 99;
        k.env_mut(id).unwrap().tf.regs.ebx = 7;
        let child = EnvId(k.syscall(id, Syscall::Exofork).unwrap());
        let env = k.env(child).unwrap();
        assert_eq!(env.parent_id, id);
        assert_eq!(env.status, EnvStatus::NotRunnable);
        assert_eq!(env.tf.regs.eax, 0);
        assert_eq!(env.tf.regs.ebx, 7);
        assert!(!env.space.pde(k.pages(), UTEXT).is_present());
    }

    #[test]
    fn test_set_status_and_permissions() {
        let (mut k, parent) = boot();
        let child = EnvId(k.syscall(parent, Syscall::Exofork).unwrap());
        let other = k.env_create().unwrap();

        let set = |envid, status| Syscall::EnvSetStatus { envid, status };
        assert_eq!(
            k.syscall(parent, set(child, EnvStatus::Dying)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            k.syscall(other, set(child, EnvStatus::Runnable)),
            Err(KernelError::UnknownEnvironment)
        );
        assert_eq!(k.syscall(parent, set(child, EnvStatus::Runnable)), Ok(0));
        assert_eq!(k.status(child), EnvStatus::Runnable);
    }

    #[test]
    fn test_set_trapframe_sanitizes() {
        let (mut k, parent) = boot();
        let child = EnvId(k.syscall(parent, Syscall::Exofork).unwrap());
        let mut tf = TrapFrame::default();
        tf.eip = 0x0080_1000;
        k.syscall(parent, Syscall::EnvSetTrapframe { envid: child, tf })
            .unwrap();
        let installed = k.env(child).unwrap().tf;
        assert!(installed.is_user());
        assert_eq!(installed.eip, 0x0080_1000);
    }

    #[test]
    fn test_env_destroy_child_and_self() {
        let (mut k, parent) = boot();
        let child = EnvId(k.syscall(parent, Syscall::Exofork).unwrap());
        k.syscall(parent, Syscall::EnvDestroy { envid: child }).unwrap();
        assert!(!k.is_live(child));
        k.syscall(
            parent,
            Syscall::EnvDestroy {
                envid: EnvId::CURRENT,
            },
        )
        .unwrap();
        assert!(!k.is_live(parent));
        assert!(k.curenv().is_none());
        assert_eq!(
            k.syscall(parent, Syscall::Getenvid),
            Err(KernelError::UnknownEnvironment)
        );
    }

    #[test]
    fn test_page_unmap_is_idempotent() {
        let (mut k, id) = boot();
        alloc(&mut k, id, UTEXT, PteFlags::user_write()).unwrap();
        let unmap = Syscall::PageUnmap {
            envid: EnvId::CURRENT,
            va: UTEXT,
        };
        assert_eq!(k.syscall(id, unmap.clone()), Ok(0));
        assert_eq!(k.syscall(id, unmap), Ok(0));
    }
}
