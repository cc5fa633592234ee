//! User-level page fault handling
//!
//! The kernel reflects a page fault by pushing a [`UTrapframe`] onto the
//! exception stack and jumping to the environment's registered entry point.
//! The entry point calls the handler installed here and, when it returns,
//! resumes the faulting code, which retries the access.

use core_types::memory::{round_down, PFTEMP, PGSIZE, UTEXT, UXSTACKTOP};
use core_types::{EnvId, PteFlags};
use kernel_api::{KernelApi, KernelError, PgFaultHandler, UTrapframe, UserError};

/// Address of the assembly entry point registered as the upcall
pub const PGFAULT_UPCALL: u32 = UTEXT + 0x20;

/// Installs `handler` as the page fault handler of the calling environment
///
/// The first installation allocates the exception stack and registers the
/// entry point with the kernel.
pub fn set_pgfault_handler(env: &mut dyn KernelApi, handler: PgFaultHandler) -> Result<(), UserError> {
    if env.pgfault_handler().is_none() {
        env.sys_page_alloc(EnvId::CURRENT, UXSTACKTOP - PGSIZE, PteFlags::user_write())?;
        env.sys_env_set_pgfault_upcall(EnvId::CURRENT, PGFAULT_UPCALL)?;
    }
    env.set_pgfault_handler(Some(handler));
    Ok(())
}

/// Copy-on-write fault handler
///
/// Only a write to a page marked copy-on-write is handled: the page is
/// replaced by a private writable copy. Anything else is fatal.
pub fn cow_pgfault(env: &mut dyn KernelApi, utf: &UTrapframe) -> Result<(), UserError> {
    let addr = utf.fault_va;
    let cow = env.vpd(addr).is_present() && env.vpt(addr).flags().contains(PteFlags::COW);
    if !utf.is_write() || !cow {
        log::error!(
            "[{}] unhandled page fault va {:08x} ip {:08x} err {:x}",
            env.getenvid(),
            addr,
            utf.eip,
            utf.err
        );
        return Err(KernelError::MemoryFault.into());
    }

    let page = round_down(addr, PGSIZE);
    env.sys_page_alloc(EnvId::CURRENT, PFTEMP, PteFlags::user_write())?;
    let contents = env.read_page(page)?;
    env.write_bytes(PFTEMP, &contents)?;
    env.sys_page_map(EnvId::CURRENT, PFTEMP, EnvId::CURRENT, page, PteFlags::user_write())?;
    env.sys_page_unmap(EnvId::CURRENT, PFTEMP)?;
    Ok(())
}
