//! Copy-on-write fork, built from exofork and page mappings
//!
//! The kernel only creates an empty child. The parent walks its own page
//! tables through the read-only `vpd`/`vpt` views and maps each present page
//! into the child:
//!
//! - pages marked `SHARE` keep their permissions in both environments;
//! - writable or copy-on-write pages become copy-on-write in the child and
//!   then, last, in the parent;
//! - read-only pages are mapped read-only.
//!
//! The exception stack is never shared: the child gets a fresh one.
//!
//! The child starts with the parent's registers and page fault handler. Its
//! code runs once the machine schedules it (a test entering it, or a program
//! attached to it).

use crate::pgfault::{cow_pgfault, set_pgfault_handler, PGFAULT_UPCALL};
use core_types::memory::{round_down, PGSIZE, PTSIZE, USTACKTOP, UTOP, UXSTACKTOP};
use core_types::{EnvId, PteFlags};
use kernel_api::{EnvStatus, KernelApi, UserError};

/// Creates a copy-on-write child; returns its id
pub fn fork(env: &mut dyn KernelApi) -> Result<EnvId, UserError> {
    realfork(env, false)
}

/// Creates a child that shares all memory except the stack
///
/// Every page outside the stack region is mapped `SHARE` into both
/// environments; the stack stays copy-on-write.
pub fn sfork(env: &mut dyn KernelApi) -> Result<EnvId, UserError> {
    realfork(env, true)
}

fn realfork(env: &mut dyn KernelApi, share: bool) -> Result<EnvId, UserError> {
    set_pgfault_handler(env, cow_pgfault)?;
    let child = env.sys_exofork()?;
    if let Err(err) = populate(env, child, share) {
        log::error!("[{}] fork of {} failed: {}", env.getenvid(), child, err);
        if let Err(destroy) = env.sys_env_destroy(child) {
            log::warn!("[{}] cleanup of half-built {} failed: {}", env.getenvid(), child, destroy);
        }
        return Err(err);
    }
    log::debug!("[{}] forked {}{}", env.getenvid(), child, if share { " (shared)" } else { "" });
    Ok(child)
}

fn populate(env: &mut dyn KernelApi, child: EnvId, share: bool) -> Result<(), UserError> {
    let mut va = 0u32;
    while va < UTOP {
        if !env.vpd(va).is_present() {
            va = round_down(va, PTSIZE) + PTSIZE;
            continue;
        }
        if va != UXSTACKTOP - PGSIZE && env.vpt(va).is_present() {
            if share && !in_stack(va) {
                sharepage(env, child, va)?;
            } else {
                duppage(env, child, va)?;
            }
        }
        va += PGSIZE;
    }

    env.sys_page_alloc(child, UXSTACKTOP - PGSIZE, PteFlags::user_write())?;
    env.sys_env_set_pgfault_upcall(child, PGFAULT_UPCALL)?;
    env.sys_env_set_status(child, EnvStatus::Runnable)
}

/// The normal stack region below `USTACKTOP`
fn in_stack(va: u32) -> bool {
    (USTACKTOP - PTSIZE..USTACKTOP).contains(&va)
}

/// Maps the page at `va` into `child` with fork semantics
pub fn duppage(env: &mut dyn KernelApi, child: EnvId, va: u32) -> Result<(), UserError> {
    let flags = env.vpt(va).flags();
    if flags.contains(PteFlags::SHARE) {
        return env.sys_page_map(EnvId::CURRENT, va, child, va, flags & PteFlags::USER_SETTABLE);
    }
    if flags.intersects(PteFlags::WRITABLE | PteFlags::COW) {
        let cow = PteFlags::user_read() | PteFlags::COW;
        env.sys_page_map(EnvId::CURRENT, va, child, va, cow)?;
        // remapping the parent last keeps the page from being written between
        // the two mappings
        return env.sys_page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, cow);
    }
    env.sys_page_map(EnvId::CURRENT, va, child, va, PteFlags::user_read())
}

fn sharepage(env: &mut dyn KernelApi, child: EnvId, va: u32) -> Result<(), UserError> {
    let flags = env.vpt(va).flags();
    let perm = (flags & PteFlags::USER_SETTABLE) | PteFlags::SHARE;
    env.sys_page_map(EnvId::CURRENT, va, child, va, perm)?;
    if !flags.contains(PteFlags::SHARE) {
        env.sys_page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, perm)?;
    }
    Ok(())
}
