//! # User Library
//!
//! The library every user environment links against. It turns the kernel's
//! minimal primitives into the operations programs actually use.
//!
//! ## Philosophy
//!
//! - **Policy lives in user space**: fork, copy-on-write and message retry
//!   are built here from exofork, page mappings and the IPC primitives.
//! - **One interface**: everything takes `&mut dyn KernelApi`, so the same
//!   code runs inside any environment of any machine.
//!
//! ## Modules
//!
//! - [`ipc`]: blocking send and receive
//! - [`pgfault`]: user-level page fault handler installation and the
//!   copy-on-write handler
//! - [`fork`]: copy-on-write `fork` and shared-memory `sfork`

pub mod fork;
pub mod ipc;
pub mod pgfault;

pub use fork::{duppage, fork, sfork};
pub use ipc::{ipc_recv, ipc_send, Message};
pub use pgfault::{cow_pgfault, set_pgfault_handler, PGFAULT_UPCALL};

use core_types::EnvId;
use kernel_api::{EnvStatus, KernelApi, UserError};

/// Destroys the calling environment
pub fn exit(env: &mut dyn KernelApi) -> Result<(), UserError> {
    env.sys_env_destroy(EnvId::CURRENT)
}

/// Yields until `child` no longer exists
pub fn wait(env: &mut dyn KernelApi, child: EnvId) -> Result<(), UserError> {
    while let Some(info) = env.env_info(child) {
        if info.status == EnvStatus::Free {
            break;
        }
        env.sys_yield()?;
    }
    Ok(())
}
