//! Typed system calls
//!
//! Every kernel entry from user level is one [`Syscall`] value. The gate in
//! the kernel dispatches on it and produces a [`SyscallResult`], which
//! [`to_abi`] folds into the single signed integer returned in `eax`.

use crate::{EnvStatus, KernelError, TrapFrame};
use core_types::{EnvId, PteFlags};
use serde::{Deserialize, Serialize};

/// A system call and its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Syscall {
    /// Print a string to the console
    Cputs { text: String },
    Getenvid,
    Yield,
    EnvDestroy { envid: EnvId },
    /// Allocate a new environment as a register-level copy of the caller
    Exofork,
    EnvSetStatus { envid: EnvId, status: EnvStatus },
    EnvSetTrapframe { envid: EnvId, tf: TrapFrame },
    EnvSetPgfaultUpcall { envid: EnvId, upcall: u32 },
    PageAlloc { envid: EnvId, va: u32, perm: PteFlags },
    PageMap {
        src_env: EnvId,
        src_va: u32,
        dst_env: EnvId,
        dst_va: u32,
        perm: PteFlags,
    },
    PageUnmap { envid: EnvId, va: u32 },
    IpcTrySend {
        envid: EnvId,
        value: u32,
        src_va: u32,
        perm: PteFlags,
    },
    IpcRecv { dst_va: u32 },
}

impl Syscall {
    /// Short name for logs and audit records
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cputs { .. } => "cputs",
            Self::Getenvid => "getenvid",
            Self::Yield => "yield",
            Self::EnvDestroy { .. } => "env_destroy",
            Self::Exofork => "exofork",
            Self::EnvSetStatus { .. } => "env_set_status",
            Self::EnvSetTrapframe { .. } => "env_set_trapframe",
            Self::EnvSetPgfaultUpcall { .. } => "env_set_pgfault_upcall",
            Self::PageAlloc { .. } => "page_alloc",
            Self::PageMap { .. } => "page_map",
            Self::PageUnmap { .. } => "page_unmap",
            Self::IpcTrySend { .. } => "ipc_try_send",
            Self::IpcRecv { .. } => "ipc_recv",
        }
    }
}

/// Outcome of a system call: a non-negative value or an error
pub type SyscallResult = Result<u32, KernelError>;

/// Folds a result into the value left in the return register
pub fn to_abi(result: SyscallResult) -> i32 {
    match result {
        Ok(value) => value as i32,
        Err(err) => err.code(),
    }
}
