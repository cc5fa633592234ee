//! Kernel API trait and environment views

use crate::{TrapFrame, UTrapframe, UserError};
use core_types::memory::PGSIZE;
use core_types::{EnvId, Pte, PteFlags};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvStatus {
    /// Slot is unused
    Free,
    /// Eligible to be scheduled
    Runnable,
    /// Waiting (for IPC, or for its parent to finish setting it up)
    NotRunnable,
    /// Being torn down
    Dying,
}

/// Pending IPC state of an environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcState {
    /// Blocked in receive
    pub recving: bool,
    /// Where a transferred page should land; `>= UTOP` means no page wanted
    pub dstva: u32,
    /// Value of the last delivered message
    pub value: u32,
    /// Sender of the last delivered message
    pub from: EnvId,
    /// Permissions of the transferred page, empty if none was transferred
    pub perm: PteFlags,
}

/// Read-only view of an environment, as user code sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvInfo {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    pub runs: u32,
    pub pgfault_upcall: u32,
    pub ipc: IpcState,
    pub tf: TrapFrame,
}

/// User-level page fault handler
///
/// Runs on the exception stack of the faulting environment. An error return
/// is fatal to the environment.
pub type PgFaultHandler = fn(&mut dyn KernelApi, &UTrapframe) -> Result<(), UserError>;

/// The kernel interface seen from inside one environment
///
/// Every method acts on behalf of the calling environment. Envid arguments
/// accept [`EnvId::CURRENT`] to mean the caller.
///
/// Memory accessors go through the caller's page tables: permission bits are
/// checked, accessed and dirty bits are set, and faults are reflected to the
/// environment's page fault handler before the access is retried.
pub trait KernelApi {
    /// Identity of the calling environment
    fn getenvid(&self) -> EnvId;

    /// Writes a string to the console
    fn cputs(&mut self, text: &str) -> Result<(), UserError>;

    /// Gives up the CPU; returns once the caller is scheduled again
    fn sys_yield(&mut self) -> Result<(), UserError>;

    /// Destroys the caller or one of its children
    fn sys_env_destroy(&mut self, envid: EnvId) -> Result<(), UserError>;

    /// Creates a child with an empty user address space and a copy of the
    /// caller's registers, except that the child's return register is 0
    ///
    /// The child starts out not runnable.
    fn sys_exofork(&mut self) -> Result<EnvId, UserError>;

    /// Sets a child's status to runnable or not runnable
    fn sys_env_set_status(&mut self, envid: EnvId, status: EnvStatus) -> Result<(), UserError>;

    /// Installs a register frame for a child
    fn sys_env_set_trapframe(&mut self, envid: EnvId, tf: &TrapFrame) -> Result<(), UserError>;

    /// Registers the page fault entry point for an environment
    fn sys_env_set_pgfault_upcall(&mut self, envid: EnvId, upcall: u32) -> Result<(), UserError>;

    /// Allocates a zeroed page and maps it at `va`
    fn sys_page_alloc(&mut self, envid: EnvId, va: u32, perm: PteFlags) -> Result<(), UserError>;

    /// Maps the page at `src_va` in one environment at `dst_va` in another
    fn sys_page_map(
        &mut self,
        src_env: EnvId,
        src_va: u32,
        dst_env: EnvId,
        dst_va: u32,
        perm: PteFlags,
    ) -> Result<(), UserError>;

    /// Unmaps the page at `va`; unmapping nothing succeeds
    fn sys_page_unmap(&mut self, envid: EnvId, va: u32) -> Result<(), UserError>;

    /// Attempts one rendezvous send
    ///
    /// Returns `true` when a page was transferred. Fails with
    /// `IpcNotReceiving` when the target is not waiting in receive.
    fn sys_ipc_try_send(
        &mut self,
        envid: EnvId,
        value: u32,
        src_va: u32,
        perm: PteFlags,
    ) -> Result<bool, UserError>;

    /// Waits for a message; returns once one was delivered
    fn sys_ipc_recv(&mut self, dst_va: u32) -> Result<(), UserError>;

    /// Arms a receive and returns at once
    ///
    /// The caller stops being runnable; an event-driven program returns to
    /// the scheduler after this and is resumed when a message arrives.
    fn sys_ipc_recv_async(&mut self, dst_va: u32) -> Result<(), UserError>;

    /// Read-only view of any environment
    fn env_info(&self, envid: EnvId) -> Option<EnvInfo>;

    /// Page-directory entry covering `va` in the caller's address space
    fn vpd(&self, va: u32) -> Pte;

    /// Page-table entry for `va`; empty if its page table is absent
    fn vpt(&self, va: u32) -> Pte;

    /// Number of mappings of the physical page behind `va`, 0 if unmapped
    fn pageref(&self, va: u32) -> u32;

    /// Reads user memory
    fn read_bytes(&mut self, va: u32, buf: &mut [u8]) -> Result<(), UserError>;

    /// Writes user memory
    fn write_bytes(&mut self, va: u32, data: &[u8]) -> Result<(), UserError>;

    /// The handler the user-level fault entry point dispatches to
    ///
    /// Part of the environment's user image: a child created by exofork
    /// starts with its parent's value.
    fn pgfault_handler(&self) -> Option<PgFaultHandler>;

    fn set_pgfault_handler(&mut self, handler: Option<PgFaultHandler>);

    /// View of the calling environment
    fn thisenv(&self) -> EnvInfo {
        match self.env_info(self.getenvid()) {
            Some(info) => info,
            None => EnvInfo {
                id: self.getenvid(),
                parent_id: EnvId::CURRENT,
                status: EnvStatus::Free,
                runs: 0,
                pgfault_upcall: 0,
                ipc: IpcState::default(),
                tf: TrapFrame::default(),
            },
        }
    }

    fn read_u32(&mut self, va: u32) -> Result<u32, UserError> {
        let mut buf = [0u8; 4];
        self.read_bytes(va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&mut self, va: u32, value: u32) -> Result<(), UserError> {
        self.write_bytes(va, &value.to_le_bytes())
    }

    /// Reads one whole page
    fn read_page(&mut self, va: u32) -> Result<Vec<u8>, UserError> {
        let mut buf = vec![0u8; PGSIZE as usize];
        self.read_bytes(va, &mut buf)?;
        Ok(buf)
    }

    /// True if `va` is backed by a present mapping
    fn va_is_mapped(&self, va: u32) -> bool {
        self.vpd(va).is_present() && self.vpt(va).is_present()
    }
}
