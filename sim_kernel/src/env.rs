//! Environments
//!
//! An environment is an address space plus the saved registers of the one
//! thread running in it. Environments live in a fixed table; an [`EnvId`]
//! names a table slot together with the slot's generation, so an id kept
//! after its environment was freed never reaches the slot's next occupant.
//!
//! Lifecycle: `Free -> Runnable <-> NotRunnable -> Dying -> Free`.

use crate::address_space::AddressSpace;
use crate::audit::KernelEvent;
use crate::Kernel;
use core_types::memory::{PGSIZE, USTACKTOP, UTEXT};
use core_types::{EnvId, PteFlags};
use kernel_api::{EnvInfo, EnvStatus, IpcState, KernelError, PgFaultHandler, TrapFrame};

/// log2 of the distance between two generations of one slot
pub const ENVGENSHIFT: u32 = 12;
pub const ENV_ID_STRIDE: u32 = 1 << ENVGENSHIFT;

/// One environment table entry
pub struct Env {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    /// Number of times the environment was switched to
    pub runs: u32,
    /// Registers saved when the environment last left user mode
    pub tf: TrapFrame,
    pub space: AddressSpace,
    /// User-level page fault entry point, 0 if none
    pub pgfault_upcall: u32,
    pub ipc: IpcState,
    /// Handler the fault entry point dispatches to (part of the user image)
    pub user_handler: Option<PgFaultHandler>,
}

impl Env {
    pub fn info(&self) -> EnvInfo {
        EnvInfo {
            id: self.id,
            parent_id: self.parent_id,
            status: self.status,
            runs: self.runs,
            pgfault_upcall: self.pgfault_upcall,
            ipc: self.ipc,
            tf: self.tf,
        }
    }
}

impl Kernel {
    /// Allocates an environment with an empty user address space
    ///
    /// The new environment is runnable, starts at `UTEXT` with its stack
    /// pointer at `USTACKTOP`, and has no stack page yet.
    pub fn env_alloc(&mut self, parent: EnvId) -> Result<EnvId, KernelError> {
        if self.envs.len() == self.envs.capacity() {
            return Err(KernelError::NoFreeEnvironmentSlot);
        }
        let space = AddressSpace::create(&mut self.pages, &self.kernel_tables)?;
        let id = self
            .envs
            .insert_with(|raw| Env {
                id: EnvId(raw),
                parent_id: parent,
                status: EnvStatus::Runnable,
                runs: 0,
                tf: TrapFrame::user(USTACKTOP, UTEXT),
                space,
                pgfault_upcall: 0,
                ipc: IpcState::default(),
                user_handler: None,
            })
            .map(EnvId)
            .ok_or(KernelError::NoFreeEnvironmentSlot)?;

        log::info!("[{}] new env {}", parent, id);
        self.audit.record(KernelEvent::EnvAllocated { env: id, parent });
        Ok(id)
    }

    /// Allocates an environment and gives it a one-page stack below
    /// `USTACKTOP`
    pub fn env_create(&mut self) -> Result<EnvId, KernelError> {
        let id = self.env_alloc(EnvId::CURRENT)?;
        if let Err(err) = self.page_alloc(id, USTACKTOP - PGSIZE, PteFlags::user_write()) {
            self.env_free(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Releases the environment's memory and returns its slot
    pub fn env_free(&mut self, id: EnvId) {
        let Some(env) = self.envs.get_mut(id.raw()) else {
            return;
        };
        env.status = EnvStatus::Dying;
        let by = self.curenv.unwrap_or(EnvId::CURRENT);
        if let Some(env) = self.envs.remove(id.raw()) {
            env.space.destroy(&mut self.pages);
        }
        log::info!("[{}] free env {}", by, id);
        self.audit.record(KernelEvent::EnvFreed { env: id });
    }

    /// Destroys an environment in any state
    ///
    /// If it was the current environment, no environment is current
    /// afterwards and the caller must schedule.
    pub fn env_destroy(&mut self, id: EnvId) {
        self.env_free(id);
        if self.curenv == Some(id) {
            self.curenv = None;
        }
    }

    /// Resolves an envid on behalf of `caller`
    ///
    /// `EnvId::CURRENT` names the caller. With `checkperm` the target must be
    /// the caller or one of its immediate children.
    pub fn envid2env(&self, caller: EnvId, id: EnvId, checkperm: bool) -> Result<EnvId, KernelError> {
        let id = if id.is_current() { caller } else { id };
        let env = self.envs.get(id.raw()).ok_or(KernelError::UnknownEnvironment)?;
        if checkperm && env.id != caller && env.parent_id != caller {
            return Err(KernelError::UnknownEnvironment);
        }
        Ok(env.id)
    }

    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id.raw())
    }

    pub fn env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs.get_mut(id.raw())
    }

    /// Environment in a table slot, whatever its id
    pub fn env_at(&self, index: usize) -> Option<&Env> {
        self.envs.at(index)
    }

    pub fn is_live(&self, id: EnvId) -> bool {
        self.envs.contains(id.raw())
    }

    /// Status of an environment; `Free` once its id no longer resolves
    pub fn status(&self, id: EnvId) -> EnvStatus {
        self.env(id).map_or(EnvStatus::Free, |env| env.status)
    }

    /// Ids of all allocated environments in slot order
    pub fn env_ids(&self) -> Vec<EnvId> {
        self.envs.iter().map(|(raw, _)| EnvId(raw)).collect()
    }

    pub fn nenv(&self) -> usize {
        self.envs.capacity()
    }

    /// Switches the CPU to `id`
    ///
    /// Counts a run only when the environment was not already current.
    pub fn env_run(&mut self, id: EnvId) {
        if self.curenv == Some(id) {
            return;
        }
        if let Some(env) = self.envs.get_mut(id.raw()) {
            env.runs += 1;
            let runs = env.runs;
            self.curenv = Some(id);
            log::trace!("run env {} ({} runs)", id, runs);
            self.audit.record(KernelEvent::EnvRun { env: id, runs });
        }
    }
}
