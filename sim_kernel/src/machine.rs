//! The machine: one CPU running user code on top of the kernel
//!
//! ## Execution model
//!
//! User code is ordinary Rust that reaches the kernel through
//! [`KernelApi`]. It runs in one of two ways:
//!
//! - **Entered**: a test drives an environment directly with
//!   [`Machine::enter`], running a closure as that environment.
//! - **Programs**: an environment can own a [`Program`], a resumable state
//!   machine. Whenever the scheduler picks that environment, the program's
//!   `resume` runs until it gives the CPU back.
//!
//! A blocking call (`sys_yield`, `sys_ipc_recv`) runs the scheduler until it
//! picks the caller again, resuming the programs of the environments it
//! picks along the way. Activations therefore nest on the host stack; an
//! environment with a live activation is never resumed a second time.
//!
//! ## Failure
//!
//! - Nothing runnable: the kernel halts and blocked callers get
//!   [`UserError::Halted`].
//! - A blocked caller the scheduler can never reach again (only the idle
//!   environment or other blocked activations are left) gets
//!   [`UserError::Deadlock`] instead of spinning forever.
//! - A program returning an error has its environment destroyed.

use crate::{Kernel, KernelConfig, PageFault};
use core_types::{EnvId, Pte, PteFlags};
use kernel_api::{
    EnvInfo, EnvStatus, KernelApi, KernelError, PgFaultHandler, Syscall, TrapFrame, UTrapframe,
    UserError,
};
use std::collections::HashMap;

/// What a program did with the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStatus {
    /// Gave the CPU back; resume it when its environment runs again
    Yielded,
    /// Finished; its environment is destroyed
    Exited,
}

/// User code that runs whenever its environment is scheduled
pub trait Program {
    fn name(&self) -> &str;

    /// Runs until the program blocks or finishes
    fn resume(&mut self, env: &mut dyn KernelApi) -> Result<ProgramStatus, UserError>;
}

/// The kernel plus the CPU that runs user programs
pub struct Machine {
    kernel: Kernel,
    programs: HashMap<EnvId, Box<dyn Program>>,
    /// Environments with an activation on the host stack, innermost last
    active: Vec<EnvId>,
    /// Consecutive blocking calls that came back without running anyone
    spin: u64,
}

impl Machine {
    /// Boots the kernel and, if configured, the idle environment in slot 0
    pub fn boot(config: KernelConfig) -> Result<Self, KernelError> {
        let spawn_idle = config.spawn_idle;
        let mut kernel = Kernel::new(config)?;
        if spawn_idle {
            let idle = kernel.env_alloc(EnvId::CURRENT)?;
            log::info!("idle environment {}", idle);
        }
        Ok(Self {
            kernel,
            programs: HashMap::new(),
            active: Vec::new(),
            spin: 0,
        })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    /// Creates a runnable environment with a stack page and no program
    pub fn create_env(&mut self) -> Result<EnvId, KernelError> {
        self.kernel.env_create()
    }

    /// Creates an environment that runs `program`
    pub fn spawn(&mut self, program: Box<dyn Program>) -> Result<EnvId, KernelError> {
        let id = self.kernel.env_create()?;
        log::info!("[{}] spawned {}", id, program.name());
        self.programs.insert(id, program);
        Ok(id)
    }

    /// Gives an existing environment a program to run
    pub fn attach(&mut self, env: EnvId, program: Box<dyn Program>) -> Result<(), KernelError> {
        if !self.kernel.is_live(env) {
            return Err(KernelError::UnknownEnvironment);
        }
        self.programs.insert(env, program);
        Ok(())
    }

    pub fn has_program(&self, env: EnvId) -> bool {
        self.programs.contains_key(&env)
    }

    /// Runs `f` as environment `env`
    ///
    /// The environment must be runnable and must not already be running.
    pub fn enter<R, F>(&mut self, env: EnvId, f: F) -> Result<R, UserError>
    where
        F: FnOnce(&mut UserEnv<'_>) -> Result<R, UserError>,
    {
        match self.kernel.status(env) {
            EnvStatus::Runnable => {}
            EnvStatus::Free => return Err(KernelError::UnknownEnvironment.into()),
            _ => return Err(KernelError::InvalidArgument.into()),
        }
        if self.active.contains(&env) {
            return Err(KernelError::InvalidArgument.into());
        }
        self.kernel.env_run(env);
        self.active.push(env);
        let result = f(&mut UserEnv::new(self, env));
        self.active.pop();
        result
    }

    /// Runs programs until none of them is runnable
    pub fn run_until_idle(&mut self) -> Result<(), UserError> {
        let budget = self.kernel.config().max_spin;
        let mut passes = 0u64;
        while self.has_ready_program() {
            let Some(next) = self.kernel.sched_yield() else {
                return Err(self.halted_error());
            };
            if self.dispatchable(next) {
                self.dispatch(next)?;
            }
            passes += 1;
            if passes > budget {
                log::error!("programs still runnable after {} passes", passes);
                return Err(UserError::Deadlock(next));
            }
        }
        Ok(())
    }

    fn has_ready_program(&self) -> bool {
        self.programs
            .keys()
            .any(|id| self.dispatchable(*id) && self.kernel.status(*id) == EnvStatus::Runnable)
    }

    fn dispatchable(&self, id: EnvId) -> bool {
        self.programs.contains_key(&id) && !self.active.contains(&id)
    }

    fn halted_error(&self) -> UserError {
        UserError::Halted(
            self.kernel
                .halted()
                .unwrap_or("no runnable environments")
                .to_string(),
        )
    }

    /// Resumes the program of an environment the scheduler just picked
    fn dispatch(&mut self, id: EnvId) -> Result<(), UserError> {
        let Some(mut program) = self.programs.remove(&id) else {
            return Ok(());
        };
        self.active.push(id);
        let outcome = program.resume(&mut UserEnv::new(self, id));
        self.active.pop();

        let live = self.kernel.is_live(id);
        let mut halted = None;
        match outcome {
            Ok(ProgramStatus::Yielded) => {}
            Ok(ProgramStatus::Exited) => {
                if live {
                    log::debug!("[{}] {} exited", id, program.name());
                    self.kernel.env_destroy(id);
                }
            }
            Err(UserError::Destroyed(_)) => {}
            Err(UserError::Halted(reason)) => halted = Some(reason),
            Err(err) => {
                if live {
                    log::error!("[{}] {} failed: {}", id, program.name(), err);
                    self.kernel.env_destroy(id);
                }
            }
        }
        if self.kernel.is_live(id) {
            self.programs.insert(id, program);
        } else {
            log::debug!("[{}] {} dropped", id, program.name());
        }
        match halted {
            Some(reason) => Err(UserError::Halted(reason)),
            None => Ok(()),
        }
    }

    /// Runs the scheduler until it picks `me` again
    fn wait_until_current(&mut self, me: EnvId) -> Result<(), UserError> {
        let limit = 2 * self.kernel.nenv();
        let mut stalls = 0usize;
        let mut progressed = false;
        loop {
            if !self.kernel.is_live(me) {
                return Err(UserError::Destroyed(me));
            }
            let Some(next) = self.kernel.sched_yield() else {
                return Err(self.halted_error());
            };
            if next == me {
                if progressed {
                    self.spin = 0;
                } else {
                    self.spin += 1;
                    if self.spin > self.kernel.config().max_spin {
                        self.spin = 0;
                        log::error!("[{}] spinning without progress", me);
                        return Err(UserError::Deadlock(me));
                    }
                }
                return Ok(());
            }
            if self.dispatchable(next) {
                self.dispatch(next)?;
                progressed = true;
                stalls = 0;
            } else {
                stalls += 1;
                if stalls > limit {
                    log::error!("[{}] blocked with nothing left to run", me);
                    return Err(UserError::Deadlock(me));
                }
            }
        }
    }
}

/// One environment's view of the machine
///
/// Implements [`KernelApi`] for code running as that environment.
pub struct UserEnv<'m> {
    machine: &'m mut Machine,
    id: EnvId,
}

impl<'m> UserEnv<'m> {
    fn new(machine: &'m mut Machine, id: EnvId) -> Self {
        Self { machine, id }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn kernel(&self) -> &Kernel {
        &self.machine.kernel
    }

    fn ensure_live(&self) -> Result<(), UserError> {
        if self.machine.kernel.is_live(self.id) {
            Ok(())
        } else {
            Err(UserError::Destroyed(self.id))
        }
    }

    /// Traps into the kernel
    ///
    /// A timer tick may preempt the caller on the way out.
    fn syscall(&mut self, call: Syscall) -> Result<u32, UserError> {
        self.ensure_live()?;
        let result = self.machine.kernel.syscall(self.id, call);
        self.ensure_live()?;
        if self.machine.kernel.clock_tick()
            && self.machine.kernel.status(self.id) == EnvStatus::Runnable
        {
            log::trace!("[{}] preempted", self.id);
            self.block()?;
        }
        Ok(result?)
    }

    fn block(&mut self) -> Result<(), UserError> {
        self.machine.wait_until_current(self.id)
    }

    fn destroyed(&mut self, fault_va: u32, reason: String) -> UserError {
        if let Some(reason) = self.machine.kernel.halted() {
            return UserError::Halted(reason.to_string());
        }
        if self.machine.kernel.is_live(self.id) {
            self.machine.kernel.kill(self.id, fault_va, reason);
        }
        UserError::Destroyed(self.id)
    }

    /// Handles a fault taken by a memory access, then lets the caller retry
    fn fault(&mut self, fault: PageFault, faults: &mut u32) -> Result<(), UserError> {
        *faults += 1;
        if *faults > self.machine.kernel.config().max_fault_retries {
            return Err(self.destroyed(fault.va, format!("fault loop at va {:08x}", fault.va)));
        }
        let addr = match self.machine.kernel.page_fault(self.id, fault) {
            Ok(addr) => addr,
            Err(_) => return Err(self.destroyed(fault.va, String::new())),
        };

        // the user-level entry point: read the record, call the handler
        let mut raw = [0u8; UTrapframe::SIZE as usize];
        if self.machine.kernel.user_read(self.id, addr, &mut raw).is_err() {
            return Err(self.destroyed(fault.va, "fault record unreadable".to_string()));
        }
        let utf = UTrapframe::decode(&raw);
        let Some(handler) = self.pgfault_handler() else {
            return Err(self.destroyed(fault.va, "page fault upcall without a handler".to_string()));
        };
        match handler(self, &utf) {
            Ok(()) => {}
            Err(err @ UserError::Halted(_)) => return Err(err),
            Err(err) => {
                return Err(self.destroyed(fault.va, format!("page fault handler failed: {}", err)));
            }
        }

        // return to the faulting context
        if let Some(env) = self.machine.kernel.env_mut(self.id) {
            env.tf.regs = utf.regs;
            env.tf.eip = utf.eip;
            env.tf.eflags = utf.eflags;
            env.tf.esp = utf.esp;
        }
        Ok(())
    }
}

impl KernelApi for UserEnv<'_> {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn cputs(&mut self, text: &str) -> Result<(), UserError> {
        self.syscall(Syscall::Cputs {
            text: text.to_string(),
        })?;
        Ok(())
    }

    fn sys_yield(&mut self) -> Result<(), UserError> {
        self.syscall(Syscall::Yield)?;
        self.block()
    }

    fn sys_env_destroy(&mut self, envid: EnvId) -> Result<(), UserError> {
        self.syscall(Syscall::EnvDestroy { envid })?;
        Ok(())
    }

    fn sys_exofork(&mut self) -> Result<EnvId, UserError> {
        self.syscall(Syscall::Exofork).map(EnvId)
    }

    fn sys_env_set_status(&mut self, envid: EnvId, status: EnvStatus) -> Result<(), UserError> {
        self.syscall(Syscall::EnvSetStatus { envid, status })?;
        Ok(())
    }

    fn sys_env_set_trapframe(&mut self, envid: EnvId, tf: &TrapFrame) -> Result<(), UserError> {
        self.syscall(Syscall::EnvSetTrapframe { envid, tf: *tf })?;
        Ok(())
    }

    fn sys_env_set_pgfault_upcall(&mut self, envid: EnvId, upcall: u32) -> Result<(), UserError> {
        self.syscall(Syscall::EnvSetPgfaultUpcall { envid, upcall })?;
        Ok(())
    }

    fn sys_page_alloc(&mut self, envid: EnvId, va: u32, perm: PteFlags) -> Result<(), UserError> {
        self.syscall(Syscall::PageAlloc { envid, va, perm })?;
        Ok(())
    }

    fn sys_page_map(
        &mut self,
        src_env: EnvId,
        src_va: u32,
        dst_env: EnvId,
        dst_va: u32,
        perm: PteFlags,
    ) -> Result<(), UserError> {
        self.syscall(Syscall::PageMap {
            src_env,
            src_va,
            dst_env,
            dst_va,
            perm,
        })?;
        Ok(())
    }

    fn sys_page_unmap(&mut self, envid: EnvId, va: u32) -> Result<(), UserError> {
        self.syscall(Syscall::PageUnmap { envid, va })?;
        Ok(())
    }

    fn sys_ipc_try_send(
        &mut self,
        envid: EnvId,
        value: u32,
        src_va: u32,
        perm: PteFlags,
    ) -> Result<bool, UserError> {
        let sent = self.syscall(Syscall::IpcTrySend {
            envid,
            value,
            src_va,
            perm,
        })?;
        Ok(sent == 1)
    }

    fn sys_ipc_recv(&mut self, dst_va: u32) -> Result<(), UserError> {
        self.syscall(Syscall::IpcRecv { dst_va })?;
        self.block()
    }

    fn sys_ipc_recv_async(&mut self, dst_va: u32) -> Result<(), UserError> {
        self.syscall(Syscall::IpcRecv { dst_va })?;
        Ok(())
    }

    fn env_info(&self, envid: EnvId) -> Option<EnvInfo> {
        let id = if envid.is_current() { self.id } else { envid };
        self.machine.kernel.env(id).map(|env| env.info())
    }

    fn vpd(&self, va: u32) -> Pte {
        let kernel = &self.machine.kernel;
        kernel
            .env(self.id)
            .map_or(Pte::EMPTY, |env| env.space.pde(kernel.pages(), va))
    }

    fn vpt(&self, va: u32) -> Pte {
        let kernel = &self.machine.kernel;
        kernel
            .env(self.id)
            .map_or(Pte::EMPTY, |env| env.space.pte(kernel.pages(), va))
    }

    fn pageref(&self, va: u32) -> u32 {
        let pte = self.vpt(va);
        if pte.is_present() {
            self.machine.kernel.pages().refcount(pte.frame())
        } else {
            0
        }
    }

    fn read_bytes(&mut self, va: u32, buf: &mut [u8]) -> Result<(), UserError> {
        let mut faults = 0;
        loop {
            self.ensure_live()?;
            match self.machine.kernel.user_read(self.id, va, buf) {
                Ok(()) => return Ok(()),
                Err(fault) => self.fault(fault, &mut faults)?,
            }
        }
    }

    fn write_bytes(&mut self, va: u32, data: &[u8]) -> Result<(), UserError> {
        let mut faults = 0;
        loop {
            self.ensure_live()?;
            match self.machine.kernel.user_write(self.id, va, data) {
                Ok(()) => return Ok(()),
                Err(fault) => self.fault(fault, &mut faults)?,
            }
        }
    }

    fn pgfault_handler(&self) -> Option<PgFaultHandler> {
        self.machine.kernel.env(self.id).and_then(|env| env.user_handler)
    }

    fn set_pgfault_handler(&mut self, handler: Option<PgFaultHandler>) {
        if let Some(env) = self.machine.kernel.env_mut(self.id) {
            env.user_handler = handler;
        }
    }
}
