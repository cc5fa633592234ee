//! # Simulated Kernel
//!
//! This crate provides an in-process exokernel: physical page frames,
//! two-level page tables, environments, a round-robin scheduler, rendezvous
//! IPC and user-level page fault reflection.
//!
//! ## Purpose
//!
//! The simulated kernel allows testing system behavior without hardware:
//! - Runs under `cargo test`
//! - Deterministic (single CPU, no real concurrency, explicit timer ticks)
//! - Inspectable (all state is accessible)
//!
//! ## Philosophy
//!
//! **The kernel provides mechanism; user code provides policy.**
//!
//! The kernel hands out pages, page mappings and environments, and moves
//! one word (plus optionally one page) per IPC message. Fork, copy-on-write,
//! the file system and its clients are built entirely at user level on top
//! of these primitives.
//!
//! ## Layout
//!
//! [`Kernel`] holds all kernel state and implements every system call
//! (`syscall_gate`). [`Machine`] adds the CPU: it owns the user programs,
//! runs them when the scheduler picks their environment, and gives each one
//! a [`UserEnv`] through which it reaches the kernel.

pub mod address_space;
pub mod audit;
pub mod env;
pub mod ipc;
pub mod machine;
pub mod page_alloc;
pub mod scheduler;
pub mod syscall_gate;
pub mod trap;

pub use address_space::{AddressSpace, FaultKind};
pub use audit::{KernelAuditLog, KernelEvent};
pub use env::Env;
pub use machine::{Machine, Program, ProgramStatus, UserEnv};
pub use trap::PageFault;

use address_space::KernelTables;
use core_types::{EnvId, SlotTable};
use kernel_api::KernelError;
use page_alloc::PageAllocator;

/// Kernel configuration
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Size of the environment table; rounded up to a power of two, at most 4096
    pub nenv: usize,
    /// Number of physical page frames
    pub npages: usize,
    /// Create the idle environment in slot 0 at boot
    pub spawn_idle: bool,
    /// Preempt the running environment every this many system calls
    pub time_slice: Option<u64>,
    /// Consecutive scheduler passes without progress before a waiting
    /// environment is declared deadlocked
    pub max_spin: u64,
    /// Consecutive reflected faults on one access before the environment
    /// is destroyed
    pub max_fault_retries: u32,
    /// Most kernel audit events kept at once
    pub audit_limit: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            nenv: 1024,
            npages: 8192,
            spawn_idle: true,
            time_slice: None,
            max_spin: 100_000,
            max_fault_retries: 16,
            audit_limit: audit::DEFAULT_AUDIT_LIMIT,
        }
    }
}

/// Simulated kernel state
///
/// This maintains all the state needed to simulate the kernel.
/// Unlike a real kernel, this state is directly accessible for testing.
pub struct Kernel {
    config: KernelConfig,
    pages: PageAllocator,
    kernel_tables: KernelTables,
    envs: SlotTable<Env>,
    /// Environment whose registers are loaded
    curenv: Option<EnvId>,
    /// Set once the scheduler finds nothing to run
    halted: Option<String>,
    /// Timer ticks (one per system call)
    ticks: u64,
    console: String,
    audit: KernelAuditLog,
}

impl Kernel {
    /// Boots a kernel: physical memory, the kernel page tables and an empty
    /// environment table
    pub fn new(mut config: KernelConfig) -> Result<Self, KernelError> {
        config.nenv = config.nenv.clamp(2, env::ENV_ID_STRIDE as usize).next_power_of_two();
        let mut pages = PageAllocator::new(config.npages);
        let kernel_tables = KernelTables::boot(&mut pages)?;
        log::info!(
            "kernel booted: {} envs, {} pages ({} free)",
            config.nenv,
            pages.npages(),
            pages.free_count()
        );
        let audit = KernelAuditLog::with_limit(config.audit_limit);
        Ok(Self {
            envs: SlotTable::new(config.nenv, env::ENV_ID_STRIDE),
            config,
            pages,
            kernel_tables,
            curenv: None,
            halted: None,
            ticks: 0,
            console: String::new(),
            audit,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Physical memory, for inspection
    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub fn curenv(&self) -> Option<EnvId> {
        self.curenv
    }

    /// Why the machine stopped, if it did
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Everything written with `cputs` so far
    pub fn console(&self) -> &str {
        &self.console
    }

    pub fn take_console(&mut self) -> String {
        std::mem::take(&mut self.console)
    }

    /// Returns a reference to the audit log
    pub fn audit_log(&self) -> &KernelAuditLog {
        &self.audit
    }

    pub fn clear_audit_log(&mut self) {
        self.audit.clear();
    }

    fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::error!("halting: {}", reason);
        self.audit.record(KernelEvent::Halted {
            reason: reason.clone(),
        });
        self.halted = Some(reason);
        self.curenv = None;
    }
}
