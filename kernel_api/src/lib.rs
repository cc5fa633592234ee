//! # Kernel API
//!
//! This crate defines the interface between user-level code and the kernel.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Environment creation by exofork (an empty copy), not full process fork
//! - Rendezvous message passing with optional page transfer
//! - Page-granular memory management driven from user space
//! - Page faults reflected back to user-level handlers
//!
//! Copy-on-write fork, the send retry loop and the file system are built on
//! top of these mechanisms by user-level code.
//!
//! ## Design Goals
//!
//! 1. **Testability**: Everything above the kernel talks to it through the
//!    [`KernelApi`] trait
//! 2. **Stable error codes**: [`KernelError`] values map one-to-one onto the
//!    negative integers carried in registers and IPC values
//! 3. **Typed system calls**: the gate dispatches a [`Syscall`] value

pub mod error;
pub mod kernel;
pub mod syscalls;
pub mod trapframe;

pub use error::{KernelError, UserError};
pub use kernel::{EnvInfo, EnvStatus, IpcState, KernelApi, PgFaultHandler};
pub use syscalls::{Syscall, SyscallResult};
pub use trapframe::{PushRegs, TrapFrame, UTrapframe};
