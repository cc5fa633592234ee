//! Traps: the simulated MMU, page fault reflection and the timer
//!
//! User memory accesses go through [`Kernel::user_read`] and
//! [`Kernel::user_write`], which walk the caller's page tables, check the
//! permission bits and set the accessed and dirty bits the way the hardware
//! would. A failed check produces a [`PageFault`], which
//! [`Kernel::page_fault`] either reflects to the environment's user-level
//! handler or answers by destroying the environment.

use crate::audit::KernelEvent;
use crate::{FaultKind, Kernel};
use core_types::memory::{pgoff, PGSIZE, UXSTACKTOP};
use core_types::{EnvId, Frame, PteFlags};
use kernel_api::trapframe::{FEC_PR, FEC_U, FEC_WR, T_PGFLT};
use kernel_api::{KernelError, UTrapframe};

/// A faulting user access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub va: u32,
    /// Hardware error code (`FEC_*` bits)
    pub err: u32,
    pub kind: FaultKind,
}

impl PageFault {
    pub fn is_write(&self) -> bool {
        self.err & FEC_WR != 0
    }
}

impl Kernel {
    /// Checks one page-contained access and sets the status bits
    fn access(&mut self, id: EnvId, va: u32, write: bool) -> Result<(), PageFault> {
        let Some(env) = self.envs.get_mut(id.raw()) else {
            return Err(PageFault {
                va,
                err: FEC_U | if write { FEC_WR } else { 0 },
                kind: FaultKind::NotPresent,
            });
        };
        if let Some(kind) = env.space.translate_fault(&self.pages, va, write) {
            let mut err = FEC_U;
            if write {
                err |= FEC_WR;
            }
            if kind != FaultKind::NotPresent {
                err |= FEC_PR;
            }
            return Err(PageFault { va, err, kind });
        }
        let mut bits = PteFlags::ACCESSED;
        if write {
            bits |= PteFlags::DIRTY;
        }
        env.space.mark(&mut self.pages, va, bits);
        Ok(())
    }

    /// Copies user memory at `va` into `buf`
    ///
    /// Stops at the first faulting page; bytes before it have been read.
    pub fn user_read(&mut self, id: EnvId, va: u32, buf: &mut [u8]) -> Result<(), PageFault> {
        let mut done = 0usize;
        while done < buf.len() {
            let at = va.wrapping_add(done as u32);
            let chunk = ((PGSIZE - pgoff(at)) as usize).min(buf.len() - done);
            self.access(id, at, false)?;
            let frame = self.frame_at(id, at);
            let off = pgoff(at) as usize;
            buf[done..done + chunk].copy_from_slice(&self.pages.bytes(frame)[off..off + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` into user memory at `va`
    ///
    /// Stops at the first faulting page; bytes before it have been written.
    pub fn user_write(&mut self, id: EnvId, va: u32, data: &[u8]) -> Result<(), PageFault> {
        let mut done = 0usize;
        while done < data.len() {
            let at = va.wrapping_add(done as u32);
            let chunk = ((PGSIZE - pgoff(at)) as usize).min(data.len() - done);
            self.access(id, at, true)?;
            let frame = self.frame_at(id, at);
            let off = pgoff(at) as usize;
            self.pages.bytes_mut(frame)[off..off + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn frame_at(&self, id: EnvId, va: u32) -> Frame {
        self.env(id)
            .map(|env| env.space.pte(&self.pages, va).frame())
            .unwrap_or(Frame(0))
    }

    /// Handles a page fault taken by `id`
    ///
    /// On success the fault record has been pushed onto the exception stack
    /// and the environment's registers point at its upcall; the returned
    /// value is the record's address. Otherwise the environment has been
    /// destroyed (or, for a fault in kernel mode, the machine halted).
    pub fn page_fault(&mut self, id: EnvId, fault: PageFault) -> Result<u32, KernelError> {
        let Some(env) = self.env_mut(id) else {
            return Err(KernelError::UnknownEnvironment);
        };
        env.tf.trapno = T_PGFLT;
        env.tf.err = fault.err;
        let tf = env.tf;
        let upcall = env.pgfault_upcall;

        if !tf.is_user() {
            self.halt(format!("kernel fault va {:08x} ip {:08x}", fault.va, tf.eip));
            return Err(KernelError::MemoryFault);
        }

        if upcall == 0 {
            return Err(self.kill(id, fault.va, format!("user fault va {:08x} ip {:08x}", fault.va, tf.eip)));
        }

        let on_exception_stack = (UXSTACKTOP - PGSIZE..UXSTACKTOP).contains(&tf.esp);
        let top = if on_exception_stack {
            tf.esp - 4
        } else {
            UXSTACKTOP
        };
        let Some(addr) = top.checked_sub(UTrapframe::SIZE) else {
            return Err(self.kill(id, fault.va, "exception stack overflow".to_string()));
        };

        let writable = self
            .env(id)
            .map(|env| {
                env.space
                    .check_user(&self.pages, addr, UTrapframe::SIZE, PteFlags::WRITABLE)
            })
            .unwrap_or(Err(addr));
        if let Err(bad) = writable {
            return Err(self.kill(
                id,
                fault.va,
                format!("user_mem_check assertion failure for va {:08x}", bad),
            ));
        }

        let record = UTrapframe {
            fault_va: fault.va,
            err: fault.err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        };
        if self.user_write(id, addr, &record.encode()).is_err() {
            return Err(self.kill(id, fault.va, "exception stack not writable".to_string()));
        }

        if let Some(env) = self.env_mut(id) {
            env.tf.esp = addr;
            env.tf.eip = upcall;
        }
        log::debug!("[{}] page fault va {:08x} reflected, utf at {:08x}", id, fault.va, addr);
        self.audit.record(KernelEvent::FaultReflected {
            env: id,
            fault_va: fault.va,
            utf_addr: addr,
        });
        Ok(addr)
    }

    /// Destroys an environment that took a fault it cannot survive
    pub fn kill(&mut self, id: EnvId, fault_va: u32, reason: String) -> KernelError {
        log::error!("[{}] {}", id, reason);
        self.audit.record(KernelEvent::UserFault {
            env: id,
            fault_va,
            reason,
        });
        self.env_destroy(id);
        KernelError::MemoryFault
    }

    /// Advances the timer by one tick
    ///
    /// Returns true when the running environment's time slice is used up.
    pub fn clock_tick(&mut self) -> bool {
        self.ticks += 1;
        match self.config.time_slice {
            Some(slice) if slice > 0 => self.ticks % slice == 0,
            _ => false,
        }
    }
}
