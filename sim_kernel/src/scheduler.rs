//! Round-robin scheduler
//!
//! ## Philosophy
//!
//! - **Mechanism, not policy**: no priorities, no fairness accounting.
//! - **Determinism first**: the same table state always yields the same pick.
//! - **No silent spinning**: when nothing can run the machine halts, and the
//!   halt is recorded.
//!
//! ## Design
//!
//! The scan starts at the slot after the current environment (slot 1 if no
//! environment is current), wraps around, and skips slot 0. Slot 0 holds
//! the idle environment, which only runs when no other environment is
//! runnable. The current environment is picked again only after every other
//! slot was considered.

use crate::Kernel;
use core_types::EnvId;
use kernel_api::EnvStatus;

impl Kernel {
    /// Picks the next environment and switches to it
    ///
    /// Returns `None` (and halts the machine) when nothing is runnable.
    pub fn sched_yield(&mut self) -> Option<EnvId> {
        let nenv = self.nenv();
        let start = match self.curenv.and_then(|id| self.envs.resolve(id.raw())) {
            Some(index) => index + 1,
            None => 1,
        };

        let mut index = start;
        for _ in 1..nenv {
            if index >= nenv {
                index = 1;
            }
            if let Some(id) = self.runnable_at(index) {
                self.env_run(id);
                return Some(id);
            }
            index += 1;
        }

        if let Some(idle) = self.runnable_at(0) {
            self.env_run(idle);
            return Some(idle);
        }

        self.halt("no runnable environments in the system");
        None
    }

    fn runnable_at(&self, index: usize) -> Option<EnvId> {
        self.env_at(index)
            .filter(|env| env.status == EnvStatus::Runnable)
            .map(|env| env.id)
    }
}
