//! Kernel audit log
//!
//! Test-facing record of the kernel's significant state changes. Nothing in
//! the kernel reads it back; tests use it to assert on what happened without
//! scraping log output.

use core_types::EnvId;
use serde::{Deserialize, Serialize};

/// Kernel audit events (test-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelEvent {
    /// Environment allocated
    EnvAllocated { env: EnvId, parent: EnvId },
    /// Environment freed and its slot returned
    EnvFreed { env: EnvId },
    /// Context switch to an environment
    EnvRun { env: EnvId, runs: u32 },
    /// Message delivered to a receiving environment
    IpcDelivered {
        from: EnvId,
        to: EnvId,
        value: u32,
        page_transferred: bool,
    },
    /// Page fault reflected to the user-level handler
    FaultReflected { env: EnvId, fault_va: u32, utf_addr: u32 },
    /// Environment destroyed because of a fault it could not handle
    UserFault { env: EnvId, fault_va: u32, reason: String },
    /// Nothing left to run, or the kernel itself faulted
    Halted { reason: String },
}

/// Default bound on retained events
pub const DEFAULT_AUDIT_LIMIT: usize = 65_536;

/// Audit log for kernel operations
///
/// Holds at most `limit` events. Once full, the oldest half is discarded to
/// make room, so a long run keeps its recent history.
#[derive(Debug, Clone)]
pub struct KernelAuditLog {
    events: Vec<KernelEvent>,
    limit: usize,
    dropped: u64,
}

impl KernelAuditLog {
    /// Creates a new empty audit log
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_AUDIT_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::new(),
            limit: limit.max(2),
            dropped: 0,
        }
    }

    /// Records an event
    pub fn record(&mut self, event: KernelEvent) {
        if self.events.len() >= self.limit {
            let old = self.events.len() / 2;
            self.events.drain(..old);
            self.dropped += old as u64;
        }
        self.events.push(event);
    }

    /// Number of events discarded to stay within the limit
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Returns all recorded events
    pub fn events(&self) -> &[KernelEvent] {
        &self.events
    }

    /// Clears all events
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Checks if an event matching the predicate exists
    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&KernelEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }

    /// Counts events matching the predicate
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&KernelEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

impl Default for KernelAuditLog {
    fn default() -> Self {
        Self::new()
    }
}
