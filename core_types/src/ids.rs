//! Identifiers for system entities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an environment
///
/// The low bits select a slot in the environment table; the high bits carry
/// the slot's generation. The value 0 never names a live environment and is
/// used by system calls to mean "the calling environment".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvId(pub u32);

impl EnvId {
    /// The calling environment
    pub const CURRENT: EnvId = EnvId(0);

    /// Returns the raw identity value
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Returns true if this is the "calling environment" shorthand
    pub fn is_current(&self) -> bool {
        self.0 == 0
    }
}

impl Default for EnvId {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Identity of an open file inside the file server
///
/// Issued by the server's open-file table; the slot is `id % MAXOPEN` and the
/// id advances by `MAXOPEN` each time the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}
