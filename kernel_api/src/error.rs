//! Kernel error types

use core_types::EnvId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by system calls and by the file server
///
/// The set is closed; every variant has a stable negative code that travels
/// in return registers and in IPC reply values.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelError {
    /// Environment doesn't exist or caller lacks permission over it
    #[error("bad environment")]
    UnknownEnvironment,

    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidArgument,

    /// Request failed due to memory shortage
    #[error("out of memory")]
    OutOfMemory,

    /// Attempt to create a new environment beyond the maximum allowed
    #[error("out of environments")]
    NoFreeEnvironmentSlot,

    /// Memory fault
    #[error("segmentation fault")]
    MemoryFault,

    /// Attempt to send to an environment that is not receiving
    #[error("env is not recving")]
    IpcNotReceiving,

    /// Unexpected end of file
    #[error("unexpected end of file")]
    EndOfFile,

    /// No free space left on disk
    #[error("no free space on disk")]
    DiskFull,

    /// Too many files are open
    #[error("too many files are open")]
    TooManyOpenFiles,

    /// File or block not found
    #[error("file or block not found")]
    NotFound,

    /// Bad path
    #[error("invalid path")]
    BadPath,

    /// File already exists
    #[error("file already exists")]
    FileExists,
}

impl KernelError {
    /// The negative integer carried on the wire
    pub fn code(self) -> i32 {
        match self {
            Self::UnknownEnvironment => -2,
            Self::InvalidArgument => -3,
            Self::OutOfMemory => -4,
            Self::NoFreeEnvironmentSlot => -5,
            Self::MemoryFault => -6,
            Self::IpcNotReceiving => -7,
            Self::EndOfFile => -8,
            Self::DiskFull => -9,
            Self::TooManyOpenFiles => -10,
            Self::NotFound => -11,
            Self::BadPath => -12,
            Self::FileExists => -13,
        }
    }

    /// Maps a wire code back to an error; unknown codes yield `None`
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            -2 => Self::UnknownEnvironment,
            -3 => Self::InvalidArgument,
            -4 => Self::OutOfMemory,
            -5 => Self::NoFreeEnvironmentSlot,
            -6 => Self::MemoryFault,
            -7 => Self::IpcNotReceiving,
            -8 => Self::EndOfFile,
            -9 => Self::DiskFull,
            -10 => Self::TooManyOpenFiles,
            -11 => Self::NotFound,
            -12 => Self::BadPath,
            -13 => Self::FileExists,
            _ => return None,
        };
        Some(err)
    }

    /// Interprets a signed return value: negatives are errors
    ///
    /// Negative values outside the known set are reported as
    /// `InvalidArgument`.
    pub fn check(value: i32) -> Result<u32, KernelError> {
        if value < 0 {
            Err(Self::from_code(value).unwrap_or(Self::InvalidArgument))
        } else {
            Ok(value as u32)
        }
    }
}

/// Errors seen by code running inside an environment
///
/// Besides kernel errors, user code can find that its own environment was
/// destroyed underneath it, or that the machine cannot schedule it again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UserError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// The calling environment no longer exists
    #[error("environment {0} was destroyed")]
    Destroyed(EnvId),

    /// Nothing is runnable; the machine stopped
    #[error("system halted: {0}")]
    Halted(String),

    /// The environment waits for an event nothing can deliver
    #[error("environment {0} cannot make progress")]
    Deadlock(EnvId),
}

impl UserError {
    /// The kernel error, if this is one
    pub fn kernel(&self) -> Option<KernelError> {
        match self {
            Self::Kernel(err) => Some(*err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [KernelError; 12] = [
        KernelError::UnknownEnvironment,
        KernelError::InvalidArgument,
        KernelError::OutOfMemory,
        KernelError::NoFreeEnvironmentSlot,
        KernelError::MemoryFault,
        KernelError::IpcNotReceiving,
        KernelError::EndOfFile,
        KernelError::DiskFull,
        KernelError::TooManyOpenFiles,
        KernelError::NotFound,
        KernelError::BadPath,
        KernelError::FileExists,
    ];

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(KernelError::UnknownEnvironment.code(), -2);
        assert_eq!(KernelError::IpcNotReceiving.code(), -7);
        assert_eq!(KernelError::FileExists.code(), -13);
        for err in ALL {
            assert_eq!(KernelError::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn test_check() {
        assert_eq!(KernelError::check(5), Ok(5));
        assert_eq!(KernelError::check(-11), Err(KernelError::NotFound));
        assert_eq!(KernelError::check(-99), Err(KernelError::InvalidArgument));
        assert_eq!(KernelError::from_code(0), None);
    }

    #[test]
    fn test_user_error_wraps_kernel_error() {
        let err: UserError = KernelError::OutOfMemory.into();
        assert_eq!(err.kernel(), Some(KernelError::OutOfMemory));
        assert_eq!(format!("{}", err), "out of memory");
        assert_eq!(UserError::Deadlock(EnvId(0x1001)).kernel(), None);
    }
}
