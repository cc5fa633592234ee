//! # Hardware Abstraction Layer (HAL)
//!
//! This crate defines the block device abstraction the file server drives.
//!
//! ## Philosophy
//!
//! **Devices are traits.** The file server never knows whether it is talking
//! to memory, a host file or real hardware; tests swap devices freely.
//!
//! ## Devices
//!
//! - [`RamDisk`]: in-memory blocks, shareable between handles for inspection
//! - [`FileDisk`]: blocks stored in a host file (disk images)

pub mod block_device;

pub use block_device::{BlockDevice, BlockError, FileDisk, RamDisk, BLOCK_SIZE};
