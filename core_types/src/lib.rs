//! # Core Types
//!
//! This crate defines the fundamental types shared by the kernel, the user
//! library and the file server.
//!
//! ## Philosophy
//!
//! - **Identities carry generations**: a stale identity never resolves to a
//!   reused slot.
//! - **Layout is data**: every address the system agrees on lives here, once.
//! - **Permissions are typed**: page-table bits are a flags type, not loose
//!   integers.
//!
//! ## Key Types
//!
//! - [`EnvId`]: Generation-tagged environment identity
//! - [`FileId`]: Generation-tagged open-file identity
//! - [`PteFlags`]: Page-table entry permission and status bits
//! - [`Pte`]: A raw page-table entry (frame number plus flags)
//! - [`SlotTable`]: Fixed-capacity table handing out generation-tagged ids

pub mod ids;
pub mod memory;
pub mod slot_table;

pub use ids::{EnvId, FileId};
pub use memory::{Frame, Pte, PteFlags};
pub use slot_table::SlotTable;
