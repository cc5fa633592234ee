//! # Memory Layout
//!
//! Virtual address layout, page-table geometry and page-table entry bits
//! shared by the kernel and by user-level code.
//!
//! ```text
//!   KERNBASE   0xF0000000  +------------------------------+
//!                          |  kernel (shared page tables) |
//!   ULIM       0xEF800000  +------------------------------+
//!   UVPT       0xEF400000  |  page tables (read-only)     |
//!   UPAGES     0xEF000000  |  page refcounts (read-only)  |
//!   UTOP,UENVS 0xEEC00000  +------------------------------+
//!   UXSTACKTOP             |  user exception stack (1 pg) |
//!                          +------------------------------+
//!                          |  empty guard page            |
//!   USTACKTOP  UTOP-2*PG   +------------------------------+
//!                          |  normal user stack, heap ... |
//!   UTEXT      0x00800000  +------------------------------+
//!   PFTEMP     UTEMP+PTSIZE-PGSIZE                        |
//!   UTEMP      0x00400000  +------------------------------+
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes per page
pub const PGSIZE: u32 = 4096;
/// log2(PGSIZE)
pub const PGSHIFT: u32 = 12;
/// Page-table entries per page table
pub const NPTENTRIES: u32 = 1024;
/// Page-directory entries per page directory
pub const NPDENTRIES: u32 = 1024;
/// Bytes mapped by one page-directory entry
pub const PTSIZE: u32 = PGSIZE * NPTENTRIES;
pub const PTXSHIFT: u32 = 12;
pub const PDXSHIFT: u32 = 22;

pub const KERNBASE: u32 = 0xF000_0000;
pub const ULIM: u32 = 0xEF80_0000;
pub const UVPT: u32 = 0xEF40_0000;
pub const UPAGES: u32 = 0xEF00_0000;
pub const UENVS: u32 = 0xEEC0_0000;
/// Top of user-accessible, user-writable memory
pub const UTOP: u32 = UENVS;
/// Top of the one-page user exception stack
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack (one guard page below the exception stack)
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE;
/// Where user programs are linked
pub const UTEXT: u32 = 0x0080_0000;
/// Scratch mapping area for temporary page mappings
pub const UTEMP: u32 = 0x0040_0000;
/// Used by the user-level copy-on-write handler
pub const PFTEMP: u32 = UTEMP + PTSIZE - PGSIZE;

/// Page-directory index of a virtual address
pub fn pdx(va: u32) -> u32 {
    (va >> PDXSHIFT) & 0x3FF
}

/// Page-table index of a virtual address
pub fn ptx(va: u32) -> u32 {
    (va >> PTXSHIFT) & 0x3FF
}

/// Offset within the page
pub fn pgoff(va: u32) -> u32 {
    va & (PGSIZE - 1)
}

/// Virtual page number
pub fn vpn(va: u32) -> u32 {
    va >> PGSHIFT
}

/// Builds a virtual address from its directory and table indices
pub fn pgaddr(pdx: u32, ptx: u32) -> u32 {
    (pdx << PDXSHIFT) | (ptx << PTXSHIFT)
}

pub fn round_down(addr: u32, align: u32) -> u32 {
    addr - addr % align
}

pub fn round_up(addr: u32, align: u32) -> u32 {
    round_down(addr.saturating_add(align - 1), align)
}

pub fn is_page_aligned(va: u32) -> bool {
    pgoff(va) == 0
}

bitflags! {
    /// Page-table entry bits
    ///
    /// `COW` and `SHARE` live in the bits the hardware leaves to software and
    /// are independent of each other and of `DIRTY`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PteFlags: u32 {
        const PRESENT = 0x001;
        const WRITABLE = 0x002;
        const USER = 0x004;
        const WRITE_THROUGH = 0x008;
        const CACHE_DISABLE = 0x010;
        const ACCESSED = 0x020;
        const DIRTY = 0x040;
        const AVAIL = 0x200;
        /// Mapping is shared with children across fork
        const SHARE = 0x400;
        /// Copy-on-write mapping
        const COW = 0x800;

        /// Bits a user environment may pass to the page-mapping system calls
        const USER_SETTABLE = Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::USER.bits()
            | Self::AVAIL.bits()
            | Self::SHARE.bits()
            | Self::COW.bits();
    }
}

impl PteFlags {
    /// Present | User
    pub fn user_read() -> Self {
        Self::PRESENT | Self::USER
    }

    /// Present | User | Writable
    pub fn user_write() -> Self {
        Self::PRESENT | Self::USER | Self::WRITABLE
    }
}

/// A physical page frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Frame(pub u32);

impl Frame {
    /// Physical address of the first byte of the frame
    pub fn addr(&self) -> u32 {
        self.0 << PGSHIFT
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame:{:05x}", self.0)
    }
}

/// A raw page-table (or page-directory) entry
///
/// The top 20 bits hold the frame number, the low 12 bits the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Pte(pub u32);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame: Frame, flags: PteFlags) -> Self {
        Self(frame.addr() | (flags.bits() & 0xFFF))
    }

    pub fn frame(&self) -> Frame {
        Frame(self.0 >> PGSHIFT)
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xFFF)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_relations() {
        assert_eq!(UTOP % PTSIZE, 0);
        assert_eq!(USTACKTOP, UXSTACKTOP - 2 * PGSIZE);
        assert_eq!(PFTEMP, 0x007F_F000);
        assert!(UTEMP < PFTEMP && PFTEMP < UTEXT);
    }

    #[test]
    fn test_address_decomposition() {
        let va = 0xD000_1234;
        assert_eq!(pdx(va), 0x340);
        assert_eq!(ptx(va), 0x001);
        assert_eq!(pgoff(va), 0x234);
        assert_eq!(pgaddr(pdx(va), ptx(va)) + pgoff(va), va);
        assert_eq!(vpn(va), 0xD0001);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_down(0x1234, PGSIZE), 0x1000);
        assert_eq!(round_up(0x1234, PGSIZE), 0x2000);
        assert_eq!(round_up(0x2000, PGSIZE), 0x2000);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3004));
    }

    #[test]
    fn test_pte_encoding() {
        let pte = Pte::new(Frame(0x1234), PteFlags::user_write() | PteFlags::COW);
        assert_eq!(pte.frame(), Frame(0x1234));
        assert!(pte.is_present());
        assert!(pte.flags().contains(PteFlags::COW));
        assert!(!pte.flags().contains(PteFlags::DIRTY));
        assert_eq!(pte.raw() & 0xFFF, 0x807);
        assert!(!Pte::EMPTY.is_present());
    }

    #[test]
    fn test_user_settable_excludes_hardware_status() {
        assert_eq!(PteFlags::USER_SETTABLE.bits(), 0xE07);
        assert!(!PteFlags::USER_SETTABLE.contains(PteFlags::DIRTY));
        assert!(!PteFlags::USER_SETTABLE.contains(PteFlags::ACCESSED));
    }
}
