//! Two-level page tables
//!
//! A page directory and its page tables live in physical frames exactly as
//! the hardware would see them: 1024 little-endian 32-bit entries per frame.
//! Directory entries are created permissive (present, writable, user) so
//! that page-table entries alone decide what user code may do.
//!
//! ## Kernel half
//!
//! Every directory shares the page tables that map the region at and above
//! `UTOP`. They are built once at boot ([`KernelTables`]) and copied into
//! each new directory by reference; tearing an address space down never
//! touches them.

use crate::page_alloc::PageAllocator;
use core_types::memory::{pdx, ptx, round_down, round_up, KERNBASE, NPDENTRIES, PGSIZE, ULIM, UTOP};
use core_types::{Frame, Pte, PteFlags};
use kernel_api::KernelError;
use serde::{Deserialize, Serialize};

/// Why a user access to a page faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    NotPresent,
    /// Present, but not with the rights the access needs
    Protection,
    /// Write to a present, read-only page marked copy-on-write
    CopyOnWrite,
}

/// The boot page directory and the shared kernel page tables
#[derive(Debug)]
pub struct KernelTables {
    pgdir: Frame,
}

impl KernelTables {
    /// Builds the boot directory with one page table covering `KERNBASE`
    pub fn boot(pages: &mut PageAllocator) -> Result<Self, KernelError> {
        let pgdir = pages.alloc()?;
        pages.incref(pgdir);
        pages.zero(pgdir);

        let table = pages.alloc()?;
        pages.incref(table);
        pages.zero(table);
        pages.write_entry(
            pgdir,
            pdx(KERNBASE),
            Pte::new(table, PteFlags::PRESENT | PteFlags::WRITABLE),
        );
        Ok(Self { pgdir })
    }

    pub fn pgdir(&self) -> Frame {
        self.pgdir
    }
}

/// One environment's page directory
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    pgdir: Frame,
}

impl AddressSpace {
    /// Allocates a directory whose kernel half mirrors the boot directory
    pub fn create(pages: &mut PageAllocator, kernel: &KernelTables) -> Result<Self, KernelError> {
        let pgdir = pages.alloc()?;
        pages.incref(pgdir);
        pages.zero(pgdir);
        for index in pdx(UTOP)..NPDENTRIES {
            let pde = pages.read_entry(kernel.pgdir(), index);
            pages.write_entry(pgdir, index, pde);
        }
        Ok(Self { pgdir })
    }

    pub fn pgdir(&self) -> Frame {
        self.pgdir
    }

    /// Directory entry covering `va`
    pub fn pde(&self, pages: &PageAllocator, va: u32) -> Pte {
        pages.read_entry(self.pgdir, pdx(va))
    }

    /// Locates the page-table slot for `va` without creating anything
    pub fn walk(&self, pages: &PageAllocator, va: u32) -> Option<(Frame, u32)> {
        let pde = self.pde(pages, va);
        pde.is_present().then(|| (pde.frame(), ptx(va)))
    }

    /// Locates the page-table slot for `va`, allocating a zeroed page table
    /// if the directory entry is empty
    fn walk_create(&mut self, pages: &mut PageAllocator, va: u32) -> Result<(Frame, u32), KernelError> {
        if let Some(slot) = self.walk(pages, va) {
            return Ok(slot);
        }
        let table = pages.alloc()?;
        pages.incref(table);
        pages.zero(table);
        pages.write_entry(self.pgdir, pdx(va), Pte::new(table, PteFlags::user_write()));
        Ok((table, ptx(va)))
    }

    /// Page-table entry for `va`; empty if its page table is absent
    pub fn pte(&self, pages: &PageAllocator, va: u32) -> Pte {
        match self.walk(pages, va) {
            Some((table, index)) => pages.read_entry(table, index),
            None => Pte::EMPTY,
        }
    }

    /// Frame and permissions mapped at `va`
    pub fn lookup(&self, pages: &PageAllocator, va: u32) -> Option<(Frame, PteFlags)> {
        let pte = self.pte(pages, va);
        pte.is_present().then(|| (pte.frame(), pte.flags()))
    }

    /// Maps `frame` at `va` with `perm | PRESENT`
    ///
    /// Whatever was mapped at `va` is unmapped first. The new frame gains its
    /// reference before the old mapping is dropped, so re-inserting the page
    /// already mapped at `va` (to change its permissions) never frees it.
    /// The resulting entry has the dirty bit clear.
    pub fn insert(
        &mut self,
        pages: &mut PageAllocator,
        frame: Frame,
        va: u32,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let (table, index) = self.walk_create(pages, va)?;
        pages.incref(frame);
        if pages.read_entry(table, index).is_present() {
            self.remove(pages, va);
        }
        pages.write_entry(table, index, Pte::new(frame, perm | PteFlags::PRESENT));
        Ok(())
    }

    /// Unmaps `va`; a no-op if nothing is mapped there
    pub fn remove(&mut self, pages: &mut PageAllocator, va: u32) {
        let Some((table, index)) = self.walk(pages, va) else {
            return;
        };
        let pte = pages.read_entry(table, index);
        if !pte.is_present() {
            return;
        }
        pages.write_entry(table, index, Pte::EMPTY);
        pages.decref(pte.frame());
    }

    /// Sets hardware status bits (accessed, dirty) on a present entry
    pub fn mark(&mut self, pages: &mut PageAllocator, va: u32, bits: PteFlags) {
        if let Some((table, index)) = self.walk(pages, va) {
            let pte = pages.read_entry(table, index);
            if pte.is_present() {
                pages.write_entry(table, index, Pte(pte.raw() | bits.bits()));
            }
        }
    }

    /// Classifies a user access to `va`; `None` means the access succeeds
    pub fn translate_fault(&self, pages: &PageAllocator, va: u32, write: bool) -> Option<FaultKind> {
        let flags = self.pte(pages, va).flags();
        if !flags.contains(PteFlags::PRESENT) {
            return Some(FaultKind::NotPresent);
        }
        if !flags.contains(PteFlags::USER) {
            return Some(FaultKind::Protection);
        }
        if write && !flags.contains(PteFlags::WRITABLE) {
            if flags.contains(PteFlags::COW) {
                return Some(FaultKind::CopyOnWrite);
            }
            return Some(FaultKind::Protection);
        }
        None
    }

    /// Checks that user code may access `[va, va + len)` with `perm`
    ///
    /// Returns the first offending address on failure: `va` itself if the
    /// first page is bad, otherwise the start of the first bad page.
    pub fn check_user(&self, pages: &PageAllocator, va: u32, len: u32, perm: PteFlags) -> Result<(), u32> {
        let need = perm | PteFlags::USER | PteFlags::PRESENT;
        let start = round_down(va, PGSIZE);
        let end = round_up(va.saturating_add(len), PGSIZE);
        let mut page = start;
        while page < end {
            let pte = self.pte(pages, page);
            if page >= ULIM || !pte.flags().contains(need) {
                return Err(page.max(va));
            }
            page += PGSIZE;
        }
        Ok(())
    }

    /// Frees every user mapping, the user page tables and the directory
    pub fn destroy(self, pages: &mut PageAllocator) {
        for index in 0..pdx(UTOP) {
            let pde = pages.read_entry(self.pgdir, index);
            if !pde.is_present() {
                continue;
            }
            let table = pde.frame();
            for slot in 0..NPDENTRIES {
                let pte = pages.read_entry(table, slot);
                if pte.is_present() {
                    pages.write_entry(table, slot, Pte::EMPTY);
                    pages.decref(pte.frame());
                }
            }
            pages.write_entry(self.pgdir, index, Pte::EMPTY);
            pages.decref(table);
        }
        pages.decref(self.pgdir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::memory::{USTACKTOP, UTEXT};

    fn setup() -> (PageAllocator, KernelTables, AddressSpace) {
        let mut pages = PageAllocator::new(64);
        let kernel = KernelTables::boot(&mut pages).unwrap();
        let space = AddressSpace::create(&mut pages, &kernel).unwrap();
        (pages, kernel, space)
    }

    #[test]
    fn test_kernel_half_is_shared() {
        let (mut pages, kernel, space) = setup();
        let other = AddressSpace::create(&mut pages, &kernel).unwrap();
        assert_eq!(space.pde(&pages, KERNBASE), other.pde(&pages, KERNBASE));
        assert!(space.pde(&pages, KERNBASE).is_present());
        assert!(!space.pde(&pages, UTEXT).is_present());
    }

    #[test]
    fn test_insert_and_lookup() {
        let (mut pages, _kernel, mut space) = setup();
        let frame = pages.alloc().unwrap();
        space.insert(&mut pages, frame, UTEXT, PteFlags::user_write()).unwrap();
        assert_eq!(pages.refcount(frame), 1);
        let (found, flags) = space.lookup(&pages, UTEXT + 0x123).unwrap();
        assert_eq!(found, frame);
        assert_eq!(flags, PteFlags::user_write());
        assert!(space.lookup(&pages, UTEXT + PGSIZE).is_none());
    }

    #[test]
    fn test_reinsert_same_frame_keeps_it_alive() {
        let (mut pages, _kernel, mut space) = setup();
        let frame = pages.alloc().unwrap();
        space.insert(&mut pages, frame, UTEXT, PteFlags::user_write()).unwrap();
        space.mark(&mut pages, UTEXT, PteFlags::DIRTY);
        space.insert(&mut pages, frame, UTEXT, PteFlags::user_read()).unwrap();
        assert_eq!(pages.refcount(frame), 1);
        assert!(!pages.is_free(frame));
        let pte = space.pte(&pages, UTEXT);
        assert!(!pte.flags().contains(PteFlags::DIRTY));
        assert!(!pte.flags().contains(PteFlags::WRITABLE));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (mut pages, _kernel, mut space) = setup();
        let frame = pages.alloc().unwrap();
        space.insert(&mut pages, frame, UTEXT, PteFlags::user_write()).unwrap();
        space.remove(&mut pages, UTEXT);
        assert!(pages.is_free(frame));
        space.remove(&mut pages, UTEXT);
        space.remove(&mut pages, 0x1000_0000);
        assert_eq!(space.pte(&pages, UTEXT), Pte::EMPTY);
    }

    #[test]
    fn test_translate_fault_classification() {
        let (mut pages, _kernel, mut space) = setup();
        let frame = pages.alloc().unwrap();
        space
            .insert(&mut pages, frame, UTEXT, PteFlags::user_read() | PteFlags::COW)
            .unwrap();
        assert_eq!(space.translate_fault(&pages, UTEXT, false), None);
        assert_eq!(space.translate_fault(&pages, UTEXT, true), Some(FaultKind::CopyOnWrite));
        assert_eq!(
            space.translate_fault(&pages, UTEXT + PGSIZE, false),
            Some(FaultKind::NotPresent)
        );
        space.insert(&mut pages, frame, UTEXT, PteFlags::user_read()).unwrap();
        assert_eq!(space.translate_fault(&pages, UTEXT, true), Some(FaultKind::Protection));
    }

    #[test]
    fn test_check_user_reports_first_bad_address() {
        let (mut pages, _kernel, mut space) = setup();
        let frame = pages.alloc().unwrap();
        space.insert(&mut pages, frame, UTEXT, PteFlags::user_read()).unwrap();
        assert_eq!(space.check_user(&pages, UTEXT + 8, 16, PteFlags::empty()), Ok(()));
        assert_eq!(space.check_user(&pages, UTEXT + 8, 16, PteFlags::WRITABLE), Err(UTEXT + 8));
        assert_eq!(
            space.check_user(&pages, UTEXT + 8, PGSIZE, PteFlags::empty()),
            Err(UTEXT + PGSIZE)
        );
        assert!(space.check_user(&pages, KERNBASE, 4, PteFlags::empty()).is_err());
    }

    #[test]
    fn test_destroy_releases_user_frames_only() {
        let (mut pages, kernel, mut space) = setup();
        let before = pages.free_count();
        let shared = pages.alloc().unwrap();
        space.insert(&mut pages, shared, UTEXT, PteFlags::user_write()).unwrap();
        let mut other = AddressSpace::create(&mut pages, &kernel).unwrap();
        other.insert(&mut pages, shared, USTACKTOP - PGSIZE, PteFlags::user_read()).unwrap();

        space.destroy(&mut pages);
        assert_eq!(pages.refcount(shared), 1);
        assert!(other.pde(&pages, KERNBASE).is_present());

        other.destroy(&mut pages);
        // the first directory was allocated before the count was taken
        assert_eq!(pages.free_count(), before + 1);
    }
}
