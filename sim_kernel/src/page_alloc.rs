//! Physical page frames
//!
//! Frames are numbered `1..npages`; frame 0 is never handed out, so a zero
//! page-table entry can never name a live frame. Each frame carries a
//! reference count equal to the number of page-table entries (plus page
//! directory and page-table uses) that point at it.
//!
//! Allocation hands out the most recently freed frame first and does not
//! clear it. Callers that need a zeroed page clear it themselves.

use core_types::memory::{NPTENTRIES, PGSIZE};
use core_types::{Frame, Pte};
use kernel_api::KernelError;

static ZERO_PAGE: [u8; PGSIZE as usize] = [0; PGSIZE as usize];

#[derive(Debug, Default)]
struct PageInfo {
    refcount: u32,
    on_free_list: bool,
    /// Backing bytes, materialized on first use
    data: Option<Box<[u8]>>,
}

/// Physical memory: frame metadata, contents and the free list
#[derive(Debug)]
pub struct PageAllocator {
    pages: Vec<PageInfo>,
    free_list: Vec<Frame>,
}

impl PageAllocator {
    pub fn new(npages: usize) -> Self {
        let mut pages: Vec<PageInfo> = (0..npages.max(1)).map(|_| PageInfo::default()).collect();
        let mut free_list = Vec::with_capacity(npages);
        for index in (1..pages.len()).rev() {
            pages[index].on_free_list = true;
            free_list.push(Frame(index as u32));
        }
        Self { pages, free_list }
    }

    /// Total number of frames, including the reserved frame 0
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Takes a frame off the free list
    ///
    /// The frame comes back with a reference count of 0 and with whatever
    /// contents it had when it was last freed.
    pub fn alloc(&mut self) -> Result<Frame, KernelError> {
        let frame = self.free_list.pop().ok_or(KernelError::OutOfMemory)?;
        let info = &mut self.pages[frame.index()];
        info.on_free_list = false;
        if info.data.is_none() {
            info.data = Some(vec![0u8; PGSIZE as usize].into_boxed_slice());
        }
        Ok(frame)
    }

    /// Returns a frame to the free list
    ///
    /// # Panics
    ///
    /// Panics if the frame is still referenced or already free.
    pub fn free(&mut self, frame: Frame) {
        let info = &mut self.pages[frame.index()];
        assert_eq!(info.refcount, 0, "freeing referenced {frame}");
        assert!(!info.on_free_list, "double free of {frame}");
        info.on_free_list = true;
        self.free_list.push(frame);
    }

    pub fn incref(&mut self, frame: Frame) {
        self.pages[frame.index()].refcount += 1;
    }

    /// Drops one reference; the frame is freed when none remain
    pub fn decref(&mut self, frame: Frame) {
        let info = &mut self.pages[frame.index()];
        info.refcount = info.refcount.saturating_sub(1);
        if info.refcount == 0 {
            self.free(frame);
        }
    }

    pub fn refcount(&self, frame: Frame) -> u32 {
        self.pages.get(frame.index()).map_or(0, |info| info.refcount)
    }

    pub fn is_free(&self, frame: Frame) -> bool {
        self.pages
            .get(frame.index())
            .map_or(false, |info| info.on_free_list)
    }

    pub fn bytes(&self, frame: Frame) -> &[u8] {
        match self.pages.get(frame.index()).and_then(|info| info.data.as_deref()) {
            Some(data) => data,
            None => &ZERO_PAGE,
        }
    }

    pub fn bytes_mut(&mut self, frame: Frame) -> &mut [u8] {
        self.pages[frame.index()]
            .data
            .get_or_insert_with(|| vec![0u8; PGSIZE as usize].into_boxed_slice())
    }

    pub fn zero(&mut self, frame: Frame) {
        self.bytes_mut(frame).fill(0);
    }

    /// Reads entry `index` of the page table (or directory) held in `frame`
    pub fn read_entry(&self, frame: Frame, index: u32) -> Pte {
        debug_assert!(index < NPTENTRIES);
        let at = index as usize * 4;
        let b = &self.bytes(frame)[at..at + 4];
        Pte(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_entry(&mut self, frame: Frame, index: u32, pte: Pte) {
        debug_assert!(index < NPTENTRIES);
        let at = index as usize * 4;
        self.bytes_mut(frame)[at..at + 4].copy_from_slice(&pte.raw().to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::PteFlags;

    #[test]
    fn test_frame_zero_is_reserved() {
        let mut pages = PageAllocator::new(4);
        let mut handed_out = Vec::new();
        while let Ok(frame) = pages.alloc() {
            handed_out.push(frame);
        }
        assert_eq!(handed_out, vec![Frame(1), Frame(2), Frame(3)]);
        assert_eq!(pages.alloc(), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut pages = PageAllocator::new(8);
        let a = pages.alloc().unwrap();
        let b = pages.alloc().unwrap();
        pages.free(a);
        pages.free(b);
        assert_eq!(pages.alloc().unwrap(), b);
        assert_eq!(pages.alloc().unwrap(), a);
    }

    #[test]
    fn test_alloc_does_not_clear() {
        let mut pages = PageAllocator::new(4);
        let frame = pages.alloc().unwrap();
        pages.bytes_mut(frame)[10] = 0x5A;
        pages.free(frame);
        let again = pages.alloc().unwrap();
        assert_eq!(again, frame);
        assert_eq!(pages.bytes(again)[10], 0x5A);
        pages.zero(again);
        assert_eq!(pages.bytes(again)[10], 0);
    }

    #[test]
    fn test_decref_to_zero_frees() {
        let mut pages = PageAllocator::new(4);
        let frame = pages.alloc().unwrap();
        pages.incref(frame);
        pages.incref(frame);
        assert_eq!(pages.refcount(frame), 2);
        pages.decref(frame);
        assert!(!pages.is_free(frame));
        pages.decref(frame);
        assert!(pages.is_free(frame));
        assert_eq!(pages.free_count(), 3);
    }

    #[test]
    #[should_panic]
    fn test_free_referenced_frame_panics() {
        let mut pages = PageAllocator::new(4);
        let frame = pages.alloc().unwrap();
        pages.incref(frame);
        pages.free(frame);
    }

    #[test]
    fn test_entries_are_little_endian_words() {
        let mut pages = PageAllocator::new(4);
        let table = pages.alloc().unwrap();
        pages.zero(table);
        let pte = Pte::new(Frame(3), PteFlags::user_write());
        pages.write_entry(table, 1023, pte);
        assert_eq!(pages.read_entry(table, 1023), pte);
        assert_eq!(&pages.bytes(table)[4092..], &pte.raw().to_le_bytes());
        assert_eq!(pages.read_entry(table, 0), Pte::EMPTY);
    }
}
