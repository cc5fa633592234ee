//! Free-block bitmap
//!
//! One bit per block, 1 = free. The bitmap blocks stay cached from mount on
//! and are contiguous in the cache window, so bit `n` lives at a fixed
//! address. Every allocation writes its bitmap block back before returning.

use crate::layout::{bitmap_blocks, BITMAP_START, BLKBITSIZE, SUPER_BLOCK};
use crate::FileSystem;
use kernel_api::{KernelApi, KernelError, UserError};

impl FileSystem {
    /// Address of the bitmap word holding the bit for `blockno`
    fn bitmap_word(&self, blockno: u32) -> u32 {
        self.diskaddr(BITMAP_START) + (blockno / 32) * 4
    }

    /// True if `blockno` is marked free
    ///
    /// Before the bitmap is loaded, and for blocks past the end of the disk,
    /// nothing is free.
    pub fn block_is_free(&self, env: &mut dyn KernelApi, blockno: u32) -> Result<bool, UserError> {
        match self.nblocks {
            Some(nblocks) if self.bitmap_loaded && blockno < nblocks => {}
            _ => return Ok(false),
        }
        let word = env.read_u32(self.bitmap_word(blockno))?;
        Ok(word & (1 << (blockno % 32)) != 0)
    }

    /// Marks `blockno` free
    ///
    /// Block 0 is the null block pointer and can never be freed. The bitmap
    /// block is only written back by a later flush or sync.
    pub fn free_block(&mut self, env: &mut dyn KernelApi, blockno: u32) -> Result<(), UserError> {
        if blockno == 0 {
            panic!("attempt to free zero block");
        }
        assert!(self.bitmap_loaded, "free_block before the bitmap is loaded");
        let addr = self.bitmap_word(blockno);
        let word = env.read_u32(addr)?;
        env.write_u32(addr, word | (1 << (blockno % 32)))
    }

    /// Allocates a free block
    ///
    /// The bitmap block is written to disk before the block is handed out.
    /// The block comes back cached as a zero page, and the zeroes are on the
    /// device too: a block that is never written reads as zeroes after a
    /// remount, not as whatever a freed file left there.
    pub fn alloc_block(&mut self, env: &mut dyn KernelApi) -> Result<u32, UserError> {
        let nblocks = self.nblocks();
        for bitblock in 0..bitmap_blocks(nblocks) {
            let page = env.read_page(self.diskaddr(BITMAP_START + bitblock))?;
            for (index, chunk) in page.chunks_exact(4).enumerate() {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if word == 0 {
                    continue;
                }
                let bit = word.trailing_zeros();
                let blockno = bitblock * BLKBITSIZE + index as u32 * 32 + bit;
                if blockno >= nblocks {
                    break;
                }
                self.unmap_block(env, blockno)?;
                env.write_u32(self.bitmap_word(blockno), word & !(1 << bit))?;
                self.write_block(env, BITMAP_START + bitblock)?;
                self.map_block(env, blockno)?;
                self.write_block(env, blockno)?;
                log::trace!("alloc_block -> {}", blockno);
                return Ok(blockno);
            }
        }
        Err(KernelError::DiskFull.into())
    }

    /// Loads the bitmap and checks that the reserved blocks are in use
    pub(crate) fn read_bitmap(&mut self, env: &mut dyn KernelApi) -> Result<(), UserError> {
        let Some(nblocks) = self.nblocks else {
            panic!("bitmap read before the superblock");
        };
        let nbitblocks = bitmap_blocks(nblocks);
        for i in 0..nbitblocks {
            self.read_block(env, BITMAP_START + i)?;
        }
        self.bitmap_loaded = true;

        for reserved in (0..=SUPER_BLOCK).chain(BITMAP_START..BITMAP_START + nbitblocks) {
            assert!(
                !self.block_is_free(env, reserved)?,
                "reserved block {} is marked free",
                reserved
            );
        }
        log::debug!("bitmap is good, {} bitmap blocks", nbitblocks);
        Ok(())
    }

    /// Number of free blocks
    pub fn free_blocks(&self, env: &mut dyn KernelApi) -> Result<u32, UserError> {
        let mut free = 0;
        for bitblock in 0..bitmap_blocks(self.nblocks()) {
            let page = env.read_page(self.diskaddr(BITMAP_START + bitblock))?;
            let base = bitblock * BLKBITSIZE;
            for (index, chunk) in page.chunks_exact(4).enumerate() {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                for bit in 0..32 {
                    let blockno = base + index as u32 * 32 + bit;
                    if blockno < self.nblocks() && word & (1 << bit) != 0 {
                        free += 1;
                    }
                }
            }
        }
        Ok(free)
    }
}
