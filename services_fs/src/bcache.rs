//! Block cache
//!
//! Block `n` is cached at `DISKMAP + n * BLKSIZE` in the server's address
//! space. A mapped page is a cached block; a page with the Dirty bit set has
//! changed since it was last written to the device. Writing a block back
//! remaps the page with its own permissions, which clears Dirty.

use crate::layout::{
    BLKSIZE, DISKMAP, DISKSIZE, FS_MAGIC, OFF_MAGIC, OFF_NBLOCKS, SUPER_BLOCK,
};
use crate::FileSystem;
use core_types::{EnvId, PteFlags};
use hal::BlockError;
use kernel_api::{KernelApi, KernelError, UserError};

/// Largest block count the cache window can hold
pub const MAX_BLOCKS: u32 = DISKSIZE / BLKSIZE;

fn device_error(blockno: u32, err: BlockError) -> UserError {
    log::error!("disk read of block {:08x} failed: {}", blockno, err);
    KernelError::InvalidArgument.into()
}

impl FileSystem {
    /// Address of the cache page for `blockno`
    ///
    /// Panics on a block beyond the end of the mounted disk.
    pub fn diskaddr(&self, blockno: u32) -> u32 {
        if let Some(nblocks) = self.nblocks {
            if blockno >= nblocks {
                panic!("bad block number {:08x} in diskaddr", blockno);
            }
        }
        assert!(blockno < MAX_BLOCKS, "block {:08x} outside the cache window", blockno);
        DISKMAP + blockno * BLKSIZE
    }

    pub fn block_is_mapped(&self, env: &dyn KernelApi, blockno: u32) -> bool {
        env.va_is_mapped(self.diskaddr(blockno))
    }

    pub fn block_is_dirty(&self, env: &dyn KernelApi, blockno: u32) -> bool {
        let va = self.diskaddr(blockno);
        env.va_is_mapped(va) && env.vpt(va).flags().contains(PteFlags::DIRTY)
    }

    /// Backs the cache slot of `blockno` with a page; contents are left as
    /// they are (zero for a fresh page)
    pub fn map_block(&self, env: &mut dyn KernelApi, blockno: u32) -> Result<(), UserError> {
        if self.block_is_mapped(env, blockno) {
            return Ok(());
        }
        env.sys_page_alloc(EnvId::CURRENT, self.diskaddr(blockno), PteFlags::user_write())
    }

    /// Makes sure `blockno` is cached and returns its address
    ///
    /// A block loaded from the device starts out clean. Panics if the block
    /// is past the end of the disk or, once the bitmap is loaded, free.
    pub fn read_block(&mut self, env: &mut dyn KernelApi, blockno: u32) -> Result<u32, UserError> {
        if let Some(nblocks) = self.nblocks {
            if blockno >= nblocks {
                panic!("reading non-existent block {:08x}", blockno);
            }
        }
        if self.bitmap_loaded && self.block_is_free(env, blockno)? {
            panic!("reading free block {:08x}", blockno);
        }

        let addr = self.diskaddr(blockno);
        if !self.block_is_mapped(env, blockno) {
            self.map_block(env, blockno)?;
            let mut buf = vec![0u8; BLKSIZE as usize];
            if let Err(err) = self.device.read_block(u64::from(blockno), &mut buf) {
                env.sys_page_unmap(EnvId::CURRENT, addr)?;
                return Err(device_error(blockno, err));
            }
            env.write_bytes(addr, &buf)?;
            remap_clean(env, addr)?;
        }
        Ok(addr)
    }

    /// Writes a cached block to the device and clears its Dirty bit
    ///
    /// Panics if the block is not cached or the device refuses the write.
    pub fn write_block(&mut self, env: &mut dyn KernelApi, blockno: u32) -> Result<(), UserError> {
        if !self.block_is_mapped(env, blockno) {
            panic!("write unmapped block {:08x}", blockno);
        }
        let addr = self.diskaddr(blockno);
        let data = env.read_page(addr)?;
        if let Err(err) = self.device.write_block(u64::from(blockno), &data) {
            panic!("disk write of block {:08x} failed: {}", blockno, err);
        }
        remap_clean(env, addr)
    }

    /// Evicts a block from the cache
    ///
    /// The block must be clean unless it is free.
    pub fn unmap_block(&mut self, env: &mut dyn KernelApi, blockno: u32) -> Result<(), UserError> {
        if !self.block_is_mapped(env, blockno) {
            return Ok(());
        }
        let free = self.block_is_free(env, blockno)?;
        assert!(
            free || !self.block_is_dirty(env, blockno),
            "evicting dirty block {:08x}",
            blockno
        );
        env.sys_page_unmap(EnvId::CURRENT, self.diskaddr(blockno))?;
        Ok(())
    }

    /// Writes back every dirty block
    pub fn sync(&mut self, env: &mut dyn KernelApi) -> Result<(), UserError> {
        let mut written = 0;
        for blockno in 0..self.nblocks() {
            if self.block_is_dirty(env, blockno) {
                self.write_block(env, blockno)?;
                written += 1;
            }
        }
        if let Err(err) = self.device.flush() {
            log::warn!("device flush failed: {}", err);
        }
        log::debug!("sync wrote {} blocks", written);
        Ok(())
    }

    /// Reads and validates the superblock, then the bitmap
    ///
    /// Between the two, the write path is checked by smashing the cached
    /// superblock, writing it, evicting it, reading it back and restoring
    /// it. Panics on a disk that is not a valid file system.
    pub fn mount(&mut self, env: &mut dyn KernelApi) -> Result<(), UserError> {
        self.read_super(env)?;
        self.check_write_block(env)?;
        self.read_bitmap(env)?;
        log::info!("[{}] file system mounted, {} blocks", env.getenvid(), self.nblocks());
        Ok(())
    }

    fn read_super(&mut self, env: &mut dyn KernelApi) -> Result<(), UserError> {
        let addr = self.read_block(env, SUPER_BLOCK)?;
        let magic = env.read_u32(addr + OFF_MAGIC)?;
        if magic != FS_MAGIC {
            panic!("bad file system magic number {:08x}", magic);
        }
        let nblocks = env.read_u32(addr + OFF_NBLOCKS)?;
        if nblocks > MAX_BLOCKS {
            panic!("file system is too large ({} blocks)", nblocks);
        }
        if u64::from(nblocks) > self.device.block_count() {
            panic!(
                "file system claims {} blocks on a {}-block device",
                nblocks,
                self.device.block_count()
            );
        }
        self.nblocks = Some(nblocks);
        log::debug!("superblock is good");
        Ok(())
    }

    fn check_write_block(&mut self, env: &mut dyn KernelApi) -> Result<(), UserError> {
        let nblocks = self.nblocks.take();
        let addr = self.diskaddr(SUPER_BLOCK);
        let backup = env.read_page(addr)?;

        env.write_bytes(addr, b"OOPS!\n\0")?;
        self.write_block(env, SUPER_BLOCK)?;
        assert!(self.block_is_mapped(env, SUPER_BLOCK));
        assert!(!self.block_is_dirty(env, SUPER_BLOCK));

        env.sys_page_unmap(EnvId::CURRENT, addr)?;
        assert!(!self.block_is_mapped(env, SUPER_BLOCK));

        self.read_block(env, SUPER_BLOCK)?;
        let mut probe = [0u8; 7];
        env.read_bytes(addr, &mut probe)?;
        assert_eq!(&probe, b"OOPS!\n\0");

        env.write_bytes(addr, &backup)?;
        self.write_block(env, SUPER_BLOCK)?;
        self.nblocks = nblocks;
        log::debug!("write_block is good");
        Ok(())
    }
}

/// Remaps a page onto itself with its own permissions
fn remap_clean(env: &mut dyn KernelApi, va: u32) -> Result<(), UserError> {
    let perm = env.vpt(va).flags() & PteFlags::USER_SETTABLE;
    env.sys_page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, perm)
}

#[cfg(test)]
mod tests {
    use crate::layout::{BITMAP_START, BLKSIZE};
    use crate::test_utils::{with_fs, Fixture};
    use hal::BlockDevice;
    use kernel_api::KernelApi;

    #[test]
    fn test_mount_leaves_superblock_intact() {
        let fixture = Fixture::new();
        let before = fixture.disk.peek(1).unwrap();
        with_fs(&fixture, |fs, u| {
            assert!(fs.is_mounted());
            assert_eq!(fs.nblocks(), fixture.nblocks);
            assert!(fs.block_is_mapped(u, 1));
            assert!(!fs.block_is_dirty(u, 1));
            Ok(())
        });
        assert_eq!(fixture.disk.peek(1).unwrap(), before);
    }

    #[test]
    fn test_loaded_block_is_clean() {
        let fixture = Fixture::new();
        with_fs(&fixture, |fs, u| {
            assert!(fs.block_is_mapped(u, BITMAP_START));
            assert!(!fs.block_is_dirty(u, BITMAP_START));
            Ok(())
        });
    }

    #[test]
    fn test_write_block_evict_reread() {
        let fixture = Fixture::new();
        with_fs(&fixture, |fs, u| {
            let bno = fs.alloc_block(u)?;
            let addr = fs.read_block(u, bno)?;
            u.write_bytes(addr, b"persist me")?;
            assert!(fs.block_is_dirty(u, bno));

            fs.write_block(u, bno)?;
            assert!(!fs.block_is_dirty(u, bno));
            assert_eq!(&fixture.disk.peek(u64::from(bno)).unwrap()[..10], b"persist me");

            fs.unmap_block(u, bno)?;
            assert!(!fs.block_is_mapped(u, bno));
            let addr = fs.read_block(u, bno)?;
            let mut buf = [0u8; 10];
            u.read_bytes(addr, &mut buf)?;
            assert_eq!(&buf, b"persist me");
            Ok(())
        });
    }

    #[test]
    fn test_sync_writes_only_dirty_blocks() {
        let fixture = Fixture::new();
        with_fs(&fixture, |fs, u| {
            let a = fs.alloc_block(u)?;
            let b = fs.alloc_block(u)?;
            let addr = fs.read_block(u, a)?;
            u.write_u32(addr, 0xfeed)?;
            fs.read_block(u, b)?;
            fs.sync(u)?;
            assert!(!fs.block_is_dirty(u, a));
            let raw = fixture.disk.peek(u64::from(a)).unwrap();
            assert_eq!(&raw[..4], &0xfeedu32.to_le_bytes());
            Ok(())
        });
    }

    #[test]
    #[should_panic(expected = "evicting dirty block")]
    fn test_evicting_dirty_block_panics() {
        let fixture = Fixture::new();
        with_fs(&fixture, |fs, u| {
            let bno = fs.alloc_block(u)?;
            let addr = fs.read_block(u, bno)?;
            u.write_u32(addr, 1)?;
            fs.unmap_block(u, bno)
        });
    }

    #[test]
    #[should_panic(expected = "reading free block")]
    fn test_reading_free_block_panics() {
        let fixture = Fixture::new();
        with_fs(&fixture, |fs, u| {
            let last = fs.nblocks() - 1;
            fs.read_block(u, last).map(|_| ())
        });
    }

    #[test]
    #[should_panic(expected = "reading non-existent block")]
    fn test_reading_past_end_panics() {
        let fixture = Fixture::new();
        with_fs(&fixture, |fs, u| {
            let end = fs.nblocks();
            fs.read_block(u, end).map(|_| ())
        });
    }

    #[test]
    #[should_panic(expected = "bad file system magic number")]
    fn test_mount_rejects_unformatted_disk() {
        let fixture = Fixture::blank(64);
        with_fs(&fixture, |_, _| Ok(()));
    }

    #[test]
    fn test_device_is_untouched_until_written() {
        let fixture = Fixture::new();
        let image = fixture.disk.image();
        with_fs(&fixture, |fs, u| {
            let bno = fs.alloc_block(u)?;
            let addr = fs.read_block(u, bno)?;
            u.write_bytes(addr, &[0xAA; BLKSIZE as usize])?;
            Ok(())
        });
        // only the bitmap block changed on disk
        let after = fixture.disk.image();
        let changed: Vec<usize> = (0..fixture.disk.block_count() as usize)
            .filter(|b| {
                let r = b * BLKSIZE as usize..(b + 1) * BLKSIZE as usize;
                image[r.clone()] != after[r]
            })
            .collect();
        assert_eq!(changed, vec![BITMAP_START as usize]);
    }
}
