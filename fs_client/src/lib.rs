//! # File Client
//!
//! The client side of the file server protocol, linked into every
//! environment that uses files.
//!
//! ## Philosophy
//!
//! - **State lives in pages, not in this crate**: a descriptor is a page the
//!   server shares with the client, and the file's blocks are mapped straight
//!   into the client's address space. Fork carries both along.
//! - **Writes go to memory**: the client writes through its mapping and
//!   reports the pages it dirtied when it closes the file.
//!
//! ## Example
//!
//! ```ignore
//! let client = FileClient::new(server);
//! let fd = client.open(env, "/motd", O_RDONLY)?;
//! let text = client.read_all(env, fd)?;
//! client.close(env, fd)?;
//! ```

pub mod fd;
pub mod file;
pub mod fsipc;

pub use file::{FileClient, Stat};
pub use services_fs::protocol::{O_ACCMODE, O_CREAT, O_EXCL, O_MKDIR, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::{fd2data, fd_va};
    use core_types::memory::PGSIZE;
    use core_types::{EnvId, PteFlags};
    use hal::RamDisk;
    use kernel_api::{KernelApi, KernelError, UserError};
    use services_fs::layout::{MAXFILESIZE, NDIRECT};
    use services_fs::protocol::MAXFD;
    use services_fs::{FileServer, FormatConfig, ImageBuilder, ServeConfig};
    use sim_kernel::{KernelConfig, Machine};

    const MOTD: &[u8] = b"hello from the file server\n";

    fn disk() -> RamDisk {
        let mut builder = ImageBuilder::new(FormatConfig { nblocks: 512 }).unwrap();
        let root = builder.root();
        builder.add_file(root, "motd", MOTD).unwrap();
        builder.add_dir(root, "etc").unwrap();
        RamDisk::from_image(&builder.finish())
    }

    /// A machine running a file server on `disk`, plus one client
    fn boot(disk: &RamDisk) -> (Machine, FileClient, EnvId) {
        let mut machine = Machine::boot(KernelConfig {
            nenv: 16,
            npages: 4096,
            ..KernelConfig::default()
        })
        .unwrap();
        let server = machine
            .spawn(Box::new(FileServer::new(
                Box::new(disk.clone()),
                ServeConfig::default(),
            )))
            .unwrap();
        let client = machine.create_env().unwrap();
        (machine, FileClient::new(server), client)
    }

    #[test]
    fn test_open_read_close() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            let fd = fs.open(u, "/motd", O_RDONLY)?;
            assert_eq!(fd, 0);
            assert_eq!(fs.read_all(u, fd)?, MOTD);

            let mut buf = [0u8; 5];
            assert_eq!(fs.read(u, fd, &mut buf, 6)?, 5);
            assert_eq!(&buf, b"from ");
            // end of file
            assert_eq!(fs.read(u, fd, &mut buf, MOTD.len() as u32)?, 0);
            assert_eq!(fs.read(u, fd, &mut buf, 10_000)?, 0);

            fs.close(u, fd)?;
            assert!(!u.va_is_mapped(fd_va(fd)));
            assert!(!u.va_is_mapped(fd2data(fd)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_stat() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            let fd = fs.open(u, "/motd", O_RDONLY)?;
            assert_eq!(
                fs.stat(u, fd)?,
                Stat {
                    name: "motd".to_string(),
                    size: MOTD.len() as u32,
                    is_dir: false,
                }
            );
            let dir = fs.open(u, "/etc", O_RDONLY)?;
            assert!(fs.stat(u, dir)?.is_dir);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_write_is_durable_after_close() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        let data: Vec<u8> = (0..3 * PGSIZE + 100).map(|i| (i % 251) as u8).collect();
        m.enter(me, |u| {
            let fd = fs.open(u, "/etc/data", O_RDWR | O_CREAT)?;
            assert_eq!(fs.write(u, fd, &data, 0)?, data.len());
            assert_eq!(fs.stat(u, fd)?.size, data.len() as u32);
            fs.close(u, fd)
        })
        .unwrap();

        // a fresh machine mounting the same disk sees the data
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            let fd = fs.open(u, "/etc/data", O_RDONLY)?;
            assert_eq!(fs.read_all(u, fd)?, data);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_write_through_indirect_blocks() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            let fd = fs.open(u, "/big", O_RDWR | O_CREAT)?;
            let offset = (NDIRECT + 3) * PGSIZE;
            fs.write(u, fd, b"far out", offset)?;
            let mut buf = [0u8; 7];
            fs.read(u, fd, &mut buf, offset)?;
            assert_eq!(&buf, b"far out");
            // the hole reads as zeroes
            fs.read(u, fd, &mut buf, PGSIZE)?;
            assert_eq!(buf, [0u8; 7]);
            fs.close(u, fd)
        })
        .unwrap();
    }

    #[test]
    fn test_ftruncate_shrinks_window() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            let fd = fs.open(u, "/t", O_RDWR | O_CREAT)?;
            fs.write(u, fd, &vec![1u8; 3 * PGSIZE as usize], 0)?;
            assert!(u.va_is_mapped(fd2data(fd) + 2 * PGSIZE));

            fs.ftruncate(u, fd, PGSIZE)?;
            assert_eq!(fs.stat(u, fd)?.size, PGSIZE);
            assert!(u.va_is_mapped(fd2data(fd)));
            assert!(!u.va_is_mapped(fd2data(fd) + PGSIZE));
            assert!(!u.va_is_mapped(fd2data(fd) + 2 * PGSIZE));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_write_limits() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            let ro = fs.open(u, "/motd", O_RDONLY)?;
            assert_eq!(
                fs.write(u, ro, b"x", 0).unwrap_err(),
                UserError::Kernel(KernelError::InvalidArgument)
            );
            let rw = fs.open(u, "/motd", O_RDWR)?;
            assert_eq!(
                fs.write(u, rw, b"xx", MAXFILESIZE - 1).unwrap_err(),
                UserError::Kernel(KernelError::DiskFull)
            );
            assert_eq!(
                fs.ftruncate(u, rw, MAXFILESIZE + 1).unwrap_err(),
                UserError::Kernel(KernelError::DiskFull)
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_bad_descriptors() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            let mut buf = [0u8; 1];
            assert_eq!(
                fs.read(u, 3, &mut buf, 0).unwrap_err(),
                UserError::Kernel(KernelError::InvalidArgument)
            );
            assert_eq!(
                fs.close(u, MAXFD).unwrap_err(),
                UserError::Kernel(KernelError::InvalidArgument)
            );
            assert_eq!(
                fs.open(u, "/nope", O_RDONLY).unwrap_err(),
                UserError::Kernel(KernelError::NotFound)
            );
            // a failed open leaves no descriptor behind
            assert!(!u.va_is_mapped(fd_va(0)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_descriptor_table_exhaustion() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            for expected in 0..MAXFD {
                assert_eq!(fs.open(u, "/motd", O_RDONLY)?, expected);
            }
            assert_eq!(
                fs.open(u, "/motd", O_RDONLY).unwrap_err(),
                UserError::Kernel(KernelError::TooManyOpenFiles)
            );
            fs.close(u, 7)?;
            assert_eq!(fs.open(u, "/motd", O_RDONLY)?, 7);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_remove_and_sync() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            fs.remove(u, "/motd")?;
            assert_eq!(
                fs.open(u, "/motd", O_RDONLY).unwrap_err(),
                UserError::Kernel(KernelError::NotFound)
            );
            fs.sync(u)?;
            assert_eq!(
                fs.remove(u, &"/x".repeat(600)).unwrap_err(),
                UserError::Kernel(KernelError::BadPath)
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_descriptor_pages_are_shared() {
        let disk = disk();
        let (mut m, fs, me) = boot(&disk);
        m.enter(me, |u| {
            let fd = fs.open(u, "/motd", O_RDONLY)?;
            let flags = u.vpt(fd_va(fd)).flags();
            assert!(flags.contains(PteFlags::SHARE));
            assert!(u.vpt(fd2data(fd)).flags().contains(PteFlags::SHARE));
            assert!(!u.vpt(fd2data(fd)).flags().contains(PteFlags::WRITABLE));
            Ok(())
        })
        .unwrap();
    }
}
