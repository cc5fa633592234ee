//! Shared fixtures for the file server's unit tests

use crate::format::{FormatConfig, ImageBuilder};
use crate::FileSystem;
use hal::RamDisk;
use kernel_api::{KernelApi, UserError};
use sim_kernel::{KernelConfig, Machine};

pub const MOTD: &[u8] = b"This is /motd, the message of the day.\n\nWelcome to the file system.\n";

/// A formatted disk
///
/// Holds `/motd` and `/a/b/c`, with plenty of free blocks (the last one
/// included). The disk shares its storage with every clone, so a test can
/// mount it, unmount it and inspect what reached the device.
pub struct Fixture {
    pub disk: RamDisk,
    pub nblocks: u32,
}

impl Fixture {
    pub fn new() -> Self {
        let nblocks = 256;
        let mut builder = ImageBuilder::new(FormatConfig { nblocks }).unwrap();
        let root = builder.root();
        builder.add_file(root, "motd", MOTD).unwrap();
        let a = builder.add_dir(root, "a").unwrap();
        let b = builder.add_dir(a, "b").unwrap();
        builder.add_file(b, "c", b"c\n").unwrap();
        Self {
            disk: RamDisk::from_image(&builder.finish()),
            nblocks,
        }
    }

    /// An unformatted disk of `nblocks` zero blocks
    pub fn blank(nblocks: u32) -> Self {
        Self {
            disk: RamDisk::new(nblocks as usize),
            nblocks,
        }
    }
}

/// Mounts the fixture in a fresh server environment and runs `f` as it
pub fn with_fs<R, F>(fixture: &Fixture, f: F) -> R
where
    F: FnOnce(&mut FileSystem, &mut dyn KernelApi) -> Result<R, UserError>,
{
    let mut machine = Machine::boot(KernelConfig {
        nenv: 8,
        npages: 2048,
        ..KernelConfig::default()
    })
    .unwrap();
    let server = machine.create_env().unwrap();
    let mut fs = FileSystem::new(Box::new(fixture.disk.clone()));
    machine
        .enter(server, |env| {
            fs.mount(env)?;
            f(&mut fs, env)
        })
        .unwrap()
}
