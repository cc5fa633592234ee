//! System Test Utilities
//!
//! Shared setup for the cross-crate scenarios in `tests/`.
//!
//! ## Test Philosophy
//!
//! - **Whole system**: scenarios run the real kernel, the real file server
//!   and the real client library together
//! - **Deterministic**: one CPU, round-robin scheduling, in-memory disks
//! - **Observable**: assertions read kernel state and raw disk blocks
//!   directly instead of trusting the layer under test

use core_types::EnvId;
use fs_client::FileClient;
use hal::{BlockDevice, RamDisk};
use services_fs::{FileServer, FormatConfig, ImageBuilder, ServeConfig};
use sim_kernel::{KernelConfig, Machine};

pub const MOTD: &[u8] = b"This is /motd, the message of the day.\n";

/// A machine with room for a file server and a handful of clients
pub fn boot() -> Machine {
    Machine::boot(KernelConfig {
        nenv: 32,
        npages: 4096,
        ..KernelConfig::default()
    })
    .unwrap()
}

/// A 1024-block disk holding `/motd` and an empty `/tmp`
pub fn standard_disk() -> RamDisk {
    let mut builder = ImageBuilder::new(FormatConfig { nblocks: 1024 }).unwrap();
    let root = builder.root();
    builder.add_file(root, "motd", MOTD).unwrap();
    builder.add_dir(root, "tmp").unwrap();
    RamDisk::from_image(&builder.finish())
}

/// Starts a file server on `device` and returns a client handle for it
pub fn start_fs(machine: &mut Machine, device: Box<dyn BlockDevice>) -> FileClient {
    let server = machine
        .spawn(Box::new(FileServer::new(device, ServeConfig::default())))
        .unwrap();
    FileClient::new(server)
}

/// Boots a machine with a file server on `disk` and one client environment
pub fn boot_with_fs(disk: &RamDisk) -> (Machine, FileClient, EnvId) {
    let mut machine = boot();
    let client = start_fs(&mut machine, Box::new(disk.clone()));
    let me = machine.create_env().unwrap();
    (machine, client, me)
}
