use std::env;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use fs_client::{FileClient, O_RDONLY};
use hal::FileDisk;
use kernel_api::{KernelApi, UserError};
use services_fs::layout::{FILE_RECORD_SIZE, MAXFILESIZE};
use services_fs::{FileRecord, FileServer, FormatConfig, ImageBuilder, ServeConfig};
use sim_kernel::{KernelConfig, Machine};

const DEFAULT_IMAGE: &str = "dist/fs.img";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("fsformat") => cmd_fsformat(args),
        Some("fsls") => cmd_fsls(args),
        _ => usage(),
    }
}

fn usage() -> Result<(), Box<dyn std::error::Error>> {
    println!("Usage:");
    println!("  cargo xtask fsformat [--image <path>] [--blocks <n>] [--tree <dir>] [files...]");
    println!("  cargo xtask fsls [--image <path>] [path]");
    Err(io::Error::new(ErrorKind::Other, "unknown xtask command").into())
}

fn repo_root() -> PathBuf {
    match Path::new(env!("CARGO_MANIFEST_DIR")).parent() {
        Some(root) => root.to_path_buf(),
        None => PathBuf::from("."),
    }
}

fn expect_value(args: &mut impl Iterator<Item = String>, flag: &str) -> io::Result<String> {
    args.next().ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, format!("{flag} expects a value"))
    })
}

/// Builds a file system image from host files
fn cmd_fsformat(mut args: impl Iterator<Item = String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut image = repo_root().join(DEFAULT_IMAGE);
    let mut config = FormatConfig::default();
    let mut trees = Vec::new();
    let mut files = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--image" => image = PathBuf::from(expect_value(&mut args, "--image")?),
            "--blocks" => {
                let value = expect_value(&mut args, "--blocks")?;
                config.nblocks = value.parse().map_err(|_| {
                    io::Error::new(ErrorKind::InvalidInput, format!("bad block count: {value}"))
                })?;
            }
            "--tree" => trees.push(PathBuf::from(expect_value(&mut args, "--tree")?)),
            _ if arg.starts_with("--") => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("unknown argument: {arg}"),
                )
                .into());
            }
            _ => files.push(PathBuf::from(arg)),
        }
    }

    let nblocks = config.nblocks;
    let mut builder = ImageBuilder::new(config)?;
    let root = builder.root();
    for file in &files {
        builder.add_host_file(root, file)?;
        println!("  {}", file.display());
    }
    for tree in &trees {
        builder.add_host_tree(root, tree)?;
        println!("  {}/", tree.display());
    }
    let used = builder.blocks_used();

    if let Some(dir) = image.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&image, builder.finish())?;
    println!("Image ready: {}", image.display());
    println!("  Blocks: {} ({} in use)", nblocks, used);
    Ok(())
}

/// Mounts an image in the simulator and lists a directory, the way a
/// client environment sees it
fn cmd_fsls(mut args: impl Iterator<Item = String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut image = repo_root().join(DEFAULT_IMAGE);
    let mut path = "/".to_string();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--image" => image = PathBuf::from(expect_value(&mut args, "--image")?),
            _ => path = arg,
        }
    }

    let mut machine = Machine::boot(KernelConfig::default())?;
    let server = machine.spawn(Box::new(FileServer::new(
        Box::new(FileDisk::open(&image)?),
        ServeConfig::default(),
    )))?;
    let me = machine.create_env()?;
    let client = FileClient::new(server);

    let listing = machine.enter(me, |u| list(u, &client, &path))?;
    for line in listing {
        println!("{line}");
    }
    Ok(())
}

fn list(
    u: &mut dyn KernelApi,
    client: &FileClient,
    path: &str,
) -> Result<Vec<String>, UserError> {
    let fd = client.open(u, path, O_RDONLY)?;
    let stat = client.stat(u, fd)?;
    if !stat.is_dir {
        client.close(u, fd)?;
        return Ok(vec![format!("{:>8} {}", stat.size, path)]);
    }

    let raw = client.read_all(u, fd)?;
    client.close(u, fd)?;
    Ok(raw
        .chunks_exact(FILE_RECORD_SIZE as usize)
        .map(FileRecord::decode)
        .filter(|record| !record.name.is_empty())
        .map(|record| {
            let kind = if record.is_dir() { "/" } else { "" };
            format!("{:>8} {}{}", record.size.min(MAXFILESIZE), record.name, kind)
        })
        .collect())
}
