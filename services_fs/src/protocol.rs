//! File server wire protocol
//!
//! A request is an IPC message whose value is the request code, with the
//! request body in the page sent along with it. The reply value is 0 or a
//! negative error code; Open and MapBlock replies also carry a page.

use crate::layout::{get_u32, name_from_bytes, put_u32, FileRecord, FILE_RECORD_SIZE, MAXPATHLEN};
use core_types::memory::{PGSIZE, PTSIZE};
use core_types::FileId;

pub const FSREQ_OPEN: u32 = 1;
pub const FSREQ_MAP: u32 = 2;
pub const FSREQ_SET_SIZE: u32 = 3;
pub const FSREQ_CLOSE: u32 = 4;
pub const FSREQ_DIRTY: u32 = 5;
pub const FSREQ_REMOVE: u32 = 6;
pub const FSREQ_SYNC: u32 = 7;

pub const O_RDONLY: u32 = 0x0000;
pub const O_WRONLY: u32 = 0x0001;
pub const O_RDWR: u32 = 0x0002;
pub const O_ACCMODE: u32 = 0x0003;
/// Create the file if it does not exist
pub const O_CREAT: u32 = 0x0100;
/// Truncate to zero length
pub const O_TRUNC: u32 = 0x0200;
/// With `O_CREAT`, fail if the file exists
pub const O_EXCL: u32 = 0x0400;
/// Create a directory
pub const O_MKDIR: u32 = 0x0800;

/// True if `omode` allows writing
pub fn is_writable(omode: u32) -> bool {
    omode & O_ACCMODE != O_RDONLY
}

/// Where the server receives request pages
pub const REQVA: u32 = 0x0fff_f000;
/// Base of the server's open-file descriptor pages
pub const FILEVA: u32 = 0xD000_0000;
/// Most files the server keeps open at once
pub const MAXOPEN: usize = 1024;

/// Client descriptor table: one page per descriptor
pub const MAXFD: u32 = 32;
pub const FILEBASE: u32 = 0xD000_0000;
pub const FDTABLE: u32 = FILEBASE - PTSIZE;
/// Client page used to build requests
pub const FSIPCBUF: u32 = FDTABLE - PGSIZE;

/// Device id of file descriptors served by the file server
pub const DEV_FILE: u32 = b'f' as u32;

/// A decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsRequest {
    Open { path: String, omode: u32 },
    MapBlock { fileid: FileId, offset: u32 },
    SetSize { fileid: FileId, size: u32 },
    Close { fileid: FileId },
    Dirty { fileid: FileId, offset: u32 },
    Remove { path: String },
    Sync,
}

impl FsRequest {
    pub fn code(&self) -> u32 {
        match self {
            Self::Open { .. } => FSREQ_OPEN,
            Self::MapBlock { .. } => FSREQ_MAP,
            Self::SetSize { .. } => FSREQ_SET_SIZE,
            Self::Close { .. } => FSREQ_CLOSE,
            Self::Dirty { .. } => FSREQ_DIRTY,
            Self::Remove { .. } => FSREQ_REMOVE,
            Self::Sync => FSREQ_SYNC,
        }
    }

    /// Request body as laid out in the request page
    ///
    /// Paths are cut to `MAXPATHLEN - 1` bytes and NUL-terminated.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Open { path, omode } => {
                let mut body = path_bytes(path);
                body.extend_from_slice(&omode.to_le_bytes());
                body
            }
            Self::MapBlock { fileid, offset } | Self::Dirty { fileid, offset } => {
                pair(fileid.raw(), *offset)
            }
            Self::SetSize { fileid, size } => pair(fileid.raw(), *size),
            Self::Close { fileid } => fileid.raw().to_le_bytes().to_vec(),
            Self::Remove { path } => path_bytes(path),
            Self::Sync => Vec::new(),
        }
    }

    /// Decodes a request body; `None` for an unknown code
    ///
    /// `body` is the whole request page.
    pub fn decode(code: u32, body: &[u8]) -> Option<Self> {
        let path = || name_from_bytes(&body[..MAXPATHLEN]);
        let fileid = || FileId(get_u32(body, 0));
        let second = || get_u32(body, 4);
        Some(match code {
            FSREQ_OPEN => Self::Open {
                path: path(),
                omode: get_u32(body, MAXPATHLEN as u32),
            },
            FSREQ_MAP => Self::MapBlock {
                fileid: fileid(),
                offset: second(),
            },
            FSREQ_SET_SIZE => Self::SetSize {
                fileid: fileid(),
                size: second(),
            },
            FSREQ_CLOSE => Self::Close { fileid: fileid() },
            FSREQ_DIRTY => Self::Dirty {
                fileid: fileid(),
                offset: second(),
            },
            FSREQ_REMOVE => Self::Remove { path: path() },
            FSREQ_SYNC => Self::Sync,
            _ => return None,
        })
    }
}

fn path_bytes(path: &str) -> Vec<u8> {
    let mut raw = vec![0u8; MAXPATHLEN];
    let len = path.len().min(MAXPATHLEN - 1);
    raw[..len].copy_from_slice(&path.as_bytes()[..len]);
    raw
}

fn pair(a: u32, b: u32) -> Vec<u8> {
    let mut raw = a.to_le_bytes().to_vec();
    raw.extend_from_slice(&b.to_le_bytes());
    raw
}

/// A file descriptor page
///
/// Shared between the server and every environment that has the file open.
/// The record copy carries the name, size and type; its block pointers mean
/// nothing outside the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fd {
    pub dev_id: u32,
    pub offset: u32,
    pub omode: u32,
    pub fileid: u32,
    pub file: FileRecord,
}

impl Fd {
    pub const OFF_OMODE: u32 = 8;
    pub const OFF_FILEID: u32 = 12;
    pub const OFF_FILE: u32 = 16;
    /// Offset of the size field of the record copy
    pub const OFF_SIZE: u32 = Self::OFF_FILE + 128;

    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; (Self::OFF_FILE + FILE_RECORD_SIZE) as usize];
        put_u32(&mut raw, 0, self.dev_id);
        put_u32(&mut raw, 4, self.offset);
        put_u32(&mut raw, Self::OFF_OMODE, self.omode);
        put_u32(&mut raw, Self::OFF_FILEID, self.fileid);
        raw[Self::OFF_FILE as usize..].copy_from_slice(&self.file.encode());
        raw
    }

    pub fn decode(raw: &[u8]) -> Self {
        Self {
            dev_id: get_u32(raw, 0),
            offset: get_u32(raw, 4),
            omode: get_u32(raw, Self::OFF_OMODE),
            fileid: get_u32(raw, Self::OFF_FILEID),
            file: FileRecord::decode(&raw[Self::OFF_FILE as usize..]),
        }
    }

    pub fn encoded_len() -> usize {
        (Self::OFF_FILE + FILE_RECORD_SIZE) as usize
    }
}
