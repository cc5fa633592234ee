//! File server request loop
//!
//! The server receives one request at a time at `REQVA`, handles it against
//! its [`FileSystem`] and replies to the sender. Open files live in a table
//! of descriptor pages at `FILEVA`; a descriptor page is shared with every
//! client that has the file open, so its reference count tells the server
//! when a slot is free again.

use crate::file::FileRef;
use crate::layout::{FileType, BLKSIZE};
use crate::protocol::{
    is_writable, Fd, FsRequest, DEV_FILE, FILEVA, MAXOPEN, O_CREAT, O_EXCL, O_MKDIR, O_TRUNC,
    REQVA,
};
use crate::FileSystem;
use core_types::memory::PGSIZE;
use core_types::{EnvId, FileId, PteFlags, SlotTable};
use hal::BlockDevice;
use kernel_api::{KernelApi, KernelError, UserError};
use sim_kernel::{Program, ProgramStatus};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Size of the open-file table, at most `MAXOPEN`
    pub max_open: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self { max_open: MAXOPEN }
    }
}

/// One slot of the open-file table
#[derive(Debug, Clone)]
struct OpenFile {
    /// Address of the slot's descriptor page
    fd_va: u32,
    file: Option<FileRef>,
    omode: u32,
}

/// A reply: value, plus the page to send along with it
struct Reply {
    value: u32,
    page: Option<(u32, PteFlags)>,
}

impl Reply {
    fn ok() -> Self {
        Self { value: 0, page: None }
    }

    fn with_page(va: u32, perm: PteFlags) -> Self {
        Self {
            value: 0,
            page: Some((va, perm)),
        }
    }

    fn error(err: KernelError) -> Self {
        Self {
            value: err.code() as u32,
            page: None,
        }
    }
}

/// The file server program
pub struct FileServer {
    fs: FileSystem,
    opentab: SlotTable<OpenFile>,
    started: bool,
}

impl FileServer {
    pub fn new(device: Box<dyn BlockDevice>, config: ServeConfig) -> Self {
        let max_open = config.max_open.clamp(1, MAXOPEN);
        Self {
            fs: FileSystem::new(device),
            opentab: SlotTable::filled(max_open, max_open as u32, |index| OpenFile {
                fd_va: FILEVA + index as u32 * PGSIZE,
                file: None,
                omode: 0,
            }),
            started: false,
        }
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    /// Finds a free open-file slot and issues a new file id for it
    ///
    /// A slot is free when nobody but the server maps its descriptor page. A
    /// slot whose page was never allocated gets one here.
    fn openfile_alloc(&mut self, env: &mut dyn KernelApi) -> Result<usize, UserError> {
        for index in 0..self.opentab.capacity() {
            let Some(fd_va) = self.opentab.at(index).map(|o| o.fd_va) else {
                continue;
            };
            match env.pageref(fd_va) {
                0 => env.sys_page_alloc(EnvId::CURRENT, fd_va, PteFlags::user_write())?,
                1 => {}
                _ => continue,
            }
            self.opentab.reissue(index);
            env.write_bytes(fd_va, &[0u8; PGSIZE as usize])?;
            return Ok(index);
        }
        Err(KernelError::TooManyOpenFiles.into())
    }

    /// Resolves a file id to its open slot
    ///
    /// The id must be the one last issued for its slot and the descriptor
    /// page must still be mapped by a client.
    fn lookup(&self, env: &dyn KernelApi, fileid: FileId) -> Result<(u32, FileRef, u32), UserError> {
        let index = self.opentab.index_of(fileid.raw());
        let open = self
            .opentab
            .at(index)
            .ok_or(UserError::Kernel(KernelError::InvalidArgument))?;
        if self.opentab.id_at(index) != fileid.raw() || env.pageref(open.fd_va) <= 1 {
            return Err(KernelError::InvalidArgument.into());
        }
        let file = open.file.ok_or(UserError::Kernel(KernelError::InvalidArgument))?;
        Ok((open.fd_va, file, open.omode))
    }

    fn serve_open(&mut self, env: &mut dyn KernelApi, path: &str, omode: u32) -> Result<Reply, UserError> {
        let index = self.openfile_alloc(env)?;

        let f = if omode & (O_CREAT | O_MKDIR) != 0 {
            let ftype = if omode & O_MKDIR != 0 {
                FileType::Directory
            } else {
                FileType::Regular
            };
            match self.fs.file_create(env, path, ftype) {
                Ok(f) => f,
                Err(UserError::Kernel(KernelError::FileExists)) if omode & O_EXCL == 0 => {
                    self.fs.file_open(env, path)?
                }
                Err(err) => return Err(err),
            }
        } else {
            self.fs.file_open(env, path)?
        };
        if omode & O_TRUNC != 0 {
            self.fs.file_set_size(env, f, 0)?;
        }

        let fileid = self.opentab.id_at(index);
        let fd = Fd {
            dev_id: DEV_FILE,
            offset: 0,
            omode,
            fileid,
            file: f.record(env)?,
        };
        let Some(open) = self.opentab.at_mut(index) else {
            return Err(KernelError::InvalidArgument.into());
        };
        open.file = Some(f);
        open.omode = omode;
        let fd_va = open.fd_va;
        env.write_bytes(fd_va, &fd.encode())?;
        log::debug!("open {} -> {}", path, FileId(fileid));
        Ok(Reply::with_page(fd_va, PteFlags::user_write() | PteFlags::SHARE))
    }

    fn serve_map(&mut self, env: &mut dyn KernelApi, fileid: FileId, offset: u32) -> Result<Reply, UserError> {
        let (_, f, omode) = self.lookup(env, fileid)?;
        let addr = self.fs.file_get_block(env, f, offset / BLKSIZE)?;
        let mut perm = PteFlags::PRESENT | PteFlags::USER | PteFlags::SHARE;
        if is_writable(omode) {
            perm |= PteFlags::WRITABLE;
        }
        Ok(Reply::with_page(addr, perm))
    }

    fn serve_set_size(&mut self, env: &mut dyn KernelApi, fileid: FileId, size: u32) -> Result<Reply, UserError> {
        let (fd_va, f, _) = self.lookup(env, fileid)?;
        self.fs.file_set_size(env, f, size)?;
        env.write_u32(fd_va + Fd::OFF_SIZE, size)?;
        Ok(Reply::ok())
    }

    fn handle(&mut self, env: &mut dyn KernelApi, request: FsRequest) -> Result<Reply, UserError> {
        match request {
            FsRequest::Open { path, omode } => self.serve_open(env, &path, omode),
            FsRequest::MapBlock { fileid, offset } => self.serve_map(env, fileid, offset),
            FsRequest::SetSize { fileid, size } => self.serve_set_size(env, fileid, size),
            FsRequest::Close { fileid } => {
                let (_, f, _) = self.lookup(env, fileid)?;
                self.fs.file_close(env, f)?;
                Ok(Reply::ok())
            }
            FsRequest::Dirty { fileid, offset } => {
                let (_, f, _) = self.lookup(env, fileid)?;
                self.fs.file_dirty(env, f, offset)?;
                Ok(Reply::ok())
            }
            FsRequest::Remove { path } => {
                self.fs.file_remove(env, &path)?;
                Ok(Reply::ok())
            }
            FsRequest::Sync => {
                self.fs.sync(env)?;
                Ok(Reply::ok())
            }
        }
    }

    /// Handles the request that just arrived, if it is one
    fn serve_one(&mut self, env: &mut dyn KernelApi) -> Result<(), UserError> {
        let ipc = env.thisenv().ipc;
        log::debug!(
            "[{}] request {} from {} [page {:08x}]",
            env.getenvid(),
            ipc.value,
            ipc.from,
            env.vpt(REQVA).raw()
        );

        if !ipc.perm.contains(PteFlags::PRESENT) {
            log::warn!("invalid request from {}: no argument page", ipc.from);
            return Ok(());
        }

        let body = env.read_page(REQVA)?;
        let Some(request) = FsRequest::decode(ipc.value, &body) else {
            log::warn!("invalid request code {} from {}", ipc.value, ipc.from);
            return Ok(());
        };

        let reply = match self.handle(env, request) {
            Ok(reply) => reply,
            Err(UserError::Kernel(err)) => {
                log::debug!("request {} from {}: {}", ipc.value, ipc.from, err);
                Reply::error(err)
            }
            Err(err) => return Err(err),
        };
        self.reply(env, ipc.from, reply)
    }

    /// Sends a reply, waiting for the client to be receiving
    ///
    /// A client that went away is not the server's problem.
    fn reply(&mut self, env: &mut dyn KernelApi, to: EnvId, reply: Reply) -> Result<(), UserError> {
        let (src_va, perm) = reply
            .page
            .unwrap_or((core_types::memory::UTOP, PteFlags::empty()));
        loop {
            match env.sys_ipc_try_send(to, reply.value, src_va, perm) {
                Ok(_) => return Ok(()),
                Err(UserError::Kernel(KernelError::IpcNotReceiving)) => env.sys_yield()?,
                Err(UserError::Kernel(err)) => {
                    log::warn!("reply to {} failed: {}", to, err);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Program for FileServer {
    fn name(&self) -> &str {
        "fs"
    }

    fn resume(&mut self, env: &mut dyn KernelApi) -> Result<ProgramStatus, UserError> {
        if !self.started {
            self.fs.mount(env)?;
            self.started = true;
        } else {
            if env.thisenv().ipc.recving {
                return Ok(ProgramStatus::Yielded);
            }
            self.serve_one(env)?;
            env.sys_page_unmap(EnvId::CURRENT, REQVA)?;
        }
        env.sys_ipc_recv_async(REQVA)?;
        Ok(ProgramStatus::Yielded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FSIPCBUF, O_RDONLY, O_RDWR};
    use crate::test_utils::{Fixture, MOTD};
    use sim_kernel::{KernelConfig, Machine};
    use user_lib::{ipc_recv, ipc_send};

    /// Scratch client mapping for replies
    const REPLYVA: u32 = 0x0200_0000;

    fn boot(fixture: &Fixture) -> (Machine, EnvId) {
        let mut machine = Machine::boot(KernelConfig {
            nenv: 8,
            npages: 2048,
            ..KernelConfig::default()
        })
        .unwrap();
        let server = machine
            .spawn(Box::new(FileServer::new(
                Box::new(fixture.disk.clone()),
                ServeConfig::default(),
            )))
            .unwrap();
        (machine, server)
    }

    /// Sends one request and returns the reply value and page permissions
    fn request(
        env: &mut dyn KernelApi,
        server: EnvId,
        req: &FsRequest,
    ) -> Result<(i32, PteFlags), UserError> {
        if !env.va_is_mapped(FSIPCBUF) {
            env.sys_page_alloc(EnvId::CURRENT, FSIPCBUF, PteFlags::user_write())?;
        }
        let mut page = vec![0u8; PGSIZE as usize];
        let body = req.encode();
        page[..body.len()].copy_from_slice(&body);
        env.write_bytes(FSIPCBUF, &page)?;
        ipc_send(env, server, req.code(), Some(FSIPCBUF), PteFlags::user_write())?;
        let msg = ipc_recv(env, Some(REPLYVA))?;
        Ok((msg.value as i32, msg.perm))
    }

    fn open(env: &mut dyn KernelApi, server: EnvId, path: &str, omode: u32) -> Result<(i32, Fd), UserError> {
        let (r, _) = request(
            env,
            server,
            &FsRequest::Open {
                path: path.to_string(),
                omode,
            },
        )?;
        if r < 0 {
            return Ok((r, Fd::default()));
        }
        let mut raw = vec![0u8; Fd::encoded_len()];
        env.read_bytes(REPLYVA, &mut raw)?;
        Ok((r, Fd::decode(&raw)))
    }

    #[test]
    fn test_open_returns_shared_descriptor() {
        let fixture = Fixture::new();
        let (mut machine, server) = boot(&fixture);
        let client = machine.create_env().unwrap();
        machine
            .enter(client, |env| {
                let (r, fd) = open(env, server, "/motd", O_RDONLY)?;
                assert_eq!(r, 0);
                assert_eq!(fd.dev_id, DEV_FILE);
                assert_eq!(fd.file.name, "motd");
                assert_eq!(fd.file.size, MOTD.len() as u32);
                assert_eq!(fd.fileid as usize % MAXOPEN, 0);
                assert!(fd.fileid as usize >= MAXOPEN);
                assert!(env.vpt(REPLYVA).flags().contains(PteFlags::SHARE));
                assert_eq!(env.pageref(REPLYVA), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_map_block_permissions_follow_open_mode() {
        let fixture = Fixture::new();
        let (mut machine, server) = boot(&fixture);
        let client = machine.create_env().unwrap();
        machine
            .enter(client, |env| {
                let (_, fd) = open(env, server, "/motd", O_RDONLY)?;
                // keep the descriptor mapped elsewhere so the next reply
                // does not replace it
                env.sys_page_map(EnvId::CURRENT, REPLYVA, EnvId::CURRENT, 0x0300_0000, PteFlags::user_write() | PteFlags::SHARE)?;
                let map = FsRequest::MapBlock {
                    fileid: FileId(fd.fileid),
                    offset: 0,
                };
                let (r, perm) = request(env, server, &map)?;
                assert_eq!(r, 0);
                assert!(!perm.contains(PteFlags::WRITABLE));
                let mut buf = vec![0u8; MOTD.len()];
                env.read_bytes(REPLYVA, &mut buf)?;
                assert_eq!(buf, MOTD);

                let (_, fd) = open(env, server, "/motd", O_RDWR)?;
                env.sys_page_map(EnvId::CURRENT, REPLYVA, EnvId::CURRENT, 0x0300_1000, PteFlags::user_write() | PteFlags::SHARE)?;
                let map = FsRequest::MapBlock {
                    fileid: FileId(fd.fileid),
                    offset: 0,
                };
                let (r, perm) = request(env, server, &map)?;
                assert_eq!(r, 0);
                assert!(perm.contains(PteFlags::WRITABLE | PteFlags::SHARE));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_open_modes() {
        let fixture = Fixture::new();
        let (mut machine, server) = boot(&fixture);
        let client = machine.create_env().unwrap();
        machine
            .enter(client, |env| {
                let (r, _) = open(env, server, "/missing", O_RDONLY)?;
                assert_eq!(r, KernelError::NotFound.code());

                let (r, fd) = open(env, server, "/new", O_RDWR | O_CREAT)?;
                assert_eq!(r, 0);
                assert_eq!(fd.file.size, 0);

                let (r, _) = open(env, server, "/motd", O_RDWR | O_CREAT | O_EXCL)?;
                assert_eq!(r, KernelError::FileExists.code());

                let (r, fd) = open(env, server, "/motd", O_RDWR | O_CREAT | O_TRUNC)?;
                assert_eq!(r, 0);
                assert_eq!(fd.file.size, 0);

                let (r, fd) = open(env, server, "/newdir", O_RDONLY | O_MKDIR)?;
                assert_eq!(r, 0);
                assert!(fd.file.is_dir());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_stale_file_id_is_rejected() {
        let fixture = Fixture::new();
        let (mut machine, server) = boot(&fixture);
        let client = machine.create_env().unwrap();
        machine
            .enter(client, |env| {
                let (_, fd) = open(env, server, "/motd", O_RDONLY)?;
                let fileid = FileId(fd.fileid);
                let (r, _) = request(env, server, &FsRequest::Close { fileid })?;
                assert_eq!(r, 0);
                env.sys_page_unmap(EnvId::CURRENT, REPLYVA)?;

                let map = FsRequest::MapBlock { fileid, offset: 0 };
                let (r, _) = request(env, server, &map)?;
                assert_eq!(r, KernelError::InvalidArgument.code());

                // the slot is reused under a new id
                let (_, again) = open(env, server, "/motd", O_RDONLY)?;
                assert_eq!(again.fileid, fd.fileid + MAXOPEN as u32);
                let map = FsRequest::MapBlock { fileid, offset: 0 };
                let (r, _) = request(env, server, &map)?;
                assert_eq!(r, KernelError::InvalidArgument.code());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_set_size_updates_descriptor() {
        let fixture = Fixture::new();
        let (mut machine, server) = boot(&fixture);
        let client = machine.create_env().unwrap();
        machine
            .enter(client, |env| {
                let (_, fd) = open(env, server, "/motd", O_RDWR)?;
                let set = FsRequest::SetSize {
                    fileid: FileId(fd.fileid),
                    size: 3,
                };
                env.sys_page_map(EnvId::CURRENT, REPLYVA, EnvId::CURRENT, 0x0300_0000, PteFlags::user_write() | PteFlags::SHARE)?;
                let (r, _) = request(env, server, &set)?;
                assert_eq!(r, 0);
                assert_eq!(env.read_u32(0x0300_0000 + Fd::OFF_SIZE)?, 3);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_open_table_exhaustion() {
        let fixture = Fixture::new();
        let mut machine = Machine::boot(KernelConfig {
            nenv: 8,
            npages: 2048,
            ..KernelConfig::default()
        })
        .unwrap();
        let server = machine
            .spawn(Box::new(FileServer::new(
                Box::new(fixture.disk.clone()),
                ServeConfig { max_open: 2 },
            )))
            .unwrap();
        let client = machine.create_env().unwrap();
        machine
            .enter(client, |env| {
                for i in 0..2u32 {
                    let (r, _) = open(env, server, "/motd", O_RDONLY)?;
                    assert_eq!(r, 0);
                    let keep = 0x0300_0000 + i * PGSIZE;
                    env.sys_page_map(EnvId::CURRENT, REPLYVA, EnvId::CURRENT, keep, PteFlags::user_write() | PteFlags::SHARE)?;
                }
                let (r, _) = open(env, server, "/motd", O_RDONLY)?;
                assert_eq!(r, KernelError::TooManyOpenFiles.code());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_request_without_page_is_ignored() {
        let fixture = Fixture::new();
        let (mut machine, server) = boot(&fixture);
        let client = machine.create_env().unwrap();
        machine
            .enter(client, |env| {
                ipc_send(env, server, FsRequest::Sync.code(), None, PteFlags::empty())?;
                // the server is receiving again and answers the next request
                let (r, _) = request(env, server, &FsRequest::Sync)?;
                assert_eq!(r, 0);
                Ok(())
            })
            .unwrap();
    }
}
