//! The dispatcher: the `fuser::Filesystem` implementation. Translates
//! kernel requests into inode/handle operations against a shared
//! `Dispatcher<C>`, bridging synchronous kernel callbacks into async
//! object-client calls via one multi-threaded `tokio::runtime::Runtime`
//! per mount (the same bridging pattern the rest of this crate's
//! ancestry uses for talking to a remote store from a sync callback).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
};
#[cfg(target_os = "macos")]
use libc::ENOATTR;
use libc::{EINVAL, ENODATA, ENOENT, ENOTDIR, ENOTEMPTY, EOPNOTSUPP};
use parking_lot::{Mutex, RwLock};

use crate::block_pool::BlockPool;
use crate::cache::{FileCache, MetadataCache, TypeCache, Ttl};
use crate::cancel::{CancelPolicy, CancelToken};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::dir_handle::DirHandle;
use crate::error::{FsError, FsResult};
use crate::file_handle::{OpenFileTarget, ReadHandle, StagedWriteHandle, StreamingWriteHandle, UploadHandler};
use crate::inode::{Inode, InodeKind, InodeTable, Resolver};
use crate::object_client::{ObjectClient, ObjectClientFacade, Precondition};

pub const ATTR_TTL: Duration = Duration::from_secs(1);
pub const ENTRY_TTL: Duration = Duration::from_secs(1);

fn system_time_from_unix(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

fn fuser_file_type(kind: InodeKind) -> FileType {
    match kind {
        InodeKind::File => FileType::RegularFile,
        InodeKind::Directory | InodeKind::ImplicitDirectory => FileType::Directory,
        InodeKind::Symlink => FileType::Symlink,
    }
}

fn attr_for(inode: &Inode, uid: u32, gid: u32) -> FileAttr {
    let (size, mtime_secs) = match &inode.file {
        Some(f) => (f.size, 0),
        None => (0, 0),
    };
    let kind = fuser_file_type(inode.kind);
    let perm = if kind == FileType::Directory { 0o755 } else { 0o644 };
    FileAttr {
        ino: inode.id,
        size,
        blocks: size.div_ceil(512),
        atime: system_time_from_unix(mtime_secs),
        mtime: system_time_from_unix(mtime_secs),
        ctime: system_time_from_unix(mtime_secs),
        crtime: system_time_from_unix(mtime_secs),
        kind,
        perm,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}

/// A file handle shared across every currently-open streaming write on
/// the same inode: one upload worker, one finalize slot, refcounted.
struct WriteSession {
    upload: UploadHandler,
    finalize: Mutex<Option<crate::file_handle::FinalizeHandle>>,
    bucket: String,
    object_name: String,
    precondition: Precondition,
    open_handles: AtomicUsize,
}

enum OpenHandle<C> {
    Dir(Arc<DirHandle>),
    Read(Arc<ReadHandle<C>>),
    WriteStaged { handle: Arc<StagedWriteHandle>, inode: u64 },
    WriteStreaming {
        handle: Arc<StreamingWriteHandle>,
        session: Arc<WriteSession>,
        inode: u64,
    },
}

/// All mutable state for one mount. Generic over the concrete
/// `ObjectClient` so the same dispatcher drives both the HTTP backend
/// and the in-memory test double.
pub struct Dispatcher<C: ObjectClient + 'static> {
    pub table: Arc<InodeTable>,
    pub metadata_cache: Arc<MetadataCache>,
    pub type_cache: Arc<TypeCache>,
    pub file_cache: Option<Arc<FileCache>>,
    pub block_pool: Arc<BlockPool>,
    pub object_client: Arc<ObjectClientFacade<C>>,
    pub config: Config,
    pub uid: u32,
    pub gid: u32,

    handles: RwLock<HashMap<u64, OpenHandle<C>>>,
    next_fh: AtomicU64,
    write_sessions: Mutex<HashMap<u64, Arc<WriteSession>>>,
}

impl<C: ObjectClient + 'static> Dispatcher<C> {
    pub fn new(
        config: Config,
        object_client: Arc<ObjectClientFacade<C>>,
        clock: SharedClock,
    ) -> std::io::Result<Self> {
        let metadata_cache = Arc::new(MetadataCache::new(
            config.metadata_cache_capacity,
            Ttl::from_seconds(config.metadata_cache_ttl_secs),
            clock.clone(),
        ));
        let type_cache = Arc::new(TypeCache::new(
            config.type_cache_capacity_per_parent,
            Ttl::from_seconds(config.type_cache_ttl_secs),
            clock.clone(),
        ));
        let file_cache = Some(Arc::new(FileCache::new(
            config.file_cache_dir.clone(),
            config.file_cache_capacity_mb * 1024 * 1024,
            crate::cache::FileCachePolicy {
                cache_for_range_reads: config.cache_for_range_reads,
                enable_o_direct: config.enable_o_direct,
                sequential_read_chunk_bytes: config.sequential_read_chunk_mb * 1024 * 1024,
            },
            clock,
        )?));
        let block_pool = BlockPool::new(
            (config.write_block_size_mb * 1024 * 1024) as usize,
            config.write_max_blocks_per_file,
        );
        Ok(Self {
            table: Arc::new(InodeTable::new()),
            metadata_cache,
            type_cache,
            file_cache,
            block_pool,
            object_client,
            config,
            uid: 0,
            gid: 0,
            handles: RwLock::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            write_sessions: Mutex::new(HashMap::new()),
        })
    }

    fn resolver(&self) -> Resolver<C> {
        Resolver {
            table: self.table.clone(),
            type_cache: self.type_cache.clone(),
            metadata_cache: self.metadata_cache.clone(),
            object_client: self.object_client.clone(),
            bucket: self.config.bucket.clone(),
            implicit_dirs: self.config.implicit_dirs,
        }
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    fn cancel_policy(&self) -> CancelPolicy {
        CancelPolicy {
            token: CancelToken::new(),
            ignore_interrupts: self.config.ignore_interrupts,
        }
    }

    fn object_path(&self, inode: &Inode) -> FsResult<String> {
        match inode.kind {
            InodeKind::File => Ok(inode
                .file
                .as_ref()
                .ok_or(FsError::NotFound)?
                .source_object_name
                .clone()),
            InodeKind::Directory | InodeKind::ImplicitDirectory => Ok(inode
                .dir
                .as_ref()
                .and_then(|d| d.prefix.clone())
                .ok_or(FsError::NotADirectory)?),
            InodeKind::Symlink => Err(FsError::NotSupported),
        }
    }
}

/// Owns a `Dispatcher<C>` and a runtime to bridge `fuser`'s synchronous
/// callbacks into it; cloneable handle `fuser::mount2` takes by value.
#[derive(Clone)]
pub struct FsWrapper<C: ObjectClient + 'static> {
    inner: Arc<Mutex<Dispatcher<C>>>,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl<C: ObjectClient + 'static> FsWrapper<C> {
    pub fn new(dispatcher: Dispatcher<C>, runtime: Arc<tokio::runtime::Runtime>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(dispatcher)),
            runtime,
        }
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}

impl<C: ObjectClient + 'static> Filesystem for FsWrapper<C> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        let (resolver, table, uid, gid) = {
            let d = self.inner.lock();
            (d.resolver(), d.table.clone(), d.uid, d.gid)
        };
        match self.block_on(resolver.resolve(parent, name)) {
            Ok(id) => {
                table.record_lookup(id);
                let inode = table.get(id).expect("just resolved");
                reply.entry(&ENTRY_TTL, &attr_for(&inode, uid, gid), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inner.lock().table.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let d = self.inner.lock();
        match d.table.get(ino) {
            Some(inode) => reply.attr(&ATTR_TTL, &attr_for(&inode, d.uid, d.gid)),
            None => reply.error(ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let d = self.inner.lock();
        let Some(mut inode) = d.table.get(ino) else {
            reply.error(ENOENT);
            return;
        };
        if let Some(new_size) = size {
            if let Some(session) = d.write_sessions.lock().get(&ino) {
                if let Some(sticky) = session.upload.sticky_error() {
                    reply.error(sticky.errno());
                    return;
                }
            }
            if let Some(file) = inode.file.as_mut() {
                file.size = new_size;
                d.table.update_file_data(ino, file.clone());
            }
        }
        let inode = d.table.get(ino).unwrap_or(inode);
        reply.attr(&ATTR_TTL, &attr_for(&inode, d.uid, d.gid));
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let d = self.inner.lock();
        if !matches!(d.table.get(ino).map(|i| i.kind), Some(InodeKind::Directory) | Some(InodeKind::ImplicitDirectory)) {
            reply.error(ENOTDIR);
            return;
        }
        let fh = d.alloc_fh();
        d.handles.write().insert(fh, OpenHandle::Dir(Arc::new(DirHandle::new())));
        reply.opened(fh, 0);
    }

    fn readdir(&mut self, _req: &Request, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let (dir_handle, bucket, prefix, table, object_client) = {
            let d = self.inner.lock();
            let Some(inode) = d.table.get(ino) else {
                reply.error(ENOENT);
                return;
            };
            let Some(prefix) = inode.dir.as_ref().and_then(|dd| dd.prefix.clone()) else {
                reply.error(ENOTDIR);
                return;
            };
            let handle = match d.handles.read().get(&fh) {
                Some(OpenHandle::Dir(h)) => h.clone(),
                _ => {
                    reply.error(EINVAL);
                    return;
                }
            };
            (handle, d.config.bucket.clone(), prefix, d.table.clone(), d.object_client.clone())
        };

        if offset == 0 {
            let result = self.block_on(dir_handle.materialize(&bucket, &prefix, ino, &table, &object_client));
            if let Err(e) = result {
                reply.error(e.errno());
                return;
            }
        }

        match dir_handle.read(offset) {
            Ok(entries) => {
                for entry in entries {
                    if reply.add(entry.inode_id, entry.offset, fuser_file_type(entry.kind), &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.inner.lock().handles.write().remove(&fh);
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let write_access = (flags & libc::O_WRONLY != 0) || (flags & libc::O_RDWR != 0);
        let d = self.inner.lock();
        let Some(inode) = d.table.get(ino) else {
            reply.error(ENOENT);
            return;
        };
        if inode.kind != InodeKind::File {
            reply.error(libc::EISDIR);
            return;
        }
        let Ok(object_name) = d.object_path(&inode) else {
            reply.error(EINVAL);
            return;
        };
        let file = inode.file.as_ref().expect("file kind has file data");
        let fh = d.alloc_fh();

        if write_access {
            let precondition = Precondition::None;
            if d.config.enable_streaming_writes {
                let mut sessions = d.write_sessions.lock();
                let session = sessions.entry(ino).or_insert_with(|| {
                    let (upload, finalize) = UploadHandler::spawn(
                        d.config.bucket.clone(),
                        object_name.clone(),
                        precondition,
                        d.block_pool.clone(),
                        d.object_client.clone(),
                    );
                    Arc::new(WriteSession {
                        upload,
                        finalize: Mutex::new(Some(finalize)),
                        bucket: d.config.bucket.clone(),
                        object_name: object_name.clone(),
                        precondition,
                        open_handles: AtomicUsize::new(0),
                    })
                });
                session.open_handles.fetch_add(1, Ordering::SeqCst);
                let handle = Arc::new(StreamingWriteHandle::new(
                    d.block_pool.clone(),
                    session.upload.clone(),
                    d.cancel_policy().token,
                ));
                let session = session.clone();
                drop(sessions);
                d.handles.write().insert(
                    fh,
                    OpenHandle::WriteStreaming { handle, session, inode: ino },
                );
            } else {
                d.handles.write().insert(
                    fh,
                    OpenHandle::WriteStaged {
                        handle: Arc::new(StagedWriteHandle::new(d.config.bucket.clone(), object_name, precondition)),
                        inode: ino,
                    },
                );
            }
        } else {
            let target = OpenFileTarget {
                generation: file.generation,
                size: file.size,
            };
            let handle = Arc::new(ReadHandle::open(
                d.config.bucket.clone(),
                object_name,
                target,
                d.file_cache.clone(),
                d.object_client.clone(),
            ));
            d.handles.write().insert(fh, OpenHandle::Read(handle));
        }
        reply.opened(fh, 0);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        let (bucket, object_client, table, uid, gid, block_pool, parent_inode) = {
            let d = self.inner.lock();
            let Some(parent_inode) = d.table.get(parent) else {
                reply.error(ENOENT);
                return;
            };
            (
                d.config.bucket.clone(),
                d.object_client.clone(),
                d.table.clone(),
                d.uid,
                d.gid,
                d.block_pool.clone(),
                parent_inode,
            )
        };
        let Some(parent_prefix) = parent_inode.dir.as_ref().and_then(|dd| dd.prefix.clone()) else {
            reply.error(ENOTDIR);
            return;
        };
        let object_name = if parent_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{parent_prefix}/{name}")
        };

        let precondition = Precondition::IfGenerationMatch(0);
        let record = match self.block_on(async {
            let writer = object_client.create_chunk_writer(&bucket, &object_name, precondition).await?;
            writer.finalize().await
        }) {
            Ok(r) => r,
            Err(e) => {
                reply.error(crate::object_client::ObjectError::errno(&e));
                return;
            }
        };
        let id = table.insert(
            InodeKind::File,
            parent,
            name.to_string(),
            Some(crate::inode::FileInodeData {
                generation: record.generation,
                size: record.size,
                source_object_name: object_name.clone(),
            }),
            None,
        );
        table.record_lookup(id);
        let inode = table.get(id).expect("just inserted");

        let d = self.inner.lock();
        let fh = d.alloc_fh();
        if d.config.enable_streaming_writes {
            let (upload, finalize) = UploadHandler::spawn(
                bucket.clone(),
                object_name.clone(),
                Precondition::None,
                block_pool.clone(),
                object_client.clone(),
            );
            let session = Arc::new(WriteSession {
                upload: upload.clone(),
                finalize: Mutex::new(Some(finalize)),
                bucket,
                object_name,
                precondition: Precondition::None,
                open_handles: AtomicUsize::new(1),
            });
            d.write_sessions.lock().insert(id, session.clone());
            let handle = Arc::new(StreamingWriteHandle::new(block_pool, upload, d.cancel_policy().token));
            d.handles.write().insert(fh, OpenHandle::WriteStreaming { handle, session, inode: id });
        } else {
            d.handles.write().insert(
                fh,
                OpenHandle::WriteStaged {
                    handle: Arc::new(StagedWriteHandle::new(bucket, object_name, Precondition::None)),
                    inode: id,
                },
            );
        }
        reply.created(&ENTRY_TTL, &attr_for(&inode, uid, gid), 0, fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let handle = match self.inner.lock().handles.read().get(&fh) {
            Some(OpenHandle::Read(h)) => h.clone(),
            _ => {
                reply.error(libc::EBADF);
                return;
            }
        };
        match self.block_on(handle.read(offset as u64, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        enum Target {
            Staged(Arc<StagedWriteHandle>),
            Streaming(Arc<StreamingWriteHandle>),
        }
        let target = match self.inner.lock().handles.read().get(&fh) {
            Some(OpenHandle::WriteStaged { handle, .. }) => Target::Staged(handle.clone()),
            Some(OpenHandle::WriteStreaming { handle, .. }) => Target::Streaming(handle.clone()),
            _ => {
                reply.error(libc::EBADF);
                return;
            }
        };
        let result = match target {
            Target::Staged(h) => h.write(offset as u64, data),
            Target::Streaming(h) => self.block_on(h.write(offset as u64, data)),
        };
        match result {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let removed = self.inner.lock().handles.write().remove(&fh);
        match removed {
            Some(OpenHandle::WriteStaged { handle, inode }) => {
                let (object_client, table) = {
                    let d = self.inner.lock();
                    (d.object_client.clone(), d.table.clone())
                };
                match self.block_on(handle.close(&object_client)) {
                    Ok(record) => {
                        if let Some(existing) = table.get(inode) {
                            if let Some(file) = existing.file {
                                table.update_file_data(
                                    inode,
                                    crate::inode::FileInodeData {
                                        generation: record.generation,
                                        size: record.size,
                                        source_object_name: file.source_object_name,
                                    },
                                );
                            }
                        }
                        reply.ok();
                    }
                    Err(e) => reply.error(e.errno()),
                }
            }
            Some(OpenHandle::WriteStreaming { handle, session, inode }) => {
                let close_result = self.block_on(handle.close());
                if let Err(e) = close_result {
                    reply.error(e.errno());
                    return;
                }
                let remaining = session.open_handles.fetch_sub(1, Ordering::SeqCst) - 1;
                if remaining == 0 {
                    let d = self.inner.lock();
                    d.write_sessions.lock().remove(&inode);
                    drop(d);
                    let finalize = session.finalize.lock().take();
                    if let Some(finalize) = finalize {
                        match self.block_on(finalize.finalize()) {
                            Ok(Some(record)) => {
                                let d = self.inner.lock();
                                d.table.update_file_data(
                                    inode,
                                    crate::inode::FileInodeData {
                                        generation: record.generation,
                                        size: record.size,
                                        source_object_name: session.object_name.clone(),
                                    },
                                );
                            }
                            Ok(None) => {
                                // No bytes were ever written: fall back to a
                                // single-shot empty-object create.
                                let d = self.inner.lock();
                                let object_client = d.object_client.clone();
                                drop(d);
                                let result = self.block_on(async {
                                    let writer = object_client
                                        .create_chunk_writer(&session.bucket, &session.object_name, session.precondition)
                                        .await?;
                                    writer.finalize().await
                                });
                                if let Ok(record) = result {
                                    let d = self.inner.lock();
                                    d.table.update_file_data(
                                        inode,
                                        crate::inode::FileInodeData {
                                            generation: record.generation,
                                            size: record.size,
                                            source_object_name: session.object_name.clone(),
                                        },
                                    );
                                }
                            }
                            Err(e) => {
                                reply.error(e.errno());
                                return;
                            }
                        }
                    }
                }
                reply.ok();
            }
            Some(OpenHandle::Read(_)) | Some(OpenHandle::Dir(_)) | None => reply.ok(),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        let (bucket, object_client, table, uid, gid, parent_prefix) = {
            let d = self.inner.lock();
            let Some(parent_inode) = d.table.get(parent) else {
                reply.error(ENOENT);
                return;
            };
            let Some(prefix) = parent_inode.dir.as_ref().and_then(|dd| dd.prefix.clone()) else {
                reply.error(ENOTDIR);
                return;
            };
            (d.config.bucket.clone(), d.object_client.clone(), d.table.clone(), d.uid, d.gid, prefix)
        };
        let marker_name = if parent_prefix.is_empty() {
            format!("{name}/")
        } else {
            format!("{parent_prefix}/{name}/")
        };
        let result = self.block_on(async {
            let writer = object_client
                .create_chunk_writer(&bucket, &marker_name, Precondition::IfGenerationMatch(0))
                .await?;
            writer.finalize().await
        });
        match result {
            Ok(_) => {
                let id = table.insert(
                    InodeKind::Directory,
                    parent,
                    name.to_string(),
                    None,
                    Some(crate::inode::DirInodeData { prefix: Some(marker_name.trim_end_matches('/').to_string()) }),
                );
                table.record_lookup(id);
                let inode = table.get(id).expect("just inserted");
                reply.entry(&ENTRY_TTL, &attr_for(&inode, uid, gid), 0);
            }
            Err(e) => reply.error(crate::object_client::ObjectError::errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, false, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, true, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(EINVAL);
            return;
        };
        let (table, object_client, bucket) = {
            let d = self.inner.lock();
            (d.table.clone(), d.object_client.clone(), d.config.bucket.clone())
        };
        let Some(entry) = table.lookup_by_name(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        if entry.kind != InodeKind::File {
            reply.error(EOPNOTSUPP);
            return;
        }
        let Some(file) = entry.file.clone() else {
            reply.error(EOPNOTSUPP);
            return;
        };
        let Some(new_parent_inode) = table.get(newparent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(new_parent_prefix) = new_parent_inode.dir.as_ref().and_then(|dd| dd.prefix.clone()) else {
            reply.error(ENOTDIR);
            return;
        };
        let new_object_name = if new_parent_prefix.is_empty() {
            newname.to_string()
        } else {
            format!("{new_parent_prefix}/{newname}")
        };

        let result = self.block_on(async {
            let composed = object_client
                .compose(
                    &bucket,
                    &new_object_name,
                    &[crate::object_client::ComposeSource {
                        name: file.source_object_name.clone(),
                        generation: file.generation,
                    }],
                    Precondition::None,
                )
                .await?;
            object_client
                .delete(&bucket, &file.source_object_name, Precondition::IfGenerationMatch(file.generation))
                .await?;
            Ok::<_, crate::object_client::ObjectError>(composed)
        });
        match result {
            Ok(composed) => {
                table.unlink_name(parent, name);
                table.rename_entry(entry.id, newparent, newname.to_string());
                table.update_file_data(
                    entry.id,
                    crate::inode::FileInodeData {
                        generation: composed.generation,
                        size: composed.size,
                        source_object_name: new_object_name,
                    },
                );
                reply.ok();
            }
            Err(e) => reply.error(crate::object_client::ObjectError::errno(&e)),
        }
    }

    // Extended attributes aren't stored remotely; these stubs only
    // exist so tools that probe for xattr support don't get EOPNOTSUPP.
    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, _size: u32, reply: ReplyXattr) {
        tracing::trace!(ino, name = ?name, "getxattr (passthrough stub)");
        #[cfg(target_os = "macos")]
        reply.error(ENOATTR);
        #[cfg(not(target_os = "macos"))]
        reply.error(ENODATA);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        tracing::trace!(ino, name = ?name, "setxattr (passthrough stub)");
        reply.ok();
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        tracing::trace!(ino, size, "listxattr (passthrough stub)");
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::trace!(ino, name = ?name, "removexattr (passthrough stub)");
        reply.ok();
    }
}

impl<C: ObjectClient + 'static> FsWrapper<C> {
    fn remove_entry(&mut self, parent: u64, name: &OsStr, expect_dir: bool, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        let (table, object_client, bucket, metadata_cache, type_cache) = {
            let d = self.inner.lock();
            (d.table.clone(), d.object_client.clone(), d.config.bucket.clone(), d.metadata_cache.clone(), d.type_cache.clone())
        };
        let Some(entry) = table.lookup_by_name(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let is_dir = matches!(entry.kind, InodeKind::Directory | InodeKind::ImplicitDirectory);
        if expect_dir && !is_dir {
            reply.error(ENOTDIR);
            return;
        }
        if !expect_dir && is_dir {
            reply.error(libc::EISDIR);
            return;
        }

        let object_name = match &entry.kind {
            InodeKind::File => entry.file.as_ref().map(|f| f.source_object_name.clone()),
            InodeKind::Directory => entry.dir.as_ref().and_then(|d| d.prefix.clone()).map(|p| format!("{p}/")),
            _ => None,
        };
        let Some(object_name) = object_name else {
            // Implicit directories have no marker object to delete.
            table.unlink_name(parent, name);
            reply.ok();
            return;
        };

        if expect_dir {
            let has_children = self.block_on(object_client.list_page(&bucket, &object_name, "/", None))
                .map(|p| !p.objects.is_empty() || !p.subdirs.is_empty())
                .unwrap_or(false);
            if has_children {
                reply.error(ENOTEMPTY);
                return;
            }
        }

        let result = self.block_on(object_client.delete(&bucket, &object_name, Precondition::None));
        match result {
            Ok(()) => {
                table.unlink_name(parent, name);
                metadata_cache.invalidate(parent, name);
                type_cache.invalidate(parent, name);
                reply.ok();
            }
            Err(e) => reply.error(crate::object_client::ObjectError::errno(&e)),
        }
    }
}
