//! The FUSE filesystem adapter: projects the cache as a flat directory of
//! markdown files, one per issue, plus the synthetic `<title>[new].md`
//! entry point for drafting a new one.
//!
//! Grounded on the `fuser::Filesystem` trait's newtype-based signatures
//! (`INodeNo`, `FileHandle`, `Errno`, ...). Every override blocks the
//! calling kernel thread only long enough to run one cache call via a
//! borrowed `tokio::runtime::Handle` — the adapter itself does no async
//! work of its own.

mod names;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fuser::{
    BsdFileFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, INodeNo,
    LockOwner, OpenFlags, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, RenameFlags, TimeOrNow, WriteFlags,
};

use crate::cache::{CacheStore, Issue, IssueFieldChanges};
use crate::codec;
use crate::config::GitmdfsConfig;
use crate::error::GitmdfsError;
use crate::sync::SyncHandle;

const ROOT_INO: u64 = 1;
const ATTR_TTL: Duration = Duration::from_secs(1);
const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

fn errno(e: &GitmdfsError) -> Errno {
    Errno::from_i32(e.to_errno())
}

fn ino_for_issue(number: u64) -> u64 {
    number * 2
}

fn issue_number_for_ino(ino: u64) -> Option<u64> {
    (ino >= 2 && ino % 2 == 0).then_some(ino / 2)
}

fn system_time_from_chrono(dt: DateTime<Utc>) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::new(dt.timestamp().max(0) as u64, dt.timestamp_subsec_nanos())
}

/// What an open file handle will write back on flush.
#[derive(Clone)]
enum FileTarget {
    Issue(u64),
    NewIssue(String),
}

struct OpenFile {
    ino: u64,
    target: FileTarget,
    buffer: Vec<u8>,
    dirty: bool,
}

/// Inode numbers for `<title>[new].md` entries, which have no cache row
/// until their first flush. Assigned on first `Lookup`/`Create` of a given
/// name and held for the process lifetime, the way the kernel's own inode
/// cache would.
#[derive(Default)]
struct SyntheticInodes {
    next: u64,
    by_name: HashMap<String, u64>,
    name_by_ino: HashMap<u64, String>,
}

impl SyntheticInodes {
    fn ino_for_name(&mut self, name: &str) -> u64 {
        if let Some(ino) = self.by_name.get(name) {
            return *ino;
        }
        if self.next == 0 {
            self.next = ino_for_issue(u32::MAX as u64) + 1; // clear of plausible issue numbers, always odd
        }
        let ino = self.next;
        self.next += 2;
        self.by_name.insert(name.to_string(), ino);
        self.name_by_ino.insert(ino, name.to_string());
        ino
    }

    fn name_for_ino(&self, ino: u64) -> Option<String> {
        self.name_by_ino.get(&ino).cloned()
    }
}

async fn render_issue(
    store: &CacheStore,
    repo: &str,
    number: u64,
) -> Result<(Issue, String), GitmdfsError> {
    let issue = store
        .get_issue(repo, number)
        .await?
        .ok_or_else(|| GitmdfsError::not_found(format!("issue {number}")))?;
    let comments = store.list_comments(repo, number).await?;
    let text = codec::encode(&issue, &comments);
    Ok((issue, text))
}

async fn flush_issue(
    store: &CacheStore,
    repo: &str,
    number: u64,
    text: &str,
) -> Result<bool, GitmdfsError> {
    let parsed = codec::decode(text)?;
    let issue = store
        .get_issue(repo, number)
        .await?
        .ok_or_else(|| GitmdfsError::not_found(format!("issue {number}")))?;
    let comments = store.list_comments(repo, number).await?;

    let changes = codec::diff(&issue, &parsed);
    let (new_comments, edited_comments) = codec::diff_comments(&comments, &parsed.comments);

    let mut applied = false;
    if changes.any() {
        let field_changes = IssueFieldChanges {
            title: changes.title_changed.then(|| parsed.title.clone()),
            body: changes.body_changed.then(|| parsed.body.clone()),
            state: None,
            labels: None,
        };
        store.mark_dirty(repo, number, &field_changes).await?;
        applied = true;
    }
    for new_comment in &new_comments {
        store.add_pending_comment(repo, number, &new_comment.body).await?;
        applied = true;
    }
    for edited in &edited_comments {
        store.mark_comment_dirty(repo, edited.id, &edited.body).await?;
        applied = true;
    }
    Ok(applied)
}

async fn flush_new_issue(store: &CacheStore, repo: &str, text: &str) -> Result<bool, GitmdfsError> {
    let parsed = codec::decode(text)?;
    store
        .add_pending_issue(repo, &parsed.title, &parsed.body, &[])
        .await?;
    Ok(true)
}

/// The mounted filesystem: a flat directory over one repository's cached
/// issues.
pub struct GitmdfsFs {
    runtime: tokio::runtime::Handle,
    store: Arc<CacheStore>,
    sync: SyncHandle,
    config: GitmdfsConfig,
    synthetic: StdMutex<SyntheticInodes>,
    handles: StdMutex<HashMap<u64, Arc<StdMutex<OpenFile>>>>,
    next_fh: AtomicU64,
}

impl GitmdfsFs {
    pub fn new(
        runtime: tokio::runtime::Handle,
        store: Arc<CacheStore>,
        sync: SyncHandle,
        config: GitmdfsConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            sync,
            config,
            synthetic: StdMutex::new(SyntheticInodes::default()),
            handles: StdMutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn repo(&self) -> &str {
        &self.config.repository
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    fn get_handle(&self, fh: u64) -> Option<Arc<StdMutex<OpenFile>>> {
        self.handles.lock().unwrap().get(&fh).cloned()
    }

    /// The size an already-open handle on `ino` would report, if one is
    /// open, so `Getattr` reflects unflushed writes the way `stat` on an
    /// open-but-unsaved file normally would.
    fn open_buffer_len(&self, ino: u64) -> Option<u64> {
        let handles = self.handles.lock().unwrap();
        handles.values().find_map(|h| {
            let state = h.lock().unwrap();
            (state.ino == ino).then_some(state.buffer.len() as u64)
        })
    }

    fn root_attr(&self) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: INodeNo(ROOT_INO),
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn issue_attr(&self, issue: &Issue, size: u64) -> FileAttr {
        let mtime = system_time_from_chrono(issue.updated_at);
        let ctime = system_time_from_chrono(issue.created_at);
        FileAttr {
            ino: INodeNo(ino_for_issue(issue.number)),
            size,
            blocks: (size + 511) / 512,
            atime: mtime,
            mtime,
            ctime,
            crtime: ctime,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn synthetic_attr(&self, ino: u64, size: u64) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: INodeNo(ino),
            size,
            blocks: (size + 511) / 512,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Filesystem for GitmdfsFs {
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        if parent.0 != ROOT_INO {
            reply.error(Errno::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(Errno::EINVAL);
            return;
        };

        if names::is_new_issue_name(name) {
            let title = names::new_issue_title(name).unwrap_or_default();
            let ino = self.synthetic.lock().unwrap().ino_for_name(name);
            let size = self
                .open_buffer_len(ino)
                .unwrap_or_else(|| codec::new_issue_template(self.repo(), &title).len() as u64);
            reply.entry(&ATTR_TTL, &self.synthetic_attr(ino, size), fuser::Generation(0));
            return;
        }

        let Some(number) = names::parse_number(name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.block_on(render_issue(&self.store, self.repo(), number)) {
            Ok((issue, text)) => {
                let size = self.open_buffer_len(ino_for_issue(number)).unwrap_or(text.len() as u64);
                reply.entry(&ATTR_TTL, &self.issue_attr(&issue, size), fuser::Generation(0));
            }
            Err(_) => reply.error(Errno::ENOENT),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        if ino.0 == ROOT_INO {
            reply.attr(&ATTR_TTL, &self.root_attr());
            return;
        }

        let buffered_size = self.open_buffer_len(ino.0);

        if let Some(number) = issue_number_for_ino(ino.0) {
            match self.block_on(render_issue(&self.store, self.repo(), number)) {
                Ok((issue, text)) => {
                    let size = buffered_size.unwrap_or(text.len() as u64);
                    reply.attr(&ATTR_TTL, &self.issue_attr(&issue, size));
                }
                Err(e) => reply.error(errno(&e)),
            }
            return;
        }

        match self.synthetic.lock().unwrap().name_for_ino(ino.0) {
            Some(name) => {
                let size = buffered_size.unwrap_or_else(|| {
                    let title = names::new_issue_title(&name).unwrap_or_default();
                    codec::new_issue_template(self.repo(), &title).len() as u64
                });
                reply.attr(&ATTR_TTL, &self.synthetic_attr(ino.0, size));
            }
            None => reply.error(Errno::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        req: &Request,
        ino: INodeNo,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        if let Some(new_size) = size {
            if let Some(fh) = fh {
                if let Some(handle) = self.get_handle(fh.0) {
                    let mut state = handle.lock().unwrap();
                    if (new_size as usize) <= state.buffer.len() {
                        state.buffer.truncate(new_size as usize);
                        state.dirty = true;
                    }
                    // growing past the current length is a no-op on the buffer;
                    // the editor writes the new bytes explicitly.
                }
            } else if let Some(number) = issue_number_for_ino(ino.0) {
                // No handle: the cache and any open buffer are left alone,
                // only the reported size reflects the truncate request.
                match self.block_on(render_issue(&self.store, self.repo(), number)) {
                    Ok((issue, _)) => reply.attr(&ATTR_TTL, &self.issue_attr(&issue, new_size)),
                    Err(e) => reply.error(errno(&e)),
                }
                return;
            } else if self.synthetic.lock().unwrap().name_for_ino(ino.0).is_some() {
                reply.attr(&ATTR_TTL, &self.synthetic_attr(ino.0, new_size));
                return;
            }
        }
        self.getattr(req, ino, fh, reply);
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        if ino.0 != ROOT_INO {
            reply.error(Errno::ENOTDIR);
            return;
        }
        reply.opened(FileHandle(0), FopenFlags::empty());
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        if ino.0 != ROOT_INO {
            reply.error(Errno::ENOTDIR);
            return;
        }
        let issues = match self.block_on(self.store.list_issues(self.repo())) {
            Ok(issues) => issues,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ROOT_INO, FileType::Directory, ".".to_string()),
            (ROOT_INO, FileType::Directory, "..".to_string()),
        ];
        for issue in &issues {
            entries.push((
                ino_for_issue(issue.number),
                FileType::RegularFile,
                names::file_name(&issue.title, issue.number),
            ));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(INodeNo(entry_ino), (i + 1) as u64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let target = if let Some(number) = issue_number_for_ino(ino.0) {
            FileTarget::Issue(number)
        } else {
            match self.synthetic.lock().unwrap().name_for_ino(ino.0) {
                Some(name) => FileTarget::NewIssue(names::new_issue_title(&name).unwrap_or_default()),
                None => {
                    reply.error(Errno::ENOENT);
                    return;
                }
            }
        };

        let buffer = match &target {
            FileTarget::Issue(number) => {
                match self.block_on(render_issue(&self.store, self.repo(), *number)) {
                    Ok((_, text)) => text.into_bytes(),
                    Err(e) => {
                        reply.error(errno(&e));
                        return;
                    }
                }
            }
            FileTarget::NewIssue(title) => codec::new_issue_template(self.repo(), title).into_bytes(),
        };

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(
            fh,
            Arc::new(StdMutex::new(OpenFile {
                ino: ino.0,
                target,
                buffer,
                dirty: false,
            })),
        );
        reply.opened(FileHandle(fh), FopenFlags::FOPEN_DIRECT_IO);
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.get_handle(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        let state = handle.lock().unwrap();
        let start = offset as usize;
        if start >= state.buffer.len() {
            reply.data(&[]);
            return;
        }
        let end = (start + size as usize).min(state.buffer.len());
        reply.data(&state.buffer[start..end]);
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.get_handle(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        if offset < 0 {
            reply.error(Errno::EINVAL);
            return;
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > MAX_FILE_SIZE {
            reply.error(errno(&GitmdfsError::FileTooLarge));
            return;
        }

        let mut state = handle.lock().unwrap();
        if end > state.buffer.len() {
            state.buffer.resize(end, 0);
        }
        state.buffer[start..end].copy_from_slice(data);
        state.dirty = true;
        reply.written(data.len() as u32);
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.get_handle(fh.0) else {
            reply.ok();
            return;
        };
        let (target, buffer, dirty) = {
            let state = handle.lock().unwrap();
            (state.target.clone(), state.buffer.clone(), state.dirty)
        };
        if !dirty {
            reply.ok();
            return;
        }

        let text = match String::from_utf8(buffer) {
            Ok(t) => t,
            Err(_) => {
                reply.error(Errno::EIO);
                return;
            }
        };

        let result = match &target {
            FileTarget::Issue(number) => self.block_on(flush_issue(&self.store, self.repo(), *number, &text)),
            FileTarget::NewIssue(_) => self.block_on(flush_new_issue(&self.store, self.repo(), &text)),
        };

        match result {
            // a DecodeError bails out of flush_issue/flush_new_issue via `?`
            // before any cache write, so the cache and the sync trigger are
            // both untouched on that path.
            Ok(applied) => {
                if applied {
                    self.sync.on_local_change();
                }
                handle.lock().unwrap().dirty = false;
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.lock().unwrap().remove(&fh.0);
        reply.ok();
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        if parent.0 != ROOT_INO {
            reply.error(Errno::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(Errno::EINVAL);
            return;
        };
        if !names::is_new_issue_name(name) {
            reply.error(Errno::EPERM);
            return;
        }

        let title = names::new_issue_title(name).unwrap_or_default();
        let template = codec::new_issue_template(self.repo(), &title);
        let ino = self.synthetic.lock().unwrap().ino_for_name(name);

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(
            fh,
            Arc::new(StdMutex::new(OpenFile {
                ino,
                target: FileTarget::NewIssue(title),
                buffer: template.clone().into_bytes(),
                dirty: false,
            })),
        );

        let attr = self.synthetic_attr(ino, template.len() as u64);
        reply.created(&ATTR_TTL, &attr, fuser::Generation(0), FileHandle(fh), FopenFlags::FOPEN_DIRECT_IO);
    }

    fn unlink(&self, _req: &Request, _parent: INodeNo, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(Errno::EPERM);
    }

    fn rename(
        &self,
        _req: &Request,
        _parent: INodeNo,
        _name: &OsStr,
        _newparent: INodeNo,
        _newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        reply.error(Errno::EPERM);
    }
}

/// Mount `fs` at `mountpoint`, blocking the calling thread until the
/// filesystem is unmounted. `default_permissions` hands permission
/// enforcement to the kernel so `access` need not be implemented.
pub fn mount(fs: GitmdfsFs, mountpoint: impl AsRef<Path>) -> std::io::Result<()> {
    fuser::mount(
        fs,
        mountpoint,
        &{
            let mut config = fuser::Config::default();
            config.mount_options = vec![
                fuser::MountOption::RW,
                fuser::MountOption::FSName("gitmdfs".to_string()),
                fuser::MountOption::DefaultPermissions,
            ];
            config
        },
    )
}

/// Mount `fs` at `mountpoint` on a background thread, returning immediately
/// with a handle that unmounts on drop.
pub fn spawn_mount(
    fs: GitmdfsFs,
    mountpoint: impl AsRef<Path>,
) -> std::io::Result<fuser::BackgroundSession> {
    fuser::spawn_mount(
        fs,
        mountpoint,
        &{
            let mut config = fuser::Config::default();
            config.mount_options = vec![
                fuser::MountOption::RW,
                fuser::MountOption::FSName("gitmdfs".to_string()),
                fuser::MountOption::DefaultPermissions,
            ];
            config
        },
    )
}
