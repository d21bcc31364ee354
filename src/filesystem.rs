//! Dispatch shims: one short function per external operation, each locking
//! the single global mutex, translating and consulting the cache, issuing
//! (or skipping) the backing call, and mapping errors back into errno. The
//! shims never touch cache state themselves -- that all lives in
//! `cache::InodeCache` -- they exist to adapt `FilesystemMT`'s call shapes
//! to it and to own the lock.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use fuse_mt::{
    CallbackResult, CreatedEntry, DirectoryEntry, FileType, FilesystemMT, RequestInfo,
    ResultCreate, ResultData, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice,
    ResultStatfs, ResultWrite, ResultXattr, Xattr,
};
use log::error;
use nix::fcntl::OFlag;
use nix::sys::stat::{mknod, Mode, SFlag};

use crate::cache::InodeCache;
use crate::handle::HandleTable;

/// Kernel attribute-cache TTL handed back with every `ResultEntry`. Kept
/// short: the whole point of this filesystem is that our own in-memory
/// cache, not the kernel's, is authoritative, and cached attributes here can
/// change from calls the kernel doesn't see (another handle's write).
const ATTR_TTL: Duration = Duration::from_secs(1);

struct State {
    cache: InodeCache,
    handles: HandleTable,
}

pub struct PramFilesystem {
    state: Mutex<State>,
}

impl PramFilesystem {
    pub fn new(backing_root: std::path::PathBuf) -> Self {
        PramFilesystem {
            state: Mutex::new(State {
                cache: InodeCache::new(backing_root),
                handles: HandleTable::default(),
            }),
        }
    }

    /// A poisoned cache lock means some prior critical section already
    /// violated an invariant under a panic; per §4.8 that is fatal, not
    /// something a single request can recover from.
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("pramfusehpc: error: {}", crate::error::PramError::CachePoisoned);
            std::process::exit(1);
            #[allow(unreachable_code)]
            poisoned.into_inner()
        })
    }
}

fn errno_of(err: &io::Error) -> libc::c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn d_type_to_kind(t: Option<nix::dir::Type>) -> FileType {
    match t {
        Some(nix::dir::Type::Directory) => FileType::Directory,
        Some(nix::dir::Type::File) => FileType::RegularFile,
        Some(nix::dir::Type::Symlink) => FileType::Symlink,
        Some(nix::dir::Type::Fifo) => FileType::NamedPipe,
        Some(nix::dir::Type::Socket) => FileType::Socket,
        Some(nix::dir::Type::CharacterDevice) => FileType::CharDevice,
        Some(nix::dir::Type::BlockDevice) => FileType::BlockDevice,
        None => FileType::RegularFile,
    }
}

impl FilesystemMT for PramFilesystem {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        Ok(())
    }

    fn destroy(&self) {
        let mut state = self.lock();
        // Bulk-release everything the cache still holds; nothing further
        // will be read back once the process tears down.
        state.cache.drain();
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        let mut state = self.lock();
        let attr = if let Some(fh) = fh {
            match state.handles.file(fh) {
                Some(open) => open.entry.lock().unwrap().attr,
                None => return Err(libc::EBADF),
            }
        } else {
            state.cache.getattr(path).map_err(|e| errno_of(&e))?
        };
        Ok((ATTR_TTL, attr))
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>, mode: u32) -> ResultEmpty {
        self.lock().cache.chmod(path, mode).map_err(|e| errno_of(&e))
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        self.lock()
            .cache
            .chown(path, uid, gid)
            .map_err(|e| errno_of(&e))
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        let mut state = self.lock();
        let handle = fh.and_then(|fh| state.handles.file(fh).map(|o| (o.fd, o.entry.clone())));
        let result = match handle {
            Some((fd, entry)) => state.cache.truncate_handle(&entry, fd, size),
            None => state.cache.truncate_path(path, size),
        };
        result.map_err(|e| errno_of(&e))
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) -> ResultEmpty {
        self.lock()
            .cache
            .utimens(path, atime, mtime)
            .map_err(|e| errno_of(&e))
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> ResultData {
        self.lock().cache.readlink(path).map_err(|e| errno_of(&e))
    }

    fn mknod(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> ResultEntry {
        let path = parent.join(name);
        let mut state = self.lock();
        let backing = state.cache.translate(&path);
        let sflag = SFlag::from_bits_truncate((mode as libc::mode_t) & libc::S_IFMT);
        let perm = Mode::from_bits_truncate((mode as libc::mode_t) & 0o7777);
        mknod(&backing, sflag, perm, rdev as u64).map_err(crate::cache::nix_to_io).map_err(|e| errno_of(&e))?;
        let attr = state.cache.getattr(&path).map_err(|e| errno_of(&e))?;
        Ok((ATTR_TTL, attr))
    }

    fn mkdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        let path = parent.join(name);
        let mut state = self.lock();
        let backing = state.cache.translate(&path);
        nix::unistd::mkdir(&backing, Mode::from_bits_truncate(mode as libc::mode_t))
            .map_err(crate::cache::nix_to_io)
            .map_err(|e| errno_of(&e))?;
        // Directories are never cached (§4.3.9), so this is a throwaway
        // lstat purely to answer the kernel's immediate follow-up lookup.
        let attr = crate::cache::lstat_attr(&backing).map_err(|e| errno_of(&e))?;
        Ok((ATTR_TTL, attr))
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let path = parent.join(name);
        self.lock().cache.unlink(&path).map_err(|e| errno_of(&e))
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let path = parent.join(name);
        let mut state = self.lock();
        let backing = state.cache.translate(&path);
        std::fs::remove_dir(&backing).map_err(|e| errno_of(&e))
    }

    fn symlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr, target: &Path) -> ResultEntry {
        let attr = self
            .lock()
            .cache
            .symlink(parent, name, target)
            .map_err(|e| errno_of(&e))?;
        Ok((ATTR_TTL, attr))
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        let src = parent.join(name);
        let dst = newparent.join(newname);
        self.lock().cache.rename(&src, &dst).map_err(|e| errno_of(&e))
    }

    fn link(&self, _req: RequestInfo, path: &Path, newparent: &Path, newname: &OsStr) -> ResultEntry {
        let attr = self
            .lock()
            .cache
            .link(path, newparent, newname)
            .map_err(|e| errno_of(&e))?;
        Ok((ATTR_TTL, attr))
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        let mut state = self.lock();
        match state.cache.open(path, flags as i32) {
            Ok((fd, entry)) => {
                let fh = state.handles.insert_file(fd, entry);
                Ok((fh, flags))
            }
            Err(e) => Err(errno_of(&e)),
        }
    }

    fn read(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        let mut state = self.lock();
        let handle = state.handles.file(fh).map(|o| (o.fd, o.entry.clone()));
        drop(state);
        match handle {
            Some((fd, entry)) => match entry.lock().unwrap().read(fd, offset, size) {
                Ok(data) => callback(Ok(&data)),
                Err(e) => callback(Err(errno_of(&e))),
            },
            None => callback(Err(libc::EBADF)),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        let state = self.lock();
        let handle = state.handles.file(fh).map(|o| (o.fd, o.entry.clone()));
        drop(state);
        match handle {
            Some((fd, entry)) => entry
                .lock()
                .unwrap()
                .write(fd, offset, &data)
                .map_err(|e| errno_of(&e)),
            None => Err(libc::EBADF),
        }
    }

    fn flush(&self, _req: RequestInfo, _path: &Path, fh: u64, _lock_owner: u64) -> ResultEmpty {
        let state = self.lock();
        if let Some(open) = state.handles.file(fh) {
            // Duplicate-then-close trick: forces a linearization point on
            // any writes the kernel has buffered for this fd without
            // actually closing it out from under the still-open handle.
            if let Ok(dupfd) = nix::unistd::dup(open.fd) {
                let _ = nix::unistd::close(dupfd);
            }
        }
        Ok(())
    }

    fn release(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        let mut state = self.lock();
        if let Some(open) = state.handles.remove_file(fh) {
            let _ = nix::unistd::close(open.fd);
            // Dropping `open.entry` here is what frees a tombstoned entry
            // (nlink already at 0, detached from the trie by a prior
            // unlink) once this was the last handle keeping it alive.
        }
        Ok(())
    }

    fn fsync(&self, _req: RequestInfo, _path: &Path, fh: u64, _datasync: bool) -> ResultEmpty {
        let state = self.lock();
        match state.handles.file(fh) {
            Some(open) => nix::unistd::fsync(open.fd).map_err(crate::cache::nix_to_io).map_err(|e| errno_of(&e)),
            None => Err(libc::EBADF),
        }
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, _flags: u32) -> ResultOpen {
        let mut state = self.lock();
        let backing = state.cache.translate(path);
        match nix::dir::Dir::open(&backing, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()) {
            Ok(dir) => {
                let fh = state.handles.insert_dir(dir);
                Ok((fh, 0))
            }
            Err(e) => Err(errno_of(&crate::cache::nix_to_io(e))),
        }
    }

    fn readdir(&self, _req: RequestInfo, _path: &Path, fh: u64) -> ResultReaddir {
        let mut state = self.lock();
        let dir = match state.handles.dir_mut(fh) {
            Some(dir) => dir,
            None => return Err(libc::EBADF),
        };
        let mut out = Vec::new();
        for entry in dir.iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = std::ffi::OsStr::from_bytes(entry.file_name().to_bytes()).to_owned();
            out.push(DirectoryEntry {
                name,
                kind: d_type_to_kind(entry.file_type()),
            });
        }
        Ok(out)
    }

    fn releasedir(&self, _req: RequestInfo, _path: &Path, fh: u64, _flags: u32) -> ResultEmpty {
        self.lock().handles.remove_dir(fh);
        Ok(())
    }

    fn fsyncdir(&self, _req: RequestInfo, _path: &Path, fh: u64, _datasync: bool) -> ResultEmpty {
        let mut state = self.lock();
        match state.handles.dir_mut(fh) {
            Some(dir) => nix::unistd::fsync(dir.as_raw_fd())
                .map_err(crate::cache::nix_to_io)
                .map_err(|e| errno_of(&e)),
            None => Err(libc::EBADF),
        }
    }

    fn statfs(&self, _req: RequestInfo, path: &Path) -> ResultStatfs {
        let mut state = self.lock();
        let backing = state.cache.translate(path);
        let stat = nix::sys::statvfs::statvfs(&backing)
            .map_err(crate::cache::nix_to_io)
            .map_err(|e| errno_of(&e))?;
        Ok(fuse_mt::Statfs {
            blocks: stat.blocks(),
            bfree: stat.blocks_free(),
            bavail: stat.blocks_available(),
            files: stat.files(),
            ffree: stat.files_free(),
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        })
    }

    fn setxattr(
        &self,
        _req: RequestInfo,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        _position: u32,
    ) -> ResultEmpty {
        let mut state = self.lock();
        let backing = state.cache.translate(path);
        crate::xattr::setxattr(&backing, name, value, flags as i32).map_err(|e| errno_of(&e))?;
        state.cache.touch_ctime_if_cached(path);
        Ok(())
    }

    fn getxattr(&self, _req: RequestInfo, path: &Path, name: &OsStr, size: u32) -> ResultXattr {
        let mut state = self.lock();
        let backing = state.cache.translate(path);
        if size == 0 {
            let n = crate::xattr::getxattr_size(&backing, name).map_err(|e| errno_of(&e))?;
            Ok(Xattr::Size(n as u32))
        } else {
            let data = crate::xattr::getxattr(&backing, name).map_err(|e| errno_of(&e))?;
            Ok(Xattr::Data(data))
        }
    }

    fn listxattr(&self, _req: RequestInfo, path: &Path, size: u32) -> ResultXattr {
        let mut state = self.lock();
        let backing = state.cache.translate(path);
        if size == 0 {
            let n = crate::xattr::listxattr_size(&backing).map_err(|e| errno_of(&e))?;
            Ok(Xattr::Size(n as u32))
        } else {
            let data = crate::xattr::listxattr(&backing).map_err(|e| errno_of(&e))?;
            Ok(Xattr::Data(data))
        }
    }

    fn removexattr(&self, _req: RequestInfo, path: &Path, name: &OsStr) -> ResultEmpty {
        let mut state = self.lock();
        let backing = state.cache.translate(path);
        crate::xattr::removexattr(&backing, name).map_err(|e| errno_of(&e))?;
        state.cache.touch_ctime_if_cached(path);
        Ok(())
    }

    fn access(&self, _req: RequestInfo, path: &Path, mask: u32) -> ResultEmpty {
        let mut state = self.lock();
        let backing = state.cache.translate(path);
        nix::unistd::access(&backing, nix::unistd::AccessFlags::from_bits_truncate(mask as i32))
            .map_err(crate::cache::nix_to_io)
            .map_err(|e| errno_of(&e))
    }

    fn create(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> ResultCreate {
        let path = parent.join(name);
        let mut state = self.lock();
        match state.cache.create(&path, flags as i32, mode) {
            Ok((fd, entry)) => {
                let attr = entry.lock().unwrap().attr;
                let fh = state.handles.insert_file(fd, entry);
                Ok(CreatedEntry {
                    ttl: ATTR_TTL,
                    attr,
                    fh,
                    flags,
                })
            }
            Err(e) => Err(errno_of(&e)),
        }
    }
}
