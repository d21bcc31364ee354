//! The inode cache: path-keyed metadata and content buffers that make the
//! mounted tree answer at RAM speed while the backing directory remains the
//! durable copy. This is the piece that actually touches the backing
//! syscalls (`lstat`, `pread`/`pwrite`, `rename`, ...) and reconciles their
//! result into the cached `CacheEntry` -- the dispatch shims in
//! `filesystem.rs` only translate request shapes and hold the lock; all the
//! coherency logic lives here.
//!
//! Every `CacheEntry` is reached through an `Arc<Mutex<_>>`. The mutex only
//! exists to make the entry `Send`/`Sync` so it can sit behind the single
//! cache-wide lock the rest of the crate already serializes all access
//! through (`InodeCache` is only ever touched with that lock held, so the
//! per-entry mutex itself never actually contends); the `Arc` is what gives
//! us the reference-counted lifetime the design calls for -- a trie slot and
//! any number of open handles can each hold a clone, and the entry's buffer
//! and symlink target are only actually freed once the last clone drops,
//! which already happens for free via `Drop`. No manual refcount field is
//! needed on top of that.

use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuse_mt::{FileAttr, FileType};
use log::{debug, trace, warn};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{AccessFlags, Gid, Uid};

use crate::translate::PathTranslator;
use crate::trie::Trie;

/// Shared handle to one cached path's metadata and content.
pub type EntryRef = Arc<Mutex<CacheEntry>>;

/// One cached path's worth of state: a snapshot of its attributes, an
/// optional content buffer (absent means "not cached, read through"), and an
/// optional resolved symlink target.
pub struct CacheEntry {
    pub attr: FileAttr,
    /// `None` means "not cached, read through"; `Some(buf)` is authoritative
    /// for `buf.len()` bytes, which plays the role the spec calls
    /// `allocated` -- there is no separate capacity field, `Vec::len` already
    /// carries it.
    pub buffer: Option<Vec<u8>>,
    /// Resolved lazily on first `readlink`.
    pub link: Option<PathBuf>,
}

impl CacheEntry {
    fn new(attr: FileAttr) -> Self {
        CacheEntry {
            attr,
            buffer: None,
            link: None,
        }
    }

    pub fn touch_ctime(&mut self) {
        self.attr.ctime = now();
    }

    /// Apply the in-memory side effects of a truncate that has already
    /// succeeded against the backing file. Mirrors §4.3.5.
    ///
    /// A *growing* truncate deliberately does not touch `buffer` here: the
    /// backing file is already the right (zero-filled) length, so the next
    /// `read`/`write` that needs the grown region picks it up lazily via
    /// `grow_to`, the same path that extends a buffer that was only ever
    /// partially populated in the first place.
    pub fn apply_truncate(&mut self, new_len: u64) {
        let old_blocks = blocks_for(self.attr.size);
        let new_blocks = blocks_for(new_len);
        self.attr.blocks = self.attr.blocks.saturating_sub(old_blocks) + new_blocks;
        self.attr.size = new_len;
        self.touch_ctime();

        if new_len == 0 {
            self.buffer = None;
            return;
        }

        if let Some(buf) = self.buffer.as_mut() {
            let new_len = new_len as usize;
            if buf.len() > new_len {
                if buf.len() >= 2 * new_len {
                    buf.truncate(new_len);
                    buf.shrink_to_fit();
                } else {
                    // Keep the larger allocation, but bytes past the new
                    // size must still read back as zero (§3 invariant).
                    buf[new_len..].fill(0);
                }
            }
        }
    }

    /// Grows `buffer` (allocating it if absent) to cover at least `new_len`
    /// bytes, without disturbing whatever prefix was already cached. The
    /// newly covered range `[old_len, min(new_len, attr.size))` is real
    /// backing content and is `pread` in; anything from `attr.size` onward
    /// is a write- or truncate-created hole and is left at the zero a fresh
    /// `resize` already gives it.
    ///
    /// On allocation failure the buffer is left exactly as it was and an
    /// `io::Error` wrapping `ENOMEM` is returned, which callers use as the
    /// signal to fall back to an uncached `pread`/`pwrite`. On a genuine
    /// backing I/O error partway through, whatever was already valid is
    /// kept (or restored, if nothing new was gained) and the error
    /// propagates.
    fn grow_to(&mut self, fd: RawFd, new_len: usize) -> io::Result<()> {
        let old_len = self.buffer.as_ref().map_or(0, Vec::len);
        if new_len <= old_len {
            return Ok(());
        }

        let mut buf = self.buffer.take().unwrap_or_default();
        if buf.try_reserve_exact(new_len - old_len).is_err() {
            self.buffer = if old_len == 0 { None } else { Some(buf) };
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        buf.resize(new_len, 0);

        let real_end = (self.attr.size as usize).min(new_len);
        if real_end > old_len {
            let mut filled = old_len;
            let mut io_err = None;
            while filled < real_end {
                match nix::sys::uio::pread(fd, &mut buf[filled..real_end], filled as i64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        io_err = Some(nix_to_io(e));
                        break;
                    }
                }
            }
            if let Some(e) = io_err {
                if filled == old_len {
                    buf.truncate(old_len);
                    self.buffer = if old_len == 0 { None } else { Some(buf) };
                    return Err(e);
                }
            }
        }

        self.buffer = Some(buf);
        Ok(())
    }

    /// §4.3.3 (generalized): demand-populates/extends the buffer so it
    /// covers at least `min(offset+size, attr.size)` bytes, then copies out
    /// the requested (clamped) range. A buffer that already covers a
    /// shorter prefix -- the first chunk of a sequential read of a large
    /// file, or one predating a growing truncate -- is extended in place
    /// rather than treated as already satisfying the request.
    pub fn read(&mut self, fd: RawFd, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let want = (offset + size as u64).min(self.attr.size) as usize;
        if self.buffer.as_ref().map_or(true, |b| b.len() < want) {
            match self.grow_to(fd, want) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOMEM) => {
                    warn!("read: buffer allocation failed, falling back to uncached pread");
                    return pread_direct(fd, offset, size);
                }
                Err(e) => return Err(e),
            }
            trace!("read: buffer now covers {} bytes", want);
        }

        let buffer = self.buffer.as_ref().unwrap();
        let clamped_len = if offset >= self.attr.size {
            0
        } else {
            size.min((self.attr.size - offset) as u32) as usize
        };
        let start = (offset as usize).min(buffer.len());
        let end = (start + clamped_len).min(buffer.len());
        Ok(buffer[start..end].to_vec())
    }

    /// §4.3.4 (revised): always demand-populates/extends the buffer to
    /// cover the written range before writing, closing the write-path
    /// divergence the original design left open -- cached `attr.size` must
    /// never go stale relative to a write the cache itself served, and a
    /// buffer that was only partially cached so far must never be grown by
    /// blindly zeroing over real backing content it hadn't covered yet.
    pub fn write(&mut self, fd: RawFd, offset: u64, data: &[u8]) -> io::Result<u32> {
        if data.is_empty() {
            return Ok(0);
        }
        let need = offset + data.len() as u64;

        if self.buffer.as_ref().map_or(true, |b| (b.len() as u64) < need) {
            match self.grow_to(fd, need as usize) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOMEM) => {
                    warn!("write: buffer growth failed, falling back to uncached pwrite");
                    let written = pwrite_direct(fd, offset, data)?;
                    self.restale_from_fd(fd);
                    return Ok(written);
                }
                Err(e) => return Err(e),
            }
        }

        if need > self.attr.size {
            self.attr.size = need;
            self.attr.blocks = blocks_for(need);
        }

        let buf = self.buffer.as_mut().unwrap();
        let start = offset as usize;
        buf[start..start + data.len()].copy_from_slice(data);
        let ts = now();
        self.attr.ctime = ts;
        self.attr.mtime = ts;
        Ok(data.len() as u32)
    }

    /// Genuine OOM fallback path: the cache can no longer vouch for `size`,
    /// so pick it back up from the descriptor rather than serve a stale
    /// value on the next `getattr`.
    fn restale_from_fd(&mut self, fd: RawFd) {
        if let Ok(st) = nix::sys::stat::fstat(fd) {
            let kind = self.attr.kind;
            self.attr = stat_to_attr(&st);
            self.attr.kind = kind;
        }
    }
}

fn blocks_for(size: u64) -> u64 {
    (size + 511) / 512
}

fn now() -> SystemTime {
    SystemTime::now()
}

fn systime(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn mode_to_kind(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn stat_to_attr(st: &libc::stat) -> FileAttr {
    FileAttr {
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: systime(st.st_atime, st.st_atime_nsec),
        mtime: systime(st.st_mtime, st.st_mtime_nsec),
        ctime: systime(st.st_ctime, st.st_ctime_nsec),
        crtime: systime(st.st_ctime, st.st_ctime_nsec),
        kind: mode_to_kind(st.st_mode as u32),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        flags: 0,
    }
}

pub fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// One-off `lstat` for paths the cache deliberately never indexes
/// (directories -- §4.3.9/§9 "directory caching is absent").
pub fn lstat_attr(backing: &Path) -> io::Result<FileAttr> {
    let st = nix::sys::stat::lstat(backing).map_err(nix_to_io)?;
    Ok(stat_to_attr(&st))
}

fn pread_direct(fd: RawFd, offset: u64, size: u32) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        match nix::sys::uio::pread(fd, &mut buf[filled..], offset as i64 + filled as i64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                if filled == 0 {
                    return Err(nix_to_io(e));
                }
                break;
            }
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn pwrite_direct(fd: RawFd, offset: u64, data: &[u8]) -> io::Result<u32> {
    let mut written = 0usize;
    while written < data.len() {
        match nix::sys::uio::pwrite(fd, &data[written..], offset as i64 + written as i64) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) => {
                if written == 0 {
                    return Err(nix_to_io(e));
                }
                break;
            }
        }
    }
    Ok(written as u32)
}

/// The path→entry index plus the translator that feeds it backing paths.
/// Every method here requires the caller to already be holding the one
/// process-global lock (see `filesystem::State`); none of these functions
/// lock anything themselves beyond the per-entry mutex, which is never
/// actually contended.
pub struct InodeCache {
    trie: Trie<EntryRef>,
    translator: PathTranslator,
}

impl InodeCache {
    pub fn new(backing_root: PathBuf) -> Self {
        InodeCache {
            trie: Trie::new(),
            translator: PathTranslator::new(backing_root),
        }
    }

    pub fn backing_root(&self) -> &Path {
        self.translator.backing_root()
    }

    /// Translate a mount-relative path, returning an owned copy. Pass-through
    /// shims that never touch the trie use this directly.
    pub fn translate(&mut self, path: &Path) -> PathBuf {
        self.translator.translate(path).to_path_buf()
    }

    /// §4.3.1.
    pub fn ensure_entry(&mut self, path: &Path) -> io::Result<EntryRef> {
        if let Some(entry) = self.trie.get(path.as_os_str().as_bytes()) {
            return Ok(entry.clone());
        }
        let backing = self.translator.translate(path).to_path_buf();
        let st = nix::sys::stat::lstat(&backing).map_err(nix_to_io)?;
        let entry: EntryRef = Arc::new(Mutex::new(CacheEntry::new(stat_to_attr(&st))));
        self.trie.put(path.as_os_str().as_bytes(), Some(entry.clone()));
        debug!("cache: created entry for {:?}", path);
        Ok(entry)
    }

    pub fn getattr(&mut self, path: &Path) -> io::Result<FileAttr> {
        let entry = self.ensure_entry(path)?;
        let attr = entry.lock().unwrap().attr;
        Ok(attr)
    }

    pub fn chmod(&mut self, path: &Path, mode: u32) -> io::Result<()> {
        let entry = self.ensure_entry(path)?;
        let perm = (mode & 0o7777) as u16;
        if entry.lock().unwrap().attr.perm == perm {
            return Ok(());
        }
        let backing = self.translator.translate(path).to_path_buf();
        std::fs::set_permissions(&backing, std::fs::Permissions::from_mode(mode))?;
        let mut e = entry.lock().unwrap();
        e.attr.perm = perm;
        e.touch_ctime();
        Ok(())
    }

    pub fn chown(&mut self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        let entry = self.ensure_entry(path)?;
        {
            let e = entry.lock().unwrap();
            let same_uid = uid.map_or(true, |u| u == e.attr.uid);
            let same_gid = gid.map_or(true, |g| g == e.attr.gid);
            if same_uid && same_gid {
                return Ok(());
            }
        }
        let backing = self.translator.translate(path).to_path_buf();
        nix::unistd::chown(&backing, uid.map(Uid::from_raw), gid.map(Gid::from_raw))
            .map_err(nix_to_io)?;
        let mut e = entry.lock().unwrap();
        if let Some(u) = uid {
            e.attr.uid = u;
        }
        if let Some(g) = gid {
            e.attr.gid = g;
        }
        e.touch_ctime();
        Ok(())
    }

    pub fn utimens(
        &mut self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()> {
        let entry = self.ensure_entry(path)?;
        let backing = self.translator.translate(path).to_path_buf();

        if atime.is_none() && mtime.is_none() {
            let st = nix::sys::stat::lstat(&backing).map_err(nix_to_io)?;
            let mut e = entry.lock().unwrap();
            e.attr.atime = systime(st.st_atime, st.st_atime_nsec);
            e.attr.mtime = systime(st.st_mtime, st.st_mtime_nsec);
            return Ok(());
        }

        {
            let e = entry.lock().unwrap();
            let same_atime = atime.map_or(true, |t| t == e.attr.atime);
            let same_mtime = mtime.map_or(true, |t| t == e.attr.mtime);
            if same_atime && same_mtime {
                return Ok(());
            }
        }

        set_backing_utimens(&backing, atime, mtime)?;
        let mut e = entry.lock().unwrap();
        if let Some(a) = atime {
            e.attr.atime = a;
        }
        if let Some(m) = mtime {
            e.attr.mtime = m;
        }
        Ok(())
    }

    pub fn truncate_path(&mut self, path: &Path, len: u64) -> io::Result<()> {
        let entry = self.ensure_entry(path)?;
        let backing = self.translator.translate(path).to_path_buf();
        nix::unistd::truncate(&backing, len as i64).map_err(nix_to_io)?;
        entry.lock().unwrap().apply_truncate(len);
        Ok(())
    }

    pub fn truncate_handle(&self, entry: &EntryRef, fd: RawFd, len: u64) -> io::Result<()> {
        nix::unistd::ftruncate(fd, len as i64).map_err(nix_to_io)?;
        entry.lock().unwrap().apply_truncate(len);
        Ok(())
    }

    /// §4.3.6. Displaces (and drops the cache's reference to) any entry that
    /// already lived at `dst`, matching POSIX rename-over-existing
    /// semantics.
    pub fn rename(&mut self, src: &Path, dst: &Path) -> io::Result<()> {
        let (backing_src, backing_dst) = {
            let (owned, borrowed) = self.translator.translate_pair(src, dst);
            (owned, borrowed.to_path_buf())
        };
        std::fs::rename(&backing_src, &backing_dst)?;

        if src != dst {
            let moved = self.trie.put(src.as_os_str().as_bytes(), None);
            if let Some(entry) = &moved {
                entry.lock().unwrap().touch_ctime();
            }
            self.trie.put(dst.as_os_str().as_bytes(), moved);
        }
        Ok(())
    }

    /// §4.3.7.
    pub fn unlink(&mut self, path: &Path) -> io::Result<()> {
        let backing = self.translator.translate(path).to_path_buf();
        if let Some(entry) = self.trie.get(path.as_os_str().as_bytes()).cloned() {
            let nlink = {
                let mut e = entry.lock().unwrap();
                e.attr.nlink = e.attr.nlink.saturating_sub(1);
                e.touch_ctime();
                e.attr.nlink
            };
            if nlink == 0 {
                self.trie.put(path.as_os_str().as_bytes(), None);
                debug!("cache: detached entry for {:?} (nlink reached 0)", path);
            }
        }
        std::fs::remove_file(&backing)?;
        Ok(())
    }

    /// §4.3.8.
    pub fn readlink(&mut self, path: &Path) -> io::Result<Vec<u8>> {
        let entry = self.ensure_entry(path)?;
        let backing = self.translator.translate(path).to_path_buf();

        {
            let e = entry.lock().unwrap();
            if !matches!(e.attr.kind, FileType::Symlink) {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
        }
        nix::unistd::access(&backing, AccessFlags::R_OK | AccessFlags::X_OK)
            .map_err(nix_to_io)?;

        let mut e = entry.lock().unwrap();
        if e.link.is_none() {
            let target = std::fs::read_link(&backing)?;
            trace!("readlink: resolved target for {:?}", path);
            e.link = Some(target);
        } else {
            trace!("readlink: served {:?} from cache", path);
        }
        Ok(e.link.clone().unwrap().into_os_string().into_vec())
    }

    /// §4.3.9 (symlink creation side is cache-aware): inserts the new entry
    /// immediately, target already known, so the `lookup`/`getattr` that
    /// follows a `symlink()` in the kernel doesn't pay a second `lstat`.
    pub fn symlink(&mut self, parent: &Path, name: &std::ffi::OsStr, target: &Path) -> io::Result<FileAttr> {
        let mount_path = parent.join(name);
        let backing = self.translator.translate(&mount_path).to_path_buf();
        std::os::unix::fs::symlink(target, &backing)?;

        let st = nix::sys::stat::lstat(&backing).map_err(nix_to_io)?;
        let mut entry = CacheEntry::new(stat_to_attr(&st));
        entry.link = Some(target.to_path_buf());
        let attr = entry.attr;
        self.trie
            .put(mount_path.as_os_str().as_bytes(), Some(Arc::new(Mutex::new(entry))));
        Ok(attr)
    }

    /// §4.3.10: hard link creation bumps the source entry's `nlink` and
    /// binds the destination trie key to the very same `EntryRef`, so either
    /// path observes the other's writes/truncates until both keys (and any
    /// open handles) are gone.
    pub fn link(&mut self, src: &Path, new_parent: &Path, new_name: &std::ffi::OsStr) -> io::Result<FileAttr> {
        let dst = new_parent.join(new_name);
        let (backing_src, backing_dst) = {
            let (owned, borrowed) = self.translator.translate_pair(src, &dst);
            (owned, borrowed.to_path_buf())
        };
        std::fs::hard_link(&backing_src, &backing_dst)?;

        let entry = self.ensure_entry(src)?;
        let attr = {
            let mut e = entry.lock().unwrap();
            e.attr.nlink += 1;
            e.touch_ctime();
            e.attr
        };
        self.trie.put(dst.as_os_str().as_bytes(), Some(entry));
        Ok(attr)
    }

    /// Required invariant per §9: xattr mutations touch `ctime` on whatever
    /// cache entry already exists for `path`, even though xattr values
    /// themselves are never cached.
    pub fn touch_ctime_if_cached(&mut self, path: &Path) {
        if let Some(entry) = self.trie.get(path.as_os_str().as_bytes()) {
            entry.lock().unwrap().touch_ctime();
        }
    }

    pub fn open(&mut self, path: &Path, flags: i32) -> io::Result<(RawFd, EntryRef)> {
        let backing = self.translator.translate(path).to_path_buf();
        let oflag = OFlag::from_bits_truncate(flags);
        let fd = fcntl::open(&backing, oflag, Mode::empty()).map_err(nix_to_io)?;
        match self.ensure_entry(path) {
            Ok(entry) => Ok((fd, entry)),
            Err(err) => {
                let _ = nix::unistd::close(fd);
                Err(err)
            }
        }
    }

    pub fn create(&mut self, path: &Path, flags: i32, mode: u32) -> io::Result<(RawFd, EntryRef)> {
        let backing = self.translator.translate(path).to_path_buf();
        let oflag = OFlag::from_bits_truncate(flags) | OFlag::O_CREAT;
        let fd = fcntl::open(&backing, oflag, Mode::from_bits_truncate(mode as libc::mode_t))
            .map_err(nix_to_io)?;
        match self.ensure_entry(path) {
            Ok(entry) => Ok((fd, entry)),
            Err(err) => {
                let _ = nix::unistd::close(fd);
                Err(err)
            }
        }
    }

    /// Releases every cached entry, used once at shutdown. Does not touch
    /// the backing filesystem -- the trie is simply dropped.
    pub fn drain(&mut self) -> Vec<EntryRef> {
        self.trie.drain()
    }
}

fn set_backing_utimens(
    path: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt as _;

    fn to_timespec(t: Option<SystemTime>) -> libc::timespec {
        match t {
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            Some(t) => match t.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(d) => libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as i64,
                },
                Err(e) => libc::timespec {
                    tv_sec: -(e.duration().as_secs() as libc::time_t),
                    tv_nsec: 0,
                },
            },
        }
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let specs = [to_timespec(atime), to_timespec(mtime)];
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            specs.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
