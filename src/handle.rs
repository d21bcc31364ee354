//! Per-open records: a file handle ties a backing descriptor to the cache
//! entry it was opened against; a directory handle holds the backing
//! directory descriptor for the lifetime of one opendir/readdir*/releasedir
//! sequence. Neither is cached between opens -- directory listings always
//! pass through, and a file handle is just bookkeeping for `read`/`write`/
//! `release` to find their way back to the right cache entry without
//! depending on the path still resolving to it (the path can have been
//! renamed, or unlinked out from under an open handle).

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use nix::dir::Dir;

use crate::cache::EntryRef;

pub struct OpenFile {
    pub fd: RawFd,
    pub entry: EntryRef,
}

/// Allocates and looks up the opaque `fh` values fuse_mt passes back to us
/// on every subsequent call for a given open file or directory.
#[derive(Default)]
pub struct HandleTable {
    files: HashMap<u64, OpenFile>,
    dirs: HashMap<u64, Dir>,
    next_fh: u64,
}

impl HandleTable {
    fn next(&mut self) -> u64 {
        self.next_fh = self.next_fh.wrapping_add(1);
        self.next_fh
    }

    pub fn insert_file(&mut self, fd: RawFd, entry: EntryRef) -> u64 {
        let fh = self.next();
        self.files.insert(fh, OpenFile { fd, entry });
        fh
    }

    pub fn file(&self, fh: u64) -> Option<&OpenFile> {
        self.files.get(&fh)
    }

    pub fn remove_file(&mut self, fh: u64) -> Option<OpenFile> {
        self.files.remove(&fh)
    }

    pub fn insert_dir(&mut self, dir: Dir) -> u64 {
        let fh = self.next();
        self.dirs.insert(fh, dir);
        fh
    }

    pub fn dir_mut(&mut self, fh: u64) -> Option<&mut Dir> {
        self.dirs.get_mut(&fh)
    }

    pub fn remove_dir(&mut self, fh: u64) -> Option<Dir> {
        self.dirs.remove(&fh)
    }
}
