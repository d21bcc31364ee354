//! Startup advisory lock: prevents two instances of this daemon from
//! mounting over the same backing directory at once.
//!
//! Not part of the distilled cache design -- the original only discusses
//! concurrent modification by *other, unrelated* processes as an accepted
//! divergence risk -- but double-mounting this same program over one `--hdd`
//! directory is a strictly worse, entirely preventable case: two independent
//! in-memory caches would silently diverge over one backing store. Uses a
//! non-blocking `fcntl` record lock, in the same style the ambient stack
//! uses for its own inter-process locks (`F_SETLK`, never blocks, released
//! implicitly on process exit).

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::PramError;

const LOCK_FILE_NAME: &str = ".pramfusehpc.lock";

/// Held for the lifetime of the mounted process. Dropping it releases the
/// lock (the kernel does this automatically on `close`, which happens when
/// `file` is dropped).
pub struct StartupLock {
    _file: File,
}

impl StartupLock {
    pub fn acquire(backing_root: &Path) -> Result<Self, PramError> {
        let path: PathBuf = backing_root.join(LOCK_FILE_NAME);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| PramError::LockAcquire(path.clone(), err))?;

        let op = libc::flock {
            l_type: libc::F_WRLCK as i16,
            l_whence: libc::SEEK_SET as i16,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };

        match nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op)) {
            Ok(_) => Ok(StartupLock { _file: file }),
            Err(nix::errno::Errno::EACCES) | Err(nix::errno::Errno::EAGAIN) => {
                Err(PramError::AlreadyMounted(backing_root.to_path_buf()))
            }
            Err(err) => Err(PramError::LockAcquire(path, std::io::Error::from(err))),
        }
    }
}
