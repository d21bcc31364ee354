//! Fatal, process-level errors.
//!
//! These are distinct from the per-request OS errno values the dispatch
//! shims return to the kernel (`libc::c_int`, mapped inline at each shim):
//! everything here can only happen during startup, or indicates the global
//! cache invariant has already been violated, and is therefore reported to
//! stderr with the `pramfusehpc: error:` prefix and a non-zero exit code
//! rather than threaded back through any single in-flight request.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum PramError {
    #[error("--hdd must be given exactly once")]
    HddGivenTwice,

    #[error("--hdd <path> is required")]
    HddMissing,

    #[error("a mount point is required")]
    MountpointMissing,

    #[error("backing directory {0:?} could not be resolved: {1}")]
    BackingRoot(PathBuf, #[source] std::io::Error),

    #[error("backing directory {0:?} is already mounted by another pramfusehpc instance")]
    AlreadyMounted(PathBuf),

    #[error("failed to acquire startup lock on {0:?}: {1}")]
    LockAcquire(PathBuf, #[source] std::io::Error),

    #[error("internal cache lock was poisoned by a prior panic")]
    CachePoisoned,

    #[error("out of memory while growing the path index")]
    TrieAllocation,

    #[error(transparent)]
    Mount(#[from] std::io::Error),
}

pub type PramResult<T> = Result<T, PramError>;
