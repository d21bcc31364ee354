//! `pramfusehpc`: mounts a FUSE pass-through filesystem over `--hdd <path>`,
//! backed by the in-memory write-back cache in `pramfusehpc::cache`.
//!
//! Startup sequence mirrors the ambient stack's own daemon bootstrap shape
//! (parse args, resolve paths, bring up logging, take any process-level
//! locks, *then* hand off to the long-running part): parse `--hdd` and the
//! passthrough mount arguments, canonicalize the backing root, initialize
//! the logger, take the advisory startup lock, build the cache, and mount.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use log::info;
use pramfusehpc::error::{PramError, PramResult};
use pramfusehpc::lock::StartupLock;
use pramfusehpc::PramFilesystem;

const ERROR_PREFIX: &str = "pramfusehpc: error:";

/// `fuse_mt`'s internal worker pool size. The single global cache mutex
/// (§5) already serializes every request's critical section, so this buys
/// overlap on in-flight backing syscalls (disk latency), not parallelism
/// through the cache itself.
const WORKER_THREADS: usize = 4;

struct Args {
    backing_root: PathBuf,
    mountpoint: OsString,
    mount_options: Vec<OsString>,
}

/// Parses `--hdd <path>` out of the argument list; everything else is
/// forwarded to the FUSE mount call untouched, with the first remaining
/// token taken as the mountpoint (per §6, "all remaining arguments are
/// forwarded to the kernel dispatch layer: mount point, mount options").
fn parse_args<I: IntoIterator<Item = OsString>>(args: I) -> PramResult<Args> {
    let mut hdd: Option<PathBuf> = None;
    let mut rest: Vec<OsString> = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--hdd" {
            let value = iter.next().ok_or(PramError::HddMissing)?;
            if hdd.is_some() {
                return Err(PramError::HddGivenTwice);
            }
            hdd = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }

    let backing_root = hdd.ok_or(PramError::HddMissing)?;
    if rest.is_empty() {
        return Err(PramError::MountpointMissing);
    }
    let mut rest = rest.into_iter();
    let mountpoint = rest.next().unwrap();
    let mount_options = rest.collect();

    Ok(Args {
        backing_root,
        mountpoint,
        mount_options,
    })
}

/// Resolves `--hdd` to an absolute path with any trailing slash stripped
/// (§4.1 precondition on the path translator's `backing_root`).
fn canonicalize_backing_root(path: &Path) -> PramResult<PathBuf> {
    std::fs::canonicalize(path).map_err(|err| PramError::BackingRoot(path.to_path_buf(), err))
}

fn run() -> PramResult<i32> {
    let args = parse_args(std::env::args_os().skip(1))?;
    let backing_root = canonicalize_backing_root(&args.backing_root)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("pramfusehpc: backing root resolved to {:?}", backing_root);

    let _startup_lock = StartupLock::acquire(&backing_root)?;

    let filesystem = PramFilesystem::new(backing_root);
    let fs = fuse_mt::FuseMT::new(filesystem, WORKER_THREADS);

    let options: Vec<&OsStr> = args.mount_options.iter().map(OsString::as_os_str).collect();
    info!("pramfusehpc: mounting at {:?}", args.mountpoint);
    fuse_mt::mount(fs, &args.mountpoint, &options)?;

    info!("pramfusehpc: unmounted cleanly");
    Ok(0)
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{ERROR_PREFIX} {err}");
            1
        }
    };
    std::process::exit(code);
}
