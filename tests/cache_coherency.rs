//! End-to-end coverage of the cache's testable properties: attribute
//! coherence, the size/blocks invariant, rename identity, unlink's `nlink`
//! bookkeeping, the read/write round trip, and the truncate-then-read zero
//! gap. Exercises `InodeCache` directly against a real temporary directory
//! rather than going through a mounted FUSE session, since none of this
//! logic depends on the kernel dispatch layer.

use std::path::Path;

use nix::fcntl::OFlag;
use pramfusehpc::cache::InodeCache;
use tempfile::tempdir;

#[test]
fn attribute_coherence_after_chmod() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"hi").unwrap();
    let mut cache = InodeCache::new(dir.path().to_path_buf());

    cache.chmod(Path::new("/a"), 0o600).unwrap();
    let attr = cache.getattr(Path::new("/a")).unwrap();
    assert_eq!(attr.perm, 0o600);

    // Mutate the backing file out from under the cache directly; getattr
    // must still answer from the cached snapshot, not a fresh lstat.
    nix::sys::stat::fchmodat(
        None,
        &dir.path().join("a"),
        nix::sys::stat::Mode::from_bits_truncate(0o644),
        nix::sys::stat::FchmodatFlags::FollowSymlink,
    )
    .unwrap();
    let attr = cache.getattr(Path::new("/a")).unwrap();
    assert_eq!(attr.perm, 0o600);
}

#[test]
fn size_and_blocks_invariant_after_truncate() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"").unwrap();
    let mut cache = InodeCache::new(dir.path().to_path_buf());

    cache.truncate_path(Path::new("/a"), 5000).unwrap();
    let attr = cache.getattr(Path::new("/a")).unwrap();
    assert_eq!(attr.size, 5000);
    assert_eq!(attr.blocks, (5000 + 511) / 512);

    cache.truncate_path(Path::new("/a"), 0).unwrap();
    let attr = cache.getattr(Path::new("/a")).unwrap();
    assert_eq!(attr.size, 0);
    assert_eq!(attr.blocks, 0);
}

#[test]
fn rename_preserves_identity_and_drops_source() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"hello").unwrap();
    let mut cache = InodeCache::new(dir.path().to_path_buf());

    cache.chmod(Path::new("/a"), 0o640).unwrap();
    cache.rename(Path::new("/a"), Path::new("/b")).unwrap();

    assert!(cache.getattr(Path::new("/a")).is_err());
    let attr = cache.getattr(Path::new("/b")).unwrap();
    assert_eq!(attr.perm, 0o640);
}

#[test]
fn unlink_drops_entry_only_at_zero_nlink() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("x"), b"abc").unwrap();
    let mut cache = InodeCache::new(dir.path().to_path_buf());

    cache
        .link(Path::new("/x"), Path::new("/"), std::ffi::OsStr::new("y"))
        .unwrap();
    cache.unlink(Path::new("/x")).unwrap();

    assert!(cache.getattr(Path::new("/x")).is_err());
    let attr = cache.getattr(Path::new("/y")).unwrap();
    assert_eq!(attr.nlink, 1);
}

#[test]
fn read_write_round_trip() {
    let dir = tempdir().unwrap();
    let mut cache = InodeCache::new(dir.path().to_path_buf());
    let path = Path::new("/w");
    let (fd, entry) = cache
        .create(path, OFlag::O_RDWR.bits(), 0o644)
        .expect("create should succeed");

    let payload = b"the quick brown fox";
    let written = entry.lock().unwrap().write(fd, 0, payload).unwrap();
    assert_eq!(written as usize, payload.len());

    let read_back = entry.lock().unwrap().read(fd, 0, payload.len() as u32).unwrap();
    assert_eq!(&read_back, payload);

    let attr = entry.lock().unwrap().attr;
    assert_eq!(attr.size, payload.len() as u64);
    nix::unistd::close(fd).ok();
}

#[test]
fn truncate_then_read_zeros_the_gap() {
    let dir = tempdir().unwrap();
    let mut cache = InodeCache::new(dir.path().to_path_buf());
    let path = Path::new("/g");
    let (fd, entry) = cache.create(path, OFlag::O_RDWR.bits(), 0o644).unwrap();

    let payload = b"abc";
    entry.lock().unwrap().write(fd, 0, payload).unwrap();
    cache
        .truncate_handle(&entry, fd, (payload.len() + 4) as u64)
        .unwrap();

    let gap = entry
        .lock()
        .unwrap()
        .read(fd, payload.len() as u64, 4)
        .unwrap();
    assert_eq!(gap, vec![0u8; 4]);
    nix::unistd::close(fd).ok();
}

#[test]
fn symlink_caches_target_after_first_readlink() {
    let dir = tempdir().unwrap();
    let mut cache = InodeCache::new(dir.path().to_path_buf());
    cache
        .symlink(Path::new("/"), std::ffi::OsStr::new("s"), Path::new("target"))
        .unwrap();

    let target = cache.readlink(Path::new("/s")).unwrap();
    assert_eq!(target, b"target");

    // Repoint the backing symlink without going through the cache; access()
    // is still re-checked on the backing path every call (per the design,
    // only the `readlink` syscall itself is skipped on a cache hit), but the
    // returned target must still be the one resolved and cached on first
    // read, not the new backing target.
    std::fs::remove_file(dir.path().join("s")).unwrap();
    std::os::unix::fs::symlink("elsewhere", dir.path().join("s")).unwrap();
    let target_again = cache.readlink(Path::new("/s")).unwrap();
    assert_eq!(target_again, b"target");
}

#[test]
fn write_of_one_mebibyte_round_trips() {
    let dir = tempdir().unwrap();
    let mut cache = InodeCache::new(dir.path().to_path_buf());
    let path = Path::new("/big");
    let (fd, entry) = cache.create(path, OFlag::O_RDWR.bits(), 0o644).unwrap();

    let payload = vec![0xABu8; 1024 * 1024];
    let written = entry.lock().unwrap().write(fd, 0, &payload).unwrap();
    assert_eq!(written as usize, payload.len());

    let read_back = entry.lock().unwrap().read(fd, 0, payload.len() as u32).unwrap();
    assert_eq!(read_back, payload);

    let attr = entry.lock().unwrap().attr;
    assert_eq!(attr.size, 1024 * 1024);
    assert_eq!(attr.blocks, 2048);
    nix::unistd::close(fd).ok();
}
