//! Path-based extended-attribute helpers for the xattr pass-through shims.
//!
//! Mirrors the grow-on-`ERANGE` idiom the ambient stack uses for its own
//! (file-descriptor based) xattr wrappers, adapted to paths since
//! `fuse_mt`'s xattr callbacks are path-addressed, not handle-addressed.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;

fn nul_err() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| nul_err())
}

fn name_cstring(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| nul_err())
}

/// Returns the raw attribute value. Grows the read buffer on `ERANGE`.
pub fn getxattr(path: &Path, name: &OsStr) -> io::Result<Vec<u8>> {
    let c_path = path_cstring(path)?;
    let c_name = name_cstring(name)?;
    let mut size = 256usize;
    loop {
        let mut buf = vec![0u8; size];
        let ret = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if ret >= 0 {
            buf.truncate(ret as usize);
            return Ok(buf);
        }
        match Errno::last() {
            Errno::ERANGE => {
                size = size.checked_mul(2).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
            }
            errno => return Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}

/// Returns the size of the attribute value without copying it (`size == 0`
/// case of the `ResultXattr` contract).
pub fn getxattr_size(path: &Path, name: &OsStr) -> io::Result<usize> {
    let c_path = path_cstring(path)?;
    let c_name = name_cstring(name)?;
    let ret = unsafe { libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
    if ret < 0 {
        return Err(io::Error::from_raw_os_error(Errno::last() as i32));
    }
    Ok(ret as usize)
}

/// NUL-separated list of attribute names. Grows the read buffer on `ERANGE`.
pub fn listxattr(path: &Path) -> io::Result<Vec<u8>> {
    let c_path = path_cstring(path)?;
    let mut size = 256usize;
    loop {
        let mut buf = vec![0u8; size];
        let ret =
            unsafe { libc::listxattr(c_path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret >= 0 {
            buf.truncate(ret as usize);
            return Ok(buf);
        }
        match Errno::last() {
            Errno::ERANGE => {
                size = size.checked_mul(2).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
            }
            errno => return Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}

pub fn listxattr_size(path: &Path) -> io::Result<usize> {
    let c_path = path_cstring(path)?;
    let ret = unsafe { libc::listxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
    if ret < 0 {
        return Err(io::Error::from_raw_os_error(Errno::last() as i32));
    }
    Ok(ret as usize)
}

pub fn setxattr(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    let c_path = path_cstring(path)?;
    let c_name = name_cstring(name)?;
    let ret = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(Errno::last() as i32));
    }
    Ok(())
}

pub fn removexattr(path: &Path, name: &OsStr) -> io::Result<()> {
    let c_path = path_cstring(path)?;
    let c_name = name_cstring(name)?;
    let ret = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(Errno::last() as i32));
    }
    Ok(())
}
