// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Extended-attribute calls on host paths
//!
//! macOS takes an extra position argument; it is always 0 here and
//! `XATTR_NOFOLLOW` is never passed. Other platforms report `ENOTSUP`.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub const XATTR_CREATE: i32 = libc::XATTR_CREATE;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub const XATTR_REPLACE: i32 = libc::XATTR_REPLACE;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub const XATTR_CREATE: i32 = 1;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub const XATTR_REPLACE: i32 = 2;

/// Result of a read: a zero-size request only asks for the length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XattrData {
    Size(usize),
    Data(Vec<u8>),
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn check_len(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn check(ret: i32) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn getxattr(path: &Path, name: &str, size: usize) -> io::Result<XattrData> {
    let path = c_path(path)?;
    let name = c_name(name)?;
    let mut buf = vec![0u8; size];
    let len = sys::getxattr(&path, &name, &mut buf)?;
    if size == 0 {
        return Ok(XattrData::Size(len));
    }
    buf.truncate(len);
    Ok(XattrData::Data(buf))
}

pub fn setxattr(path: &Path, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
    let path = c_path(path)?;
    let name = c_name(name)?;
    sys::setxattr(&path, &name, value, flags)
}

/// Names come back NUL-separated, exactly as the kernel lays them out.
pub fn listxattr(path: &Path, size: usize) -> io::Result<XattrData> {
    let path = c_path(path)?;
    let mut buf = vec![0u8; size];
    let len = sys::listxattr(&path, &mut buf)?;
    if size == 0 {
        return Ok(XattrData::Size(len));
    }
    buf.truncate(len);
    Ok(XattrData::Data(buf))
}

pub fn removexattr(path: &Path, name: &str) -> io::Result<()> {
    let path = c_path(path)?;
    let name = c_name(name)?;
    sys::removexattr(&path, &name)
}

/// Splits a NUL-separated name list.
pub fn split_names(list: &[u8]) -> Vec<String> {
    list.split(|b| *b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect()
}

#[cfg(target_os = "linux")]
mod sys {
    use super::{check, check_len};
    use std::ffi::CStr;
    use std::io;

    pub fn getxattr(path: &CStr, name: &CStr, buf: &mut [u8]) -> io::Result<usize> {
        check_len(unsafe {
            libc::getxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        })
    }

    pub fn setxattr(path: &CStr, name: &CStr, value: &[u8], flags: i32) -> io::Result<()> {
        check(unsafe {
            libc::setxattr(path.as_ptr(), name.as_ptr(), value.as_ptr().cast(), value.len(), flags)
        })
    }

    pub fn listxattr(path: &CStr, buf: &mut [u8]) -> io::Result<usize> {
        check_len(unsafe { libc::listxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) })
    }

    pub fn removexattr(path: &CStr, name: &CStr) -> io::Result<()> {
        check(unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) })
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::{check, check_len};
    use std::ffi::CStr;
    use std::io;

    pub fn getxattr(path: &CStr, name: &CStr, buf: &mut [u8]) -> io::Result<usize> {
        check_len(unsafe {
            libc::getxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len(), 0, 0)
        })
    }

    pub fn setxattr(path: &CStr, name: &CStr, value: &[u8], flags: i32) -> io::Result<()> {
        check(unsafe {
            libc::setxattr(path.as_ptr(), name.as_ptr(), value.as_ptr().cast(), value.len(), 0, flags)
        })
    }

    pub fn listxattr(path: &CStr, buf: &mut [u8]) -> io::Result<usize> {
        check_len(unsafe { libc::listxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len(), 0) })
    }

    pub fn removexattr(path: &CStr, name: &CStr) -> io::Result<()> {
        check(unsafe { libc::removexattr(path.as_ptr(), name.as_ptr(), 0) })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod sys {
    use std::ffi::CStr;
    use std::io;

    fn unsupported<T>() -> io::Result<T> {
        Err(io::Error::from_raw_os_error(libc::ENOTSUP))
    }

    pub fn getxattr(_path: &CStr, _name: &CStr, _buf: &mut [u8]) -> io::Result<usize> {
        unsupported()
    }

    pub fn setxattr(_path: &CStr, _name: &CStr, _value: &[u8], _flags: i32) -> io::Result<()> {
        unsupported()
    }

    pub fn listxattr(_path: &CStr, _buf: &mut [u8]) -> io::Result<usize> {
        unsupported()
    }

    pub fn removexattr(_path: &CStr, _name: &CStr) -> io::Result<()> {
        unsupported()
    }
}
