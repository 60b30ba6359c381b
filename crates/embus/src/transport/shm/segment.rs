// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 embus contributors

//! POSIX shared memory segment wrapper.
//!
//! The bound server creates the segment and unlinks it on close; clients
//! open and map the same name. Mappings are released on drop, the name
//! only by an explicit unlink.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::{Error, Result};

/// A mapped POSIX shared memory object.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is plain shared memory; everything layered on it
// (rings, heartbeats) synchronizes through atomics.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create (replacing any stale leftover), size and map a segment.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = valid_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string. shm_unlink on
        // a missing name just fails, which we ignore: it clears leftovers
        // from a crashed predecessor. shm_open returns -1 or a valid fd.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(os_err("shm_open", name));
        }

        // SAFETY: fd is the valid descriptor opened above.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = os_err("ftruncate", name);
            // SAFETY: fd is still open and not used after this.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let ptr = map(fd, size);
        // SAFETY: the mapping (if any) holds its own reference to the
        // object; fd is not used again.
        unsafe { libc::close(fd) };
        let ptr = ptr?;

        // SAFETY: ptr covers exactly `size` writable bytes and nothing
        // else references the fresh segment yet. A zeroed region is a
        // valid empty layout for every structure placed on it.
        unsafe {
            ptr::write_bytes(ptr, 0, size);
        }

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open and map an existing segment.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let c_name = valid_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; return value
        // checked below.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(os_err("shm_open", name));
        }

        let ptr = map(fd, size);
        // SAFETY: mapping keeps the object alive; fd is done.
        unsafe { libc::close(fd) };

        Ok(Self {
            ptr: ptr?,
            size,
            name: name.to_string(),
        })
    }

    /// Remove the name. Existing mappings stay valid until unmapped.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = valid_name(name)?;
        // SAFETY: valid C string; only touches the shm namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(Error::Shm(format!("shm_unlink {name}: {err}")));
            }
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in create/open
        // and Drop runs once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
    }
}

fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
    // SAFETY: kernel-chosen address, valid fd, standard shared RW flags;
    // MAP_FAILED checked below.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Shm(format!(
            "mmap: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(ptr.cast::<u8>())
}

fn valid_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() > 255 {
        return Err(Error::Shm(format!("invalid segment name {name}")));
    }
    CString::new(name).map_err(|_| Error::Shm(format!("invalid segment name {name}")))
}

fn os_err(what: &str, name: &str) -> Error {
    Error::Shm(format!("{what} {name}: {}", io::Error::last_os_error()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/embus_test_{tag}_{nanos}")
    }

    #[test]
    fn create_then_open_shares_bytes() {
        let name = unique_name("seg");
        let a = ShmSegment::create(&name, 4096).unwrap();
        // SAFETY: freshly created 4096-byte mapping.
        unsafe {
            *a.as_ptr() = 0xa5;
        }
        let b = ShmSegment::open(&name, 4096).unwrap();
        // SAFETY: same object, same size.
        unsafe {
            assert_eq!(*b.as_ptr(), 0xa5);
        }
        drop(a);
        drop(b);
        ShmSegment::unlink(&name).unwrap();
    }

    #[test]
    fn open_missing_fails() {
        assert!(ShmSegment::open("/embus_test_missing_xyz", 4096).is_err());
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name("unlink");
        let _seg = ShmSegment::create(&name, 4096).unwrap();
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
    }

    #[test]
    fn bad_names_rejected() {
        assert!(ShmSegment::create("noslash", 64).is_err());
        assert!(ShmSegment::create("/a/b", 64).is_err());
    }

    #[test]
    fn create_zeroes_previous_contents() {
        let name = unique_name("zero");
        {
            let seg = ShmSegment::create(&name, 4096).unwrap();
            // SAFETY: valid 4096-byte mapping.
            unsafe {
                *seg.as_ptr() = 0xff;
            }
        }
        let seg = ShmSegment::create(&name, 4096).unwrap();
        // SAFETY: valid 4096-byte mapping.
        unsafe {
            assert_eq!(*seg.as_ptr(), 0);
        }
        drop(seg);
        ShmSegment::unlink(&name).unwrap();
    }
}
