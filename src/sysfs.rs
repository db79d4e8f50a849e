//! Directory-relative attribute I/O against a device's sysfs directory.
//!
//! Every attribute is opened with `openat(2)` relative to a directory
//! descriptor held for the whole authorization attempt. This is a security
//! control, not an I/O convenience: re-resolving an absolute path could
//! hand us the directory of a different device that was re-enumerated at
//! the same path after a disconnect. Interrupted syscalls are retried
//! transparently; every other failure is surfaced.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::Path;

use crate::AuthError;

/// Open mode for a single attribute file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrMode {
    ReadOnly,
    WriteOnly,
}

/// An open device attribute directory.
#[derive(Debug)]
pub struct AttrDir {
    fd: OwnedFd,
}

impl AttrDir {
    /// Open the attribute directory itself.
    ///
    /// A vanished directory means the device was removed between lookup
    /// and authorization and is reported as `NotFound`.
    pub fn open(path: &Path) -> Result<Self, AuthError> {
        let cpath = cstring_from_path(path)?;
        let fd = retry_eintr(|| unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            ) as isize
        });
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(AuthError::NotFound(path.display().to_string()));
            }
            return Err(AuthError::io("device directory", err));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd as i32) },
        })
    }

    /// Open a named attribute relative to this directory.
    pub fn open_attr(&self, name: &'static str, mode: AttrMode) -> Result<AttrFile, AuthError> {
        let cname = CString::new(name)
            .map_err(|_| AuthError::io(name, io::Error::from(io::ErrorKind::InvalidInput)))?;
        let flags = match mode {
            AttrMode::ReadOnly => libc::O_RDONLY,
            AttrMode::WriteOnly => libc::O_WRONLY,
        } | libc::O_CLOEXEC;
        let fd = retry_eintr(|| unsafe {
            libc::openat(self.fd.as_raw_fd(), cname.as_ptr(), flags) as isize
        });
        if fd < 0 {
            return Err(AuthError::io(name, io::Error::last_os_error()));
        }
        Ok(AttrFile {
            fd: unsafe { OwnedFd::from_raw_fd(fd as i32) },
            name,
        })
    }
}

/// An open attribute file, closed on drop or explicitly via [`AttrFile::close`].
#[derive(Debug)]
pub struct AttrFile {
    fd: OwnedFd,
    name: &'static str,
}

impl AttrFile {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read exactly `len` bytes.
    ///
    /// Short data is an error (`UnexpectedEof`), never silently tolerated:
    /// a truncated attribute is a protocol-level failure.
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, AuthError> {
        let buf = self.read_up_to(len)?;
        if buf.len() != len {
            return Err(AuthError::io(
                self.name,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read: {} of {} bytes", buf.len(), len),
                ),
            ));
        }
        Ok(buf)
    }

    /// Read up to `len` bytes, stopping early only at end of data.
    pub fn read_up_to(&mut self, len: usize) -> Result<Vec<u8>, AuthError> {
        let mut buf = vec![0u8; len];
        let mut nread = 0usize;
        while nread < len {
            let n = retry_eintr(|| unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf[nread..].as_mut_ptr() as *mut libc::c_void,
                    len - nread,
                )
            });
            if n < 0 {
                return Err(AuthError::io(self.name, io::Error::last_os_error()));
            }
            if n == 0 {
                break;
            }
            nread += n as usize;
        }
        buf.truncate(nread);
        Ok(buf)
    }

    /// Read the whole attribute, for attributes of unknown length.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, AuthError> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_up_to(256)?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Write all of `data` in one logical `write(2)`.
    ///
    /// The kernel rejects chunked writes of key material as malformed, so
    /// a short write is an error here, not something to continue from.
    /// Only interrupted calls are retried.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), AuthError> {
        let n = retry_eintr(|| unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        });
        if n < 0 {
            return Err(AuthError::io(self.name, io::Error::last_os_error()));
        }
        if n as usize != data.len() {
            return Err(AuthError::io(
                self.name,
                io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes", n, data.len()),
                ),
            ));
        }
        Ok(())
    }

    /// Single-byte variant of [`AttrFile::write_all`], for the grant code.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), AuthError> {
        self.write_all(&[byte])
    }

    /// Close the attribute, reporting the close error.
    ///
    /// Sysfs attributes may defer the actual store to `close(2)`; a close
    /// failure after a write means the data is not guaranteed delivered.
    pub fn close(self) -> Result<(), AuthError> {
        let name = self.name;
        let raw = self.fd.into_raw_fd();
        let r = unsafe { libc::close(raw) };
        if r != 0 {
            return Err(AuthError::io(name, io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Read a short ASCII attribute (e.g. `security`, `vendor_name`) and trim
/// the trailing newline sysfs appends.
pub fn read_attr_string(dir: &AttrDir, name: &'static str) -> Result<String, AuthError> {
    let mut attr = dir.open_attr(name, AttrMode::ReadOnly)?;
    let bytes = attr.read_to_end()?;
    let text = String::from_utf8(bytes).map_err(|_| {
        AuthError::io(
            name,
            io::Error::new(io::ErrorKind::InvalidData, "attribute is not valid utf-8"),
        )
    })?;
    Ok(text.trim_end_matches(['\n', '\0']).trim().to_string())
}

fn cstring_from_path(path: &Path) -> Result<CString, AuthError> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        AuthError::io(
            "device directory",
            io::Error::from(io::ErrorKind::InvalidInput),
        )
    })
}

fn retry_eintr<F>(mut op: F) -> isize
where
    F: FnMut() -> isize,
{
    loop {
        let r = op();
        if r >= 0 {
            return r;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return r;
        }
    }
}
