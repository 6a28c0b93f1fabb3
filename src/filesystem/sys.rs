//! Linux syscall surface: descriptor-based listing, stat and file handles.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;

use libc::{c_int, c_uint};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{OFlag, openat};
use nix::sys::stat::{Mode, fstat};
use snafu::prelude::*;
use tracing::debug;

use crate::filesystem::identity::{
    HandleTooLargeSnafu, IdentityError, IdentityToken, MAX_HANDLE_SIZE, OsSnafu,
    StaleIdentitySnafu,
};
use crate::filesystem::{Filesystem, ListedEntry, ObjectAttributes};
use crate::fingerprints::FileFingerprint;

/// Interrupted or would-block calls are retried this many times before
/// they are reported as failures.
const MAX_TRANSIENT_RETRIES: usize = 16;

#[derive(Debug, Snafu)]
#[snafu(display("{operation} failed: {errno}"))]
pub struct SyscallError {
    pub operation: &'static str,
    pub errno: Errno,
}

impl SyscallError {
    pub fn new(operation: &'static str, errno: Errno) -> Self {
        Self { operation, errno }
    }

    /// Interrupted and would-block failures; retrying the call is safe.
    pub fn is_transient(&self) -> bool {
        matches!(self.errno, Errno::EINTR | Errno::EAGAIN)
    }

    /// The object disappeared between being listed and being opened.
    pub fn is_vanished(&self) -> bool {
        matches!(
            self.errno,
            Errno::ENOENT | Errno::ENOTDIR | Errno::ELOOP | Errno::ESTALE
        )
    }
}

/// Runs `call`, retrying transient failures.
pub fn retry_transient<T>(
    operation: &'static str,
    mut call: impl FnMut() -> nix::Result<T>,
) -> Result<T, SyscallError> {
    let mut attempts = 0;
    loop {
        match call() {
            Err(errno @ (Errno::EINTR | Errno::EAGAIN)) if attempts < MAX_TRANSIENT_RETRIES => {
                attempts += 1;
                debug!("{operation} returned {errno}, retrying (attempt {attempts})");
            }
            result => return result.map_err(|errno| SyscallError::new(operation, errno)),
        }
    }
}

/// Kernel `struct file_handle` with an inline buffer of the maximum size.
#[repr(C)]
struct HandleBuffer {
    handle_bytes: c_uint,
    handle_type: c_int,
    f_handle: [u8; MAX_HANDLE_SIZE],
}

impl HandleBuffer {
    fn empty() -> Self {
        Self {
            handle_bytes: MAX_HANDLE_SIZE as c_uint,
            handle_type: 0,
            f_handle: [0; MAX_HANDLE_SIZE],
        }
    }

    fn from_token(token: &IdentityToken) -> Self {
        let mut buffer = Self::empty();
        let bytes = token.bytes();
        buffer.handle_bytes = bytes.len() as c_uint;
        buffer.handle_type = token.handle_type();
        buffer.f_handle[..bytes.len()].copy_from_slice(bytes);
        buffer
    }
}

/// The tracked mount, addressed through its root directory descriptor.
#[derive(Debug)]
pub struct MountFs {
    root: OwnedFd,
}

impl MountFs {
    pub fn open(mountpoint: &Path) -> io::Result<Self> {
        let root = File::options()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(mountpoint)?;
        Ok(Self {
            root: OwnedFd::from(root),
        })
    }

    pub fn root_fd(&self) -> BorrowedFd<'_> {
        self.root.as_fd()
    }

    fn open_at(
        directory: &OwnedFd,
        name: &OsStr,
        flags: OFlag,
        operation: &'static str,
    ) -> Result<OwnedFd, SyscallError> {
        retry_transient(operation, || {
            openat(directory.as_fd(), name, flags, Mode::empty())
        })
    }
}

impl Filesystem for MountFs {
    type Object = OwnedFd;

    fn attributes(&self, object: &OwnedFd) -> Result<ObjectAttributes, SyscallError> {
        let stat = retry_transient("fstat", || fstat(object.as_fd()))?;
        Ok(ObjectAttributes {
            ino: stat.st_ino as u64,
            mode: stat.st_mode as u32,
            fingerprint: FileFingerprint {
                size: stat.st_size as u64,
                mtime: FileFingerprint::seconds(stat.st_mtime as i64, stat.st_mtime_nsec as i64),
                ctime: FileFingerprint::seconds(stat.st_ctime as i64, stat.st_ctime_nsec as i64),
            },
        })
    }

    fn identity_token(&self, object: &OwnedFd) -> Result<IdentityToken, IdentityError> {
        let mut buffer = HandleBuffer::empty();
        let mut mount_id: c_int = 0;
        let result = retry_transient("name_to_handle_at", || {
            Errno::result(unsafe {
                libc::syscall(
                    libc::SYS_name_to_handle_at,
                    object.as_raw_fd(),
                    c"".as_ptr(),
                    &mut buffer as *mut HandleBuffer,
                    &mut mount_id as *mut c_int,
                    libc::AT_EMPTY_PATH,
                )
            })
        });
        match result {
            Ok(_) => IdentityToken::new(
                buffer.handle_type,
                &buffer.f_handle[..buffer.handle_bytes as usize],
            ),
            // The kernel reports the size it would have needed.
            Err(SyscallError {
                errno: Errno::EOVERFLOW,
                ..
            }) => HandleTooLargeSnafu {
                size: buffer.handle_bytes as usize,
            }
            .fail(),
            Err(source) => Err(source).context(OsSnafu),
        }
    }

    fn open_by_token(&self, token: &IdentityToken) -> Result<OwnedFd, IdentityError> {
        let mut buffer = HandleBuffer::from_token(token);
        let result = retry_transient("open_by_handle_at", || {
            Errno::result(unsafe {
                libc::syscall(
                    libc::SYS_open_by_handle_at,
                    self.root.as_raw_fd(),
                    &mut buffer as *mut HandleBuffer,
                    libc::O_PATH | libc::O_CLOEXEC,
                )
            })
        });
        match result {
            Ok(fd) => Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) }),
            Err(SyscallError {
                errno: Errno::ESTALE | Errno::ENOENT,
                ..
            }) => StaleIdentitySnafu.fail(),
            Err(source) => Err(source).context(OsSnafu),
        }
    }

    fn list(&self, directory: &OwnedFd) -> Result<Vec<ListedEntry>, SyscallError> {
        // A private open file description keeps the listing offset independent
        // of whoever else holds `directory`.
        let mut stream = retry_transient("opendir", || {
            Dir::openat(
                directory.as_fd(),
                ".",
                OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
                Mode::empty(),
            )
        })?;
        stream
            .iter()
            .map(|entry| {
                let entry = entry.map_err(|errno| SyscallError::new("readdir", errno))?;
                Ok(ListedEntry {
                    name: OsStr::from_bytes(entry.file_name().to_bytes()).to_os_string(),
                    ino: entry.ino(),
                })
            })
            .collect()
    }

    fn open_child(
        &self,
        directory: &OwnedFd,
        name: &OsStr,
    ) -> Result<Option<OwnedFd>, SyscallError> {
        match Self::open_at(
            directory,
            name,
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            "openat",
        ) {
            Ok(fd) => Ok(Some(fd)),
            Err(error) if error.is_vanished() => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn open_directory(&self, object: &OwnedFd) -> Result<OwnedFd, SyscallError> {
        Self::open_at(
            object,
            OsStr::new("."),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            "openat(.)",
        )
    }

    fn open_root(&self) -> Result<OwnedFd, SyscallError> {
        self.open_directory(&self.root)
    }
}

/// True when `path` is the root of a mounted filesystem.
///
/// The mount-wide subscription reports every directory on the mount, so a
/// watched path below the mount root would receive events for directories
/// it cannot reach.
pub fn is_mountpoint(path: &Path) -> io::Result<bool> {
    let own = fs::metadata(path)?;
    let parent = fs::metadata(path.join(".."))?;
    Ok(own.dev() != parent.dev() || own.ino() == parent.ino())
}
