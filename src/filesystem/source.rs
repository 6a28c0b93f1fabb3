use std::ffi::{OsStr, OsString};

use crate::filesystem::identity::{IdentityError, IdentityToken};
use crate::filesystem::sys::SyscallError;
use crate::fingerprints::FileFingerprint;

/// Coarse file type derived from the `st_mode` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum FileKind {
    #[display("directory")]
    Directory,
    #[display("regular file")]
    Regular,
    #[display("symlink")]
    Symlink,
    #[display("special file")]
    Other,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFREG => FileKind::Regular,
            libc::S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

/// The identity attributes read from an open object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectAttributes {
    pub ino: u64,
    pub mode: u32,
    pub fingerprint: FileFingerprint,
}

impl ObjectAttributes {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }
}

/// One name/inode pair as reported by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: OsString,
    pub ino: u64,
}

impl ListedEntry {
    pub fn is_pseudo_entry(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Descriptor-level view of the tracked filesystem.
///
/// `Object` is an owned handle: dropping it releases the underlying
/// descriptor, so every code path that stops using an object releases it
/// exactly once.
pub trait Filesystem {
    type Object;

    /// Reads inode number, mode and the size/time fingerprint of `object`.
    fn attributes(&self, object: &Self::Object) -> Result<ObjectAttributes, SyscallError>;

    /// Generates the opaque identity token naming `object`.
    fn identity_token(&self, object: &Self::Object) -> Result<IdentityToken, IdentityError>;

    /// Reopens an object from a previously generated token.
    ///
    /// Fails with [`IdentityError::StaleIdentity`] once the object is gone.
    fn open_by_token(&self, token: &IdentityToken) -> Result<Self::Object, IdentityError>;

    /// Lists the entries of an open directory, pseudo-entries included.
    fn list(&self, directory: &Self::Object) -> Result<Vec<ListedEntry>, SyscallError>;

    /// Opens `name` inside `directory` without following symlinks.
    ///
    /// Returns `Ok(None)` when the entry vanished between listing and opening.
    fn open_child(
        &self,
        directory: &Self::Object,
        name: &OsStr,
    ) -> Result<Option<Self::Object>, SyscallError>;

    /// Opens a fresh readable directory handle for an already open directory.
    fn open_directory(&self, object: &Self::Object) -> Result<Self::Object, SyscallError>;

    /// Opens a fresh handle to the watched root.
    fn open_root(&self) -> Result<Self::Object, SyscallError>;
}
