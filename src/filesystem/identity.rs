//! Identity resolution: opaque kernel file handles mapped onto inode records.
//!
//! Numeric inode numbers are recycled by the filesystem as soon as an object
//! is deleted, so they only serve as a lookup key. The identity token
//! (the kernel's `struct file_handle`) is what tells two objects apart: a
//! token keeps resolving for exactly as long as the object it names exists.

use snafu::prelude::*;
use tracing::{debug, info};

use crate::filesystem::sys::SyscallError;
use crate::filesystem::tree::{InodeId, Tree};
use crate::filesystem::Filesystem;

/// Largest file handle the kernel hands out (`MAX_HANDLE_SZ`).
pub const MAX_HANDLE_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityToken {
    handle_type: i32,
    bytes: Vec<u8>,
}

impl IdentityToken {
    pub fn new(handle_type: i32, bytes: &[u8]) -> Result<Self, IdentityError> {
        ensure!(
            bytes.len() <= MAX_HANDLE_SIZE,
            HandleTooLargeSnafu { size: bytes.len() }
        );
        Ok(Self {
            handle_type,
            bytes: bytes.to_vec(),
        })
    }

    pub fn handle_type(&self) -> i32 {
        self.handle_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IdentityError {
    #[snafu(display(
        "Identity token of {size} bytes exceeds the {MAX_HANDLE_SIZE} byte limit"
    ))]
    HandleTooLarge { size: usize },
    #[snafu(display("Identity token no longer resolves to a live object"))]
    StaleIdentity,
    #[snafu(display("Failed to read object identity"))]
    Os { source: SyscallError },
}

/// Finds the record for an open object, creating it when the object has not
/// been seen before or when its inode number was recycled.
pub fn resolve<F: Filesystem>(
    fs: &F,
    tree: &mut Tree,
    object: &F::Object,
) -> Result<InodeId, IdentityError> {
    let attributes = fs.attributes(object).context(OsSnafu)?;
    let token = fs.identity_token(object)?;

    let Some(existing) = tree.lookup_ino(attributes.ino) else {
        return Ok(tree.insert_record(&attributes, token));
    };

    let still_live = match tree.record(existing) {
        Some(record) if record.token() == &token => true,
        // Equal objects may hand out unequal tokens; the stored token
        // still opening means the inode number was not recycled.
        Some(record) => match fs.open_by_token(record.token()) {
            Ok(_) => true,
            Err(IdentityError::StaleIdentity) => false,
            Err(error) => return Err(error),
        },
        None => false,
    };

    if still_live {
        tree.refresh_fingerprint(existing, attributes.fingerprint);
        return Ok(existing);
    }

    info!(
        "Inode number {} was recycled, discarding {}",
        attributes.ino,
        tree.resolve_path(existing).display()
    );
    tree.invalidate(existing);
    let fresh = tree.insert_record(&attributes, token);
    debug!("Created {fresh} for recycled inode number {}", attributes.ino);
    Ok(fresh)
}
