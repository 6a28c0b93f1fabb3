//! In-memory mirror of a mounted filesystem.
//!
//! Objects are identified by kernel file handles rather than paths or inode
//! numbers. The [`tree`] holds inode records and directory entries, the
//! [`scanner`] reconciles single directories against the live filesystem, and
//! [`identity`] decides when an inode number has been recycled.

pub mod arena;
pub mod identity;
#[cfg(test)]
pub mod memfs;
pub mod observation;
pub mod scanner;
mod source;
pub mod sys;
pub mod tree;

pub use source::{FileKind, Filesystem, ListedEntry, ObjectAttributes};
