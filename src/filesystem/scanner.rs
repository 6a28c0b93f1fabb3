//! Directory reconciliation: brings the children of one tree record in line
//! with the on-disk listing of the directory it mirrors.

use std::collections::HashSet;
use std::ffi::OsString;

use derive_more::AddAssign;
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::filesystem::identity::{self, IdentityError};
use crate::filesystem::sys::SyscallError;
use crate::filesystem::tree::{InodeId, Tree, TreeError};
use crate::filesystem::{Filesystem, ListedEntry};

/// Counters describing what one scan changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AddAssign)]
pub struct ScanSummary {
    pub directories: usize,
    pub linked: usize,
    pub unlinked: usize,
    pub fast_path: usize,
    pub skipped: usize,
}

impl ScanSummary {
    pub fn changed(&self) -> bool {
        self.linked > 0 || self.unlinked > 0
    }

    fn skipped() -> Self {
        Self {
            skipped: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ScanError {
    #[snafu(display("Failed to resolve the identity of a scanned object"))]
    Resolve { source: IdentityError },
    #[snafu(display("Filesystem call failed while scanning"))]
    Os { source: SyscallError },
    #[snafu(display("Failed to update the tree"))]
    Tree { source: TreeError },
}

pub struct Scanner<'a, F: Filesystem> {
    fs: &'a F,
    tree: &'a mut Tree,
    strict: bool,
}

impl<'a, F: Filesystem> Scanner<'a, F> {
    /// `strict` disables the same-name, same-inode-number shortcut, so every
    /// listed child has its identity token checked.
    pub fn new(fs: &'a F, tree: &'a mut Tree, strict: bool) -> Self {
        Self { fs, tree, strict }
    }

    /// Opens the mount root, registers it as the tree root and scans the
    /// whole mount.
    pub fn scan_root(&mut self) -> Result<ScanSummary, ScanError> {
        let root = self.fs.open_root().context(OsSnafu)?;
        let inode = identity::resolve(self.fs, self.tree, &root).context(ResolveSnafu)?;
        self.tree.set_root(inode);
        self.scan(root, true)
    }

    /// Reconciles `directory` against the tree, descending into child
    /// directories when `recursive` is set and into newly linked ones always.
    ///
    /// Consumes the handle; it is released on every return path.
    pub fn scan(&mut self, directory: F::Object, recursive: bool) -> Result<ScanSummary, ScanError> {
        let parent = match identity::resolve(self.fs, self.tree, &directory) {
            Ok(parent) => parent,
            Err(IdentityError::HandleTooLarge { size }) => {
                warn!("Skipping directory with a {size} byte identity token");
                return Ok(ScanSummary::skipped());
            }
            Err(error) => return Err(error).context(ResolveSnafu),
        };

        let listing = match self.fs.list(&directory) {
            Ok(listing) => listing,
            Err(error) if error.is_vanished() => {
                debug!(
                    "{} vanished before it could be listed",
                    self.tree.resolve_path(parent).display()
                );
                self.tree.orphan_if_unlinked(parent);
                return Ok(ScanSummary::skipped());
            }
            Err(error) => return Err(error).context(OsSnafu),
        };
        let mut summary = ScanSummary {
            directories: 1,
            ..ScanSummary::default()
        };
        let mut seen = HashSet::<OsString>::with_capacity(listing.len());
        for listed in listing {
            if listed.is_pseudo_entry() {
                continue;
            }
            summary += self.reconcile(&directory, parent, &listed, recursive)?;
            seen.insert(listed.name);
        }

        let gone = self
            .tree
            .children(parent)
            .filter(|(name, _)| !seen.contains(*name))
            .map(|(_, entry)| entry)
            .collect::<Vec<_>>();
        for entry in gone {
            self.tree.remove_entry(entry).context(TreeSnafu)?;
            summary.unlinked += 1;
        }

        // A directory nothing links to was removed after its notification was
        // queued, or its parent has not been scanned yet.
        self.tree.orphan_if_unlinked(parent);
        debug!(
            "Scanned {}: {summary:?}",
            self.tree.resolve_path(parent).display()
        );
        Ok(summary)
    }

    fn reconcile(
        &mut self,
        directory: &F::Object,
        parent: InodeId,
        listed: &ListedEntry,
        recursive: bool,
    ) -> Result<ScanSummary, ScanError> {
        if !self.strict {
            let unchanged = self
                .tree
                .child(parent, &listed.name)
                .and_then(|child| self.tree.record(child))
                .filter(|record| record.ino() == listed.ino);
            if let Some(record) = unchanged {
                let mut summary = ScanSummary {
                    fast_path: 1,
                    ..ScanSummary::default()
                };
                if recursive && record.is_directory() {
                    summary += self.descend(directory, listed)?;
                }
                return Ok(summary);
            }
        }

        let Some(object) = self.fs.open_child(directory, &listed.name).context(OsSnafu)? else {
            debug!("{:?} vanished before it could be opened", listed.name);
            return Ok(ScanSummary::skipped());
        };
        let child = match identity::resolve(self.fs, self.tree, &object) {
            Ok(child) => child,
            Err(IdentityError::HandleTooLarge { size }) => {
                warn!(
                    "Skipping {:?}: identity token of {size} bytes is too large",
                    listed.name
                );
                return Ok(ScanSummary::skipped());
            }
            Err(IdentityError::Os { source }) if source.is_vanished() => {
                debug!("{:?} vanished while being resolved", listed.name);
                return Ok(ScanSummary::skipped());
            }
            Err(error) => return Err(error).context(ResolveSnafu),
        };

        let mut summary = ScanSummary::default();
        // Resolution may have invalidated the record previously bound here.
        match self.tree.child_entry(parent, &listed.name) {
            Some(entry) if self.tree.entry(entry).map(|e| e.child()) == Some(child) => {}
            Some(entry) => {
                self.tree.remove_entry(entry).context(TreeSnafu)?;
                summary.unlinked += 1;
                self.tree
                    .add_entry(parent, &listed.name, child)
                    .context(TreeSnafu)?;
                summary.linked += 1;
            }
            None => {
                self.tree
                    .add_entry(parent, &listed.name, child)
                    .context(TreeSnafu)?;
                summary.linked += 1;
            }
        }

        // A directory linked here with no children yet is new to the mirror,
        // possibly moved in with its contents, so it is always explored.
        let (is_directory, unexplored) =
            self.tree.record(child).map_or((false, false), |record| {
                let empty = record.children().is_some_and(|children| children.is_empty());
                (record.is_directory(), summary.linked > 0 && empty)
            });
        if is_directory && (recursive || unexplored) {
            match self.fs.open_directory(&object) {
                Ok(handle) => {
                    drop(object);
                    summary += self.scan(handle, recursive)?;
                }
                Err(error) if error.is_vanished() => summary.skipped += 1,
                Err(error) => return Err(error).context(OsSnafu),
            }
        }
        Ok(summary)
    }

    fn descend(
        &mut self,
        directory: &F::Object,
        listed: &ListedEntry,
    ) -> Result<ScanSummary, ScanError> {
        let Some(object) = self.fs.open_child(directory, &listed.name).context(OsSnafu)? else {
            return Ok(ScanSummary::skipped());
        };
        match self.fs.open_directory(&object) {
            Ok(handle) => {
                drop(object);
                self.scan(handle, true)
            }
            Err(error) if error.is_vanished() => Ok(ScanSummary::skipped()),
            Err(error) => Err(error).context(OsSnafu),
        }
    }
}
