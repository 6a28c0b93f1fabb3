//! In-memory mirror of the watched directory tree.
//!
//! The tree is a graph of inode records and named directory entries. Every
//! entry is owned by its parent's name mapping and mirrored in the child's
//! reverse-link set; hard-linked objects are the only records with more than
//! one incoming entry. Records and entries live in two arenas and refer to
//! each other by index, so removals never leave dangling references behind.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::hash::BuildHasherDefault;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use derive_more::Display;
use hashlink::LinkedHashMap;
use metrohash::MetroHash64;
use snafu::prelude::*;
use tracing::{debug, error};

use crate::filesystem::arena::{Arena, Index};
use crate::filesystem::identity::IdentityToken;
use crate::filesystem::observation::{Observation, ObservationSink};
use crate::filesystem::{FileKind, ObjectAttributes};
use crate::fingerprints::FileFingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("inode {_0}")]
pub struct InodeId(Index);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("entry {_0}")]
pub struct EntryId(Index);

type InoTable = HashMap<u64, InodeId, BuildHasherDefault<MetroHash64>>;

#[derive(Debug)]
pub struct InodeRecord {
    ino: u64,
    mode: u32,
    token: IdentityToken,
    fingerprint: FileFingerprint,
    links: BTreeSet<EntryId>,
    children: Option<LinkedHashMap<OsString, EntryId>>,
}

impl InodeRecord {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn is_directory(&self) -> bool {
        self.children.is_some()
    }

    pub fn token(&self) -> &IdentityToken {
        &self.token
    }

    pub fn fingerprint(&self) -> &FileFingerprint {
        &self.fingerprint
    }

    /// Entries referencing this record.
    pub fn links(&self) -> &BTreeSet<EntryId> {
        &self.links
    }

    /// Child name mapping; only directories carry one.
    pub fn children(&self) -> Option<&LinkedHashMap<OsString, EntryId>> {
        self.children.as_ref()
    }
}

#[derive(Debug)]
pub struct DirectoryEntry {
    parent: InodeId,
    child: InodeId,
    name: OsString,
}

impl DirectoryEntry {
    pub fn parent(&self) -> InodeId {
        self.parent
    }

    pub fn child(&self) -> InodeId {
        self.child
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }
}

#[derive(Debug, Snafu)]
pub enum TreeError {
    #[snafu(display("{inode} is not in the tree"))]
    UnknownInode { inode: InodeId },
    #[snafu(display("{entry} is not in the tree"))]
    UnknownEntry { entry: EntryId },
    #[snafu(display("{inode} is not a directory"))]
    NotADirectory { inode: InodeId },
    #[snafu(display("Name '{name}' is already bound under {parent}"))]
    NameTaken { parent: InodeId, name: String },
    #[snafu(display("Tree invariant violated: {detail}"))]
    Inconsistent { detail: String },
}

pub struct Tree {
    inodes: Arena<InodeRecord>,
    entries: Arena<DirectoryEntry>,
    by_ino: InoTable,
    root: Option<InodeId>,
    /// Records without incoming entries, with the moment they lost the last one.
    orphans: LinkedHashMap<InodeId, Instant>,
    reclaim_grace: Duration,
    /// Records that gained an entry since the last [`Tree::take_touched`].
    touched: HashSet<InodeId>,
    sink: Box<dyn ObservationSink>,
}

impl Tree {
    pub fn new(reclaim_grace: Duration, sink: Box<dyn ObservationSink>) -> Self {
        Self {
            inodes: Arena::default(),
            entries: Arena::default(),
            by_ino: InoTable::default(),
            root: None,
            orphans: LinkedHashMap::new(),
            reclaim_grace,
            touched: HashSet::new(),
            sink,
        }
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn root(&self) -> Option<InodeId> {
        self.root
    }

    /// Marks `inode` as the mount root; the root is never reclaimed.
    pub fn set_root(&mut self, inode: InodeId) {
        self.orphans.remove(&inode);
        self.root = Some(inode);
    }

    pub fn record(&self, inode: InodeId) -> Option<&InodeRecord> {
        self.inodes.get(inode.0)
    }

    pub fn entry(&self, entry: EntryId) -> Option<&DirectoryEntry> {
        self.entries.get(entry.0)
    }

    pub fn lookup_ino(&self, ino: u64) -> Option<InodeId> {
        self.by_ino.get(&ino).copied()
    }

    pub fn is_orphan(&self, inode: InodeId) -> bool {
        self.orphans.contains_key(&inode)
    }

    pub fn child_entry(&self, parent: InodeId, name: &OsStr) -> Option<EntryId> {
        self.record(parent)?.children.as_ref()?.get(name).copied()
    }

    /// Record bound to `name` under `parent`.
    pub fn child(&self, parent: InodeId, name: &OsStr) -> Option<InodeId> {
        let entry = self.child_entry(parent, name)?;
        self.entry(entry).map(DirectoryEntry::child)
    }

    pub fn children(&self, parent: InodeId) -> impl Iterator<Item = (&OsStr, EntryId)> {
        self.record(parent)
            .and_then(|record| record.children.as_ref())
            .into_iter()
            .flat_map(|children| {
                children
                    .iter()
                    .map(|(name, entry)| (name.as_os_str(), *entry))
            })
    }

    /// Creates a record for a newly resolved object.
    ///
    /// The record starts without links and without a reclaim deadline; the
    /// caller either binds it or hands it to [`Tree::orphan_if_unlinked`].
    pub fn insert_record(&mut self, attributes: &ObjectAttributes, token: IdentityToken) -> InodeId {
        let children = (attributes.kind() == FileKind::Directory).then(LinkedHashMap::new);
        let inode = InodeId(self.inodes.insert(InodeRecord {
            ino: attributes.ino,
            mode: attributes.mode,
            token,
            fingerprint: attributes.fingerprint,
            links: BTreeSet::new(),
            children,
        }));
        if let Some(previous) = self.by_ino.insert(attributes.ino, inode) {
            error!(
                "Inode number {} was still mapped to {previous} when {inode} was created",
                attributes.ino
            );
        }
        inode
    }

    pub fn refresh_fingerprint(&mut self, inode: InodeId, fingerprint: FileFingerprint) {
        if let Some(record) = self.inodes.get_mut(inode.0) {
            record.fingerprint = fingerprint;
        }
    }

    /// Binds `name` under `parent` to `child`.
    pub fn add_entry(
        &mut self,
        parent: InodeId,
        name: &OsStr,
        child: InodeId,
    ) -> Result<EntryId, TreeError> {
        ensure!(self.inodes.contains(child.0), UnknownInodeSnafu { inode: child });
        let parent_record = self
            .record(parent)
            .context(UnknownInodeSnafu { inode: parent })?;
        let name_taken = parent_record
            .children
            .as_ref()
            .context(NotADirectorySnafu { inode: parent })?
            .contains_key(name);
        ensure!(
            !name_taken,
            NameTakenSnafu {
                parent,
                name: name.to_string_lossy().into_owned(),
            }
        );
        let parent_ino = parent_record.ino;

        let entry = EntryId(self.entries.insert(DirectoryEntry {
            parent,
            child,
            name: name.to_os_string(),
        }));
        if let Some(children) = self
            .inodes
            .get_mut(parent.0)
            .and_then(|record| record.children.as_mut())
        {
            children.insert(name.to_os_string(), entry);
        }
        let mut child_ino = 0;
        if let Some(record) = self.inodes.get_mut(child.0) {
            record.links.insert(entry);
            child_ino = record.ino;
        }
        self.orphans.remove(&child);
        self.touched.insert(child);

        let observation = Observation::Linked {
            path: self.resolve_path(parent).join(name),
            ino: child_ino,
            parent_ino,
        };
        self.sink.observe(&observation);
        Ok(entry)
    }

    /// Removes a binding from both of its ends.
    ///
    /// A child left without links becomes an orphan and is destroyed by the
    /// next [`Tree::reclaim_orphans`] pass after the grace window.
    pub fn remove_entry(&mut self, entry: EntryId) -> Result<(), TreeError> {
        let (parent, name) = {
            let binding = self.entry(entry).context(UnknownEntrySnafu { entry })?;
            (binding.parent, binding.name.clone())
        };
        let path = self.resolve_path(parent).join(&name);

        let binding = self
            .entries
            .remove(entry.0)
            .context(UnknownEntrySnafu { entry })?;
        let mut parent_ino = 0;
        if let Some(record) = self.inodes.get_mut(binding.parent.0) {
            parent_ino = record.ino;
            if let Some(children) = record.children.as_mut() {
                children.remove(&binding.name);
            }
        }
        let mut child_ino = 0;
        if let Some(record) = self.inodes.get_mut(binding.child.0) {
            child_ino = record.ino;
            record.links.remove(&entry);
            if record.links.is_empty() && self.root != Some(binding.child) {
                self.orphans.insert(binding.child, Instant::now());
            }
        }

        let observation = Observation::Unlinked {
            path,
            ino: child_ino,
            parent_ino,
        };
        self.sink.observe(&observation);
        Ok(())
    }

    /// Starts the grace window of a record that has no incoming entries.
    ///
    /// Returns false for linked records, the root and records already waiting.
    pub fn orphan_if_unlinked(&mut self, inode: InodeId) -> bool {
        let unlinked = self
            .record(inode)
            .is_some_and(|record| record.links.is_empty());
        if !unlinked || self.root == Some(inode) || self.orphans.contains_key(&inode) {
            return false;
        }
        self.orphans.insert(inode, Instant::now());
        true
    }

    /// One representative path to `inode`, for diagnostics only.
    ///
    /// Hard-linked records are reached through their lowest-numbered entry.
    pub fn resolve_path(&self, inode: InodeId) -> PathBuf {
        let mut components = Vec::new();
        let mut current = inode;
        // Bounded by the record count in case of a cycle.
        for _ in 0..=self.inodes.len() {
            let Some(entry) = self
                .record(current)
                .and_then(|record| record.links.first())
                .and_then(|entry| self.entry(*entry))
            else {
                break;
            };
            components.push(entry.name.as_os_str());
            current = entry.parent;
        }
        let mut path = PathBuf::from("/");
        path.extend(components.into_iter().rev());
        path
    }

    /// Destroys a record immediately, together with every entry pointing at it
    /// and, for directories, every entry it contains.
    pub fn invalidate(&mut self, inode: InodeId) {
        if self.destroy(inode) {
            debug!("Invalidated {inode}");
        }
    }

    /// Destroys orphans whose grace window has elapsed at `now`.
    ///
    /// Destroying a directory orphans its children; with a zero grace window
    /// they are collected in the same call.
    pub fn reclaim_orphans(&mut self, now: Instant) -> usize {
        let mut reclaimed = 0;
        loop {
            let expired = self
                .orphans
                .iter()
                .filter(|(_, since)| now.saturating_duration_since(**since) >= self.reclaim_grace)
                .map(|(inode, _)| *inode)
                .collect::<Vec<_>>();
            if expired.is_empty() {
                return reclaimed;
            }
            for inode in expired {
                if self.destroy(inode) {
                    reclaimed += 1;
                }
            }
        }
    }

    /// Records that gained an entry since the previous call.
    pub fn take_touched(&mut self) -> Vec<InodeId> {
        let mut touched = self
            .touched
            .drain()
            .filter(|inode| self.inodes.contains(inode.0))
            .collect::<Vec<_>>();
        touched.sort();
        touched
    }

    fn destroy(&mut self, inode: InodeId) -> bool {
        let Some(record) = self.record(inode) else {
            self.orphans.remove(&inode);
            return false;
        };
        let mut doomed = record.links.iter().copied().collect::<Vec<_>>();
        if let Some(children) = record.children.as_ref() {
            doomed.extend(children.values().copied());
        }
        for entry in doomed {
            if let Err(e) = self.remove_entry(entry) {
                error!("Failed to detach {entry} while destroying {inode}: {e}");
            }
        }

        self.orphans.remove(&inode);
        self.touched.remove(&inode);
        if self.root == Some(inode) {
            self.root = None;
        }
        let Some(record) = self.inodes.remove(inode.0) else {
            return false;
        };
        if self.by_ino.get(&record.ino) == Some(&inode) {
            self.by_ino.remove(&record.ino);
        }
        true
    }

    /// Verifies bidirectional consistency, sibling uniqueness and that only
    /// directories carry child mappings.
    pub fn check_consistency(&self) -> Result<(), TreeError> {
        for (index, entry) in self.entries.iter() {
            let id = EntryId(index);
            let parent = self.record(entry.parent).context(InconsistentSnafu {
                detail: format!("{id} has a missing parent {}", entry.parent),
            })?;
            let bound = parent
                .children
                .as_ref()
                .and_then(|children| children.get(&entry.name));
            ensure!(
                bound == Some(&id),
                InconsistentSnafu {
                    detail: format!(
                        "{id} named {:?} is not bound in its parent",
                        entry.name
                    ),
                }
            );
            let child = self.record(entry.child).context(InconsistentSnafu {
                detail: format!("{id} has a missing child {}", entry.child),
            })?;
            ensure!(
                child.links.contains(&id),
                InconsistentSnafu {
                    detail: format!("{id} is missing from the links of {}", entry.child),
                }
            );
        }

        for (index, record) in self.inodes.iter() {
            let id = InodeId(index);
            ensure!(
                record.children.is_some() == (record.kind() == FileKind::Directory),
                InconsistentSnafu {
                    detail: format!("{id} is a {} with a mismatched child mapping", record.kind()),
                }
            );
            for link in &record.links {
                ensure!(
                    self.entry(*link).map(DirectoryEntry::child) == Some(id),
                    InconsistentSnafu {
                        detail: format!("{id} lists {link} which does not point back"),
                    }
                );
            }
            for (name, entry) in record.children.iter().flatten() {
                let points_back = self
                    .entry(*entry)
                    .is_some_and(|binding| binding.parent == id && &binding.name == name);
                ensure!(
                    points_back,
                    InconsistentSnafu {
                        detail: format!("{id} maps {name:?} to foreign {entry}"),
                    }
                );
            }
            ensure!(
                self.by_ino.get(&record.ino) == Some(&id),
                InconsistentSnafu {
                    detail: format!("{id} is not registered under inode number {}", record.ino),
                }
            );
        }
        Ok(())
    }
}
