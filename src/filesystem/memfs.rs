//! Scriptable in-memory [`Filesystem`] for exercising the tracker without
//! touching a real mount.
//!
//! Every physical object gets a serial number that is never reused; the
//! identity token is derived from it, so recycling an inode number produces a
//! different token exactly like the kernel does. An object that loses its last
//! name stays reachable through handles opened earlier, but its token no longer
//! opens.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path};
use std::rc::Rc;

use nix::errno::Errno;

use crate::filesystem::identity::{IdentityError, IdentityToken, MAX_HANDLE_SIZE};
use crate::filesystem::sys::SyscallError;
use crate::filesystem::{Filesystem, ListedEntry, ObjectAttributes};
use crate::fingerprints::FileFingerprint;

const ROOT_SERIAL: u64 = 0;
const ROOT_INO: u64 = 2;
const TOKEN_TYPE: i32 = 1;

#[derive(Debug)]
struct Node {
    ino: u64,
    mode: u32,
    fingerprint: FileFingerprint,
    nlink: usize,
    children: Option<BTreeMap<OsString, u64>>,
    oversized: bool,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<u64, Node>,
    next_serial: u64,
    next_ino: u64,
    clock: f64,
    phantoms: HashMap<u64, Vec<ListedEntry>>,
    failing_listings: HashSet<u64>,
}

/// An open handle; dropping it gives the lease back.
#[derive(Debug)]
pub struct MemHandle {
    serial: u64,
    leases: Rc<Cell<usize>>,
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        self.leases.set(self.leases.get() - 1);
    }
}

#[derive(Debug)]
pub struct MemFs {
    state: RefCell<State>,
    leases: Rc<Cell<usize>>,
}

impl MemFs {
    pub fn new() -> Self {
        let mut state = State {
            next_serial: ROOT_SERIAL + 1,
            next_ino: 100,
            clock: 1_700_000_000.0,
            ..State::default()
        };
        state.nodes.insert(
            ROOT_SERIAL,
            Node {
                ino: ROOT_INO,
                mode: libc::S_IFDIR | 0o755,
                fingerprint: FileFingerprint::default(),
                nlink: 1,
                children: Some(BTreeMap::new()),
                oversized: false,
            },
        );
        Self {
            state: RefCell::new(state),
            leases: Rc::new(Cell::new(0)),
        }
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.leases.get()
    }

    pub fn mkdir(&self, path: &str) -> u64 {
        let ino = self.allocate_ino();
        self.insert(path, ino, libc::S_IFDIR | 0o755)
    }

    pub fn create(&self, path: &str) -> u64 {
        let ino = self.allocate_ino();
        self.create_with_ino(path, ino)
    }

    pub fn create_with_ino(&self, path: &str, ino: u64) -> u64 {
        self.insert(path, ino, libc::S_IFREG | 0o644)
    }

    pub fn link(&self, existing: &str, path: &str) {
        let serial = self.serial_of(existing);
        let (parent, name) = self.split(path);
        let mut state = self.state.borrow_mut();
        bind(&mut state, parent, name, serial);
        state.clock += 1.0;
        let clock = state.clock;
        let node = state.nodes.get_mut(&serial).expect("linked node exists");
        node.nlink += 1;
        node.fingerprint.ctime = clock;
    }

    /// Unbinds `path`; the object disappears with its last name.
    pub fn remove(&self, path: &str) {
        let (parent, name) = self.split(path);
        let mut state = self.state.borrow_mut();
        let serial = unbind(&mut state, parent, &name);
        release(&mut state, serial);
    }

    pub fn rename(&self, from: &str, to: &str) {
        let (from_parent, from_name) = self.split(from);
        let (to_parent, to_name) = self.split(to);
        let mut state = self.state.borrow_mut();
        let serial = unbind(&mut state, from_parent, &from_name);
        let replaced = state.nodes[&to_parent]
            .children
            .as_ref()
            .and_then(|children| children.get(&to_name).copied());
        if let Some(replaced) = replaced {
            unbind(&mut state, to_parent, &to_name);
            release(&mut state, replaced);
        }
        bind(&mut state, to_parent, to_name, serial);
    }

    /// Changes the size of a file, bumping both timestamps.
    pub fn write(&self, path: &str, size: u64) {
        let serial = self.serial_of(path);
        let mut state = self.state.borrow_mut();
        state.clock += 1.0;
        let clock = state.clock;
        let node = state.nodes.get_mut(&serial).expect("written node exists");
        node.fingerprint = FileFingerprint {
            size,
            mtime: clock,
            ctime: clock,
        };
    }

    pub fn open(&self, path: &str) -> MemHandle {
        let serial = self.serial_of(path);
        self.handle(serial)
    }

    pub fn ino_of(&self, path: &str) -> u64 {
        let serial = self.serial_of(path);
        self.state.borrow().nodes[&serial].ino
    }

    /// Makes the object's identity token exceed the handle size limit.
    pub fn mark_oversized(&self, path: &str) {
        let serial = self.serial_of(path);
        let mut state = self.state.borrow_mut();
        state
            .nodes
            .get_mut(&serial)
            .expect("marked node exists")
            .oversized = true;
    }

    /// Lists `name` under `directory` without any object behind it, like an
    /// entry removed between `readdir` and `openat`.
    pub fn add_phantom(&self, directory: &str, name: &str, ino: u64) {
        let serial = self.serial_of(directory);
        self.state
            .borrow_mut()
            .phantoms
            .entry(serial)
            .or_default()
            .push(ListedEntry {
                name: name.into(),
                ino,
            });
    }

    pub fn fail_listing(&self, directory: &str) {
        let serial = self.serial_of(directory);
        self.state.borrow_mut().failing_listings.insert(serial);
    }

    fn handle(&self, serial: u64) -> MemHandle {
        self.leases.set(self.leases.get() + 1);
        MemHandle {
            serial,
            leases: Rc::clone(&self.leases),
        }
    }

    fn allocate_ino(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        state.next_ino += 1;
        state.next_ino
    }

    fn insert(&self, path: &str, ino: u64, mode: u32) -> u64 {
        let (parent, name) = self.split(path);
        let mut state = self.state.borrow_mut();
        let serial = state.next_serial;
        state.next_serial += 1;
        state.clock += 1.0;
        let clock = state.clock;
        let is_directory = mode & libc::S_IFMT == libc::S_IFDIR;
        state.nodes.insert(
            serial,
            Node {
                ino,
                mode,
                fingerprint: FileFingerprint {
                    size: 0,
                    mtime: clock,
                    ctime: clock,
                },
                nlink: 1,
                children: is_directory.then(BTreeMap::new),
                oversized: false,
            },
        );
        bind(&mut state, parent, name, serial);
        ino
    }

    fn serial_of(&self, path: &str) -> u64 {
        let state = self.state.borrow();
        let mut serial = ROOT_SERIAL;
        for component in Path::new(path).components() {
            if let Component::Normal(name) = component {
                serial = state.nodes[&serial]
                    .children
                    .as_ref()
                    .and_then(|children| children.get(name).copied())
                    .unwrap_or_else(|| panic!("{path} does not exist"));
            }
        }
        serial
    }

    fn split(&self, path: &str) -> (u64, OsString) {
        let path = Path::new(path);
        let parent = path.parent().and_then(Path::to_str).unwrap_or("/");
        let name = path.file_name().expect("path has a file name");
        (self.serial_of(parent), name.to_os_string())
    }

}

fn bind(state: &mut State, parent: u64, name: OsString, serial: u64) {
    let children = state
        .nodes
        .get_mut(&parent)
        .and_then(|node| node.children.as_mut())
        .expect("parent is a directory");
    assert!(
        children.insert(name.clone(), serial).is_none(),
        "{name:?} already exists"
    );
}

fn unbind(state: &mut State, parent: u64, name: &OsStr) -> u64 {
    state
        .nodes
        .get_mut(&parent)
        .and_then(|node| node.children.as_mut())
        .and_then(|children| children.remove(name))
        .unwrap_or_else(|| panic!("{name:?} does not exist"))
}

fn release(state: &mut State, serial: u64) {
    let node = state.nodes.get_mut(&serial).expect("released node exists");
    node.nlink -= 1;
    if node.nlink > 0 {
        return;
    }
    let orphaned = node
        .children
        .as_mut()
        .map(std::mem::take)
        .unwrap_or_default();
    state.phantoms.remove(&serial);
    for child in orphaned.into_values() {
        release(state, child);
    }
}

impl Filesystem for MemFs {
    type Object = MemHandle;

    fn attributes(&self, object: &MemHandle) -> Result<ObjectAttributes, SyscallError> {
        let state = self.state.borrow();
        let node = &state.nodes[&object.serial];
        Ok(ObjectAttributes {
            ino: node.ino,
            mode: node.mode,
            fingerprint: node.fingerprint,
        })
    }

    fn identity_token(&self, object: &MemHandle) -> Result<IdentityToken, IdentityError> {
        if self.state.borrow().nodes[&object.serial].oversized {
            return Err(IdentityError::HandleTooLarge {
                size: MAX_HANDLE_SIZE + 8,
            });
        }
        IdentityToken::new(TOKEN_TYPE, &object.serial.to_le_bytes())
    }

    fn open_by_token(&self, token: &IdentityToken) -> Result<MemHandle, IdentityError> {
        let serial = <[u8; 8]>::try_from(token.bytes())
            .map(u64::from_le_bytes)
            .map_err(|_| IdentityError::StaleIdentity)?;
        let linked = self
            .state
            .borrow()
            .nodes
            .get(&serial)
            .is_some_and(|node| node.nlink > 0);
        if token.handle_type() != TOKEN_TYPE || !linked {
            return Err(IdentityError::StaleIdentity);
        }
        Ok(self.handle(serial))
    }

    fn list(&self, directory: &MemHandle) -> Result<Vec<ListedEntry>, SyscallError> {
        let state = self.state.borrow();
        if state.failing_listings.contains(&directory.serial) {
            return Err(SyscallError::new("readdir", Errno::EIO));
        }
        let node = &state.nodes[&directory.serial];
        let children = node
            .children
            .as_ref()
            .ok_or_else(|| SyscallError::new("readdir", Errno::ENOTDIR))?;
        let mut listing = vec![
            ListedEntry {
                name: ".".into(),
                ino: node.ino,
            },
            ListedEntry {
                name: "..".into(),
                ino: ROOT_INO,
            },
        ];
        listing.extend(children.iter().map(|(name, serial)| ListedEntry {
            name: name.clone(),
            ino: state.nodes[serial].ino,
        }));
        listing.extend(
            state
                .phantoms
                .get(&directory.serial)
                .into_iter()
                .flatten()
                .cloned(),
        );
        Ok(listing)
    }

    fn open_child(
        &self,
        directory: &MemHandle,
        name: &OsStr,
    ) -> Result<Option<MemHandle>, SyscallError> {
        let child = self.state.borrow().nodes[&directory.serial]
            .children
            .as_ref()
            .ok_or_else(|| SyscallError::new("openat", Errno::ENOTDIR))?
            .get(name)
            .copied();
        Ok(child.map(|serial| self.handle(serial)))
    }

    fn open_directory(&self, object: &MemHandle) -> Result<MemHandle, SyscallError> {
        if self.state.borrow().nodes[&object.serial].children.is_none() {
            return Err(SyscallError::new("openat(.)", Errno::ENOTDIR));
        }
        Ok(self.handle(object.serial))
    }

    fn open_root(&self) -> Result<MemHandle, SyscallError> {
        Ok(self.handle(ROOT_SERIAL))
    }
}
