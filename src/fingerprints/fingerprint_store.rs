use std::collections::HashMap;
use std::path::Path;

use bincode::{Decode, Encode};
use compio::fs;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::ext::BestEffortPathExt;
use crate::filesystem::identity::{IdentityError, IdentityToken};
use crate::filesystem::tree::InodeRecord;
use crate::filesystem::{FileKind, Filesystem};
use crate::fingerprints::FileFingerprint;

const COMPRESSION_LEVEL: i32 = 3;

/// Row key: the inode number together with the identity token that was
/// current when the row was written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct StoreKey {
    pub ino: u64,
    pub handle_type: i32,
    pub handle: Vec<u8>,
}

impl StoreKey {
    pub fn new(ino: u64, token: &IdentityToken) -> Self {
        Self {
            ino,
            handle_type: token.handle_type(),
            handle: token.bytes().to_vec(),
        }
    }

    pub fn token(&self) -> Result<IdentityToken, IdentityError> {
        IdentityToken::new(self.handle_type, &self.handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ScanState {
    /// Content has to be looked at again.
    Pending = 1,
    Scanned = 100,
}

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct StoreRow {
    pub fingerprint: FileFingerprint,
    pub state: ScanState,
}

/// Persisted size/time fingerprints of regular files, used to decide which
/// files need their content looked at again.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    rows: HashMap<StoreKey, StoreRow>,
}

impl FingerprintStore {
    /// Loads the store from `path`, starting empty if there is nothing
    /// usable there.
    pub async fn read(path: &Path) -> Self {
        debug!(
            "Reading fingerprint store from {}",
            path.best_effort_path_display()
        );
        let compressed = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(_) => {
                info!("No existing fingerprint store found, starting fresh");
                return Self::default();
            }
        };
        match Self::decode(&compressed) {
            Ok(rows) => {
                debug!("Loaded {} fingerprint rows", rows.len());
                Self { rows }
            }
            Err(e) => {
                warn!("Discarding unreadable fingerprint store: {e}");
                Self::default()
            }
        }
    }

    fn decode(compressed: &[u8]) -> Result<HashMap<StoreKey, StoreRow>, StoreError> {
        let bytes = zstd::decode_all(compressed).context(CompressionSnafu)?;
        let (rows, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
            .context(DecodeSnafu)?;
        Ok(rows)
    }

    pub async fn write(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.context(WriteSnafu {
                file_path: parent.best_effort_path_display(),
            })?;
        }

        let bytes = bincode::encode_to_vec(&self.rows, bincode::config::standard())
            .context(EncodeSnafu)?;
        let compressed =
            zstd::encode_all(bytes.as_slice(), COMPRESSION_LEVEL).context(CompressionSnafu)?;
        fs::write(path, compressed).await.0.context(WriteSnafu {
            file_path: path.best_effort_path_display(),
        })?;
        debug!("Wrote {} fingerprint rows", self.rows.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, key: &StoreKey) -> Option<&StoreRow> {
        self.rows.get(key)
    }

    pub fn pending(&self) -> impl Iterator<Item = &StoreKey> {
        self.rows
            .iter()
            .filter(|(_, row)| row.state == ScanState::Pending)
            .map(|(key, _)| key)
    }

    /// Records the current fingerprint of a regular file.
    ///
    /// Returns true when the row was created or flipped to pending.
    pub fn absorb(&mut self, record: &InodeRecord) -> bool {
        if record.kind() != FileKind::Regular {
            return false;
        }
        let key = StoreKey::new(record.ino(), record.token());
        let fingerprint = *record.fingerprint();
        match self.rows.get_mut(&key) {
            None => {
                self.rows.insert(
                    key,
                    StoreRow {
                        fingerprint,
                        state: ScanState::Pending,
                    },
                );
                true
            }
            Some(row) if row.fingerprint.diverges_from(&fingerprint) => {
                row.fingerprint = fingerprint;
                let flipped = row.state != ScanState::Pending;
                row.state = ScanState::Pending;
                flipped
            }
            Some(_) => false,
        }
    }

    /// Marks a row as processed by the content pass.
    pub fn mark_scanned(&mut self, key: &StoreKey, fingerprint: FileFingerprint) -> bool {
        match self.rows.get_mut(key) {
            Some(row) => {
                row.fingerprint = fingerprint;
                row.state = ScanState::Scanned;
                true
            }
            None => false,
        }
    }

    /// Re-stats every scanned row through its identity token, flipping rows
    /// whose object is gone or changed back to pending.
    ///
    /// Returns the number of rows flipped.
    pub fn verify<F: Filesystem>(&mut self, fs: &F) -> usize {
        let mut flipped = 0;
        for (key, row) in self
            .rows
            .iter_mut()
            .filter(|(_, row)| row.state == ScanState::Scanned)
        {
            let current = key
                .token()
                .and_then(|token| fs.open_by_token(&token))
                .and_then(|object| {
                    fs.attributes(&object)
                        .map_err(|source| IdentityError::Os { source })
                });
            let changed = match current {
                Ok(attributes) => {
                    let changed = attributes.fingerprint.diverges_from(&row.fingerprint);
                    if changed {
                        row.fingerprint = attributes.fingerprint;
                    }
                    changed
                }
                Err(IdentityError::StaleIdentity) => true,
                Err(IdentityError::Os { source }) if source.is_vanished() => true,
                Err(e) => {
                    warn!("Leaving row for inode number {} unverified: {e}", key.ino);
                    false
                }
            };
            if changed {
                row.state = ScanState::Pending;
                flipped += 1;
            }
        }
        if flipped > 0 {
            info!("{flipped} stored fingerprints no longer match");
        }
        flipped
    }
}

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("Failed to write the fingerprint store: {}", file_path))]
    WriteError {
        file_path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to (de)compress the fingerprint store"))]
    CompressionError { source: std::io::Error },
    #[snafu(display("Failed to encode the fingerprint store"))]
    EncodeError { source: bincode::error::EncodeError },
    #[snafu(display("Failed to decode the fingerprint store"))]
    DecodeError { source: bincode::error::DecodeError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::identity::resolve;
    use crate::filesystem::memfs::MemFs;
    use crate::filesystem::observation::RecordingSink;
    use crate::filesystem::tree::{InodeId, Tree};
    use std::time::Duration;
    use tempfile::TempDir;

    fn tracked(fs: &MemFs, tree: &mut Tree, path: &str) -> InodeId {
        resolve(fs, tree, &fs.open(path)).expect("Failed to resolve")
    }

    fn tree() -> Tree {
        Tree::new(Duration::ZERO, Box::new(RecordingSink::default()))
    }

    fn key_of(tree: &Tree, inode: InodeId) -> StoreKey {
        let record = tree.record(inode).unwrap();
        StoreKey::new(record.ino(), record.token())
    }

    #[test]
    fn new_files_are_pending() {
        let fs = MemFs::new();
        fs.create("/file");
        let mut tree = tree();
        let inode = tracked(&fs, &mut tree, "/file");
        let mut store = FingerprintStore::default();

        assert!(store.absorb(tree.record(inode).unwrap()));

        let key = key_of(&tree, inode);
        assert_eq!(store.get(&key).unwrap().state, ScanState::Pending);
        assert_eq!(store.pending().collect::<Vec<_>>(), vec![&key]);
    }

    #[test]
    fn directories_are_not_stored() {
        let fs = MemFs::new();
        fs.mkdir("/dir");
        let mut tree = tree();
        let inode = tracked(&fs, &mut tree, "/dir");
        let mut store = FingerprintStore::default();

        assert!(!store.absorb(tree.record(inode).unwrap()));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn diverging_fingerprint_flips_a_scanned_row() {
        let fs = MemFs::new();
        fs.create("/file");
        let mut tree = tree();
        let inode = tracked(&fs, &mut tree, "/file");
        let mut store = FingerprintStore::default();
        store.absorb(tree.record(inode).unwrap());
        let key = key_of(&tree, inode);
        store.mark_scanned(&key, *tree.record(inode).unwrap().fingerprint());

        assert!(!store.absorb(tree.record(inode).unwrap()));
        fs.write("/file", 64);
        tracked(&fs, &mut tree, "/file");
        assert!(store.absorb(tree.record(inode).unwrap()));

        let row = store.get(&key).unwrap();
        assert_eq!(row.state, ScanState::Pending);
        assert_eq!(row.fingerprint.size, 64);
    }

    #[test]
    fn verify_flips_changed_and_deleted_rows() {
        let fs = MemFs::new();
        fs.create("/kept");
        fs.create("/changed");
        fs.create("/deleted");
        let mut tree = tree();
        let mut store = FingerprintStore::default();
        let mut keys = Vec::new();
        for path in ["/kept", "/changed", "/deleted"] {
            let inode = tracked(&fs, &mut tree, path);
            let record = tree.record(inode).unwrap();
            store.absorb(record);
            let key = key_of(&tree, inode);
            store.mark_scanned(&key, *record.fingerprint());
            keys.push(key);
        }

        fs.write("/changed", 10);
        fs.remove("/deleted");
        let flipped = store.verify(&fs);

        assert_eq!(flipped, 2);
        assert_eq!(store.get(&keys[0]).unwrap().state, ScanState::Scanned);
        assert_eq!(store.get(&keys[1]).unwrap().state, ScanState::Pending);
        assert_eq!(store.get(&keys[2]).unwrap().state, ScanState::Pending);
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn verify_ignores_pending_rows() {
        let fs = MemFs::new();
        fs.create("/file");
        let mut tree = tree();
        let inode = tracked(&fs, &mut tree, "/file");
        let mut store = FingerprintStore::default();
        store.absorb(tree.record(inode).unwrap());
        fs.remove("/file");

        assert_eq!(store.verify(&fs), 0);
    }

    #[compio::test]
    async fn store_survives_a_write_read_cycle() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("state").join("fingerprints.zst");
        let fs = MemFs::new();
        fs.create("/a");
        fs.create("/b");
        let mut tree = tree();
        let mut store = FingerprintStore::default();
        let a = tracked(&fs, &mut tree, "/a");
        let b = tracked(&fs, &mut tree, "/b");
        store.absorb(tree.record(a).unwrap());
        store.absorb(tree.record(b).unwrap());
        store.mark_scanned(&key_of(&tree, b), *tree.record(b).unwrap().fingerprint());

        store.write(&path).await.expect("Failed to write store");
        let loaded = FingerprintStore::read(&path).await;

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&key_of(&tree, a)), store.get(&key_of(&tree, a)));
        assert_eq!(
            loaded.get(&key_of(&tree, b)).unwrap().state,
            ScanState::Scanned
        );
    }

    #[compio::test]
    async fn missing_store_reads_as_empty() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FingerprintStore::read(&temp_dir.path().join("absent")).await;
        assert_eq!(store.len(), 0);
    }

    #[compio::test]
    async fn corrupt_store_reads_as_empty() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("corrupt");
        std::fs::write(&path, b"definitely not zstd").unwrap();

        let store = FingerprintStore::read(&path).await;

        assert_eq!(store.len(), 0);
    }
}
