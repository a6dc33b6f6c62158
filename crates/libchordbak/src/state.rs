// Persistent per-peer state: the sent-files and stored-files registries and
// the capacity accounting. Every mutation is written through to
// `<root>/<guid>/state` so a restart picks up where the peer left off.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use dashmap::DashMap;
use libchordbak_core::{ChordId, FileId, PeerFile};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Capacity and occupation form one invariant (`occupation <= capacity` at
/// rest) and are only ever touched together, hence the single mutex.
struct DiskUsage {
    capacity: u64,
    occupation: u64,
}

pub struct PeerState {
    /// `<root>/<guid>`; stored blobs and the state file live here.
    dir: PathBuf,
    state_path: PathBuf,
    /// Files this peer owns and has backed up elsewhere, by local filename.
    sent: DashMap<String, PeerFile>,
    /// Files this peer holds on behalf of others, by file id.
    stored: DashMap<FileId, PeerFile>,
    disk: Mutex<DiskUsage>,
}

#[derive(Serialize, Deserialize)]
struct StateOnDisk {
    capacity: u64,
    sent: BTreeMap<String, PeerFile>,
    stored: Vec<PeerFile>,
}

impl PeerState {
    /// Loads the state file or starts fresh when there is none. A state
    /// file that exists but does not parse is fatal: refusing to start
    /// beats silently forgetting what we stored for others.
    pub fn load_or_create(root: &Path, guid: ChordId, capacity: u64) -> anyhow::Result<Self> {
        let dir = root.join(guid.to_string());
        std::fs::create_dir_all(&dir).with_context(|| format!("error creating {dir:?}"))?;
        let state_path = dir.join("state");

        let state = PeerState {
            dir,
            state_path: state_path.clone(),
            sent: DashMap::new(),
            stored: DashMap::new(),
            disk: Mutex::new(DiskUsage {
                capacity,
                occupation: 0,
            }),
        };

        match std::fs::read(&state_path) {
            Ok(bytes) => {
                let on_disk: StateOnDisk = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt state file {state_path:?}"))?;
                state.disk.lock().capacity = on_disk.capacity;
                for (name, pf) in on_disk.sent {
                    state.sent.insert(name, pf);
                }
                for pf in on_disk.stored {
                    state.stored.insert(pf.file_id, pf);
                }
                debug!(path = ?state_path, "loaded peer state");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?state_path, "no previous state, starting fresh");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("error reading {state_path:?}"));
            }
        }
        state.update_occupation();
        Ok(state)
    }

    /// Where the blob for `file_id` lives on disk.
    pub fn blob_path(&self, file_id: &FileId) -> PathBuf {
        self.dir.join(file_id.as_string())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serializes both maps and the capacity; tempfile plus rename so a
    /// crash mid-write never corrupts the previous state.
    pub fn persist(&self) {
        if let Err(e) = self.try_persist() {
            error!(path = ?self.state_path, "error persisting state: {:#}", e);
        }
    }

    fn try_persist(&self) -> anyhow::Result<()> {
        let on_disk = StateOnDisk {
            capacity: self.disk.lock().capacity,
            sent: self
                .sent
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            stored: self.stored.iter().map(|e| e.value().clone()).collect(),
        };
        let tmp = self
            .state_path
            .with_file_name(format!("state.tmp.{}", std::process::id()));
        let file = std::fs::File::create(&tmp).with_context(|| format!("error opening {tmp:?}"))?;
        serde_json::to_writer(std::io::BufWriter::new(file), &on_disk)
            .with_context(|| format!("error serializing state to {tmp:?}"))?;
        std::fs::rename(&tmp, &self.state_path)
            .with_context(|| format!("error renaming {tmp:?} to {:?}", self.state_path))?;
        Ok(())
    }

    // sent files

    pub fn get_sent(&self, name: &str) -> Option<PeerFile> {
        self.sent.get(name).map(|e| e.value().clone())
    }

    pub fn add_sent(&self, name: String, pf: PeerFile) {
        self.sent.insert(name, pf);
        self.persist();
    }

    pub fn remove_sent(&self, name: &str) -> Option<PeerFile> {
        let removed = self.sent.remove(name).map(|(_, pf)| pf);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Mutates one sent entry in place (key bookkeeping, delete marking).
    pub fn with_sent_mut<R>(&self, name: &str, f: impl FnOnce(&mut PeerFile) -> R) -> Option<R> {
        let r = self.sent.get_mut(name).map(|mut e| f(e.value_mut()));
        if r.is_some() {
            self.persist();
        }
        r
    }

    /// Looks a sent entry up by file id; REMOVED only carries the id.
    pub fn sent_name_by_file_id(&self, file_id: &FileId) -> Option<String> {
        self.sent
            .iter()
            .find(|e| e.value().file_id == *file_id)
            .map(|e| e.key().clone())
    }

    pub fn sent_snapshot(&self) -> BTreeMap<String, PeerFile> {
        self.sent
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // stored files

    pub fn has_stored(&self, file_id: &FileId) -> bool {
        self.stored.contains_key(file_id)
    }

    pub fn get_stored(&self, file_id: &FileId) -> Option<PeerFile> {
        self.stored.get(file_id).map(|e| e.value().clone())
    }

    /// At most one entry per file id; a second add is refused.
    pub fn add_stored(&self, pf: PeerFile) -> crate::Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.stored.entry(pf.file_id) {
            Entry::Occupied(_) => return Err(crate::Error::DuplicateFile),
            Entry::Vacant(v) => {
                v.insert(pf);
            }
        }
        self.persist();
        Ok(())
    }

    pub fn remove_stored(&self, file_id: &FileId) -> Option<PeerFile> {
        let removed = self.stored.remove(file_id).map(|(_, pf)| pf);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    pub fn stored_snapshot(&self) -> Vec<PeerFile> {
        self.stored.iter().map(|e| e.value().clone()).collect()
    }

    // capacity accounting

    pub fn capacity(&self) -> u64 {
        self.disk.lock().capacity
    }

    pub fn occupation(&self) -> u64 {
        self.disk.lock().occupation
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.disk.lock().capacity = capacity;
        self.persist();
    }

    pub fn has_space(&self, bytes: u64) -> bool {
        let disk = self.disk.lock();
        disk.occupation + bytes <= disk.capacity
    }

    /// Recomputes occupation from the on-disk sizes of the stored blobs.
    /// Entries whose blob vanished count as zero and are logged.
    pub fn update_occupation(&self) {
        let mut total = 0u64;
        for entry in self.stored.iter() {
            let path = self.blob_path(entry.key());
            match std::fs::metadata(&path) {
                Ok(meta) => total += meta.len(),
                Err(e) => {
                    warn!(file = %entry.key(), "stored blob missing from disk: {e}");
                }
            }
        }
        self.disk.lock().occupation = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libchordbak_core::PeerRef;
    use libchordbak_core::constants::DEFAULT_CAPACITY;

    fn owner() -> PeerRef {
        PeerRef::new("127.0.0.1:4100".parse().unwrap())
    }

    fn stored_file(b: u8, size: u64) -> PeerFile {
        PeerFile::stored(FileId([b; 32]), owner(), size, 1, ChordId::new(b as u32))
    }

    #[test]
    fn state_survives_restart() {
        let root = tempfile::tempdir().unwrap();
        let guid = ChordId::new(9);
        let state = PeerState::load_or_create(root.path(), guid, DEFAULT_CAPACITY).unwrap();

        let mut sent = PeerFile::sent(FileId([1; 32]), owner(), 123, 2);
        sent.add_key(ChordId::new(40));
        state.add_sent("notes.txt".into(), sent);
        state.add_stored(stored_file(2, 456)).unwrap();
        state.set_capacity(10_000);

        let reloaded = PeerState::load_or_create(root.path(), guid, DEFAULT_CAPACITY).unwrap();
        assert_eq!(reloaded.capacity(), 10_000);
        let sent = reloaded.get_sent("notes.txt").unwrap();
        assert!(sent.keys.contains(&ChordId::new(40)));
        assert!(reloaded.has_stored(&FileId([2; 32])));
    }

    #[test]
    fn corrupt_state_file_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let guid = ChordId::new(9);
        let dir = root.path().join(guid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("state"), b"{not json").unwrap();
        assert!(PeerState::load_or_create(root.path(), guid, DEFAULT_CAPACITY).is_err());
    }

    #[test]
    fn duplicate_stored_entry_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let state = PeerState::load_or_create(root.path(), ChordId::new(1), DEFAULT_CAPACITY)
            .unwrap();
        state.add_stored(stored_file(5, 10)).unwrap();
        assert!(matches!(
            state.add_stored(stored_file(5, 10)),
            Err(crate::Error::DuplicateFile)
        ));
    }

    #[test]
    fn has_space_tracks_capacity() {
        let root = tempfile::tempdir().unwrap();
        let state = PeerState::load_or_create(root.path(), ChordId::new(1), 100).unwrap();
        assert!(state.has_space(100));
        assert!(!state.has_space(101));
    }

    #[test]
    fn occupation_follows_on_disk_sizes() {
        let root = tempfile::tempdir().unwrap();
        let state = PeerState::load_or_create(root.path(), ChordId::new(3), 1_000_000).unwrap();

        let pf = stored_file(7, 300);
        std::fs::write(state.blob_path(&pf.file_id), vec![0u8; 300]).unwrap();
        state.add_stored(pf).unwrap();
        state.update_occupation();
        assert_eq!(state.occupation(), 300);
        assert!(state.has_space(999_700));
        assert!(!state.has_space(999_701));

        state.remove_stored(&FileId([7; 32]));
        state.update_occupation();
        assert_eq!(state.occupation(), 0);
    }
}
