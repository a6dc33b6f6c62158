use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ChordId, FileId, PeerRef};

/// A file the peer either backed up elsewhere (sent-files map) or holds on
/// behalf of another owner (stored-files map).
///
/// In the sent map `local_key` is `None` and `keys` accumulates the routing
/// keys under which copies were accepted. In the stored map `local_key` is
/// the key this peer stores the file under and `keys` stays empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerFile {
    pub file_id: FileId,
    pub owner: PeerRef,
    pub size: u64,
    pub replication: u32,
    #[serde(default)]
    pub keys: BTreeSet<ChordId>,
    #[serde(default)]
    pub local_key: Option<ChordId>,
    #[serde(default)]
    pub being_deleted: bool,
}

impl PeerFile {
    pub fn sent(file_id: FileId, owner: PeerRef, size: u64, replication: u32) -> Self {
        PeerFile {
            file_id,
            owner,
            size,
            replication,
            keys: BTreeSet::new(),
            local_key: None,
            being_deleted: false,
        }
    }

    pub fn stored(
        file_id: FileId,
        owner: PeerRef,
        size: u64,
        replication: u32,
        local_key: ChordId,
    ) -> Self {
        PeerFile {
            file_id,
            owner,
            size,
            replication,
            keys: BTreeSet::new(),
            local_key: Some(local_key),
            being_deleted: false,
        }
    }

    pub fn add_key(&mut self, key: ChordId) {
        self.keys.insert(key);
    }

    pub fn remove_key(&mut self, key: ChordId) {
        self.keys.remove(&key);
    }

    /// A sent file is under-replicated when copies dropped below the degree
    /// requested at backup time.
    pub fn under_replicated(&self) -> bool {
        (self.keys.len() as u32) < self.replication
    }
}
