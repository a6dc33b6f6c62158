// The protocol engine: coordinates BACKUP / RESTORE / DELETE / RECLAIM
// against remote peers. Per-target work runs under the protocol pool;
// failures stay confined to their target and come back as notification
// lines rather than errors.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libchordbak_core::constants::{
    BACKUP_ACK_TIMEOUT, BACKUP_STORED_TIMEOUT, CHORD_MAX_PEERS, DEFAULT_CAPACITY,
    RESTORE_ACK_TIMEOUT,
};
use libchordbak_core::{ChordId, FileId, PeerFile, PeerRef};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use wire_protocol::{BackupRequest, Frame, Message, NackReason};

use crate::commands::Notifier;
use crate::error::Error;
use crate::state::PeerState;
use crate::transport::Dialer;

enum BackupOutcome {
    Stored,
    AlreadyHad,
    NoSpace,
    NoAck,
    Unexpected,
}

pub struct Engine {
    me: PeerRef,
    chord: Arc<chord::Chord>,
    state: Arc<PeerState>,
    dialer: Arc<dyn Dialer>,
    notifier: Notifier,
    protocol_pool: Arc<Semaphore>,
    // Injectable so tests can pin the key draw.
    rng: Mutex<StdRng>,
}

impl Engine {
    pub fn new(
        me: PeerRef,
        chord: Arc<chord::Chord>,
        state: Arc<PeerState>,
        dialer: Arc<dyn Dialer>,
        notifier: Notifier,
        protocol_pool_size: usize,
        rng: StdRng,
    ) -> Self {
        Engine {
            me,
            chord,
            state,
            dialer,
            notifier,
            protocol_pool: Arc::new(Semaphore::new(protocol_pool_size)),
            rng: Mutex::new(rng),
        }
    }

    // BACKUP

    pub async fn backup(&self, filename: String, replication: u32) {
        self.backup_excluding(filename, replication, HashSet::new())
            .await
    }

    /// Backs `filename` up onto `replication` distinct peers, skipping any
    /// guid in `exclude` (used by the re-backup path to avoid peers that
    /// still hold a copy).
    pub async fn backup_excluding(
        &self,
        filename: String,
        replication: u32,
        exclude: HashSet<ChordId>,
    ) {
        if replication == 0 {
            self.notifier
                .notify(format!("BACKUP {filename}: replication degree must be positive"));
            return;
        }
        if self.chord.is_solitary() {
            self.notifier
                .notify(format!("BACKUP {filename}: {}", Error::NotBootstrapped));
            return;
        }
        let path = PathBuf::from(&filename);
        let (file_id, size) = match FileId::of_path(&path) {
            Ok(v) => v,
            Err(e) => {
                self.notifier.notify(format!("BACKUP {filename}: {e:#}"));
                return;
            }
        };

        let targets = self.select_targets(replication, &exclude).await;
        if targets.is_empty() {
            self.notifier
                .notify(format!("BACKUP {filename}: no suitable peers found"));
            return;
        }
        debug!(file = %filename, targets = targets.len(), "backup fan-out");

        if self.state.get_sent(&filename).is_none() {
            self.state.add_sent(
                filename.clone(),
                PeerFile::sent(file_id, self.me, size, replication),
            );
        }

        let tasks = targets.iter().map(|(key, target)| {
            let pool = self.protocol_pool.clone();
            let filename = filename.clone();
            let path = path.clone();
            async move {
                let _permit = pool.acquire_owned().await.ok();
                self.backup_one(&filename, &path, file_id, size, replication, *key, target)
                    .await
            }
        });
        let lines = futures::future::join_all(tasks).await;

        self.state.persist();
        self.notifier
            .notify(format!("BACKUP {}:\n{}", filename, lines.join("\n")));
    }

    /// Draws `4 * replication` distinct candidate keys and resolves them in
    /// order until enough distinct non-self targets answered.
    async fn select_targets(
        &self,
        replication: u32,
        exclude: &HashSet<ChordId>,
    ) -> Vec<(ChordId, PeerRef)> {
        let mut chosen = HashSet::new();
        let mut out = Vec::new();
        for key in self.draw_candidate_keys(replication) {
            if out.len() as u32 == replication {
                break;
            }
            let target = match self.chord.find_successor(key).await {
                Ok(t) => t,
                Err(e) => {
                    debug!(key = %key, "candidate lookup failed: {:#}", e);
                    continue;
                }
            };
            if target.guid == self.me.guid
                || chosen.contains(&target.guid)
                || exclude.contains(&target.guid)
            {
                continue;
            }
            chosen.insert(target.guid);
            out.push((key, target));
        }
        out
    }

    fn draw_candidate_keys(&self, replication: u32) -> Vec<ChordId> {
        let want = (4 * replication).min(CHORD_MAX_PEERS) as usize;
        let mut rng = self.rng.lock();
        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(want);
        while keys.len() < want {
            let key = ChordId::new(rng.random_range(0..CHORD_MAX_PEERS));
            if seen.insert(key) {
                keys.push(key);
            }
        }
        keys
    }

    async fn backup_one(
        &self,
        filename: &str,
        path: &Path,
        file_id: FileId,
        size: u64,
        replication: u32,
        key: ChordId,
        target: &PeerRef,
    ) -> String {
        let req = BackupRequest {
            file_id,
            size,
            owner: self.me,
            key,
            replication,
        };
        match self.backup_dialogue(path, req, target).await {
            Ok(BackupOutcome::Stored) => {
                self.state.with_sent_mut(filename, |pf| pf.add_key(key));
                format!("Backup Successful on Peer {}", target.guid)
            }
            Ok(BackupOutcome::AlreadyHad) => {
                // the copy exists, the key is as good as a fresh store
                self.state.with_sent_mut(filename, |pf| pf.add_key(key));
                format!("Peer {} already has the file", target.guid)
            }
            Ok(BackupOutcome::NoSpace) => format!("Peer {} has no space", target.guid),
            Ok(BackupOutcome::NoAck) => {
                format!("Failed to receive ACK from Peer {}", target.guid)
            }
            Ok(BackupOutcome::Unexpected) => {
                format!("Received unexpected message from Peer {}", target.guid)
            }
            Err(e) => {
                debug!(peer = %target.guid, "backup failed: {:#}", e);
                format!("Failed to Backup file on Peer {}", target.guid)
            }
        }
    }

    async fn backup_dialogue(
        &self,
        path: &Path,
        req: BackupRequest,
        target: &PeerRef,
    ) -> crate::Result<BackupOutcome> {
        let size = req.size;
        let mut conn = self.dialer.dial(target.addr).await?;
        conn.send(&Frame::new(self.me, Message::Backup(req))).await?;

        let reply = match conn.recv(BACKUP_ACK_TIMEOUT).await {
            Ok(f) => f,
            Err(Error::Timeout(_)) => {
                conn.close().await;
                return Ok(BackupOutcome::Unexpected);
            }
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        let outcome = match reply.message {
            Message::Ack { .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                conn.send_file(&mut file, size).await?;
                match conn.recv(BACKUP_STORED_TIMEOUT).await {
                    Ok(Frame {
                        message: Message::Ack { .. },
                        ..
                    }) => BackupOutcome::Stored,
                    Ok(_) | Err(Error::Timeout(_)) => BackupOutcome::NoAck,
                    Err(e) => {
                        conn.close().await;
                        return Err(e);
                    }
                }
            }
            Message::Nack(NackReason::NoSpace) => BackupOutcome::NoSpace,
            Message::Nack(NackReason::HaveFile) => BackupOutcome::AlreadyHad,
            _ => BackupOutcome::Unexpected,
        };
        conn.close().await;
        Ok(outcome)
    }

    // RESTORE

    pub async fn restore(&self, filename: String) {
        let entry = match self.state.get_sent(&filename) {
            Some(e) => e,
            None => {
                self.notifier
                    .notify(format!("RESTORE {filename}: file was never backed up"));
                return;
            }
        };
        let basename = Path::new(&filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.clone());
        let dest = self.state.dir().join(format!("restored_{basename}"));

        for key in entry.keys.iter().copied() {
            let target = match self.chord.find_successor(key).await {
                Ok(t) => t,
                Err(e) => {
                    debug!(key = %key, "restore lookup failed: {:#}", e);
                    continue;
                }
            };
            if target.guid == self.me.guid {
                continue;
            }
            match self.restore_from(&entry, key, &target, &dest).await {
                Ok(true) => {
                    self.notifier.notify(format!(
                        "File {filename} restored successfully to {}",
                        dest.display()
                    ));
                    return;
                }
                Ok(false) => {
                    debug!(peer = %target.guid, "peer does not hold the file");
                }
                Err(e) => {
                    debug!(peer = %target.guid, "restore attempt failed: {:#}", e);
                }
            }
        }
        self.notifier
            .notify(format!("File {filename} could not be restored"));
    }

    /// One restore attempt. `Ok(false)` means the peer answered but does
    /// not hold the file; the caller moves on to the next key.
    async fn restore_from(
        &self,
        entry: &PeerFile,
        key: ChordId,
        target: &PeerRef,
        dest: &Path,
    ) -> crate::Result<bool> {
        let mut conn = self.dialer.dial(target.addr).await?;
        conn.send(&Frame::new(self.me, Message::Get(entry.file_id)))
            .await?;
        let reply = conn.recv(RESTORE_ACK_TIMEOUT).await;
        match reply {
            Ok(Frame {
                message: Message::Ack { .. },
                ..
            }) => {}
            Ok(Frame {
                message: Message::Nack(_),
                ..
            }) => {
                conn.close().await;
                return Ok(false);
            }
            Ok(_) => {
                conn.close().await;
                return Err(Error::violation("unexpected reply to GET"));
            }
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        }

        // the second GET tells the storer to start streaming
        conn.send(&Frame::new(self.me, Message::Get(entry.file_id)))
            .await?;
        let blob = self.state.blob_path(&entry.file_id);
        let mut file = tokio::fs::File::create(&blob).await?;
        if let Err(e) = conn.recv_file(&mut file, entry.size).await {
            drop(file);
            let _ = tokio::fs::remove_file(&blob).await;
            conn.close().await;
            return Err(e);
        }
        conn.close().await;
        tokio::fs::copy(&blob, dest).await?;

        let _ = self.state.add_stored(PeerFile::stored(
            entry.file_id,
            entry.owner,
            entry.size,
            entry.replication,
            key,
        ));
        self.state.update_occupation();
        self.state.persist();
        Ok(true)
    }

    // DELETE

    pub async fn delete(&self, filename: String) {
        let entry = match self.state.get_sent(&filename) {
            Some(e) => e,
            None => {
                self.notifier
                    .notify(format!("DELETE {filename}: file was never backed up"));
                return;
            }
        };
        self.state
            .with_sent_mut(&filename, |pf| pf.being_deleted = true);

        let mut targets = Vec::new();
        for key in entry.keys.iter().copied() {
            match self.chord.find_successor(key).await {
                Ok(t) if t.guid != self.me.guid => targets.push(t),
                Ok(_) => {}
                Err(e) => debug!(key = %key, "delete lookup failed: {:#}", e),
            }
        }
        let mut seen = HashSet::new();
        targets.retain(|t| seen.insert(t.guid));

        let tasks = targets.iter().map(|target| {
            let pool = self.protocol_pool.clone();
            async move {
                let _permit = pool.acquire_owned().await.ok();
                let ok = self.send_delete(target, entry.file_id).await;
                format!(
                    "Peer {}{}",
                    target.guid,
                    if ok { "" } else { " (unreachable)" }
                )
            }
        });
        let lines = futures::future::join_all(tasks).await;

        self.state.remove_sent(&filename);
        self.notifier.notify(format!(
            "DELETE {filename}: dispatched to [{}]",
            lines.join(", ")
        ));
    }

    /// Fire-and-forget: no acknowledgement is awaited.
    async fn send_delete(&self, target: &PeerRef, file_id: FileId) -> bool {
        match self.dialer.dial(target.addr).await {
            Ok(mut conn) => {
                let sent = conn
                    .send(&Frame::new(self.me, Message::Delete(file_id)))
                    .await
                    .is_ok();
                conn.close().await;
                sent
            }
            Err(e) => {
                debug!(peer = %target.guid, "delete send failed: {:#}", e);
                false
            }
        }
    }

    // RECLAIM

    /// Evicts stored files until occupation fits `target_bytes`, or all of
    /// them when `target_bytes` is zero (which also resets the capacity).
    pub async fn reclaim(&self, target_bytes: u64) {
        for pf in self.state.stored_snapshot() {
            if target_bytes > 0 && self.state.occupation() <= target_bytes {
                break;
            }
            self.evict(&pf).await;
            self.state.update_occupation();
        }
        if target_bytes == 0 {
            self.state.set_capacity(DEFAULT_CAPACITY);
        } else {
            self.state.set_capacity(target_bytes);
        }
        self.notifier.notify(format!(
            "RECLAIM complete: occupying {} of {} bytes",
            self.state.occupation(),
            self.state.capacity()
        ));
    }

    async fn evict(&self, pf: &PeerFile) {
        info!(file = %pf.file_id, owner = %pf.owner.guid, "evicting stored file");
        let _ = tokio::fs::remove_file(self.state.blob_path(&pf.file_id)).await;
        self.state.remove_stored(&pf.file_id);
        let key = match pf.local_key {
            Some(k) => k,
            None => return,
        };
        // best effort: an unreachable owner just misses the notice
        match self.dialer.dial(pf.owner.addr).await {
            Ok(mut conn) => {
                let _ = conn
                    .send(&Frame::new(
                        self.me,
                        Message::Removed {
                            file_id: pf.file_id,
                            key,
                        },
                    ))
                    .await;
                conn.close().await;
            }
            Err(e) => {
                debug!(owner = %pf.owner.guid, "owner unreachable for REMOVED: {:#}", e);
            }
        }
    }

    // REMOVED (receiver side)

    /// A storer evicted one of our copies. Drop its key; when the file
    /// falls below its replication degree and is not being deleted, run a
    /// fresh backup that avoids the peers still holding it.
    pub async fn handle_removed(&self, file_id: FileId, key: ChordId) {
        let name = match self.state.sent_name_by_file_id(&file_id) {
            Some(n) => n,
            None => {
                debug!(file = %file_id, "REMOVED for a file we do not track");
                return;
            }
        };
        let needs_rebackup = self
            .state
            .with_sent_mut(&name, |pf| {
                pf.remove_key(key);
                pf.under_replicated() && !pf.being_deleted
            })
            .unwrap_or(false);
        if !needs_rebackup {
            return;
        }
        let entry = match self.state.get_sent(&name) {
            Some(e) => e,
            None => return,
        };
        let mut exclude = HashSet::new();
        for k in entry.keys.iter().copied() {
            match self.chord.find_successor(k).await {
                Ok(p) => {
                    exclude.insert(p.guid);
                }
                Err(e) => debug!(key = %k, "holder lookup failed: {:#}", e),
            }
        }
        warn!(file = %name, "replication degraded, re-backing up");
        self.backup_excluding(name, entry.replication, exclude).await;
    }
}
