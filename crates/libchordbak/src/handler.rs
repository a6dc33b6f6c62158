// Inbound side of the protocol: one accepted connection, one request,
// handled on its own short-lived task.

use std::sync::Arc;

use libchordbak_core::constants::CONTROL_READ_TIMEOUT;
use libchordbak_core::{FileId, PeerFile, PeerRef};
use tracing::debug;
use wire_protocol::{BackupRequest, Frame, Message, NackReason};

use crate::engine::Engine;
use crate::state::PeerState;
use crate::transport::Connection;

#[derive(Clone)]
pub(crate) struct Handler {
    pub me: PeerRef,
    pub chord: Arc<chord::Chord>,
    pub state: Arc<PeerState>,
    pub engine: Arc<Engine>,
}

impl Handler {
    fn frame(&self, message: Message) -> Frame {
        Frame::new(self.me, message)
    }

    pub async fn serve(&self, mut conn: Connection) -> anyhow::Result<()> {
        let frame = conn.recv(CONTROL_READ_TIMEOUT).await?;
        let sender = frame.sender;
        match frame.message {
            Message::Backup(req) => self.on_backup(conn, req).await,
            Message::Get(file_id) => self.on_get(conn, file_id).await,
            Message::Delete(file_id) => {
                self.on_delete(file_id).await;
                conn.close().await;
                Ok(())
            }
            Message::Removed { file_id, key } => {
                conn.close().await;
                self.engine.handle_removed(file_id, key).await;
                Ok(())
            }
            Message::FindSucc(key) => {
                let reply = match self.chord.find_successor(key).await {
                    Ok(p) => Message::Peer(p),
                    Err(e) => {
                        debug!(key = %key, "lookup failed: {:#}", e);
                        Message::Nack(NackReason::Other("LOOKUP".into()))
                    }
                };
                conn.send(&self.frame(reply)).await?;
                conn.close().await;
                Ok(())
            }
            Message::GetPred => {
                let reply = match self.chord.predecessor() {
                    Some(p) => Message::Peer(p),
                    None => Message::Nack(NackReason::Other("NOPRED".into())),
                };
                conn.send(&self.frame(reply)).await?;
                conn.close().await;
                Ok(())
            }
            Message::Notify => {
                self.chord.handle_notify(sender);
                conn.send(&self.frame(Message::ack())).await?;
                conn.close().await;
                Ok(())
            }
            Message::Ping => {
                conn.send(&self.frame(Message::ack())).await?;
                conn.close().await;
                Ok(())
            }
            other @ (Message::Ack { .. } | Message::Nack(..) | Message::Peer(..)) => {
                conn.close().await;
                anyhow::bail!("unexpected request message {other:?}")
            }
        }
    }

    /// Storer side of BACKUP: refuse duplicates and over-capacity files,
    /// otherwise accept, receive the body, register and confirm.
    async fn on_backup(&self, mut conn: Connection, req: BackupRequest) -> anyhow::Result<()> {
        if self.state.has_stored(&req.file_id) {
            conn.send(&self.frame(Message::Nack(NackReason::HaveFile)))
                .await?;
            conn.close().await;
            return Ok(());
        }
        if !self.state.has_space(req.size) {
            conn.send(&self.frame(Message::Nack(NackReason::NoSpace)))
                .await?;
            conn.close().await;
            return Ok(());
        }
        conn.send(&self.frame(Message::ack())).await?;

        let path = self.state.blob_path(&req.file_id);
        let mut file = tokio::fs::File::create(&path).await?;
        if let Err(e) = conn.recv_file(&mut file, req.size).await {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            conn.close().await;
            return Err(e.into());
        }

        let stored = PeerFile::stored(req.file_id, req.owner, req.size, req.replication, req.key);
        if let Err(e) = self.state.add_stored(stored) {
            // lost a race against a concurrent backup of the same file
            let _ = tokio::fs::remove_file(&path).await;
            conn.close().await;
            return Err(e.into());
        }
        self.state.update_occupation();
        debug!(file = %req.file_id, owner = %req.owner.guid, size = req.size, "stored file");

        conn.send(&self.frame(Message::ack())).await?;
        conn.close().await;
        Ok(())
    }

    /// Storer side of RESTORE: confirm we hold the file, then wait for the
    /// repeated GET that tells us to start streaming.
    async fn on_get(&self, mut conn: Connection, file_id: FileId) -> anyhow::Result<()> {
        let pf = match self.state.get_stored(&file_id) {
            Some(pf) => pf,
            None => {
                conn.send(&self.frame(Message::Nack(NackReason::Other("NOFILE".into()))))
                    .await?;
                conn.close().await;
                return Ok(());
            }
        };
        conn.send(&self.frame(Message::ack())).await?;

        let second = conn.recv(CONTROL_READ_TIMEOUT).await?;
        match second.message {
            Message::Get(id) if id == file_id => {}
            other => {
                conn.close().await;
                anyhow::bail!("expected repeated GET, got {other:?}");
            }
        }
        let mut file = tokio::fs::File::open(self.state.blob_path(&file_id)).await?;
        conn.send_file(&mut file, pf.size).await?;
        conn.close().await;
        Ok(())
    }

    /// DELETE receiver. Idempotent: deleting an unknown file is a no-op.
    async fn on_delete(&self, file_id: FileId) {
        if self.state.remove_stored(&file_id).is_some() {
            let _ = tokio::fs::remove_file(self.state.blob_path(&file_id)).await;
            self.state.update_occupation();
            debug!(file = %file_id, "deleted stored file");
        }
    }
}
