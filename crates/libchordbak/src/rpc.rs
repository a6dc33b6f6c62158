use std::sync::Arc;

use async_trait::async_trait;
use chord::ChordRpc;
use libchordbak_core::constants::CONTROL_READ_TIMEOUT;
use libchordbak_core::{ChordId, PeerRef};
use wire_protocol::{Frame, Message};

use crate::transport::Dialer;

/// Runs the chord control conversations over the transport: one
/// connection, one request, one reply.
pub struct WireRpc {
    me: PeerRef,
    dialer: Arc<dyn Dialer>,
}

impl WireRpc {
    pub fn new(me: PeerRef, dialer: Arc<dyn Dialer>) -> Self {
        WireRpc { me, dialer }
    }

    async fn roundtrip(&self, target: &PeerRef, msg: Message) -> anyhow::Result<Message> {
        let mut conn = self.dialer.dial(target.addr).await?;
        conn.send(&Frame::new(self.me, msg)).await?;
        let reply = conn.recv(CONTROL_READ_TIMEOUT).await?;
        conn.close().await;
        Ok(reply.message)
    }
}

#[async_trait]
impl ChordRpc for WireRpc {
    async fn find_successor(&self, target: &PeerRef, key: ChordId) -> anyhow::Result<PeerRef> {
        match self.roundtrip(target, Message::FindSucc(key)).await? {
            Message::Peer(p) => Ok(p),
            other => anyhow::bail!("unexpected reply to FINDSUCC: {other:?}"),
        }
    }

    async fn get_predecessor(&self, target: &PeerRef) -> anyhow::Result<Option<PeerRef>> {
        match self.roundtrip(target, Message::GetPred).await? {
            Message::Peer(p) => Ok(Some(p)),
            Message::Nack(_) => Ok(None),
            other => anyhow::bail!("unexpected reply to GETPRED: {other:?}"),
        }
    }

    async fn notify(&self, target: &PeerRef, _me: &PeerRef) -> anyhow::Result<()> {
        match self.roundtrip(target, Message::Notify).await? {
            Message::Ack { .. } => Ok(()),
            other => anyhow::bail!("unexpected reply to NOTIFY: {other:?}"),
        }
    }

    async fn ping(&self, target: &PeerRef) -> anyhow::Result<()> {
        match self.roundtrip(target, Message::Ping).await? {
            Message::Ack { .. } => Ok(()),
            other => anyhow::bail!("unexpected reply to PING: {other:?}"),
        }
    }
}
