use async_trait::async_trait;
use libchordbak_core::{ChordId, PeerRef};

/// The network seam of the overlay. The peer implements this over its
/// transport; tests implement it over an in-memory registry.
///
/// Every method is one request/reply exchange with `target`; errors mean
/// the target was unreachable or answered out of protocol.
#[async_trait]
pub trait ChordRpc: Send + Sync + 'static {
    /// Ask `target` to resolve the successor of `key`.
    async fn find_successor(&self, target: &PeerRef, key: ChordId) -> anyhow::Result<PeerRef>;

    /// Ask `target` for its current predecessor, if it has one.
    async fn get_predecessor(&self, target: &PeerRef) -> anyhow::Result<Option<PeerRef>>;

    /// Tell `target` that `me` believes it is its predecessor.
    async fn notify(&self, target: &PeerRef, me: &PeerRef) -> anyhow::Result<()>;

    /// Liveness probe.
    async fn ping(&self, target: &PeerRef) -> anyhow::Result<()>;
}
