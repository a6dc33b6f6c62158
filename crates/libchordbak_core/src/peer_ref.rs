use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::id::ChordId;

/// A reference to a peer: its reachable address plus its ring GUID.
///
/// This is a plain value. Identity is the GUID; two references to the same
/// GUID compare equal even if one of them carries a stale address.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PeerRef {
    pub addr: SocketAddr,
    pub guid: ChordId,
}

impl PeerRef {
    pub fn new(addr: SocketAddr) -> Self {
        PeerRef {
            addr,
            guid: ChordId::from_addr(&addr),
        }
    }

    pub fn with_guid(addr: SocketAddr, guid: ChordId) -> Self {
        PeerRef { addr, guid }
    }
}

impl PartialEq for PeerRef {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

impl Eq for PeerRef {}

impl std::hash::Hash for PeerRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.guid.hash(state)
    }
}

/// Text form is `host:port:guid`, as it travels on the wire.
impl std::fmt::Display for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.guid)
    }
}

impl FromStr for PeerRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, guid) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("peer reference {s:?} has no guid component"))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("bad address in peer reference {s:?}: {e}"))?;
        let guid: ChordId = guid
            .parse()
            .map_err(|e| anyhow::anyhow!("bad guid in peer reference {s:?}: {e}"))?;
        Ok(PeerRef { addr, guid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parse_roundtrip() {
        let r = PeerRef::new("10.0.0.1:9000".parse().unwrap());
        let parsed: PeerRef = r.to_string().parse().unwrap();
        assert_eq!(parsed, r);
        assert_eq!(parsed.addr, r.addr);
    }

    #[test]
    fn equality_is_by_guid() {
        let a = PeerRef::with_guid("10.0.0.1:9000".parse().unwrap(), ChordId::new(42));
        let b = PeerRef::with_guid("10.0.0.2:9001".parse().unwrap(), ChordId::new(42));
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_garbage() {
        assert!("nonsense".parse::<PeerRef>().is_err());
        assert!("127.0.0.1:x:1".parse::<PeerRef>().is_err());
    }
}
