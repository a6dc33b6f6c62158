use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::CHORD_MAX_PEERS;

/// A ring identifier in `[0, 2^M)`.
///
/// Both peer GUIDs and backup routing keys live in this space. All interval
/// checks are modular: the ring wraps at `CHORD_MAX_PEERS`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChordId(u32);

impl ChordId {
    pub fn new(value: u32) -> Self {
        ChordId(value % CHORD_MAX_PEERS)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// The GUID a peer derives from its advertised network address.
    pub fn from_addr(addr: &SocketAddr) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(addr.to_string().as_bytes());
        let digest = hasher.finalize();
        let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        ChordId(word % CHORD_MAX_PEERS)
    }

    /// `self + 2^i` on the ring, the start of finger interval `i`.
    pub fn finger_start(&self, i: u8) -> Self {
        ChordId(self.0.wrapping_add(1 << i) % CHORD_MAX_PEERS)
    }

    /// Is `self` in the open interval `(a, b)` on the ring?
    ///
    /// When `a == b` the interval covers the whole ring except `a` itself.
    pub fn in_open(&self, a: ChordId, b: ChordId) -> bool {
        if a.0 < b.0 {
            a.0 < self.0 && self.0 < b.0
        } else if a.0 > b.0 {
            self.0 > a.0 || self.0 < b.0
        } else {
            self.0 != a.0
        }
    }

    /// Is `self` in the half-open interval `(a, b]` on the ring?
    ///
    /// When `a == b` the interval is the entire ring.
    pub fn in_open_closed(&self, a: ChordId, b: ChordId) -> bool {
        self.0 == b.0 || self.in_open(a, b)
    }
}

impl std::fmt::Display for ChordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ChordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ChordId::new(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u32) -> ChordId {
        ChordId::new(v)
    }

    #[test]
    fn wraps_modulo_ring_size() {
        assert_eq!(id(CHORD_MAX_PEERS + 3), id(3));
    }

    #[test]
    fn open_interval_no_wrap() {
        assert!(id(5).in_open(id(1), id(10)));
        assert!(!id(1).in_open(id(1), id(10)));
        assert!(!id(10).in_open(id(1), id(10)));
    }

    #[test]
    fn open_interval_wrapping() {
        // (250, 5) crosses zero
        assert!(id(255).in_open(id(250), id(5)));
        assert!(id(0).in_open(id(250), id(5)));
        assert!(id(3).in_open(id(250), id(5)));
        assert!(!id(250).in_open(id(250), id(5)));
        assert!(!id(5).in_open(id(250), id(5)));
        assert!(!id(100).in_open(id(250), id(5)));
    }

    #[test]
    fn degenerate_interval_is_everything_but_endpoint() {
        assert!(id(1).in_open(id(7), id(7)));
        assert!(!id(7).in_open(id(7), id(7)));
        // (a, a] is the full ring
        assert!(id(7).in_open_closed(id(7), id(7)));
    }

    #[test]
    fn open_closed_includes_right_endpoint() {
        assert!(id(10).in_open_closed(id(1), id(10)));
        assert!(id(5).in_open_closed(id(250), id(5)));
        assert!(!id(1).in_open_closed(id(1), id(10)));
    }

    #[test]
    fn finger_start_wraps() {
        assert_eq!(id(200).finger_start(7), id((200 + 128) % 256));
        assert_eq!(id(0).finger_start(0), id(1));
    }

    #[test]
    fn guid_is_stable_and_in_range() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let a = ChordId::from_addr(&addr);
        let b = ChordId::from_addr(&addr);
        assert_eq!(a, b);
        assert!(a.get() < CHORD_MAX_PEERS);
    }
}
