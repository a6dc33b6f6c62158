use std::collections::VecDeque;

use libchordbak_core::constants::{M, SUCCESSOR_LIST_LEN};
use libchordbak_core::{ChordId, PeerRef};
use serde::Serialize;

pub(crate) const FINGER_COUNT: usize = M as usize;

/// Mutable routing state of one ring member: predecessor, finger table and
/// the successor fallback list. Owned by [`crate::Chord`] behind one lock;
/// everything here is plain bookkeeping with no I/O.
pub(crate) struct RingState {
    pub me: PeerRef,
    pub predecessor: Option<PeerRef>,
    // finger[i] caches the successor of me.guid + 2^i; finger[0] is the
    // canonical successor.
    pub fingers: [Option<PeerRef>; FINGER_COUNT],
    pub successors: VecDeque<PeerRef>,
}

impl RingState {
    pub fn solitary(me: PeerRef) -> Self {
        RingState {
            me,
            predecessor: None,
            fingers: [None; FINGER_COUNT],
            successors: VecDeque::new(),
        }
    }

    pub fn successor(&self) -> PeerRef {
        self.fingers[0].unwrap_or(self.me)
    }

    pub fn is_solitary(&self) -> bool {
        self.successor() == self.me
    }

    /// Installs a new canonical successor, demoting the previous one into
    /// the fallback list.
    pub fn set_successor(&mut self, succ: PeerRef) {
        let old = self.fingers[0].take();
        self.fingers[0] = Some(succ);
        self.successors.retain(|p| *p != succ);
        self.successors.push_front(succ);
        if let Some(old) = old {
            if old != succ && old != self.me && !self.successors.contains(&old) {
                self.successors.push_back(old);
            }
        }
        self.successors.truncate(SUCCESSOR_LIST_LEN);
    }

    /// Drops the current successor (observed dead) and promotes the next
    /// fallback, or falls back to self when the list drains.
    pub fn drop_successor(&mut self) -> PeerRef {
        let dead = self.successor();
        self.successors.retain(|p| *p != dead);
        for f in self.fingers.iter_mut() {
            if *f == Some(dead) {
                *f = None;
            }
        }
        let next = self.successors.front().copied().unwrap_or(self.me);
        self.fingers[0] = Some(next);
        next
    }

    /// The finger with the highest guid in `(me, k)`, scanning high to low.
    pub fn closest_preceding(&self, k: ChordId) -> PeerRef {
        for f in self.fingers.iter().rev().flatten() {
            if f.guid.in_open(self.me.guid, k) {
                return *f;
            }
        }
        self.successor()
    }

    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            me: self.me,
            predecessor: self.predecessor,
            successors: self.successors.iter().copied().collect(),
            fingers: self
                .fingers
                .iter()
                .enumerate()
                .map(|(i, f)| FingerEntry {
                    start: self.me.guid.finger_start(i as u8),
                    peer: *f,
                })
                .collect(),
        }
    }
}

/// Read-only view of the routing state, handed out to the STATE / CHORD
/// commands.
#[derive(Clone, Debug, Serialize)]
pub struct RingSnapshot {
    pub me: PeerRef,
    pub predecessor: Option<PeerRef>,
    pub successors: Vec<PeerRef>,
    pub fingers: Vec<FingerEntry>,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct FingerEntry {
    pub start: ChordId,
    pub peer: Option<PeerRef>,
}

impl std::fmt::Display for RingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "peer {}", self.me)?;
        match &self.predecessor {
            Some(p) => writeln!(f, "predecessor {p}")?,
            None => writeln!(f, "predecessor none")?,
        }
        for (i, s) in self.successors.iter().enumerate() {
            writeln!(f, "successor[{i}] {s}")?;
        }
        for entry in &self.fingers {
            match &entry.peer {
                Some(p) => writeln!(f, "finger start={} -> {p}", entry.start)?,
                None => writeln!(f, "finger start={} -> (unset)", entry.start)?,
            }
        }
        Ok(())
    }
}
