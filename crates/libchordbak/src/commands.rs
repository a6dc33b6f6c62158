use std::str::FromStr;

use chord::RingSnapshot;
use libchordbak_core::ChordId;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

use crate::state::PeerState;

/// A user command, as delivered by whatever local surface fronts the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Backup { file: String, replication: u32 },
    Restore { file: String },
    Delete { file: String },
    Reclaim { bytes: u64 },
    State,
    Chord,
    Lookup { guid: ChordId },
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty command"))?
            .to_ascii_uppercase();
        let mut arg = |name: &str| {
            words
                .next()
                .map(str::to_owned)
                .ok_or_else(|| anyhow::anyhow!("{verb}: missing {name}"))
        };
        let cmd = match verb.as_str() {
            "BACKUP" => Command::Backup {
                file: arg("filename")?,
                replication: arg("replication degree")?.parse()?,
            },
            "RESTORE" => Command::Restore { file: arg("filename")? },
            "DELETE" => Command::Delete { file: arg("filename")? },
            "RECLAIM" => Command::Reclaim {
                bytes: arg("bytes")?.parse()?,
            },
            "STATE" => Command::State,
            "CHORD" => Command::Chord,
            "LOOKUP" => Command::Lookup {
                guid: arg("guid")?.parse()?,
            },
            other => anyhow::bail!("unknown command {other:?}"),
        };
        Ok(cmd)
    }
}

/// Best-effort notification sink. Commands answer asynchronously through
/// this channel; a consumer that went away is logged, never an error.
#[derive(Clone)]
pub struct Notifier {
    tx: UnboundedSender<String>,
}

impl Notifier {
    pub fn new() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (Notifier { tx }, rx)
    }

    pub fn notify(&self, msg: impl Into<String>) {
        let msg = msg.into();
        debug!(notification = %msg);
        if self.tx.send(msg).is_err() {
            warn!("notification sink closed, dropping message");
        }
    }
}

/// Human-readable dump of the full internal state, for the STATE command.
pub fn render_state(state: &PeerState, ring: &RingSnapshot) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "capacity {} bytes, occupied {} bytes",
        state.capacity(),
        state.occupation()
    );

    let sent = state.sent_snapshot();
    let _ = writeln!(out, "sent files: {}", sent.len());
    for (name, pf) in sent {
        let keys: Vec<String> = pf.keys.iter().map(|k| k.to_string()).collect();
        let _ = writeln!(
            out,
            "  {name} id={} size={} replication={} keys=[{}]{}",
            pf.file_id,
            pf.size,
            pf.replication,
            keys.join(","),
            if pf.being_deleted { " (deleting)" } else { "" },
        );
    }

    let stored = state.stored_snapshot();
    let _ = writeln!(out, "stored files: {}", stored.len());
    for pf in stored {
        let _ = writeln!(
            out,
            "  {} owner={} size={} key={}",
            pf.file_id,
            pf.owner,
            pf.size,
            pf.local_key.map(|k| k.to_string()).unwrap_or_default(),
        );
    }

    out.push_str(&ring.to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            "BACKUP notes.txt 3".parse::<Command>().unwrap(),
            Command::Backup {
                file: "notes.txt".into(),
                replication: 3
            }
        );
        assert_eq!(
            "restore notes.txt".parse::<Command>().unwrap(),
            Command::Restore {
                file: "notes.txt".into()
            }
        );
        assert_eq!(
            "RECLAIM 0".parse::<Command>().unwrap(),
            Command::Reclaim { bytes: 0 }
        );
        assert_eq!("STATE".parse::<Command>().unwrap(), Command::State);
        assert_eq!(
            "LOOKUP 17".parse::<Command>().unwrap(),
            Command::Lookup {
                guid: ChordId::new(17)
            }
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!("".parse::<Command>().is_err());
        assert!("BACKUP".parse::<Command>().is_err());
        assert!("BACKUP f".parse::<Command>().is_err());
        assert!("BACKUP f x".parse::<Command>().is_err());
        assert!("FROBNICATE".parse::<Command>().is_err());
    }
}
