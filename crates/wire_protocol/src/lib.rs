// Chordbak peer protocol: parsing and serialization of the framed messages
// peers exchange over their authenticated streams.
//
// Frame layout:
//   type(u8) | addr_len(u16 BE) | addr ("host:port") | guid(u32 BE)
//   | body_len(u32 BE) | body (UTF-8)
//
// The sender reference travels in every frame so receivers can answer or
// route without any out-of-band registry. Bodies are `::`-separated fields,
// except REMOVED which uses a single `:`.

use std::str::FromStr;

use byteorder::{BE, ByteOrder};
use libchordbak_core::{ChordId, FileId, PeerRef};

type MsgId = u8;

const MSGID_BACKUP: MsgId = 0;
const MSGID_GET: MsgId = 1;
const MSGID_DELETE: MsgId = 2;
const MSGID_REMOVED: MsgId = 3;
const MSGID_ACK: MsgId = 4;
const MSGID_NACK: MsgId = 5;
const MSGID_FINDSUCC: MsgId = 6;
const MSGID_GETPRED: MsgId = 7;
const MSGID_NOTIFY: MsgId = 8;
const MSGID_PEER: MsgId = 9;
const MSGID_PING: MsgId = 10;

const TYPE_LEN: usize = 1;
const ADDR_LEN_LEN: usize = 2;
const GUID_LEN: usize = 4;
const BODY_LEN_LEN: usize = 4;

// "host:port" never legitimately approaches this; anything bigger is a
// corrupt or hostile frame.
const MAX_ADDR_LEN: usize = 256;
pub const MAX_BODY_LEN: usize = 8 * 1024;

#[derive(Clone, Copy)]
pub struct MsgIdDebug(MsgId);

impl MsgIdDebug {
    const fn name(&self) -> Option<&'static str> {
        let n = match self.0 {
            MSGID_BACKUP => "backup",
            MSGID_GET => "get",
            MSGID_DELETE => "delete",
            MSGID_REMOVED => "removed",
            MSGID_ACK => "ack",
            MSGID_NACK => "nack",
            MSGID_FINDSUCC => "findsucc",
            MSGID_GETPRED => "getpred",
            MSGID_NOTIFY => "notify",
            MSGID_PEER => "peer",
            MSGID_PING => "ping",
            _ => return None,
        };
        Some(n)
    }
}

impl core::fmt::Debug for MsgIdDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "<unknown msg_id {}>", self.0),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageDeserializeError {
    #[error("not enough data: expected at least {0} more bytes")]
    NotEnoughData(usize),
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error("sender address length {0} exceeds {MAX_ADDR_LEN}")]
    AddrTooLong(usize),
    #[error("body length {0} exceeds {MAX_BODY_LEN}")]
    BodyTooLong(usize),
    #[error("frame is not valid UTF-8")]
    BadUtf8,
    #[error("bad sender address {0:?}")]
    BadSenderAddr(String),
    #[error("message {0:?}: missing field {1}")]
    MissingField(MsgIdDebug, &'static str),
    #[error("message {0:?}: bad field {1}: {2}")]
    BadField(MsgIdDebug, &'static str, String),
}

use MessageDeserializeError as E;

/// Why a storer refused a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NackReason {
    /// The storer cannot fit the file within its capacity.
    NoSpace,
    /// The storer already holds this file id.
    HaveFile,
    Other(String),
}

impl NackReason {
    fn as_str(&self) -> &str {
        match self {
            NackReason::NoSpace => "NOSPACE",
            NackReason::HaveFile => "HAVEFILE",
            NackReason::Other(s) => s,
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "NOSPACE" => NackReason::NoSpace,
            "HAVEFILE" => NackReason::HaveFile,
            other => NackReason::Other(other.to_owned()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupRequest {
    pub file_id: FileId,
    pub size: u64,
    pub owner: PeerRef,
    pub key: ChordId,
    pub replication: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Backup(BackupRequest),
    Get(FileId),
    Delete(FileId),
    /// A storer evicted `file_id`, which it held under `key`.
    Removed { file_id: FileId, key: ChordId },
    Ack { status: Option<String> },
    Nack(NackReason),
    FindSucc(ChordId),
    GetPred,
    Notify,
    Peer(PeerRef),
    Ping,
}

impl Message {
    fn msg_id(&self) -> MsgId {
        match self {
            Message::Backup(..) => MSGID_BACKUP,
            Message::Get(..) => MSGID_GET,
            Message::Delete(..) => MSGID_DELETE,
            Message::Removed { .. } => MSGID_REMOVED,
            Message::Ack { .. } => MSGID_ACK,
            Message::Nack(..) => MSGID_NACK,
            Message::FindSucc(..) => MSGID_FINDSUCC,
            Message::GetPred => MSGID_GETPRED,
            Message::Notify => MSGID_NOTIFY,
            Message::Peer(..) => MSGID_PEER,
            Message::Ping => MSGID_PING,
        }
    }

    fn body(&self) -> String {
        match self {
            Message::Backup(b) => format!(
                "{}::{}::{}::{}::{}",
                b.file_id, b.size, b.owner, b.key, b.replication
            ),
            Message::Get(id) | Message::Delete(id) => id.to_string(),
            Message::Removed { file_id, key } => format!("{file_id}:{key}"),
            Message::Ack { status } => status.clone().unwrap_or_default(),
            Message::Nack(reason) => reason.as_str().to_owned(),
            Message::FindSucc(key) => key.to_string(),
            Message::Peer(r) => r.to_string(),
            Message::GetPred | Message::Notify | Message::Ping => String::new(),
        }
    }

    pub fn ack() -> Message {
        Message::Ack { status: None }
    }
}

/// One message plus the reference of the peer that sent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub sender: PeerRef,
    pub message: Message,
}

impl Frame {
    pub fn new(sender: PeerRef, message: Message) -> Self {
        Frame { sender, message }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        let addr = self.sender.addr.to_string();
        let body = self.message.body();
        buf.push(self.message.msg_id());
        buf.extend_from_slice(&(addr.len() as u16).to_be_bytes());
        buf.extend_from_slice(addr.as_bytes());
        buf.extend_from_slice(&self.sender.guid.get().to_be_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body.as_bytes());
    }

    /// Parses one frame from the front of `buf`. Returns the frame and the
    /// number of bytes consumed; `NotEnoughData` means read more and retry.
    pub fn deserialize(buf: &[u8]) -> Result<(Frame, usize), MessageDeserializeError> {
        let header = TYPE_LEN + ADDR_LEN_LEN;
        if buf.len() < header {
            return Err(E::NotEnoughData(header - buf.len()));
        }
        let msg_id = buf[0];
        let addr_len = BE::read_u16(&buf[TYPE_LEN..]) as usize;
        if addr_len > MAX_ADDR_LEN {
            return Err(E::AddrTooLong(addr_len));
        }
        let body_len_off = header + addr_len + GUID_LEN;
        if buf.len() < body_len_off + BODY_LEN_LEN {
            return Err(E::NotEnoughData(body_len_off + BODY_LEN_LEN - buf.len()));
        }
        let body_len = BE::read_u32(&buf[body_len_off..]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(E::BodyTooLong(body_len));
        }
        let total = body_len_off + BODY_LEN_LEN + body_len;
        if buf.len() < total {
            return Err(E::NotEnoughData(total - buf.len()));
        }

        let addr = std::str::from_utf8(&buf[header..header + addr_len]).map_err(|_| E::BadUtf8)?;
        let addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|_| E::BadSenderAddr(addr.to_owned()))?;
        let guid = ChordId::new(BE::read_u32(&buf[header + addr_len..]));
        let sender = PeerRef::with_guid(addr, guid);

        let body = std::str::from_utf8(&buf[body_len_off + BODY_LEN_LEN..total])
            .map_err(|_| E::BadUtf8)?;
        let message = parse_body(msg_id, body)?;
        Ok((Frame { sender, message }, total))
    }
}

fn field<'a, T: FromStr>(
    msg_id: MsgId,
    it: &mut impl Iterator<Item = &'a str>,
    name: &'static str,
) -> Result<T, MessageDeserializeError>
where
    T::Err: std::fmt::Display,
{
    let raw = it
        .next()
        .ok_or(E::MissingField(MsgIdDebug(msg_id), name))?;
    raw.parse()
        .map_err(|e: T::Err| E::BadField(MsgIdDebug(msg_id), name, e.to_string()))
}

fn parse_body(msg_id: MsgId, body: &str) -> Result<Message, MessageDeserializeError> {
    let m = match msg_id {
        MSGID_BACKUP => {
            // ownerRef uses single `:` separators internally, so splitting
            // on `::` keeps it whole.
            let mut it = body.split("::");
            Message::Backup(BackupRequest {
                file_id: field(msg_id, &mut it, "fileId")?,
                size: field(msg_id, &mut it, "size")?,
                owner: field(msg_id, &mut it, "ownerRef")?,
                key: field(msg_id, &mut it, "key")?,
                replication: field(msg_id, &mut it, "replicationDegree")?,
            })
        }
        MSGID_GET => Message::Get(parse_file_id(msg_id, body)?),
        MSGID_DELETE => Message::Delete(parse_file_id(msg_id, body)?),
        MSGID_REMOVED => {
            let (file_id, key) = body
                .rsplit_once(':')
                .ok_or(E::MissingField(MsgIdDebug(msg_id), "key"))?;
            Message::Removed {
                file_id: parse_file_id(msg_id, file_id)?,
                key: key
                    .parse()
                    .map_err(|e: std::num::ParseIntError| {
                        E::BadField(MsgIdDebug(msg_id), "key", e.to_string())
                    })?,
            }
        }
        MSGID_ACK => Message::Ack {
            status: (!body.is_empty()).then(|| body.to_owned()),
        },
        MSGID_NACK => Message::Nack(NackReason::parse(body)),
        MSGID_FINDSUCC => {
            let mut it = std::iter::once(body);
            Message::FindSucc(field(msg_id, &mut it, "key")?)
        }
        MSGID_GETPRED => Message::GetPred,
        MSGID_NOTIFY => Message::Notify,
        MSGID_PEER => {
            let mut it = std::iter::once(body);
            Message::Peer(field(msg_id, &mut it, "peerRef")?)
        }
        MSGID_PING => Message::Ping,
        other => return Err(E::UnsupportedMessageId(other)),
    };
    Ok(m)
}

fn parse_file_id(msg_id: MsgId, s: &str) -> Result<FileId, MessageDeserializeError> {
    s.parse()
        .map_err(|e: anyhow::Error| E::BadField(MsgIdDebug(msg_id), "fileId", format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> PeerRef {
        PeerRef::new("127.0.0.1:4000".parse().unwrap())
    }

    fn roundtrip(message: Message) -> Frame {
        let frame = Frame::new(sender(), message);
        let mut buf = Vec::new();
        frame.serialize(&mut buf);
        let (parsed, consumed) = Frame::deserialize(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed, frame);
        parsed
    }

    #[test]
    fn roundtrip_backup() {
        roundtrip(Message::Backup(BackupRequest {
            file_id: FileId([0x5a; 32]),
            size: 1024,
            owner: PeerRef::new("10.1.2.3:9999".parse().unwrap()),
            key: ChordId::new(77),
            replication: 3,
        }));
    }

    #[test]
    fn roundtrip_simple_messages() {
        roundtrip(Message::Get(FileId([1; 32])));
        roundtrip(Message::Delete(FileId([2; 32])));
        roundtrip(Message::Removed {
            file_id: FileId([3; 32]),
            key: ChordId::new(200),
        });
        roundtrip(Message::Ack { status: None });
        roundtrip(Message::Ack {
            status: Some("STORED".into()),
        });
        roundtrip(Message::Nack(NackReason::NoSpace));
        roundtrip(Message::Nack(NackReason::HaveFile));
        roundtrip(Message::Nack(NackReason::Other("WEIRD".into())));
        roundtrip(Message::FindSucc(ChordId::new(12)));
        roundtrip(Message::GetPred);
        roundtrip(Message::Notify);
        roundtrip(Message::Peer(PeerRef::new("192.168.0.7:81".parse().unwrap())));
        roundtrip(Message::Ping);
    }

    #[test]
    fn truncation_asks_for_more() {
        let frame = Frame::new(sender(), Message::Ping);
        let mut buf = Vec::new();
        frame.serialize(&mut buf);
        for cut in 0..buf.len() {
            match Frame::deserialize(&buf[..cut]) {
                Err(MessageDeserializeError::NotEnoughData(n)) => {
                    assert!(n > 0 && cut + n <= buf.len())
                }
                other => panic!("expected NotEnoughData at cut {cut}, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_message_id() {
        let frame = Frame::new(sender(), Message::Ping);
        let mut buf = Vec::new();
        frame.serialize(&mut buf);
        buf[0] = 42;
        assert!(matches!(
            Frame::deserialize(&buf),
            Err(MessageDeserializeError::UnsupportedMessageId(42))
        ));
    }

    #[test]
    fn consumes_exactly_one_frame() {
        let mut buf = Vec::new();
        Frame::new(sender(), Message::Ping).serialize(&mut buf);
        let first_len = buf.len();
        Frame::new(sender(), Message::GetPred).serialize(&mut buf);

        let (f1, n1) = Frame::deserialize(&buf).unwrap();
        assert_eq!(f1.message, Message::Ping);
        assert_eq!(n1, first_len);
        let (f2, n2) = Frame::deserialize(&buf[n1..]).unwrap();
        assert_eq!(f2.message, Message::GetPred);
        assert_eq!(n1 + n2, buf.len());
    }

    #[test]
    fn rejects_oversized_body() {
        let frame = Frame::new(sender(), Message::Ping);
        let mut buf = Vec::new();
        frame.serialize(&mut buf);
        let body_len_off = buf.len() - 4;
        buf[body_len_off..].copy_from_slice(&(MAX_BODY_LEN as u32 + 1).to_be_bytes());
        assert!(matches!(
            Frame::deserialize(&buf),
            Err(MessageDeserializeError::BodyTooLong(_))
        ));
    }

    #[test]
    fn backup_body_grammar() {
        let owner = PeerRef::new("10.1.2.3:9999".parse().unwrap());
        let frame = Frame::new(
            sender(),
            Message::Backup(BackupRequest {
                file_id: FileId([0xaa; 32]),
                size: 77,
                owner,
                key: ChordId::new(5),
                replication: 2,
            }),
        );
        let mut buf = Vec::new();
        frame.serialize(&mut buf);
        let expected = format!("{}::77::{}::5::2", FileId([0xaa; 32]), owner);
        let tail = &buf[buf.len() - expected.len()..];
        assert_eq!(std::str::from_utf8(tail).unwrap(), expected);
    }

    #[test]
    fn removed_uses_single_colon() {
        let frame = Frame::new(
            sender(),
            Message::Removed {
                file_id: FileId([9; 32]),
                key: ChordId::new(31),
            },
        );
        let mut buf = Vec::new();
        frame.serialize(&mut buf);
        let expected = format!("{}:31", FileId([9; 32]));
        let tail = &buf[buf.len() - expected.len()..];
        assert_eq!(std::str::from_utf8(tail).unwrap(), expected);
    }
}
