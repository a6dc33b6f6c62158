use std::time::Duration;

/// Width of the ring identifier space in bits. Every peer in a ring must be
/// compiled with the same value.
pub const M: u8 = 8;

/// Size of the identifier space, `2^M`.
pub const CHORD_MAX_PEERS: u32 = 1 << M;

/// Chunk size used when streaming file contents over a connection.
pub const TLS_CHUNK_SIZE: usize = 16 * 1024;

/// Default storage capacity granted to other peers, in bytes.
pub const DEFAULT_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Period of the ring maintenance tick (stabilize / fix_fingers /
/// check_predecessor).
pub const STABILIZE_INTERVAL: Duration = Duration::from_millis(1000);

/// Default number of concurrently executing client commands.
pub const CLIENT_POOL_SIZE: usize = 8;

/// Default number of concurrently executing per-target protocol tasks.
pub const PROTOCOL_POOL_SIZE: usize = 16;

/// How many fallback successors to remember besides the canonical one.
pub const SUCCESSOR_LIST_LEN: usize = 3;

/// How long a backup initiator waits for the storer to accept.
pub const BACKUP_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a backup initiator waits for the storer to confirm the file
/// landed on disk.
pub const BACKUP_STORED_TIMEOUT: Duration = Duration::from_millis(2000);

/// How long a restore waits for the storer to confirm it has the file.
pub const RESTORE_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for establishing an outgoing connection, handshake included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout for reading a single control message where no tighter protocol
/// deadline applies (inbound request handling, chord queries).
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_millis(1000);
