pub mod constants;
pub mod file_id;
pub mod id;
pub mod peer_file;
pub mod peer_ref;
pub mod spawn_utils;

pub use file_id::FileId;
pub use id::ChordId;
pub use peer_file::PeerFile;
pub use peer_ref::PeerRef;
