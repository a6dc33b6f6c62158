mod chord;
mod ring;
mod rpc;

pub use chord::Chord;
pub use ring::{FingerEntry, RingSnapshot};
pub use rpc::ChordRpc;
