//! ONC/RPC wire protocol: constants, message buffer, header codec.

pub mod header;
pub mod packet;
pub mod wire;

pub use packet::{pad4, RpcPacket};
