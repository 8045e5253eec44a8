//! KV connection layer: packets, framing, connections, and the per-connection
//! client that tracks in-flight requests.
//!
//! Only what routing needs is modelled here. Command bodies are opaque bytes
//! owned by the caller; bootstrap (capability negotiation, authentication) is
//! the job of the [`ConnectionProvider`].

mod client;
mod conn;
mod packet;

pub use client::{Disposition, KvClient, ResponseHandler};
pub use conn::{ConnectionProvider, PacketConn, TcpConnectionProvider, TcpPacketConn};
pub use packet::{Command, Magic, Packet, PacketCodec, Status, HEADER_LEN};
