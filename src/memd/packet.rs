//! Binary protocol packet model and header framing.

use crate::error::NetworkError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 24;

/// Largest body accepted from the wire.
pub const MAX_BODY_LEN: usize = 20 * 1024 * 1024 + 1024;

/// Packet direction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Magic {
    #[default]
    Request,
    Response,
    /// A request initiated by the server, such as a topology-change notice.
    ServerRequest,
    ServerResponse,
}

impl Magic {
    pub fn to_u8(self) -> u8 {
        match self {
            Magic::Request => 0x80,
            Magic::Response => 0x81,
            Magic::ServerRequest => 0x82,
            Magic::ServerResponse => 0x83,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x80 => Some(Magic::Request),
            0x81 => Some(Magic::Response),
            0x82 => Some(Magic::ServerRequest),
            0x83 => Some(Magic::ServerResponse),
            _ => None,
        }
    }
}

/// Command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Command {
    #[default]
    Get,
    /// Also the opcode of the server's cluster-map change notification.
    Set,
    Add,
    Replace,
    Delete,
    Noop,
    GetReplica,
    SelectBucket,
    GetClusterConfig,
    RangeScanContinue,
    DcpStreamReq,
    Other(u8),
}

impl Command {
    pub fn to_u8(self) -> u8 {
        match self {
            Command::Get => 0x00,
            Command::Set => 0x01,
            Command::Add => 0x02,
            Command::Replace => 0x03,
            Command::Delete => 0x04,
            Command::Noop => 0x0a,
            Command::DcpStreamReq => 0x53,
            Command::GetReplica => 0x83,
            Command::SelectBucket => 0x89,
            Command::GetClusterConfig => 0xb5,
            Command::RangeScanContinue => 0xdb,
            Command::Other(op) => op,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Command::Get,
            0x01 => Command::Set,
            0x02 => Command::Add,
            0x03 => Command::Replace,
            0x04 => Command::Delete,
            0x0a => Command::Noop,
            0x53 => Command::DcpStreamReq,
            0x83 => Command::GetReplica,
            0x89 => Command::SelectBucket,
            0xb5 => Command::GetClusterConfig,
            0xdb => Command::RangeScanContinue,
            op => Command::Other(op),
        }
    }
}

/// Response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Success,
    KeyNotFound,
    KeyExists,
    TooBig,
    InvalidArgs,
    NotStored,
    NotMyVbucket,
    /// The node has no bucket data for this connection, only topology.
    ConfigOnly,
    Locked,
    AuthError,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TmpFail,
    SyncWriteInProgress,
    SyncWriteReCommitInProgress,
    Other(u16),
}

impl Status {
    pub fn to_u16(self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::TooBig => 0x03,
            Status::InvalidArgs => 0x04,
            Status::NotStored => 0x05,
            Status::NotMyVbucket => 0x07,
            Status::Locked => 0x09,
            Status::ConfigOnly => 0x0d,
            Status::AuthError => 0x20,
            Status::UnknownCommand => 0x81,
            Status::OutOfMemory => 0x82,
            Status::NotSupported => 0x83,
            Status::InternalError => 0x84,
            Status::Busy => 0x85,
            Status::TmpFail => 0x86,
            Status::SyncWriteInProgress => 0xa2,
            Status::SyncWriteReCommitInProgress => 0xa4,
            Status::Other(code) => code,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::TooBig,
            0x04 => Status::InvalidArgs,
            0x05 => Status::NotStored,
            0x07 => Status::NotMyVbucket,
            0x09 => Status::Locked,
            0x0d => Status::ConfigOnly,
            0x20 => Status::AuthError,
            0x81 => Status::UnknownCommand,
            0x82 => Status::OutOfMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::InternalError,
            0x85 => Status::Busy,
            0x86 => Status::TmpFail,
            0xa2 => Status::SyncWriteInProgress,
            0xa4 => Status::SyncWriteReCommitInProgress,
            code => Status::Other(code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists"),
            Status::TooBig => write!(f, "value too big"),
            Status::InvalidArgs => write!(f, "invalid arguments"),
            Status::NotStored => write!(f, "not stored"),
            Status::NotMyVbucket => write!(f, "not my vbucket"),
            Status::ConfigOnly => write!(f, "config only"),
            Status::Locked => write!(f, "locked"),
            Status::AuthError => write!(f, "authentication error"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "out of memory"),
            Status::NotSupported => write!(f, "not supported"),
            Status::InternalError => write!(f, "internal server error"),
            Status::Busy => write!(f, "busy"),
            Status::TmpFail => write!(f, "temporary failure"),
            Status::SyncWriteInProgress => write!(f, "sync write in progress"),
            Status::SyncWriteReCommitInProgress => write!(f, "sync write re-commit in progress"),
            Status::Other(code) => write!(f, "status 0x{:04x}", code),
        }
    }
}

/// One protocol packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub magic: Magic,
    pub command: Command,
    pub datatype: u8,
    /// Vbucket id for requests.
    pub vbucket: u16,
    /// Status for responses.
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub key: Bytes,
    pub extras: Bytes,
    pub value: Bytes,
}

impl Packet {
    /// Create a request packet.
    pub fn request(command: Command) -> Self {
        Self {
            magic: Magic::Request,
            command,
            ..Default::default()
        }
    }

    /// Create a response to `req` with the given status.
    pub fn response_to(req: &Packet, status: Status) -> Self {
        Self {
            magic: Magic::Response,
            command: req.command,
            status,
            opaque: req.opaque,
            ..Default::default()
        }
    }

    /// Returns true if this is the server's cluster-map change notification.
    pub fn is_cluster_map_notification(&self) -> bool {
        self.magic == Magic::ServerRequest && self.command == Command::Set
    }

    /// Decodes the `(epoch, revision)` pair of a cluster-map change notification.
    pub fn cluster_map_version(&self) -> Option<(i64, i64)> {
        if self.extras.len() < 16 {
            return None;
        }
        let mut extras = self.extras.clone();
        let epoch = extras.get_u64() as i64;
        let rev = extras.get_u64() as i64;
        Some((epoch, rev))
    }
}

/// Header framing codec for [`Packet`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, NetworkError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(NetworkError::MalformedPacket(format!(
                "body length {} exceeds limit",
                body_len
            )));
        }
        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        let magic_byte = src[0];
        let magic = Magic::from_u8(magic_byte).ok_or_else(|| {
            NetworkError::MalformedPacket(format!("unknown magic 0x{:02x}", magic_byte))
        })?;
        let mut header = src.split_to(HEADER_LEN);
        header.advance(1);
        let command = Command::from_u8(header.get_u8());
        let key_len = header.get_u16() as usize;
        let extras_len = header.get_u8() as usize;
        let datatype = header.get_u8();
        let vb_or_status = header.get_u16();
        let _body_len = header.get_u32();
        let opaque = header.get_u32();
        let cas = header.get_u64();

        if key_len + extras_len > body_len {
            return Err(NetworkError::MalformedPacket(
                "key and extras exceed body length".to_string(),
            ));
        }

        let mut body = src.split_to(body_len);
        let extras = body.split_to(extras_len).freeze();
        let key = body.split_to(key_len).freeze();
        let value = body.freeze();

        let (vbucket, status) = match magic {
            Magic::Request | Magic::ServerRequest => (vb_or_status, Status::Success),
            Magic::Response | Magic::ServerResponse => (0, Status::from_u16(vb_or_status)),
        };

        Ok(Some(Packet {
            magic,
            command,
            datatype,
            vbucket,
            status,
            opaque,
            cas,
            key,
            extras,
            value,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = NetworkError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), NetworkError> {
        let body_len = packet.extras.len() + packet.key.len() + packet.value.len();
        if packet.key.len() > u16::MAX as usize || packet.extras.len() > u8::MAX as usize {
            return Err(NetworkError::MalformedPacket(
                "key or extras too long".to_string(),
            ));
        }

        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(packet.magic.to_u8());
        dst.put_u8(packet.command.to_u8());
        dst.put_u16(packet.key.len() as u16);
        dst.put_u8(packet.extras.len() as u8);
        dst.put_u8(packet.datatype);
        match packet.magic {
            Magic::Request | Magic::ServerRequest => dst.put_u16(packet.vbucket),
            Magic::Response | Magic::ServerResponse => dst.put_u16(packet.status.to_u16()),
        }
        dst.put_u32(body_len as u32);
        dst.put_u32(packet.opaque);
        dst.put_u64(packet.cas);
        dst.put_slice(&packet.extras);
        dst.put_slice(&packet.key);
        dst.put_slice(&packet.value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_full_body() {
        let mut packet = Packet::request(Command::Get);
        packet.key = Bytes::from_static(b"foo");
        packet.vbucket = 517;
        packet.opaque = 9;

        let mut buf = BytesMut::new();
        PacketCodec.encode(packet.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 3);

        let mut partial = buf.split_to(HEADER_LEN + 1);
        assert!(PacketCodec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        let decoded = PacketCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_response_carries_status() {
        let req = Packet::request(Command::Get);
        let mut resp = Packet::response_to(&req, Status::NotMyVbucket);
        resp.value = Bytes::from_static(b"{}");

        let mut buf = BytesMut::new();
        PacketCodec.encode(resp, &mut buf).unwrap();
        let decoded = PacketCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.status, Status::NotMyVbucket);
        assert_eq!(decoded.value, Bytes::from_static(b"{}"));
    }

    #[test]
    fn test_rejects_unknown_magic() {
        let mut buf = BytesMut::from(&[0u8; HEADER_LEN][..]);
        assert!(PacketCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_cluster_map_notification_version() {
        let mut extras = BytesMut::new();
        extras.put_u64(3);
        extras.put_u64(1042);
        let packet = Packet {
            magic: Magic::ServerRequest,
            command: Command::Set,
            extras: extras.freeze(),
            ..Default::default()
        };
        assert!(packet.is_cluster_map_notification());
        assert_eq!(packet.cluster_map_version(), Some((3, 1042)));
    }

    #[test]
    fn test_status_codes() {
        for code in [0x00u16, 0x07, 0x0d, 0x86, 0xa2, 0xa4, 0x1234] {
            assert_eq!(Status::from_u16(code).to_u16(), code);
        }
        assert_eq!(Command::from_u8(0xb5), Command::GetClusterConfig);
    }
}
