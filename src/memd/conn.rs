//! Packet connections and the provider that dials them.

use super::packet::{Command, Packet, PacketCodec, Status};
use crate::error::{Error, NetworkError, Result, TopologyError};
use crate::types::{AuthMechanism, AuthProvider, RouteEndpoint, TlsSettings};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

/// A bootstrapped connection exchanging framed packets.
///
/// Reads and writes may run concurrently from different tasks.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn write_packet(&self, packet: Packet) -> std::result::Result<(), NetworkError>;

    async fn read_packet(&self) -> std::result::Result<Packet, NetworkError>;

    fn local_addr(&self) -> String;

    fn remote_addr(&self) -> String;

    /// Close the connection. Pending reads fail with `ConnectionClosed`.
    async fn close(&self);
}

/// Dials and bootstraps connections for pipeline workers.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn dial(
        &self,
        endpoint: &RouteEndpoint,
        tls: Option<&TlsSettings>,
        auth: &dyn AuthProvider,
        mechanisms: &[AuthMechanism],
    ) -> Result<Box<dyn PacketConn>>;
}

/// Plain TCP packet connection.
pub struct TcpPacketConn {
    reader: Mutex<FramedRead<OwnedReadHalf, PacketCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, PacketCodec>>,
    local_addr: String,
    remote_addr: String,
}

impl TcpPacketConn {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let local_addr = stream.local_addr()?.to_string();
        let remote_addr = stream.peer_addr()?.to_string();
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(FramedRead::new(read, PacketCodec)),
            writer: Mutex::new(FramedWrite::new(write, PacketCodec)),
            local_addr,
            remote_addr,
        })
    }
}

#[async_trait]
impl PacketConn for TcpPacketConn {
    async fn write_packet(&self, packet: Packet) -> std::result::Result<(), NetworkError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(packet)
            .await
            .map_err(|e| NetworkError::WriteFailed(e.to_string()))
    }

    async fn read_packet(&self) -> std::result::Result<Packet, NetworkError> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Some(result) => result,
            None => Err(NetworkError::ConnectionClosed),
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

/// Dials plain TCP connections and selects the bucket.
///
/// TLS and SASL negotiation are left to providers supplied by the
/// embedding client.
#[derive(Debug, Clone)]
pub struct TcpConnectionProvider {
    bucket_name: String,
    connect_timeout: Duration,
}

impl TcpConnectionProvider {
    pub fn new(bucket_name: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            connect_timeout,
        }
    }

    async fn select_bucket(&self, conn: &TcpPacketConn) -> Result<()> {
        let mut packet = Packet::request(Command::SelectBucket);
        packet.key = self.bucket_name.clone().into_bytes().into();
        conn.write_packet(packet).await?;

        let resp = conn.read_packet().await?;
        match resp.status {
            Status::Success => Ok(()),
            Status::KeyNotFound => Err(TopologyError::BucketNotFound(self.bucket_name.clone()).into()),
            Status::AuthError => Err(Error::AuthenticationFailure),
            status => Err(Error::Status(status)),
        }
    }
}

#[async_trait]
impl ConnectionProvider for TcpConnectionProvider {
    async fn dial(
        &self,
        endpoint: &RouteEndpoint,
        tls: Option<&TlsSettings>,
        _auth: &dyn AuthProvider,
        _mechanisms: &[AuthMechanism],
    ) -> Result<Box<dyn PacketConn>> {
        if tls.is_some() {
            return Err(NetworkError::TlsUnsupported.into());
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&endpoint.address))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: endpoint.address.clone(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: endpoint.address.clone(),
                reason: e.to_string(),
            })?;

        let conn = TcpPacketConn::new(stream)?;
        debug!(address = %endpoint.address, local = %conn.local_addr, "tcp connection established");

        if !self.bucket_name.is_empty() {
            self.select_bucket(&conn).await?;
        }
        Ok(Box::new(conn))
    }
}
