//! In-memory cluster, connections and config streams.

use crate::error::{NetworkError, Result};
use crate::memd::{Command, ConnectionProvider, Magic, Packet, PacketConn, Status};
use crate::polling::ConfigStreamer;
use crate::types::{AuthMechanism, AuthProvider, Credentials, RouteEndpoint, TlsSettings};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A request as seen by a mock node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub address: String,
    pub command: Command,
    pub key: Bytes,
    pub vbucket: u16,
    pub extras: Bytes,
}

/// A connection attempt seen by the mock provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRecord {
    pub address: String,
    pub tls: bool,
    pub username: String,
}

struct ConnHandle {
    address: String,
    tx: mpsc::UnboundedSender<Packet>,
    closed: CancellationToken,
}

/// A cluster of mock KV nodes sharing one config.
///
/// Every node answers `GetClusterConfig` with the current config and any
/// other command with success, echoing its own address as the value.
/// Failures are scripted per node.
pub struct MockCluster {
    config: Mutex<Value>,
    down: Mutex<HashSet<String>>,
    scripted: Mutex<HashMap<String, VecDeque<Status>>>,
    cccp_status: Mutex<Option<Status>>,
    enforce_ownership: AtomicBool,
    response_delay: Mutex<Duration>,
    conns: Mutex<Vec<Arc<ConnHandle>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    dials: Mutex<Vec<DialRecord>>,
    next_port: AtomicU64,
}

impl MockCluster {
    pub fn new(config: Value) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            down: Mutex::new(HashSet::new()),
            scripted: Mutex::new(HashMap::new()),
            cccp_status: Mutex::new(None),
            enforce_ownership: AtomicBool::new(false),
            response_delay: Mutex::new(Duration::ZERO),
            conns: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            dials: Mutex::new(Vec::new()),
            next_port: AtomicU64::new(50000),
        })
    }

    pub fn provider(self: &Arc<Self>) -> Arc<MockConnectionProvider> {
        Arc::new(MockConnectionProvider {
            cluster: self.clone(),
        })
    }

    pub fn set_config(&self, config: Value) {
        *self.config.lock() = config;
    }

    pub fn config_bytes(&self) -> Bytes {
        Bytes::from(self.config.lock().to_string())
    }

    /// Answer every `GetClusterConfig` with `status` instead of the config.
    pub fn set_cccp_status(&self, status: Option<Status>) {
        *self.cccp_status.lock() = status;
    }

    /// Fail the next request to `address` with `status`. Not-my-vbucket
    /// replies carry the current config.
    pub fn push_status(&self, address: &str, status: Status) {
        self.scripted
            .lock()
            .entry(address.to_string())
            .or_default()
            .push_back(status);
    }

    /// Reply not-my-vbucket when a node is not the active owner of the
    /// request's vbucket in the current config.
    pub fn enforce_ownership(&self, enabled: bool) {
        self.enforce_ownership.store(enabled, Ordering::Release);
    }

    pub fn set_response_delay(&self, delay: Duration) {
        *self.response_delay.lock() = delay;
    }

    /// Refuse new connections to `address` and drop existing ones.
    pub fn set_node_down(&self, address: &str, down: bool) {
        if down {
            self.down.lock().insert(address.to_string());
            self.drop_connections(address);
        } else {
            self.down.lock().remove(address);
        }
    }

    pub fn drop_connections(&self, address: &str) {
        for conn in self.conns.lock().iter() {
            if conn.address == address {
                conn.closed.cancel();
            }
        }
    }

    /// Send a cluster-map change notification on every open connection.
    pub fn notify_cluster_map_change(&self, epoch: i64, rev: i64) {
        let mut extras = BytesMut::with_capacity(16);
        extras.put_u64(epoch as u64);
        extras.put_u64(rev as u64);
        let packet = Packet {
            magic: Magic::ServerRequest,
            command: Command::Set,
            extras: extras.freeze(),
            ..Default::default()
        };
        for conn in self.conns.lock().iter() {
            if !conn.closed.is_cancelled() {
                let _ = conn.tx.send(packet.clone());
            }
        }
    }

    pub fn open_connections(&self, address: &str) -> usize {
        self.conns
            .lock()
            .iter()
            .filter(|c| c.address == address && !c.closed.is_cancelled())
            .count()
    }

    pub fn dials(&self) -> Vec<DialRecord> {
        self.dials.lock().clone()
    }

    pub fn dial_count(&self, address: &str) -> usize {
        self.dials.lock().iter().filter(|d| d.address == address).count()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, command: Command) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.command == command)
            .cloned()
            .collect()
    }

    fn config_version(&self) -> (i64, i64) {
        let config = self.config.lock();
        (
            config["revEpoch"].as_i64().unwrap_or(0),
            config["rev"].as_i64().unwrap_or(0),
        )
    }

    fn vbucket_owner(&self, vbucket: u16) -> Option<String> {
        let config = self.config.lock();
        let map = &config["vBucketServerMap"];
        let idx = map["vBucketMap"][vbucket as usize][0].as_i64()?;
        map["serverList"][idx as usize].as_str().map(str::to_string)
    }

    fn open_conn(self: &Arc<Self>, address: &str) -> MockPacketConn {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnHandle {
            address: address.to_string(),
            tx,
            closed: CancellationToken::new(),
        });
        let mut conns = self.conns.lock();
        conns.retain(|c| !c.closed.is_cancelled());
        conns.push(handle.clone());
        MockPacketConn {
            cluster: self.clone(),
            handle,
            rx: tokio::sync::Mutex::new(rx),
            local: format!(
                "127.0.0.1:{}",
                self.next_port.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }

    fn respond(&self, address: &str, packet: &Packet) -> Option<Packet> {
        self.requests.lock().push(RecordedRequest {
            address: address.to_string(),
            command: packet.command,
            key: packet.key.clone(),
            vbucket: packet.vbucket,
            extras: packet.extras.clone(),
        });

        if packet.command == Command::GetClusterConfig {
            if let Some(status) = *self.cccp_status.lock() {
                return Some(Packet::response_to(packet, status));
            }
            let mut resp = Packet::response_to(packet, Status::Success);
            if packet.extras.len() >= 16 {
                let mut extras = packet.extras.clone();
                let known = (extras.get_u64() as i64, extras.get_u64() as i64);
                if self.config_version() <= known {
                    return Some(resp);
                }
            }
            resp.value = self.config_bytes();
            return Some(resp);
        }

        let scripted = self
            .scripted
            .lock()
            .get_mut(address)
            .and_then(|queue| queue.pop_front());
        if let Some(status) = scripted {
            let mut resp = Packet::response_to(packet, status);
            if status == Status::NotMyVbucket {
                resp.value = self.config_bytes();
            }
            return Some(resp);
        }

        if self.enforce_ownership.load(Ordering::Acquire) && packet.command != Command::GetReplica {
            if let Some(owner) = self.vbucket_owner(packet.vbucket) {
                if owner != address {
                    let mut resp = Packet::response_to(packet, Status::NotMyVbucket);
                    resp.value = self.config_bytes();
                    return Some(resp);
                }
            }
        }

        let mut resp = Packet::response_to(packet, Status::Success);
        resp.key = packet.key.clone();
        resp.value = Bytes::from(address.to_string());
        Some(resp)
    }
}

/// One connection to a [`MockCluster`] node.
pub struct MockPacketConn {
    cluster: Arc<MockCluster>,
    handle: Arc<ConnHandle>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    local: String,
}

#[async_trait]
impl PacketConn for MockPacketConn {
    async fn write_packet(&self, packet: Packet) -> std::result::Result<(), NetworkError> {
        if self.handle.closed.is_cancelled() {
            return Err(NetworkError::ConnectionClosed);
        }
        if let Some(resp) = self.cluster.respond(&self.handle.address, &packet) {
            let delay = *self.cluster.response_delay.lock();
            if delay.is_zero() {
                let _ = self.handle.tx.send(resp);
            } else {
                let tx = self.handle.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(resp);
                });
            }
        }
        Ok(())
    }

    async fn read_packet(&self) -> std::result::Result<Packet, NetworkError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.handle.closed.cancelled() => Err(NetworkError::ConnectionClosed),
            packet = rx.recv() => packet.ok_or(NetworkError::ConnectionClosed),
        }
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn remote_addr(&self) -> String {
        self.handle.address.clone()
    }

    async fn close(&self) {
        self.handle.closed.cancel();
    }
}

/// Dials [`MockPacketConn`]s, recording every attempt.
pub struct MockConnectionProvider {
    cluster: Arc<MockCluster>,
}

#[async_trait]
impl ConnectionProvider for MockConnectionProvider {
    async fn dial(
        &self,
        endpoint: &RouteEndpoint,
        tls: Option<&TlsSettings>,
        auth: &dyn AuthProvider,
        _mechanisms: &[AuthMechanism],
    ) -> Result<Box<dyn PacketConn>> {
        self.cluster.dials.lock().push(DialRecord {
            address: endpoint.address.clone(),
            tls: tls.is_some(),
            username: auth.credentials(&endpoint.address).username,
        });
        if self.cluster.down.lock().contains(&endpoint.address) {
            return Err(NetworkError::ConnectionFailed {
                addr: endpoint.address.clone(),
                reason: "node down".to_string(),
            }
            .into());
        }
        Ok(Box::new(self.cluster.open_conn(&endpoint.address)))
    }
}

enum StreamScript {
    Status(u16),
    Chunks(Vec<Bytes>),
    Channel(Option<mpsc::UnboundedReceiver<Bytes>>),
}

/// Scripted HTTP config streams keyed by request path. Unknown paths
/// answer 404.
#[derive(Default)]
pub struct MockConfigStreamer {
    scripts: Mutex<HashMap<String, StreamScript>>,
    opens: Mutex<Vec<(String, String)>>,
}

impl MockConfigStreamer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond_status(&self, path: &str, status: u16) {
        self.scripts
            .lock()
            .insert(path.to_string(), StreamScript::Status(status));
    }

    /// Serve `chunks` on every open of `path`, then keep the stream open.
    pub fn respond_chunks(&self, path: &str, chunks: Vec<Bytes>) {
        self.scripts
            .lock()
            .insert(path.to_string(), StreamScript::Chunks(chunks));
    }

    /// Serve the first open of `path` from the returned sender. Later opens
    /// answer 503.
    pub fn stream_channel(&self, path: &str) -> mpsc::UnboundedSender<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts
            .lock()
            .insert(path.to_string(), StreamScript::Channel(Some(rx)));
        tx
    }

    /// `(endpoint, path)` of every open.
    pub fn opens(&self) -> Vec<(String, String)> {
        self.opens.lock().clone()
    }
}

#[async_trait]
impl ConfigStreamer for MockConfigStreamer {
    async fn open(
        &self,
        endpoint: &str,
        path: &str,
        _credentials: &Credentials,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        self.opens
            .lock()
            .push((endpoint.to_string(), path.to_string()));

        let mut scripts = self.scripts.lock();
        match scripts.get_mut(path) {
            None => Err(NetworkError::Http { status: 404 }.into()),
            Some(StreamScript::Status(status)) => Err(NetworkError::Http { status: *status }.into()),
            Some(StreamScript::Chunks(chunks)) => Ok(stream::iter(chunks.clone().into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Some(StreamScript::Channel(rx)) => match rx.take() {
                Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|chunk| (Ok(chunk), rx))
                })
                .boxed()),
                None => Err(NetworkError::Http { status: 503 }.into()),
            },
        }
    }
}
