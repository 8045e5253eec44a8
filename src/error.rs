//! Error types for the routing engine.

use crate::memd::Status;
use crate::retry::RetryReason;
use thiserror::Error;

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the routing engine.
///
/// Errors are `Clone` so a single failure can be handed both to a request
/// completion and to a poller's `last_error` slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Topology parsing and validation errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Request routing errors.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Pipeline queue errors.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The server answered with a non-success status.
    #[error("server status: {0}")]
    Status(Status),

    /// The mux or agent has been shut down.
    #[error("shutdown in progress")]
    Shutdown,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out (ambiguous: {ambiguous})")]
    Timeout { ambiguous: bool },

    /// The target pipeline queue is full.
    #[error("pipeline overloaded")]
    Overload,

    /// Credentials were rejected.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The connection was closed because a reconnect was forced.
    #[error("connection closed for forced reconnect")]
    ForcedReconnect,

    /// No KV pipelines are available to poll for topology.
    #[error("no cccp hosts available")]
    NoCccpHosts,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Queue(QueueError::Cancelled))
    }

    /// Returns the server status carried by this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Status(status) => Some(*status),
            _ => None,
        }
    }

    /// Returns true if the in-protocol poller should give way to the HTTP
    /// poller after seeing this error.
    pub fn is_polling_fallback(&self) -> bool {
        match self {
            Error::NoCccpHosts => true,
            Error::Status(status) => matches!(
                status,
                Status::KeyNotFound | Status::NotSupported | Status::UnknownCommand
            ),
            _ => false,
        }
    }
}

/// Topology parsing and validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The config payload could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// The config was parsed but is structurally invalid.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The bucket does not exist on the cluster.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// No endpoints are available to fetch topology from.
    #[error("no endpoints available")]
    NoEndpoints,
}

/// Request routing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The vbucket id is outside the map.
    #[error("invalid vbucket: {vbucket} (map has {num_vbuckets})")]
    InvalidVbucket { vbucket: u16, num_vbuckets: usize },

    /// The replica index exceeds the configured replica count.
    #[error("invalid replica index: {index} (bucket has {num_replicas} replicas)")]
    InvalidReplica { index: i32, num_replicas: usize },

    /// A required routing argument was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Key operations are not possible without a selected bucket.
    #[error("cluster-level config in use, no bucket selected")]
    GcccpInUse,

    /// The requested server is not part of the current topology.
    #[error("invalid server: {0}")]
    InvalidServer(String),

    /// The resolved node is outside the requested server group.
    #[error("server group mismatch: wanted {wanted}, node {address} is in {actual}")]
    ServerGroupMismatch {
        wanted: String,
        actual: String,
        address: String,
    },

    /// The topology carries no usable routing table.
    #[error("no routing table available")]
    NoRoutingTable,
}

/// Network communication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// The connection was closed by the peer or locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The client no longer accepts requests.
    #[error("client closed")]
    ClientClosed,

    /// Failed to write a packet.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Failed to receive a packet.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// A packet could not be decoded.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// The provider cannot establish TLS connections.
    #[error("tls not supported by this connection provider")]
    TlsUnsupported,

    /// An HTTP request returned a non-success status.
    #[error("http status {status}")]
    Http { status: u16 },
}

/// Pipeline queue errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("queue full")]
    Full,

    /// The queue no longer accepts requests.
    #[error("queue closed")]
    Closed,

    /// The request is owned by another queue or connection.
    #[error("request already queued")]
    AlreadyQueued,

    /// The request was cancelled before it could be queued.
    #[error("request cancelled")]
    Cancelled,
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => NetworkError::ConnectionClosed,
            _ => NetworkError::ReceiveFailed(e.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Network(e.into())
    }
}

impl From<serde_json::Error> for TopologyError {
    fn from(e: serde_json::Error) -> Self {
        TopologyError::Parse(e.to_string())
    }
}

/// A request failure delivered to the caller, annotated with the request's
/// routing and retry history.
#[derive(Error, Debug, Clone)]
#[error("{source} (key: {key:?}, attempts: {retry_attempts}, reasons: {retry_reasons:?}, last dispatched to: {last_dispatched_to:?})")]
pub struct KvError {
    /// The underlying failure.
    pub source: Error,
    /// Server status, when the failure came from a response.
    pub status: Option<Status>,
    /// Document key, lossily decoded.
    pub key: String,
    /// Bucket the request targeted.
    pub bucket: String,
    /// Opaque of the last dispatch.
    pub opaque: u32,
    /// Number of retries performed.
    pub retry_attempts: u32,
    /// Reasons for each retry, in order.
    pub retry_reasons: Vec<RetryReason>,
    /// Remote address of the last connection that wrote the request.
    pub last_dispatched_to: Option<String>,
    /// Local address of the last connection that wrote the request.
    pub last_dispatched_from: Option<String>,
    /// Identifier of the last connection that wrote the request.
    pub last_connection_id: Option<String>,
}

impl KvError {
    /// Returns the underlying error.
    pub fn inner(&self) -> &Error {
        &self.source
    }
}
