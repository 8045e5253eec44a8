//! A single KV connection with its in-flight request table.

use super::conn::PacketConn;
use super::packet::{Magic, Packet, Status};
use crate::error::{Error, NetworkError, QueueError, Result};
use crate::pipeline::{next_owner_token, Request, Response};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// What the error classifier decided for a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The classifier took the request back and will retry it.
    Retrying,
    /// The request must complete with this error.
    Fail(Error),
}

/// Receives failures and server-initiated packets from connections.
pub trait ResponseHandler: Send + Sync {
    /// Classify a failed request. `resp` is set when the failure came from
    /// a server response.
    fn handle_error(&self, resp: Option<&Response>, req: &Arc<Request>, err: Error) -> Disposition;

    /// Handle a request initiated by the server.
    fn handle_server_request(&self, packet: Packet, source_addr: &str);
}

/// One bootstrapped connection to a node.
pub struct KvClient {
    conn_id: String,
    address: String,
    local_addr: String,
    token: u64,
    conn: Arc<dyn PacketConn>,
    ops: DashMap<u32, Arc<Request>>,
    next_opaque: AtomicU32,
    handler: Arc<dyn ResponseHandler>,
    closing: AtomicBool,
    shutdown: CancellationToken,
    closed: CancellationToken,
    drained: Notify,
}

impl KvClient {
    /// Wrap `conn` and start its read loop. `address` is the topology
    /// address of the node, used when reporting where responses came from.
    pub fn start(
        address: impl Into<String>,
        conn: Box<dyn PacketConn>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Arc<Self> {
        let conn: Arc<dyn PacketConn> = Arc::from(conn);
        let client = Arc::new(Self {
            conn_id: uuid::Uuid::new_v4().simple().to_string(),
            address: address.into(),
            local_addr: conn.local_addr(),
            token: next_owner_token(),
            conn,
            ops: DashMap::new(),
            next_opaque: AtomicU32::new(1),
            handler,
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            drained: Notify::new(),
        });

        tokio::spawn(client.clone().read_loop());
        client
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the read loop has exited and in-flight requests have
    /// been handed back.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Write `req` to the connection.
    ///
    /// On error the request has been released and the caller must classify
    /// the failure. A cancelled request yields `Error::Cancelled` and needs
    /// no further handling.
    pub async fn send_request(&self, req: Arc<Request>) -> Result<()> {
        if self.is_closing() {
            return Err(NetworkError::ClientClosed.into());
        }
        if !req.try_claim(self.token) {
            return Err(if req.is_completed() {
                Error::Cancelled
            } else {
                QueueError::AlreadyQueued.into()
            });
        }

        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        req.set_opaque(opaque);
        req.set_connection_info(&self.address, &self.local_addr, &self.conn_id);
        self.ops.insert(opaque, req.clone());

        trace!(address = %self.address, opaque, command = ?req.command(), "writing request");
        if let Err(e) = self.conn.write_packet(req.to_packet(opaque)).await {
            if self.ops.remove(&opaque).is_none() {
                // The read loop already failed it.
                return Ok(());
            }
            req.release(self.token);
            self.notify_if_drained();
            return Err(match e {
                NetworkError::WriteFailed(_) => e.into(),
                other => NetworkError::WriteFailed(other.to_string()).into(),
            });
        }
        req.mark_written();
        Ok(())
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.conn.read_packet() => match result {
                    Ok(packet) => packet,
                    Err(e) => {
                        if !self.is_closing() {
                            debug!(address = %self.address, conn_id = %self.conn_id, error = %e, "connection read failed");
                        }
                        break;
                    }
                },
            };
            self.resolve(packet);
        }

        self.closing.store(true, Ordering::Release);
        self.conn.close().await;
        self.fail_in_flight();
        self.closed.cancel();
        debug!(address = %self.address, conn_id = %self.conn_id, "connection closed");
    }

    fn resolve(&self, packet: Packet) {
        if packet.magic == Magic::ServerRequest {
            if packet.is_cluster_map_notification() {
                self.handler.handle_server_request(packet, &self.address);
            } else {
                trace!(command = ?packet.command, "ignoring unsupported server request");
            }
            return;
        }

        let opaque = packet.opaque;
        let req = match self.ops.get(&opaque) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(address = %self.address, opaque, "response for unknown request");
                return;
            }
        };

        let status = packet.status;
        let keep = req.is_persistent() && status == Status::Success;
        if !keep {
            self.ops.remove(&opaque);
            req.release(self.token);
        }

        let resp = Response {
            packet,
            source_addr: self.address.clone(),
        };
        if status == Status::Success {
            if keep {
                req.deliver(resp);
            } else {
                req.try_complete(Ok(resp));
            }
        } else {
            req.set_last_status(status);
            if let Disposition::Fail(err) =
                self.handler.handle_error(Some(&resp), &req, Error::Status(status))
            {
                req.try_complete(Err(err));
            }
        }

        self.notify_if_drained();
    }

    fn fail_in_flight(&self) {
        let opaques: Vec<u32> = self.ops.iter().map(|entry| *entry.key()).collect();
        for opaque in opaques {
            if let Some((_, req)) = self.ops.remove(&opaque) {
                req.release(self.token);
                if let Disposition::Fail(err) =
                    self.handler
                        .handle_error(None, &req, NetworkError::ConnectionClosed.into())
                {
                    req.try_complete(Err(err));
                }
            }
        }
        self.drained.notify_waiters();
    }

    fn notify_if_drained(&self) {
        if self.is_closing() && self.ops.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Stop accepting requests and close once in-flight requests resolve.
    /// Persistent requests are cancelled with `err` when given.
    pub fn graceful_close(self: &Arc<Self>, err: Option<Error>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(address = %self.address, conn_id = %self.conn_id, in_flight = self.ops.len(), "gracefully closing connection");

        if let Some(err) = err {
            let persistent: Vec<u32> = self
                .ops
                .iter()
                .filter(|entry| entry.value().is_persistent())
                .map(|entry| *entry.key())
                .collect();
            for opaque in persistent {
                if let Some((_, req)) = self.ops.remove(&opaque) {
                    req.release(self.token);
                    req.try_complete(Err(err.clone()));
                }
            }
        }

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let notified = client.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if client.ops.is_empty() || client.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = client.closed.cancelled() => break,
                }
            }
            client.close().await;
        });
    }

    /// Close the connection now. In-flight requests are handed to the
    /// classifier as connection-closed.
    pub async fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            debug!(address = %self.address, conn_id = %self.conn_id, "closing connection");
        }
        self.shutdown.cancel();
        self.conn.close().await;
    }
}
