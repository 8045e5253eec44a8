//! Streaming config polling over the management (HTTP) port.

use super::{LoopControl, TopologyPoller};
use crate::error::{Error, NetworkError, Result, TopologyError};
use crate::mux::KvMux;
use crate::topology::BucketConfig;
use crate::types::Credentials;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Opens long-lived config streams against a management endpoint.
#[async_trait]
pub trait ConfigStreamer: Send + Sync {
    /// GET `endpoint` + `path`. A non-success HTTP status fails with
    /// [`NetworkError::Http`].
    async fn open(
        &self,
        endpoint: &str,
        path: &str,
        credentials: &Credentials,
    ) -> Result<BoxStream<'static, Result<Bytes>>>;
}

/// [`ConfigStreamer`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestConfigStreamer {
    client: reqwest::Client,
}

impl ReqwestConfigStreamer {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ConfigStreamer for ReqwestConfigStreamer {
    async fn open(
        &self,
        endpoint: &str,
        path: &str,
        credentials: &Credentials,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NetworkError::Http {
                status: status.as_u16(),
            }
            .into());
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::from(NetworkError::ReceiveFailed(e.to_string()))))
            .boxed())
    }
}

/// Most bytes a streamed config object may hold before it closes.
pub const MAX_PENDING_CONFIG_LEN: usize = 20 * 1024 * 1024;

/// Splits a chunked config stream into complete JSON objects.
///
/// Objects may be split across chunks at any byte. Whitespace and
/// separators between objects are dropped.
#[derive(Debug)]
pub struct ConfigStreamDecoder {
    buf: Vec<u8>,
    scan_pos: usize,
    start: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    max_pending: usize,
}

impl Default for ConfigStreamDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_CONFIG_LEN)
    }
}

impl ConfigStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buf: Vec::new(),
            scan_pos: 0,
            start: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            max_pending,
        }
    }

    /// Feed one chunk and return every object it completes. Fails, and
    /// discards everything buffered, once an unfinished object grows past
    /// the limit.
    pub fn push(&mut self, chunk: &[u8]) -> std::result::Result<Vec<Bytes>, NetworkError> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut consumed = 0;

        for i in self.scan_pos..self.buf.len() {
            let b = self.buf[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' if self.depth > 0 => self.in_string = true,
                b'{' => {
                    if self.depth == 0 {
                        self.start = i;
                    }
                    self.depth += 1;
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        out.push(Bytes::copy_from_slice(&self.buf[self.start..=i]));
                        consumed = i + 1;
                    }
                }
                _ if self.depth == 0 => consumed = i + 1,
                _ => {}
            }
        }

        self.buf.drain(..consumed);
        self.start = self.start.saturating_sub(consumed);
        self.scan_pos = self.buf.len();
        if self.buf.len() > self.max_pending {
            let pending = self.buf.len();
            *self = Self::with_limit(self.max_pending);
            return Err(NetworkError::ReceiveFailed(format!(
                "unterminated config object of {} bytes exceeds limit",
                pending
            )));
        }
        Ok(out)
    }

    /// Bytes held for an incomplete object.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint)
        .trim_end_matches('/')
}

/// Outcome of reading one stream.
enum StreamEnd {
    Stopped,
    Rotate,
}

/// Streams configs from one management endpoint at a time, rotating to
/// another after `redial_period`.
pub struct HttpPoller {
    mux: Arc<KvMux>,
    streamer: Arc<dyn ConfigStreamer>,
    seed_endpoints: Vec<String>,
    retry_delay: Duration,
    redial_period: Duration,
    max_wait: Duration,
    control: LoopControl,
}

impl HttpPoller {
    pub fn new(
        mux: Arc<KvMux>,
        streamer: Arc<dyn ConfigStreamer>,
        seed_endpoints: Vec<String>,
        retry_delay: Duration,
        redial_period: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            mux,
            streamer,
            seed_endpoints,
            retry_delay,
            redial_period,
            max_wait,
            control: LoopControl::new(),
        }
    }

    fn stream_path(&self) -> String {
        let bucket = self.mux.bucket_name();
        if bucket.is_empty() {
            "/pools/default/nodeServicesStreaming".to_string()
        } else {
            format!("/pools/default/bs/{}", bucket)
        }
    }

    /// Management endpoints of the applied topology, or the seeds when it
    /// has none.
    fn endpoints(&self, use_tls: bool) -> Vec<String> {
        let config = self.mux.topology().current();
        let endpoints: Vec<String> = config
            .mgmt_endpoints
            .select(use_tls)
            .iter()
            .map(|ep| ep.address.clone())
            .collect();
        if endpoints.is_empty() {
            self.seed_endpoints.clone()
        } else {
            endpoints
        }
    }

    async fn open_stream(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let open = |path: String| async move {
            tokio::time::timeout(
                self.max_wait,
                self.streamer.open(endpoint, &path, credentials),
            )
            .await
            .map_err(|_| Error::Timeout { ambiguous: false })?
        };

        match open(self.stream_path()).await {
            Err(Error::Network(NetworkError::Http { status: 404 })) if !self.mux.bucket_name().is_empty() => {
                debug!(endpoint = %endpoint, "terse streaming path not found, trying legacy path");
                let legacy = format!("/pools/default/bucketsStreaming/{}", self.mux.bucket_name());
                match open(legacy).await {
                    Err(Error::Network(NetworkError::Http { status: 404 })) => Err(
                        TopologyError::BucketNotFound(self.mux.bucket_name().to_string()).into(),
                    ),
                    other => other,
                }
            }
            Err(Error::Network(NetworkError::Http { status: 401 })) => {
                Err(Error::AuthenticationFailure)
            }
            other => other,
        }
    }

    /// Read configs until the stream ends, the redial period passes, or
    /// the poller stops. Returns whether any config was seen.
    async fn read_stream(
        &self,
        endpoint: &str,
        mut stream: BoxStream<'static, Result<Bytes>>,
        stop: &CancellationToken,
        saw_config: &mut bool,
    ) -> StreamEnd {
        let source = strip_scheme(endpoint).to_string();
        let mut decoder = ConfigStreamDecoder::new();
        let redial = tokio::time::sleep(self.redial_period);
        tokio::pin!(redial);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return StreamEnd::Stopped,
                _ = &mut redial => {
                    debug!(endpoint = %endpoint, "redial period elapsed, rotating config stream");
                    return StreamEnd::Rotate;
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let objects = match decoder.push(&bytes) {
                            Ok(objects) => objects,
                            Err(err) => {
                                warn!(endpoint = %endpoint, error = %err, "discarding config stream");
                                self.control.set_error(err.into());
                                return StreamEnd::Rotate;
                            }
                        };
                        for object in objects {
                            match BucketConfig::parse_from_address(&object, &source) {
                                Ok(config) => {
                                    *saw_config = true;
                                    if self.control.is_paused() {
                                        trace!(endpoint = %endpoint, "paused, dropping streamed config");
                                        continue;
                                    }
                                    self.mux.topology().propose_topology(&config);
                                }
                                Err(e) => {
                                    warn!(endpoint = %endpoint, error = %e, "failed to parse streamed config");
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        debug!(endpoint = %endpoint, error = %err, "config stream failed");
                        self.control.set_error(err);
                        return StreamEnd::Rotate;
                    }
                    None => {
                        debug!(endpoint = %endpoint, "config stream closed");
                        return StreamEnd::Rotate;
                    }
                },
            }
        }
    }
}

#[async_trait]
impl TopologyPoller for HttpPoller {
    async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        debug!(path = %self.stream_path(), "http poller started");

        loop {
            if stop.is_cancelled() {
                break;
            }
            let Some(settings) = self.mux.state().map(|s| s.settings().clone()) else {
                debug!("mux closed, http poller exiting");
                break;
            };

            let mut endpoints = self.endpoints(settings.use_tls);
            endpoints.shuffle(&mut rand::rng());
            let mut seen = HashSet::new();
            let mut saw_config = false;

            for endpoint in endpoints {
                if !seen.insert(endpoint.clone()) {
                    continue;
                }
                if stop.is_cancelled() {
                    break;
                }

                let credentials = settings.auth.credentials(&endpoint);
                let stream = tokio::select! {
                    _ = stop.cancelled() => break,
                    stream = self.open_stream(&endpoint, &credentials) => stream,
                };
                match stream {
                    Ok(stream) => {
                        trace!(endpoint = %endpoint, "config stream opened");
                        if let StreamEnd::Stopped =
                            self.read_stream(&endpoint, stream, &stop, &mut saw_config).await
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(endpoint = %endpoint, error = %err, "failed to open config stream");
                        self.control.set_error(err);
                    }
                }
            }

            if !saw_config {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        debug!("http poller stopped");
        Ok(())
    }

    fn pause(&self, paused: bool) {
        self.control.pause(paused);
    }

    fn stop(&self) {
        self.control.stop();
    }

    fn stop_token(&self) -> CancellationToken {
        self.control.token()
    }

    fn reset(&self) {
        self.control.reset();
    }

    fn last_error(&self) -> Option<Error> {
        self.control.last_error()
    }
}
