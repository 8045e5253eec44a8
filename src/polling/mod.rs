//! Topology polling.
//!
//! ```text
//!   PollerController
//!     ├─ CccpPoller  (GetClusterConfig over KV pipelines, default)
//!     │     └─ fallback status / no pipelines ──► switch to HTTP
//!     └─ HttpPoller  (streaming config over the management port)
//!           └─ partitioned topology seen ──► switch back to CCCP
//! ```
//!
//! Only one poller runs at a time. Both hand every config they receive to
//! the [`TopologyManager`](crate::topology::TopologyManager), which fences
//! stale ones.

mod cccp;
mod controller;
mod http;

pub use cccp::CccpPoller;
pub use controller::PollerController;
pub use http::{ConfigStreamDecoder, ConfigStreamer, HttpPoller, ReqwestConfigStreamer};

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A loop that fetches topology and proposes it to the manager.
#[async_trait]
pub trait TopologyPoller: Send + Sync {
    /// Poll until `stop` is cancelled. Returns `Err` when polling this way
    /// is not possible and the controller should fall back.
    async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<()>;

    /// Stop token for the next run. Take it before spawning the loop so a
    /// `stop` issued before the loop is first polled still ends it.
    fn stop_token(&self) -> CancellationToken;

    /// While paused, fetched configs are dropped.
    fn pause(&self, paused: bool);

    /// Stop the running loop.
    fn stop(&self);

    /// Clear the stop signal and last error so the poller can run again.
    fn reset(&self);

    fn last_error(&self) -> Option<Error>;
}

/// Stop, pause and error state shared by the pollers.
pub(crate) struct LoopControl {
    stop: Mutex<CancellationToken>,
    paused: AtomicBool,
    last_error: Mutex<Option<Error>>,
}

impl LoopControl {
    pub(crate) fn new() -> Self {
        Self {
            stop: Mutex::new(CancellationToken::new()),
            paused: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Stop token for one run of the loop.
    pub(crate) fn token(&self) -> CancellationToken {
        self.stop.lock().clone()
    }

    pub(crate) fn stop(&self) {
        self.stop.lock().cancel();
    }

    pub(crate) fn reset(&self) {
        let mut stop = self.stop.lock();
        if stop.is_cancelled() {
            *stop = CancellationToken::new();
        }
        *self.last_error.lock() = None;
    }

    pub(crate) fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_error(&self, err: Error) {
        *self.last_error.lock() = Some(err);
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        self.last_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_control_reset() {
        let control = LoopControl::new();
        let first = control.token();
        control.set_error(Error::NoCccpHosts);
        control.stop();
        assert!(first.is_cancelled());
        assert_eq!(control.last_error(), Some(Error::NoCccpHosts));

        control.reset();
        assert!(first.is_cancelled());
        assert!(!control.token().is_cancelled());
        assert!(control.last_error().is_none());
    }

    #[test]
    fn test_pause() {
        let control = LoopControl::new();
        assert!(!control.is_paused());
        control.pause(true);
        assert!(control.is_paused());
        control.pause(false);
        assert!(!control.is_paused());
    }
}
