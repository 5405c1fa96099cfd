//! Server stop signal.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long [`StopSignal::drain`] waits by default.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Stops the listener and every WebSocket transport it spawned.
///
/// Transports hold child tokens, so stopping closes them all at once.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    /// Signal that has not fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the signal fires.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn stop(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Whether the signal has fired.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire the signal and wait for the server task to finish.
    pub async fn drain(&self, server: JoinHandle<()>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        let _ = self.stop();
        info!(timeout_secs = timeout.as_secs(), "waiting for server to stop");
        if tokio::time::timeout(timeout, server).await.is_err() {
            warn!("server did not stop within {timeout:?}");
        }
    }
}
