//! Request deadlines and cancellation.
//!
//! A workflow owns a single [`Context`]; every cluster call it makes is
//! bounded by that deadline and aborted when the context is cancelled.
//! Sub-operations can shorten it with [`Context::child`] but never extend
//! it. Cleanup starts from a fresh context so resources are released even
//! after the workflow ran out of time or was interrupted.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Default deadline for a whole workflow.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Carries the deadline and cancellation of the current request.
#[derive(Clone, Debug)]
pub struct Context {
    deadline: Instant,
    cancel: CancellationToken,
}

impl Context {
    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Context {
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// The same deadline, cancelled whenever `cancel` is.
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Context {
            deadline: self.deadline,
            cancel,
        }
    }

    /// A context with the default workflow deadline.
    pub fn background() -> Self {
        Context::with_timeout(DEFAULT_TIMEOUT)
    }

    /// A context expiring after `timeout` or when `self` expires, whichever
    /// comes first.
    pub fn child(&self, timeout: Duration) -> Self {
        Context {
            deadline: std::cmp::min(self.deadline, Instant::now() + timeout),
            cancel: self.cancel.child_token(),
        }
    }

    /// The instant this context expires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// True once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Runs `fut`, failing with [`Error::DeadlineExceeded`] if it does not
    /// settle before the deadline and with [`Error::Cancelled`] if the
    /// context is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout_at(self.deadline, fut) => match res {
                Ok(res) => res,
                Err(_) => Err(Error::DeadlineExceeded),
            },
        }
    }
}

/// Cancels `cancel` on the first SIGINT or SIGTERM. The task ends early
/// when `cancel` is cancelled by someone else.
pub fn cancel_on_signal(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = wait_for_signal() => match res {
                Ok(signal) => info!(signal, "Received signal; cancelling"),
                Err(e) => {
                    warn!(error = %e, "Unable to listen for signals");
                    return;
                }
            },
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "SIGINT")
}

impl Default for Context {
    fn default() -> Self {
        Context::background()
    }
}
