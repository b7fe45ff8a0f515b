//! Cancellable, bounded polling
//!
//! Rebase and pipeline waits are explicit suspension points: probe, sleep,
//! probe again, until the probe reports a result, the deadline passes, or the
//! engine shuts down.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Handle that flips every [`CancelToken`] it produced
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown switch
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Token observing this switch
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Cancel all tokens
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap, cloneable cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    ///
    /// Pends forever if the [`Shutdown`] was dropped without triggering.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Interval and overall bound of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between probes
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

/// What a single probe observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// Finished with a value
    Ready(T),
    /// Not yet; sleep and probe again
    Pending,
}

/// Probe until ready, timed out, or cancelled.
///
/// Returns `Ok(Some(value))` when the probe finished, `Ok(None)` on timeout,
/// and `Err(Error::Cancelled)` on shutdown. Probe errors propagate as-is.
pub async fn poll_until<T, F, Fut>(
    settings: PollSettings,
    cancel: &CancelToken,
    mut probe: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>>>,
{
    // A timeout past the clock's range means no deadline
    let deadline = Instant::now().checked_add(settings.timeout);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Probe::Ready(value) = probe().await? {
            return Ok(Some(value));
        }

        let nap = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                settings.interval.min(deadline - now)
            }
            None => settings.interval,
        };
        tokio::select! {
            () = tokio::time::sleep(nap) => {}
            () = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}
