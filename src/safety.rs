//! Cooperative cancellation and drop guards for acquisition runs.
//!
//! # Problem
//!
//! A run spends most of its time suspended: waiting on instrument round-trips, on
//! settle delays, or on an operator confirming that the wiring was reversed. A stop
//! request from the controller must be honored at the next of those suspension
//! points, and the bookkeeping that marks the Source/Meter pair as busy must be
//! released even if the run task panics.
//!
//! # Solution
//!
//! - `CancellationToken`: shared, lock-free stop flag with a reason and an async
//!   wake-up, so settle waits end as soon as a stop is requested.
//! - `PanicGuard`: RAII guard that runs synchronous cleanup on drop.
//!
//! # Example
//!
//! ```rust,ignore
//! let token = CancellationToken::new();
//! let engine_token = token.clone();
//!
//! tokio::spawn(async move {
//!     // returns false if cancelled before the delay elapsed
//!     if !engine_token.sleep(Duration::from_millis(500)).await {
//!         return;
//!     }
//!     // ... sample ...
//! });
//!
//! token.cancel("operator pressed stop");
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

// =============================================================================
// Cancellation Token
// =============================================================================

/// A shared flag for requesting a cooperative stop of the active run.
///
/// The token is created once by the controller and outlives individual runs.
/// The engine only ever sets it (on fatal errors); clearing happens through
/// [`CancellationToken::reset`] when the controller starts the next run.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    flag: AtomicBool,
    reason: RwLock<Option<String>>,
    notify: Notify,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancellationToken {
    /// Create a new, clear token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    ///
    /// The first reason recorded since the last reset is kept; later calls only
    /// make sure the flag is set.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.inner.reason.write() {
            if r.is_none() {
                *r = Some(reason.into());
            }
        }
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Reason given with the stop request.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().ok().and_then(|r| r.clone())
    }

    /// Clear the flag for a new run.
    pub fn reset(&self) {
        if let Ok(mut r) = self.inner.reason.write() {
            *r = None;
        }
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` when the full delay elapsed, `false` when the token was set
    /// before or during the wait.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration).await
    }

    /// Sleep until `deadline` unless cancelled first. See [`CancellationToken::sleep`].
    pub async fn sleep_until(&self, deadline: Instant) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }

    /// Create a guard that cancels this token with "Panic in: <context>" if
    /// dropped while still armed. Dismiss it on the normal path.
    pub fn guard(&self, context: impl Into<String>) -> PanicGuard {
        let token = self.clone();
        let ctx = context.into();
        PanicGuard::named(ctx.clone(), move || {
            token.cancel(format!("Panic in: {}", ctx));
        })
    }
}

// =============================================================================
// Panic Guard (Synchronous)
// =============================================================================

/// A synchronous RAII guard that executes cleanup when dropped.
///
/// Used to release the controller's run slot and, through
/// [`CancellationToken::guard`], to cancel the token if the run task unwinds.
///
/// # Limitations
///
/// - Cannot run async code (instrument securing is done explicitly by the engine)
/// - Must not panic in the cleanup function
pub struct PanicGuard {
    cleanup: Option<Box<dyn FnOnce() + Send + 'static>>,
    name: String,
}

impl PanicGuard {
    /// Create a named panic guard (for logging).
    pub fn named<F>(name: impl Into<String>, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
            name: name.into(),
        }
    }

    /// Dismiss the guard without running cleanup.
    pub fn dismiss(mut self) {
        self.cleanup = None;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if std::thread::panicking() {
                tracing::error!(guard = %self.name, "Guard triggered during panic - executing cleanup");
            }

            // catch panics to avoid a double panic
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup));
            if result.is_err() {
                tracing::error!(guard = %self.name, "Guard cleanup panicked");
            }
        }
    }
}
