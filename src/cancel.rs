use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A cooperative cancellation flag shared between a `ConnectPlan` and
/// whoever may cancel it (the `FastFallbackFinder`, or the owning call).
///
/// `cancel()` is idempotent and safe from any thread (§4.4). A plan whose
/// `cancel()` arrives before its socket exists still observes it on the
/// next suspension point, because every connect step checks
/// `is_canceled()` before and `canceled()` is raced against via
/// `tokio::select!`.
#[derive(Default)]
pub struct CancelToken {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. If already canceled,
    /// resolves immediately.
    pub async fn canceled(&self) {
        if self.is_canceled() {
            return;
        }
        // Notify::notified() must be constructed before checking the flag
        // again to avoid missing a cancel that races in between, hence the
        // re-check after awaiting.
        loop {
            let notified = self.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
            if self.is_canceled() {
                return;
            }
        }
    }
}
