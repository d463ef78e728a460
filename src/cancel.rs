//! Explicit cancellation token checked at every blocking-read boundary.
//!
//! Out-of-band events (user interrupt, broken pipe on write) set the token;
//! the next frame read unwinds with a stopped error instead of returning
//! data. The stop-and-delete variant additionally asks the receiver to roll
//! back every file it created during the conversation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::TrzszError;

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    delete: AtomicBool,
    notify: Notify,
}

/// Shared stop flag for one conversation.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<Inner>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the conversation; in-progress reads fail with `Stopped`.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Stop the conversation and request rollback of created files.
    pub fn stop_and_delete(&self) {
        self.inner.delete.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn delete_requested(&self) -> bool {
        self.inner.delete.load(Ordering::SeqCst)
    }

    /// The error a read should unwind with once the token is set.
    pub fn stop_error(&self) -> TrzszError {
        if self.delete_requested() {
            TrzszError::StoppedAndDeleted
        } else {
            TrzszError::Stopped
        }
    }

    /// Resolves once the token is set. Safe to race with `stop`: the flag is
    /// re-checked after registering for notification.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Drain window to absorb whatever the peer is still mid-flight sending
/// after a fatal condition, sized by the largest chunk round trip observed.
pub fn drain_timeout(max_chunk_time: Duration) -> Duration {
    std::cmp::max(max_chunk_time * 2, Duration::from_millis(500))
}
