use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

// ---------------------------------------------------------------------------
// CancelToken — per-build cooperative cancellation
// ---------------------------------------------------------------------------

/// Cancellation flag shared by everything working on one build.
///
/// In-flight provider calls `select!` on [`CancelToken::cancelled`] alongside
/// the call itself; quick checks use [`CancelToken::is_cancelled`].
///
/// ```ignore
/// let token = CancelToken::new();
/// tokio::select! {
///     _ = token.cancelled() => { /* abandon */ }
///     out = provider.generate(p, prompt, &opts) => { /* use out */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Trigger cancellation. Returns `false` if it was already triggered.
    pub fn cancel(&self) -> bool {
        if self
            .flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            debug!("cancel token triggered");
            self.tx.send_replace(true);
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Resolve once the token is cancelled. Resolves immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the token, so `changed`
        // only errors once nothing can cancel anymore.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
