//! One-shot cancellable timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A scheduled callback that can be cancelled until it fires.
///
/// Each timer carries a sequence number chosen by its owner. The callback
/// reports that number back, so an owner that has since replaced the timer
/// can tell a stale firing from the current one.
#[derive(Debug)]
pub struct TimerHandle {
    seq: u64,
    fired: Arc<AtomicBool>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl TimerHandle {
    /// Run `on_fire(seq)` after `delay` unless cancelled first.
    pub fn schedule<F>(delay: Duration, seq: u64, on_fire: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let flag = fired.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    flag.store(true, Ordering::SeqCst);
                    on_fire(seq);
                }
                _ = cancel_rx => {}
            }
        });

        Self {
            seq,
            fired,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Cancel the timer. Returns `false` if it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self) -> bool {
        if self.fired.load(Ordering::SeqCst) {
            return false;
        }
        match self.cancel_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.cancel_tx.is_some() && !self.fired.load(Ordering::SeqCst)
    }
}
