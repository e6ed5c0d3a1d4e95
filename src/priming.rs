//! Render-empty gate.
//!
//! Before a route change is pushed to the HAL, the streams that were muted
//! for the switch should have drained the audio already queued on the old
//! device. Muting arms the gate; the audio server reports drained frames
//! through [`RenderEmptyGate::frame_drained`]. The wait is bounded and
//! best-effort: on timeout the route change proceeds anyway.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

/// Counts pending drains and lets a route update wait for them.
#[derive(Debug, Default)]
pub struct RenderEmptyGate {
    pending: AtomicUsize,
    notify: Notify,
}

impl RenderEmptyGate {
    /// Creates a gate with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one muted stream that still has queued audio.
    pub fn arm(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Reports that one muted stream finished draining.
    pub fn frame_drained(&self) {
        let prev = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if prev <= 1 {
            self.notify.notify_waiters();
        }
    }

    /// Number of streams still draining.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Waits until nothing is pending or `timeout` elapses.
    ///
    /// Returns `true` if the gate drained in time. A timeout clears the
    /// pending count so a lost notification cannot stall later switches.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if drained {
            debug!("render empty gate drained");
        } else {
            warn!(pending = self.pending(), "render empty wait timed out, continuing");
            self.pending.store(0, Ordering::SeqCst);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let gate = RenderEmptyGate::new();
        assert!(gate.wait_drained(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_released_by_drain() {
        let gate = Arc::new(RenderEmptyGate::new());
        gate.arm();

        let drainer = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                gate.frame_drained();
            })
        };

        assert!(gate.wait_drained(Duration::from_secs(1)).await);
        drainer.await.unwrap();
        assert_eq!(gate.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_clears() {
        let gate = RenderEmptyGate::new();
        gate.arm();
        gate.arm();

        assert!(!gate.wait_drained(Duration::from_millis(120)).await);
        assert_eq!(gate.pending(), 0);
    }

    #[test]
    fn test_drain_saturates_at_zero() {
        let gate = RenderEmptyGate::new();
        gate.frame_drained();
        assert_eq!(gate.pending(), 0);
    }
}
