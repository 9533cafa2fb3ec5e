//! Single-slot channel from the tracking loop to the presentation layer.
//!
//! The producer never blocks: an unconsumed batch is replaced by the next
//! one (with its pending clears folded in).

use super::commands::RenderBatch;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Create a connected sender/receiver pair.
pub fn overlay_channel() -> (OverlaySender, OverlayReceiver) {
    let (tx, rx) = bounded(1);
    let replaced = Arc::new(AtomicU64::new(0));
    (
        OverlaySender {
            tx,
            drain: rx.clone(),
            replaced: replaced.clone(),
        },
        OverlayReceiver { rx, replaced },
    )
}

/// Producer half, owned by the tracking loop.
#[derive(Clone)]
pub struct OverlaySender {
    tx: Sender<RenderBatch>,
    drain: Receiver<RenderBatch>,
    replaced: Arc<AtomicU64>,
}

impl OverlaySender {
    /// Publish a batch, replacing any batch still pending.
    pub fn publish(&self, mut batch: RenderBatch) {
        loop {
            match self.tx.try_send(batch) {
                Ok(()) => return,
                Err(TrySendError::Full(b)) => {
                    batch = b;
                    if let Ok(stale) = self.drain.try_recv() {
                        log::debug!(
                            "Overlay batch {} replaced by {} before it was consumed",
                            stale.cycle,
                            batch.cycle
                        );
                        batch.absorb(stale);
                        self.replaced.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // Unreachable while `drain` is held.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Consumer half, owned by the presentation layer.
#[derive(Clone)]
pub struct OverlayReceiver {
    rx: Receiver<RenderBatch>,
    replaced: Arc<AtomicU64>,
}

impl OverlayReceiver {
    /// Take the pending batch, if any.
    pub fn try_recv(&self) -> Option<RenderBatch> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a batch.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RenderBatch> {
        match self.rx.recv_timeout(timeout) {
            Ok(batch) => Some(batch),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Batches replaced before the presentation layer consumed them.
    pub fn replaced_count(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderCommand;

    #[test]
    fn test_publish_never_blocks() {
        let (tx, rx) = overlay_channel();
        for cycle in 0..10 {
            let mut batch = RenderBatch::new(cycle);
            batch
                .commands
                .push(RenderCommand::ClearOverlay { marker_id: cycle as u16 });
            tx.publish(batch);
        }
        let latest = rx.try_recv().unwrap();
        assert_eq!(latest.cycle, 9);
        // All clears survive the replacements.
        assert_eq!(latest.clears().count(), 10);
        assert!(rx.try_recv().is_none());
        assert_eq!(rx.replaced_count(), 9);
    }

    #[test]
    fn test_recv_timeout_empty() {
        let (_tx, rx) = overlay_channel();
        assert!(rx.recv_timeout(Duration::from_millis(5)).is_none());
    }
}
