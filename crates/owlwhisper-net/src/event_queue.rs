use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::events::CoreEvent;

const CAPACITY: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum EventQueueError {
    #[error("timed out waiting for an event")]
    Timeout,
    #[error("event queue stopped")]
    Stopped
}

/// Bounded MPSC queue of [`CoreEvent`]s. `push` never blocks the network
/// path: when full, the event is dropped and the drop is logged.
pub struct EventQueue {
    tx:      mpsc::Sender<CoreEvent>,
    rx:      tokio::sync::Mutex<mpsc::Receiver<CoreEvent>>,
    stopped: Arc<AtomicBool>
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(CAPACITY);
        Self { tx, rx: tokio::sync::Mutex::new(rx), stopped: Arc::new(AtomicBool::new(false)) }
    }

    pub fn handle(&self) -> EventQueueHandle {
        EventQueueHandle { tx: self.tx.clone(), stopped: self.stopped.clone() }
    }

    /// Blocks on the oldest pending event, up to `timeout`.
    pub async fn next(&self, timeout: Duration) -> Result<CoreEvent, EventQueueError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EventQueueError::Stopped);
        }
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(EventQueueError::Stopped),
            Err(_) => {
                if self.stopped.load(Ordering::Acquire) {
                    Err(EventQueueError::Stopped)
                } else {
                    Err(EventQueueError::Timeout)
                }
            }
        }
    }

    /// Prevents further pushes and unblocks any pending `next()` calls.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap, cloneable producer handle shared with every component that emits events.
#[derive(Clone)]
pub struct EventQueueHandle {
    tx:      mpsc::Sender<CoreEvent>,
    stopped: Arc<AtomicBool>
}

impl EventQueueHandle {
    /// Non-blocking push. Drops the event and logs a warning if the queue is
    /// full or stopped; never blocks the caller.
    pub fn push(&self, event: CoreEvent) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(error = %e, "event queue full, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NetworkStatusKind;

    #[tokio::test]
    async fn push_then_next_round_trips() {
        let queue = EventQueue::new();
        let handle = queue.handle();
        handle.push(CoreEvent::network_status(NetworkStatusKind::NetworkReady, "ok"));

        let event = queue.next(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(event, CoreEvent::NetworkStatus { .. }));
    }

    #[tokio::test]
    async fn next_times_out_when_empty() {
        let queue = EventQueue::new();
        let result = queue.next(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(EventQueueError::Timeout)));
    }

    #[tokio::test]
    async fn stop_unblocks_next() {
        let queue = EventQueue::new();
        queue.stop();
        let result = queue.next(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(EventQueueError::Stopped)));
    }

    #[tokio::test]
    async fn push_after_stop_is_dropped_silently() {
        let queue = EventQueue::new();
        let handle = queue.handle();
        queue.stop();
        handle.push(CoreEvent::network_status(NetworkStatusKind::Degraded, "ignored"));
    }
}
