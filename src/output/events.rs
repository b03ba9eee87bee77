// Real-time result events for monitoring layers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use super::report::ExecutionResult;

/// Publishing side of the event stream.
///
/// Sending never waits: a receiver that falls more than `capacity` events
/// behind loses the oldest ones and learns how many on its next `recv`.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<ExecutionResult>,
    dropped: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventEmitter {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a result. Having no subscriber is fine.
    pub fn emit(&self, result: &ExecutionResult) {
        let _ = self.tx.send(result.clone());
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
            dropped: 0,
            total_dropped: self.dropped.clone(),
        }
    }

    /// Events lost by all receivers so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Consuming side of the event stream
pub struct EventReceiver {
    rx: broadcast::Receiver<ExecutionResult>,
    dropped: u64,
    total_dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Next result, or `None` once the engine is gone and the buffer drained
    pub async fn recv(&mut self) -> Option<ExecutionResult> {
        loop {
            match self.rx.recv().await {
                Ok(result) => return Some(result),
                Err(broadcast::error::RecvError::Lagged(n)) => self.count_dropped(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-waiting variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<ExecutionResult> {
        loop {
            match self.rx.try_recv() {
                Ok(result) => return Some(result),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.count_dropped(n),
                Err(_) => return None,
            }
        }
    }

    /// Events this receiver has missed
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn count_dropped(&mut self, n: u64) {
        tracing::warn!(dropped = n, "event observer lagging, oldest events dropped");
        self.dropped += n;
        self.total_dropped.fetch_add(n, Ordering::Relaxed);
    }
}
