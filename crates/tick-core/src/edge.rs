use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::point::Message;

/// Default bounded capacity for task edges.
pub const DEFAULT_EDGE_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Edge — bounded single-producer/single-consumer transport
// ---------------------------------------------------------------------------

/// Shared counters for one edge, read by `describe()`.
#[derive(Debug, Default)]
pub struct EdgeStats {
    pub emitted: AtomicU64,
    pub collected: AtomicU64,
}

/// Create a bounded edge. The producer blocks when the queue is full, the
/// consumer blocks when it is empty; dropping the producer closes the edge
/// exactly once and the consumer drains what remains.
pub fn edge(capacity: usize) -> (EdgeTx, EdgeRx) {
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(EdgeStats::default());
    (
        EdgeTx {
            tx,
            stats: Arc::clone(&stats),
        },
        EdgeRx { rx, stats },
    )
}

#[derive(Debug, thiserror::Error)]
#[error("edge closed")]
pub struct EdgeClosed;

#[derive(Clone)]
pub struct EdgeTx {
    tx: mpsc::Sender<Message>,
    stats: Arc<EdgeStats>,
}

impl EdgeTx {
    pub async fn send(&self, msg: Message) -> Result<(), EdgeClosed> {
        self.tx.send(msg).await.map_err(|_| EdgeClosed)?;
        self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> Arc<EdgeStats> {
        Arc::clone(&self.stats)
    }
}

pub struct EdgeRx {
    rx: mpsc::Receiver<Message>,
    stats: Arc<EdgeStats>,
}

impl EdgeRx {
    /// Receive the next message; None once the producer has closed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await;
        if msg.is_some() {
            self.stats.collected.fetch_add(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn stats(&self) -> Arc<EdgeStats> {
        Arc::clone(&self.stats)
    }
}

/// Fan a message out to every downstream edge. Returns false when every
/// consumer has gone away (shutdown is in progress).
pub async fn send_all(outs: &[EdgeTx], msg: &Message) -> bool {
    let mut delivered = outs.is_empty();
    for out in outs {
        if out.send(msg.clone()).await.is_ok() {
            delivered = true;
        }
    }
    delivered
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
