// ── Per-subscriber change queues ──

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::model::StateChange;
use crate::stream::ChangeStream;

/// Fans state changes out to every live subscriber.
///
/// Each subscriber owns an unbounded queue, so a slow reader never stalls
/// dispatch and never misses a change. Queues whose reader is gone are
/// pruned on the next publish.
#[derive(Debug, Default)]
pub(crate) struct ChangeFeed {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StateChange>>>,
}

impl ChangeFeed {
    pub(crate) fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        ChangeStream::new(rx)
    }

    pub(crate) fn publish(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| changes.iter().all(|c| tx.send(c.clone()).is_ok()));
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
