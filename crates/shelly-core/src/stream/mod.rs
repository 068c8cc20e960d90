// ── Reactive state streams ──
//
// Subscription types for consuming device state from the DeviceStore.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;

use crate::model::{DeviceState, StateChange};

/// A subscription to the whole device state.
///
/// Provides both point-in-time snapshot access and reactive change
/// notification via the `changed()` method or by converting to a `Stream`.
pub struct StateStream {
    current: Arc<DeviceState>,
    receiver: watch::Receiver<Arc<DeviceState>>,
}

impl StateStream {
    pub(crate) fn new(receiver: watch::Receiver<Arc<DeviceState>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// Get the snapshot captured at creation time (or at the last `changed()`).
    pub fn current(&self) -> &Arc<DeviceState> {
        &self.current
    }

    /// Get the latest snapshot (may have changed since creation).
    pub fn latest(&self) -> Arc<DeviceState> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next update, returning the new snapshot.
    /// Returns `None` once the session has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<DeviceState>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> StateWatchStream {
        StateWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `watch::Receiver`.
///
/// Yields the current snapshot first, then a new one after each update.
/// Intermediate snapshots may be skipped by a slow reader.
pub struct StateWatchStream {
    inner: WatchStream<Arc<DeviceState>>,
}

impl Stream for StateWatchStream {
    type Item = Arc<DeviceState>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Per-component change events.
///
/// Unlike [`StateStream`] nothing is coalesced: every component of every
/// applied update arrives, in order.
pub struct ChangeStream {
    receiver: mpsc::UnboundedReceiver<StateChange>,
}

impl ChangeStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<StateChange>) -> Self {
        Self { receiver }
    }

    /// Next change, or `None` once the session has been dropped.
    pub async fn recv(&mut self) -> Option<StateChange> {
        self.receiver.recv().await
    }

    /// Next change if one is already queued.
    pub fn try_recv(&mut self) -> Option<StateChange> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for ChangeStream {
    type Item = StateChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
