// ── Canonical device state ──
//
// Copy-on-write store for the config/status tree. The dispatch task is the
// only writer; every applied update is published as a fresh
// `Arc<DeviceState>` through a `watch` channel and then fanned out as
// per-component change events.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use super::feed::ChangeFeed;
use crate::model::{DeviceState, StateChange};
use crate::stream::{ChangeStream, StateStream};

/// Central reactive store for one device's state.
#[derive(Debug)]
pub struct DeviceStore {
    current: watch::Sender<Arc<DeviceState>>,
    feed: ChangeFeed,
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore {
    pub fn new() -> Self {
        let (current, _) = watch::channel(Arc::new(DeviceState::default()));
        Self {
            current,
            feed: ChangeFeed::default(),
        }
    }

    // ── Readers ──────────────────────────────────────────────────────

    /// The latest fully applied state.
    pub fn snapshot(&self) -> Arc<DeviceState> {
        self.current.borrow().clone()
    }

    /// Whole-state subscription: yields a new snapshot after each update.
    pub fn watch(&self) -> StateStream {
        StateStream::new(self.current.subscribe())
    }

    /// Per-component change events, one per component per applied update.
    pub fn subscribe(&self) -> ChangeStream {
        self.feed.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    // ── Writer ───────────────────────────────────────────────────────

    /// Owned copy of the current state to build the next one from.
    /// Component payloads stay shared until modified.
    pub(super) fn working_copy(&self) -> DeviceState {
        DeviceState::clone(&self.current.borrow())
    }

    /// Publish `next` atomically, then notify subscribers.
    pub(super) fn publish(&self, mut next: DeviceState, changes: &[StateChange]) {
        next.updated_at = Some(Utc::now());
        self.current.send_replace(Arc::new(next));
        self.feed.publish(changes);
    }
}
