// Inbound dispatch: one task per link, frames handled strictly in order.

use std::sync::atomic::Ordering;
use std::sync::{PoisonError, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use serde_json::Value;
use shelly_api::wire::{self, ErrorReplyFrame};
use shelly_api::{Frame, FrameSender, Inbound, NotifyKind, ReplyOutcome, TransportEvent};

use super::SessionInner;
use crate::correlator::SnapshotTarget;
use crate::error::ProtocolAnomaly;
use crate::event::SessionEvent;
use crate::model::Tree;
use crate::store::Recorded;

pub(super) async fn run(
    weak: Weak<SessionInner>,
    generation: u64,
    sender: FrameSender,
    mut events: mpsc::Receiver<TransportEvent>,
    stop: CancellationToken,
) {
    let reason = loop {
        let event = tokio::select! {
            biased;
            () = stop.cancelled() => {
                debug!(generation, "dispatch stopped");
                return;
            }
            event = events.recv() => event,
        };
        let Some(inner) = weak.upgrade() else { return };

        match event {
            Some(TransportEvent::Frame(Frame::Text(text))) => {
                inner.handle_text(&text, &sender).await;
            }
            Some(TransportEvent::Frame(Frame::Binary(bytes))) => inner.handle_blob(&bytes),
            Some(TransportEvent::Closed) | None => break "closed by device".to_owned(),
            Some(TransportEvent::Error(e)) => break e,
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.on_link_lost(generation, &reason);
    }
}

impl SessionInner {
    async fn handle_text(&self, text: &str, sender: &FrameSender) {
        let inbound = match wire::classify(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.record(ProtocolAnomaly::Malformed { reason: e.reason });
                return;
            }
        };

        if let Some(src) = inbound.src() {
            self.track_peer(src);
        }

        match inbound {
            Inbound::Reply { id, outcome, .. } => self.resolve_reply(id, outcome),
            Inbound::Notification { kind, params, .. } => self.handle_notification(kind, params),
            Inbound::PeerCall { id, method, .. } => {
                debug!(%id, %method, "rejecting call from device");
                let reply = ErrorReplyFrame::not_implemented(id, &self.config.client_id);
                if let Err(e) = sender.send(reply.to_text()).await {
                    debug!(error = %e, "could not answer device call");
                }
            }
        }
    }

    fn resolve_reply(&self, id: u64, outcome: ReplyOutcome) {
        let Some(pending) = self.correlator.take(id) else {
            self.record(ProtocolAnomaly::UnknownReplyId { id });
            return;
        };

        debug!(
            id,
            method = %pending.method,
            elapsed_ms = u64::try_from(pending.submitted_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "reply received"
        );

        // Snapshots land in the tree before the caller wakes.
        if let (Some(target), ReplyOutcome::Result(value)) = (pending.target, &outcome) {
            let applied = match target {
                SnapshotTarget::Config => self.store.apply_snapshot(Tree::Config, value),
                SnapshotTarget::Status => self.store.apply_snapshot(Tree::Status, value),
                SnapshotTarget::DynamicComponents => self.store.apply_dynamic_components(value),
            };
            self.record_applied(applied);
        }

        pending.complete(Ok(outcome));
    }

    fn handle_notification(&self, kind: NotifyKind, params: Value) {
        if !self.is_live() {
            self.record(ProtocolAnomaly::OutOfState {
                kind: notify_name(&kind),
                state: self.current_state().to_string(),
            });
            return;
        }

        match kind {
            NotifyKind::Status => {
                let applied = self.store.apply_delta(&params);
                self.record_applied(applied);
            }
            NotifyKind::FullStatus => {
                let applied = self.store.apply_snapshot(Tree::Status, &params);
                self.record_applied(applied);
            }
            NotifyKind::Event => {
                debug!("device event");
                self.emit(SessionEvent::DeviceEvent(params));
            }
            NotifyKind::Other(method) => {
                self.record(ProtocolAnomaly::UnhandledNotification { method });
            }
        }
    }

    fn handle_blob(&self, bytes: &[u8]) {
        if !self.is_live() {
            self.record(ProtocolAnomaly::OutOfState {
                kind: "binary frame".into(),
                state: self.current_state().to_string(),
            });
            return;
        }

        let decoder = self
            .blob_decoder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(decoder) = decoder else {
            self.record(ProtocolAnomaly::UndecodableBlob {
                reason: "no blob decoder configured".into(),
            });
            return;
        };

        match decoder.decode_state_blob(bytes) {
            Ok(partial) => {
                // The first blob seeds the status tree.
                let applied = if self.store.snapshot().has_status() {
                    self.store.apply_delta(&partial)
                } else {
                    self.store.apply_snapshot(Tree::Status, &partial)
                };
                self.record_applied(applied);
            }
            Err(e) => self.record(ProtocolAnomaly::UndecodableBlob { reason: e.0 }),
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn record_applied(&self, applied: Result<Recorded, ProtocolAnomaly>) {
        match applied {
            Ok(recorded) => recorded.into_iter().for_each(|a| self.record(a)),
            Err(anomaly) => self.record(anomaly),
        }
    }

    /// Remember the device's `src` so requests can address it.
    fn track_peer(&self, src: &str) {
        let previous = {
            let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
            if peer.as_deref() == Some(src) {
                return;
            }
            peer.replace(src.to_owned())
        };
        if let Some(from) = previous {
            self.record(ProtocolAnomaly::PeerChanged {
                from,
                to: src.to_owned(),
            });
        }
    }
}

fn notify_name(kind: &NotifyKind) -> String {
    match kind {
        NotifyKind::Status => wire::NOTIFY_STATUS.to_owned(),
        NotifyKind::FullStatus => wire::NOTIFY_FULL_STATUS.to_owned(),
        NotifyKind::Event => wire::NOTIFY_EVENT.to_owned(),
        NotifyKind::Other(method) => method.clone(),
    }
}
