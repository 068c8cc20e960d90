// Connect, reconnect, and close.
//
// `establish` is the one path from `Connecting` to a loaded `Ready`
// session; both `connect()` and the reconnect supervisor go through it
// while holding the connect lock.

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shelly_api::{AuthData, DeviceInfo, FrameSender};

use super::{SessionInner, SessionState, dispatch};
use crate::correlator::SnapshotTarget;
use crate::error::CoreError;
use crate::event::SessionEvent;

impl SessionInner {
    pub(super) async fn connect(self: &Arc<Self>) -> Result<(), CoreError> {
        let _guard = self.connect_lock.lock().await;
        match self.current_state() {
            SessionState::Ready => return Ok(()),
            SessionState::Closed => return Err(CoreError::Disconnected),
            _ => {}
        }

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(CoreError::Disconnected),
            result = self.establish() => result,
        };

        if let Err(ref e) = result {
            warn!(host = %self.config.options.host, error = %e, "connect failed");
            self.abandon_link();
            self.set_state(SessionState::Disconnected);
        }
        result
    }

    /// Probe, open, authenticate, and load state.
    async fn establish(self: &Arc<Self>) -> Result<(), CoreError> {
        let endpoint = self.transport.endpoint();
        self.set_state(SessionState::Connecting);
        info!(host = %endpoint, "connecting to device");

        let info = self.transport.probe().await?;
        let requires_auth = info.requires_auth()?;
        let auth = if requires_auth {
            Some(self.credentials_for(&info)?)
        } else {
            None
        };
        debug!(
            id = %info.id,
            fw = info.fw_id.as_deref().unwrap_or("?"),
            auth = requires_auth,
            "device probed"
        );
        *self.auth.lock().unwrap_or_else(PoisonError::into_inner) = auth;
        *self.challenge.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.device_info.store(Some(Arc::new(info)));

        let link = self.transport.open().await?;
        let (sender, events, closer) = link.into_parts();
        let (generation, stop) = self.install_link(sender.clone(), closer);
        self.track_task(tokio::spawn(dispatch::run(
            Arc::downgrade(self),
            generation,
            sender,
            events,
            stop,
        )));

        let mut config_loaded = false;
        if requires_auth {
            self.set_state(SessionState::Authenticating);
            self.fetch_snapshot(SnapshotTarget::Config).await?;
            config_loaded = true;
            debug!(host = %endpoint, "authenticated");
        }

        // The link is usable from here on; callers are admitted once the
        // snapshots are in.
        self.live.store(true, Ordering::SeqCst);
        if !config_loaded {
            self.fetch_snapshot(SnapshotTarget::Config).await?;
        }
        self.fetch_snapshot(SnapshotTarget::Status).await?;
        self.fetch_dynamic_components().await?;

        // A loss observed after this point goes through the reconnect path.
        let lost = {
            let mut slot = self.link.lock().unwrap_or_else(PoisonError::into_inner);
            slot.establishing = false;
            if !slot.lost {
                self.reconnect_epoch.fetch_add(1, Ordering::SeqCst);
                self.backoff
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .reset();
                self.set_state(SessionState::Ready);
            }
            slot.lost
        };
        if lost {
            return Err(CoreError::Disconnected);
        }

        info!(host = %endpoint, "session ready");
        self.emit(SessionEvent::Initialized);
        Ok(())
    }

    fn credentials_for(&self, info: &DeviceInfo) -> Result<AuthData, CoreError> {
        let opts = &self.config.options;
        match (&opts.username, &opts.password) {
            (Some(username), Some(password)) => {
                Ok(AuthData::new(info.realm(), username, password))
            }
            _ => {
                self.emit(SessionEvent::AuthFailed);
                Err(CoreError::InvalidAuth {
                    message: "auth missing and required".into(),
                })
            }
        }
    }

    // ── Link bookkeeping ─────────────────────────────────────────────

    /// Make a freshly opened link current. Returns its generation and the
    /// token that stops its dispatch task.
    fn install_link(&self, sender: FrameSender, closer: CancellationToken) -> (u64, CancellationToken) {
        let stop = CancellationToken::new();
        let generation = {
            let mut slot = self.link.lock().unwrap_or_else(PoisonError::into_inner);
            slot.generation += 1;
            for old in [slot.stop.replace(stop.clone()), slot.closer.replace(closer)]
                .into_iter()
                .flatten()
            {
                old.cancel();
            }
            slot.establishing = true;
            slot.lost = false;
            slot.generation
        };
        self.live.store(false, Ordering::SeqCst);
        self.sender.store(Some(Arc::new(sender)));
        self.correlator.reopen();
        (generation, stop)
    }

    /// Drop the current link on our own initiative. Pending calls fail.
    fn abandon_link(&self) {
        {
            let mut slot = self.link.lock().unwrap_or_else(PoisonError::into_inner);
            slot.generation += 1;
            slot.establishing = false;
            for token in [slot.stop.take(), slot.closer.take()].into_iter().flatten() {
                token.cancel();
            }
        }
        self.live.store(false, Ordering::SeqCst);
        self.sender.store(None);
        self.correlator.fail_all();
    }

    /// Called by a dispatch task whose link ended. Stale generations are
    /// ignored, so each link loss is handled once.
    pub(super) fn on_link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let establishing = {
            let mut slot = self.link.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.generation != generation || slot.lost {
                return;
            }
            slot.lost = true;
            self.live.store(false, Ordering::SeqCst);
            for token in [slot.stop.take(), slot.closer.take()].into_iter().flatten() {
                token.cancel();
            }
            slot.establishing
        };

        // Pending calls fail before anyone can observe the new state.
        let failed = self.correlator.fail_all();
        self.sender.store(None);
        warn!(host = %self.config.options.host, reason, failed, "link lost");
        self.emit(SessionEvent::Disconnected);

        if establishing {
            // The in-flight connect sees its calls fail and reports it.
            return;
        }

        match self.current_state() {
            SessionState::Closed => {}
            SessionState::Ready if self.config.auto_reconnect && !self.cancel.is_cancelled() => {
                self.start_reconnect();
            }
            _ => self.set_state(SessionState::Disconnected),
        }
    }

    fn start_reconnect(self: &Arc<Self>) {
        let epoch = self.reconnect_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let attempt = self
            .backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempt()
            + 1;
        self.set_state(SessionState::Reconnecting { attempt });
        self.track_task(tokio::spawn(reconnect_loop(Arc::downgrade(self), epoch)));
    }

    fn superseded(&self, epoch: u64) -> bool {
        self.reconnect_epoch.load(Ordering::SeqCst) != epoch
    }

    // ── Close ────────────────────────────────────────────────────────

    pub(super) async fn close(&self) {
        self.cancel.cancel();
        self.abandon_link();
        self.set_state(SessionState::Closed);

        let handles: Vec<_> = self
            .task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!(host = %self.config.options.host, "session closed");
    }
}

/// Reconnect with backoff until a link is `Ready` again, attempts run out,
/// the session closes, or a newer loss supersedes this loop.
async fn reconnect_loop(weak: Weak<SessionInner>, epoch: u64) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        if inner.superseded(epoch) {
            return;
        }

        let step = {
            let mut backoff = inner.backoff.lock().unwrap_or_else(PoisonError::into_inner);
            if backoff.exhausted() {
                None
            } else {
                Some((backoff.attempt() + 1, backoff.next_delay()))
            }
        };
        let Some((attempt, delay)) = step else {
            error!(host = %inner.config.options.host, "reconnect attempts exhausted, giving up");
            inner.set_state(SessionState::Disconnected);
            return;
        };

        inner.set_state(SessionState::Reconnecting { attempt });
        info!(
            host = %inner.config.options.host,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );

        let cancel = inner.cancel.clone();
        drop(inner);
        if !sleep_unless_cancelled(&cancel, delay).await {
            return;
        }

        let Some(inner) = weak.upgrade() else { return };
        let result = {
            let _guard = inner.connect_lock.lock().await;
            if inner.superseded(epoch)
                || matches!(inner.current_state(), SessionState::Ready | SessionState::Closed)
            {
                return;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = inner.establish() => result,
            }
        };

        match result {
            Ok(()) => {
                info!(host = %inner.config.options.host, attempt, "reconnected");
                return;
            }
            Err(e) => {
                inner.abandon_link();
                if e.is_terminal() {
                    error!(host = %inner.config.options.host, error = %e, "reconnect failed permanently");
                    inner.set_state(SessionState::Disconnected);
                    return;
                }
                warn!(host = %inner.config.options.host, attempt, error = %e, "reconnect attempt failed");
                inner.emit(SessionEvent::ReconnectFailed { attempt, error: e });
            }
        }
    }
}

async fn sleep_unless_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
