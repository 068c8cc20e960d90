// Call path: correlate, sign, send, await, and the single auth retry.

use std::sync::PoisonError;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use shelly_api::{AuthChallenge, AuthFields, ReplyOutcome, RequestFrame};

use super::{GET_COMPONENTS, GET_CONFIG, GET_STATUS, SessionInner, VIRTUAL_COMPONENTS_MIN_FIRMWARE};
use crate::correlator::SnapshotTarget;
use crate::error::CoreError;
use crate::event::SessionEvent;

impl SessionInner {
    /// One logical call. Does not check the lifecycle state; the handshake
    /// and snapshot loading run before `Ready`.
    pub(super) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        target: Option<SnapshotTarget>,
    ) -> Result<Value, CoreError> {
        let signed = self.sign_for_request();
        let outcome = self
            .round_trip(method, params.clone(), timeout, target, signed)
            .await?;

        let message = match outcome {
            ReplyOutcome::Unauthorized { message } => message,
            other => return settle(other),
        };

        let Some(auth) = self.auth_data() else {
            warn!(method, "device demands authentication but no credentials are configured");
            self.emit(SessionEvent::AuthFailed);
            return Err(CoreError::InvalidAuth {
                message: "auth missing and required".into(),
            });
        };

        let challenge = AuthChallenge::parse(&message)?;
        debug!(method, nonce = challenge.nonce, "auth challenge, retrying once");
        let fields = auth.answer(&challenge);
        *self
            .challenge
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(challenge);

        match self
            .round_trip(method, params, timeout, target, Some(fields))
            .await?
        {
            ReplyOutcome::Unauthorized { .. } => {
                warn!(method, "credentials rejected");
                self.emit(SessionEvent::AuthFailed);
                Err(CoreError::InvalidAuth {
                    message: "credentials rejected by device".into(),
                })
            }
            other => settle(other),
        }
    }

    /// Register, send, and wait for exactly one reply frame.
    async fn round_trip(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        target: Option<SnapshotTarget>,
        auth: Option<AuthFields>,
    ) -> Result<ReplyOutcome, CoreError> {
        let (id, reply) = self.correlator.register(method, timeout, target)?;

        let Some(sender) = self.sender.load_full() else {
            self.correlator.cancel(id);
            return Err(CoreError::Disconnected);
        };

        let frame = RequestFrame {
            id,
            src: self.config.client_id.clone(),
            method: method.to_owned(),
            params,
            dst: self.peer.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            auth,
        };

        debug!(id, method, signed = frame.auth.is_some(), "sending request");
        if let Err(e) = sender.send(frame.to_text()).await {
            self.correlator.cancel(id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Disconnected),
            Err(_) => {
                self.correlator.cancel(id);
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(id, method, timeout_ms, "call timed out");
                Err(CoreError::Timeout {
                    method: method.to_owned(),
                    timeout_ms,
                })
            }
        }
    }

    fn auth_data(&self) -> Option<shelly_api::AuthData> {
        self.auth
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Signed fields for a first attempt: reuse the latest challenge if
    /// there is one, otherwise pre-sign.
    fn sign_for_request(&self) -> Option<AuthFields> {
        let auth = self.auth_data()?;
        let challenge = self
            .challenge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Some(match challenge {
            Some(challenge) => auth.answer(&challenge),
            None => auth.presign(),
        })
    }

    // ── Snapshot fetches ─────────────────────────────────────────────

    pub(super) async fn fetch_snapshot(&self, target: SnapshotTarget) -> Result<(), CoreError> {
        let method = match target {
            SnapshotTarget::Config => GET_CONFIG,
            SnapshotTarget::Status => GET_STATUS,
            SnapshotTarget::DynamicComponents => GET_COMPONENTS,
        };
        self.request(method, None, self.config.call_timeout, Some(target))
            .await
            .map(drop)
    }

    /// Merge virtual components when enabled and the firmware serves them.
    ///
    /// A device-side RPC error is logged and ignored.
    pub(super) async fn fetch_dynamic_components(&self) -> Result<(), CoreError> {
        if !self.config.fetch_dynamic_components {
            return Ok(());
        }
        let supported = self
            .device_info
            .load_full()
            .and_then(|info| info.firmware_date())
            .is_some_and(|date| date >= VIRTUAL_COMPONENTS_MIN_FIRMWARE);
        if !supported {
            debug!("firmware predates virtual components, skipping");
            return Ok(());
        }

        let result = self
            .request(
                GET_COMPONENTS,
                Some(json!({ "dynamic_only": true })),
                self.config.call_timeout,
                Some(SnapshotTarget::DynamicComponents),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(CoreError::Rpc { code, message }) => {
                warn!(code, %message, "could not fetch dynamic components");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn settle(outcome: ReplyOutcome) -> Result<Value, CoreError> {
    match outcome {
        ReplyOutcome::Result(value) => Ok(value),
        ReplyOutcome::Error(err) => Err(CoreError::Rpc {
            code: err.code,
            message: err.message,
        }),
        ReplyOutcome::Unauthorized { message } => Err(CoreError::InvalidAuth { message }),
    }
}
