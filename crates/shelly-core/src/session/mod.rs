// ── Session controller ──
//
// Full lifecycle management for one device connection: probe, link,
// authentication, initial snapshots, dispatch of inbound frames, and
// reconnection with backoff. The public `Session` handle is cheaply
// cloneable; all clones drive the same connection.

mod dispatch;
mod lifecycle;
mod request;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shelly_api::{AuthChallenge, AuthData, DeviceInfo, FrameSender, Transport, WsTransport};

use crate::backoff::Backoff;
use crate::collab::{BlobDecoder, ComponentCatalog, ComponentMeta};
use crate::config::SessionConfig;
use crate::correlator::{Correlator, SnapshotTarget};
use crate::error::{CoreError, ProtocolAnomaly};
use crate::event::SessionEvent;
use crate::model::{ComponentKey, DeviceState};
use crate::store::DeviceStore;
use crate::stream::{ChangeStream, StateStream};

const EVENT_CHANNEL_SIZE: usize = 256;

pub(crate) const GET_CONFIG: &str = "Shelly.GetConfig";
pub(crate) const GET_STATUS: &str = "Shelly.GetStatus";
pub(crate) const GET_COMPONENTS: &str = "Shelly.GetComponents";

/// First firmware build date that serves `Shelly.GetComponents`.
pub const VIRTUAL_COMPONENTS_MIN_FIRMWARE: u32 = 20_240_213;

// ── SessionState ─────────────────────────────────────────────────────

/// Lifecycle state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting { attempt: u32 },
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Ready => f.write_str("ready"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<SessionInner>`. Created `Disconnected`;
/// call [`connect()`](Self::connect) to bring the link up and
/// [`close()`](Self::close) to tear everything down for good.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Bookkeeping for the current link, guarded by one lock so that link
/// loss is handled exactly once.
#[derive(Debug, Default)]
struct LinkSlot {
    generation: u64,
    /// Shuts the transport link down.
    closer: Option<CancellationToken>,
    /// Stops the dispatch task without reporting a loss.
    stop: Option<CancellationToken>,
    establishing: bool,
    lost: bool,
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    store: DeviceStore,
    correlator: Correlator,
    state: watch::Sender<SessionState>,
    event_tx: broadcast::Sender<SessionEvent>,
    sender: ArcSwapOption<FrameSender>,
    link: Mutex<LinkSlot>,
    device_info: ArcSwapOption<DeviceInfo>,
    auth: Mutex<Option<AuthData>>,
    challenge: Mutex<Option<AuthChallenge>>,
    peer: Mutex<Option<String>>,
    backoff: Mutex<Backoff>,
    blob_decoder: RwLock<Option<Arc<dyn BlobDecoder>>>,
    catalog: RwLock<Option<Arc<dyn ComponentCatalog>>>,
    anomalies: AtomicU64,
    /// The current link finished its handshake; notifications apply.
    live: AtomicBool,
    reconnect_epoch: AtomicU64,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create a session over the WebSocket transport. Does NOT connect.
    pub fn new(config: SessionConfig) -> Result<Self, CoreError> {
        config.options.validate()?;
        let transport = WsTransport::new(
            &config.options.host,
            config.options.port,
            config.call_timeout,
        )?
        .with_expected_mac(config.options.device_mac.clone());
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create a session over any transport (simulators, tests).
    pub fn with_transport(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let backoff = Backoff::new(config.reconnect.clone());

        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                store: DeviceStore::new(),
                correlator: Correlator::new(),
                state,
                event_tx,
                sender: ArcSwapOption::empty(),
                link: Mutex::new(LinkSlot::default()),
                device_info: ArcSwapOption::empty(),
                auth: Mutex::new(None),
                challenge: Mutex::new(None),
                peer: Mutex::new(None),
                backoff: Mutex::new(backoff),
                blob_decoder: RwLock::new(None),
                catalog: RwLock::new(None),
                anomalies: AtomicU64::new(0),
                live: AtomicBool::new(false),
                reconnect_epoch: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Decoder for legacy binary state frames.
    pub fn set_blob_decoder(&self, decoder: Arc<dyn BlobDecoder>) {
        *self
            .inner
            .blob_decoder
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(decoder);
    }

    /// Metadata source for [`describe()`](Self::describe).
    pub fn set_catalog(&self, catalog: Arc<dyn ComponentCatalog>) {
        *self
            .inner
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(catalog);
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Probe the device, open the link, authenticate if required, and
    /// load the initial config and status snapshots.
    ///
    /// The session reports `Ready`, and accepts calls, only once that
    /// state is loaded. A no-op if already `Ready`.
    pub async fn connect(&self) -> Result<(), CoreError> {
        self.inner.connect().await
    }

    /// Tear the session down for good.
    ///
    /// Fails every outstanding call with `Disconnected`, closes the link,
    /// and joins background tasks. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Invoke a method with the configured default timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CoreError> {
        self.call_with_timeout(method, params, self.inner.config.call_timeout)
            .await
    }

    /// Invoke a method with an explicit timeout.
    ///
    /// Only a `Ready` session accepts calls; otherwise this fails
    /// immediately with [`CoreError::Disconnected`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        self.inner.ensure_ready()?;
        self.inner.request(method, params, timeout, None).await
    }

    /// `Shelly.Reboot` after `delay_ms`.
    pub async fn reboot(&self, delay_ms: u64) -> Result<(), CoreError> {
        self.call("Shelly.Reboot", Some(json!({ "delay_ms": delay_ms })))
            .await
            .map(drop)
    }

    /// `Shelly.Update` from the stable or beta channel.
    pub async fn trigger_ota_update(&self, beta: bool) -> Result<(), CoreError> {
        let stage = if beta { "beta" } else { "stable" };
        self.call("Shelly.Update", Some(json!({ "stage": stage })))
            .await
            .map(drop)
    }

    /// Re-fetch the full status tree (plus virtual components).
    pub async fn refresh_status(&self) -> Result<(), CoreError> {
        self.inner.ensure_ready()?;
        self.inner.fetch_snapshot(SnapshotTarget::Status).await?;
        self.inner.fetch_dynamic_components().await
    }

    /// Re-fetch the full config tree (plus virtual components).
    pub async fn refresh_config(&self) -> Result<(), CoreError> {
        self.inner.ensure_ready()?;
        self.inner.fetch_snapshot(SnapshotTarget::Config).await?;
        self.inner.fetch_dynamic_components().await
    }

    // ── State observation ────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to the session event broadcast.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Latest fully applied device state.
    pub fn snapshot(&self) -> Arc<DeviceState> {
        self.inner.store.snapshot()
    }

    /// Per-component change events.
    pub fn subscribe(&self) -> ChangeStream {
        self.inner.store.subscribe()
    }

    /// Whole-state snapshots as they are published.
    pub fn watch_state(&self) -> StateStream {
        self.inner.store.watch()
    }

    /// Identity reported by the last probe.
    pub fn device_info(&self) -> Option<Arc<DeviceInfo>> {
        self.inner.device_info.load_full()
    }

    /// Unit and range metadata for a component the device has.
    pub fn describe(&self, key: &ComponentKey) -> Option<ComponentMeta> {
        let catalog = self
            .inner
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        self.snapshot().describe(key, catalog.as_ref())
    }

    /// Anomalies recorded since the session was created.
    pub fn anomaly_count(&self) -> u64 {
        self.inner.anomalies.load(Ordering::Relaxed)
    }

    /// Calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_count()
    }
}

// ── Shared helpers ───────────────────────────────────────────────────

impl SessionInner {
    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Publish a new state. `Closed` is never left.
    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "session state");
            *current = next;
            true
        });
    }

    fn ensure_ready(&self) -> Result<(), CoreError> {
        if self.current_state() == SessionState::Ready {
            Ok(())
        } else {
            Err(CoreError::Disconnected)
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Log and broadcast a dropped or suspicious frame.
    fn record(&self, anomaly: ProtocolAnomaly) {
        tracing::warn!(host = %self.config.options.host, %anomaly, "protocol anomaly");
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        self.emit(SessionEvent::Anomaly(anomaly));
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut handles = self
            .task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        let slot = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        for token in [slot.stop.take(), slot.closer.take()].into_iter().flatten() {
            token.cancel();
        }
    }
}
