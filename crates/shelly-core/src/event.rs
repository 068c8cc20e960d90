// ── Session events ──

use serde_json::Value;

use crate::error::{CoreError, ProtocolAnomaly};

/// Out-of-band happenings broadcast to every [`Session::events`](crate::Session::events)
/// receiver.
///
/// State-tree changes are not repeated here; use
/// [`Session::subscribe`](crate::Session::subscribe) for those.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Config and status snapshots are in place after a (re)connect.
    Initialized,
    /// A `NotifyEvent` from the device, e.g. button presses.
    DeviceEvent(Value),
    /// An inbound frame was malformed or unexpected and has been dropped.
    Anomaly(ProtocolAnomaly),
    /// The link went down.
    Disconnected,
    /// One reconnection attempt failed.
    ReconnectFailed { attempt: u32, error: CoreError },
    /// The device rejected our credentials.
    AuthFailed,
}
