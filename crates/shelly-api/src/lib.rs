// shelly-api: wire-level client pieces for Shelly RPC-generation devices

pub mod auth;
pub mod error;
pub mod info;
pub mod transport;
pub mod websocket;
pub mod wire;

pub use auth::{AuthChallenge, AuthData, AuthFields};
pub use error::Error;
pub use info::DeviceInfo;
pub use transport::{Frame, FrameSender, Link, MemoryPeer, Transport, TransportEvent};
pub use websocket::WsTransport;
pub use wire::{Inbound, MalformedFrame, NotifyKind, ReplyOutcome, RequestFrame, RpcErrorBody};
