// shelly-core: session engine between shelly-api and consumers.

pub mod backoff;
pub mod collab;
pub mod config;
pub mod correlator;
pub mod error;
pub mod event;
pub mod model;
pub mod session;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use collab::{BlobDecodeError, BlobDecoder, ComponentCatalog, ComponentMeta};
pub use config::{ConnectionOptions, ReconnectConfig, SessionConfig};
pub use error::{CoreError, ProtocolAnomaly};
pub use event::SessionEvent;
pub use session::{Session, SessionState, VIRTUAL_COMPONENTS_MIN_FIRMWARE};
pub use store::DeviceStore;
pub use stream::{ChangeStream, StateStream};

pub use model::{
    ComponentKey, ComponentKind, ComponentTree, ComponentView, DeviceState, Fields, StateChange,
    Tree,
};

// Wire types consumers routinely touch.
pub use shelly_api::{DeviceInfo, Transport};
