// ── Device domain model ──
//
// Typed component keys and the canonical config/status tree that the
// session keeps in sync with the device.

pub mod component;
pub mod state;

pub use component::{ComponentKey, ComponentKind, InvalidComponentKey};
pub use state::{ComponentTree, ComponentView, DeviceState, Fields, StateChange, Tree};
