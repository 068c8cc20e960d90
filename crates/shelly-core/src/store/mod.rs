// ── State synchronizer ──
//
// Copy-on-write device state with push-based change notification.

mod apply;
mod device_store;
mod feed;
pub mod merge;

pub use apply::Recorded;
pub use device_store::DeviceStore;
