// ── External collaborators ──
//
// Hooks for functionality that lives outside the session engine: decoding
// the legacy binary state blob and looking up per-component metadata.
// Hosts plug implementations into `Session::set_blob_decoder` and
// `Session::set_catalog`.

use serde_json::Value;

use crate::model::ComponentKey;

/// A binary state blob that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BlobDecodeError(pub String);

/// Turns a legacy binary frame into a partial status tree.
///
/// The decoded value must have the same shape as a status notification's
/// params: an object keyed by component key.
pub trait BlobDecoder: Send + Sync {
    fn decode_state_blob(&self, bytes: &[u8]) -> Result<Value, BlobDecodeError>;
}

/// Display metadata for one component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentMeta {
    pub unit: Option<String>,
    pub value_range: Option<(f64, f64)>,
}

/// Device-model metadata tables.
pub trait ComponentCatalog: Send + Sync {
    fn describe(&self, key: &ComponentKey) -> Option<ComponentMeta>;
}
