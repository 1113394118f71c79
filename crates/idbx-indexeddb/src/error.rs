//! Error types for the IndexedDB engine

use idbx_core::{EngineError, EngineErrorKind};
use thiserror::Error;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::DomException;

/// Result type for browser-side setup
pub type Result<T> = std::result::Result<T, IndexedDbError>;

/// Failures outside of a DOMException: setup and value conversion
#[derive(Debug, Error)]
pub enum IndexedDbError {
    /// IndexedDB is not available in this environment
    #[error("IndexedDB not available: {0}")]
    NotAvailable(String),

    /// Optional browser API missing (e.g. `indexedDB.databases()`)
    #[error("IndexedDB feature not supported: {0}")]
    Unsupported(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JavaScript value conversion error
    #[error("JS conversion error: {0}")]
    JsValue(String),
}

impl From<JsValue> for IndexedDbError {
    fn from(val: JsValue) -> Self {
        let msg = js_sys::JSON::stringify(&val)
            .map(String::from)
            .unwrap_or_else(|_| format!("{:?}", val));
        IndexedDbError::JsValue(msg)
    }
}

/// Map setup and conversion failures onto engine error kinds
impl From<IndexedDbError> for EngineError {
    fn from(err: IndexedDbError) -> Self {
        let kind = match err {
            IndexedDbError::NotAvailable(_) => EngineErrorKind::InvalidState,
            IndexedDbError::Unsupported(_) => EngineErrorKind::NotFound,
            IndexedDbError::Json(_) | IndexedDbError::JsValue(_) => EngineErrorKind::Data,
        };
        EngineError::new(kind, err.to_string())
    }
}

/// Engine error for a DOMException.
pub fn dom_error(exception: &DomException) -> EngineError {
    EngineError::new(
        EngineErrorKind::from_name(&exception.name()),
        exception.message(),
    )
}

/// Engine error for a value thrown by a synchronous IndexedDB call.
pub fn js_error(value: JsValue) -> EngineError {
    if let Some(exception) = value.dyn_ref::<DomException>() {
        return dom_error(exception);
    }
    if let Some(error) = value.dyn_ref::<js_sys::Error>() {
        let name = String::from(error.name());
        return EngineError::new(EngineErrorKind::from_name(&name), String::from(error.message()));
    }
    IndexedDbError::from(value).into()
}
