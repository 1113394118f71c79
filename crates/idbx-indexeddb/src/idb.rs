//! Low-level IndexedDB helpers using web-sys
//!
//! Attaches Rust handlers to `IdbRequest` success/error events and converts between
//! JSON records, keys and JS values.

use std::cell::{Cell, RefCell};
use std::ops::Bound;
use std::rc::Rc;

use idbx_core::engine::{
    CursorHandler, CursorRequest, ErrorHandler, NativeRequest, SuccessHandler,
};
use idbx_core::{EngineError, EngineErrorKind, EngineResult, Key, KeyRange};
use js_sys::Promise;
use serde_json::Value;
use tracing::debug;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{IdbCursor, IdbFactory, IdbKeyRange, IdbRequest, IdbTransaction};

use crate::engine::WebKeyCursor;
use crate::error::{dom_error, js_error, IndexedDbError, Result};

type EventClosure = Closure<dyn FnMut(web_sys::Event)>;

/// Closure kept alive until its request settles (the upgrade handler of an open request).
pub(crate) type UpgradeClosure = Closure<dyn FnMut(web_sys::IdbVersionChangeEvent)>;

/// Get the global IndexedDB factory.
pub fn idb_factory() -> Result<IdbFactory> {
    let global = js_sys::global();

    let idb: JsValue = js_sys::Reflect::get(&global, &"indexedDB".into())
        .map_err(|_| IndexedDbError::NotAvailable("no indexedDB on global".into()))?;

    if idb.is_undefined() || idb.is_null() {
        return Err(IndexedDbError::NotAvailable(
            "indexedDB is null/undefined".into(),
        ));
    }

    idb.dyn_into::<IdbFactory>()
        .map_err(|_| IndexedDbError::NotAvailable("indexedDB is not IdbFactory".into()))
}

enum Source {
    Request {
        request: IdbRequest,
        upgrade: Option<UpgradeClosure>,
    },
    Promise(Promise),
}

/// A pending IndexedDB request (or promise) and how to decode its result.
pub struct WebRequest<T> {
    source: Source,
    decode: fn(JsValue) -> EngineResult<T>,
}

impl<T> WebRequest<T> {
    pub(crate) fn new(request: IdbRequest, decode: fn(JsValue) -> EngineResult<T>) -> Self {
        Self {
            source: Source::Request {
                request,
                upgrade: None,
            },
            decode,
        }
    }

    pub(crate) fn open(
        request: IdbRequest,
        upgrade: UpgradeClosure,
        decode: fn(JsValue) -> EngineResult<T>,
    ) -> Self {
        Self {
            source: Source::Request {
                request,
                upgrade: Some(upgrade),
            },
            decode,
        }
    }

    pub(crate) fn from_promise(promise: Promise, decode: fn(JsValue) -> EngineResult<T>) -> Self {
        Self {
            source: Source::Promise(promise),
            decode,
        }
    }
}

impl<T: 'static> NativeRequest for WebRequest<T> {
    type Output = T;

    fn on_settled(self, on_success: SuccessHandler<T>, on_error: ErrorHandler) {
        let decode = self.decode;
        match self.source {
            Source::Request { request, upgrade } => {
                attach(request, upgrade, decode, on_success, on_error)
            }
            Source::Promise(promise) => wasm_bindgen_futures::spawn_local(async move {
                match wasm_bindgen_futures::JsFuture::from(promise).await {
                    Ok(value) => match decode(value) {
                        Ok(result) => on_success(result),
                        Err(e) => on_error(e),
                    },
                    Err(e) => on_error(js_error(e)),
                }
            }),
        }
    }
}

fn request_error(request: &IdbRequest) -> EngineError {
    match request.error() {
        Ok(Some(exception)) => dom_error(&exception),
        _ => EngineError::new(EngineErrorKind::Unknown, "unknown IDB error"),
    }
}

fn attach<T: 'static>(
    request: IdbRequest,
    upgrade: Option<UpgradeClosure>,
    decode: fn(JsValue) -> EngineResult<T>,
    on_success: SuccessHandler<T>,
    on_error: ErrorHandler,
) {
    type Handlers<T> = (SuccessHandler<T>, ErrorHandler);
    type Kept = (EventClosure, EventClosure, Option<UpgradeClosure>);

    let handlers: Rc<RefCell<Option<Handlers<T>>>> =
        Rc::new(RefCell::new(Some((on_success, on_error))));
    // Store closures in Rc<RefCell> to manage their lifetime without leaking
    let closures: Rc<RefCell<Option<Kept>>> = Rc::new(RefCell::new(None));

    let req_s = request.clone();
    let handlers_s = handlers.clone();
    let closures_s = closures.clone();
    let success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
        let taken = handlers_s.borrow_mut().take();
        if let Some((on_success, on_error)) = taken {
            match req_s.result().map_err(js_error).and_then(decode) {
                Ok(value) => on_success(value),
                Err(e) => on_error(e),
            }
        }
        *closures_s.borrow_mut() = None;
    }) as Box<dyn FnMut(web_sys::Event)>);

    let req_e = request.clone();
    let closures_e = closures.clone();
    let error = Closure::wrap(Box::new(move |_event: web_sys::Event| {
        let taken = handlers.borrow_mut().take();
        if let Some((_, on_error)) = taken {
            on_error(request_error(&req_e));
        }
        *closures_e.borrow_mut() = None;
    }) as Box<dyn FnMut(web_sys::Event)>);

    request.set_onsuccess(Some(success.as_ref().unchecked_ref()));
    request.set_onerror(Some(error.as_ref().unchecked_ref()));

    // Keep everything alive until one of the signals fires
    *closures.borrow_mut() = Some((success, error, upgrade));
}

thread_local! {
    static LIVE_WALKS: Cell<usize> = Cell::new(0);
}

/// Cursor walks on this thread whose event handlers are still registered.
pub fn live_cursor_walks() -> usize {
    LIVE_WALKS.with(Cell::get)
}

/// Handlers of one cursor walk. Dropping them unhooks the transaction listeners.
struct WalkClosures {
    _success: EventClosure,
    _error: EventClosure,
    finish: Option<(IdbTransaction, EventClosure)>,
}

impl WalkClosures {
    fn new(
        success: EventClosure,
        error: EventClosure,
        finish: Option<(IdbTransaction, EventClosure)>,
    ) -> Self {
        LIVE_WALKS.with(|live| live.set(live.get() + 1));
        Self {
            _success: success,
            _error: error,
            finish,
        }
    }
}

impl Drop for WalkClosures {
    fn drop(&mut self) {
        if let Some((tx, _)) = &self.finish {
            tx.set_oncomplete(None);
            tx.set_onabort(None);
        }
        LIVE_WALKS.with(|live| live.set(live.get().saturating_sub(1)));
    }
}

/// `openKeyCursor` request: success fires once per cursor step.
///
/// The walk's handlers live until the cursor runs out, the request fails, or the
/// transaction completes or aborts (a navigator that stops early).
pub struct WebCursorRequest {
    request: IdbRequest,
}

impl WebCursorRequest {
    pub(crate) fn new(request: IdbRequest) -> Self {
        Self { request }
    }
}

impl CursorRequest for WebCursorRequest {
    type Cursor = WebKeyCursor;

    fn on_each(self, mut on_success: CursorHandler<WebKeyCursor>, on_error: ErrorHandler) {
        let closures: Rc<RefCell<Option<WalkClosures>>> = Rc::new(RefCell::new(None));
        let on_error = Rc::new(RefCell::new(Some(on_error)));

        let req_s = self.request.clone();
        let closures_s = closures.clone();
        let on_error_s = on_error.clone();
        let success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = match req_s.result() {
                Ok(result) => result,
                Err(e) => {
                    if let Some(on_error) = on_error_s.borrow_mut().take() {
                        on_error(js_error(e));
                    }
                    closures_s.borrow_mut().take();
                    return;
                }
            };
            match result.dyn_into::<IdbCursor>() {
                Ok(cursor) => on_success(Some(WebKeyCursor::new(cursor))),
                Err(_) => {
                    on_success(None);
                    closures_s.borrow_mut().take();
                }
            }
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_e = self.request.clone();
        let closures_e = closures.clone();
        let error = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let taken = on_error.borrow_mut().take();
            if let Some(on_error) = taken {
                on_error(request_error(&req_e));
            }
            closures_e.borrow_mut().take();
        }) as Box<dyn FnMut(web_sys::Event)>);

        let finish = self.request.transaction().map(|tx| {
            let closures_f = closures.clone();
            let finish = Closure::wrap(Box::new(move |_event: web_sys::Event| {
                if closures_f.borrow_mut().take().is_some() {
                    debug!("cursor walk released when its transaction ended");
                }
            }) as Box<dyn FnMut(web_sys::Event)>);
            tx.set_oncomplete(Some(finish.as_ref().unchecked_ref()));
            tx.set_onabort(Some(finish.as_ref().unchecked_ref()));
            (tx, finish)
        });

        self.request
            .set_onsuccess(Some(success.as_ref().unchecked_ref()));
        self.request.set_onerror(Some(error.as_ref().unchecked_ref()));

        *closures.borrow_mut() = Some(WalkClosures::new(success, error, finish));
    }
}

/// Convert a JSON value into a JS value.
pub fn value_to_js(value: &Value) -> EngineResult<JsValue> {
    let text = serde_json::to_string(value).map_err(IndexedDbError::from)?;
    js_sys::JSON::parse(&text).map_err(js_error)
}

/// Convert a JS value into JSON. `undefined` becomes `null`.
pub fn js_to_value(value: &JsValue) -> EngineResult<Value> {
    if value.is_undefined() {
        return Ok(Value::Null);
    }
    let text = String::from(js_sys::JSON::stringify(value).map_err(js_error)?);
    Ok(serde_json::from_str(&text).map_err(IndexedDbError::from)?)
}

pub fn key_to_js(key: &Key) -> EngineResult<JsValue> {
    value_to_js(&key.to_value())
}

pub fn js_to_key(value: &JsValue) -> EngineResult<Key> {
    let json = js_to_value(value)?;
    Key::from_value(&json)
        .ok_or_else(|| EngineError::data(format!("{} is not a supported key", json)))
}

/// The `IDBKeyRange` for `range`, or `None` when it is unbounded on both sides.
pub fn key_range_to_js(range: &KeyRange) -> EngineResult<Option<IdbKeyRange>> {
    fn side(bound: &Bound<Key>) -> EngineResult<Option<(JsValue, bool)>> {
        match bound {
            Bound::Included(key) => Ok(Some((key_to_js(key)?, false))),
            Bound::Excluded(key) => Ok(Some((key_to_js(key)?, true))),
            Bound::Unbounded => Ok(None),
        }
    }

    let range = match (side(range.lower())?, side(range.upper())?) {
        (None, None) => return Ok(None),
        (Some((lower, open)), None) => IdbKeyRange::lower_bound_with_open(&lower, open),
        (None, Some((upper, open))) => IdbKeyRange::upper_bound_with_open(&upper, open),
        (Some((lower, lower_open)), Some((upper, upper_open))) => {
            IdbKeyRange::bound_with_lower_open_and_upper_open(
                &lower, &upper, lower_open, upper_open,
            )
        }
    };
    range.map(Some).map_err(js_error)
}

/// Decoders used as request result policies.
pub(crate) mod decode {
    use super::*;

    pub fn unit(_: JsValue) -> EngineResult<()> {
        Ok(())
    }

    pub fn key(value: JsValue) -> EngineResult<Key> {
        js_to_key(&value)
    }

    pub fn optional_value(value: JsValue) -> EngineResult<Option<Value>> {
        if value.is_undefined() {
            return Ok(None);
        }
        js_to_value(&value).map(Some)
    }

    pub fn values(value: JsValue) -> EngineResult<Vec<Value>> {
        match js_to_value(&value)? {
            Value::Array(items) => Ok(items),
            other => {
                debug!(%other, "getAll returned a non-array");
                Err(EngineError::data("getAll result is not an array"))
            }
        }
    }
}
