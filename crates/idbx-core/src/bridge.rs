//! Request bridge: native completion signals to futures
//!
//! Each native request is registered exactly once; both handlers share one
//! oneshot sender, so whichever signal fires first settles the future and any
//! later signal is dropped. Issued requests cannot be cancelled; dropping the
//! future only discards the result.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;
use tracing::debug;

use crate::engine::{CursorRequest, NativeRequest};
use crate::error::{EngineError, EngineResult};

type Slot<T> = Rc<RefCell<Option<oneshot::Sender<EngineResult<T>>>>>;

/// Future of a single settled native request.
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct Settled<T> {
    receiver: oneshot::Receiver<EngineResult<T>>,
}

impl<T> Settled<T> {
    /// A future that is already settled with `result`.
    pub fn resolved(result: EngineResult<T>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }
}

impl<T> Future for Settled<T> {
    type Output = EngineResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(EngineError::abort(
                "request was dropped without a success or error signal",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn settle<T>(slot: &Slot<T>, result: EngineResult<T>) -> bool {
    match slot.borrow_mut().take() {
        Some(sender) => {
            let _ = sender.send(result);
            true
        }
        None => false,
    }
}

/// Convert a native request into a future of its outcome.
pub fn promisify<R: NativeRequest>(request: R) -> Settled<R::Output> {
    let (sender, receiver) = oneshot::channel();
    let slot: Slot<R::Output> = Rc::new(RefCell::new(Some(sender)));
    let error_slot = slot.clone();

    request.on_settled(
        Box::new(move |value| {
            settle(&slot, Ok(value));
        }),
        Box::new(move |error| {
            if !settle(&error_slot, Err(error)) {
                debug!("error signal after request already settled");
            }
        }),
    );

    Settled { receiver }
}

/// Convert a cursor request into a future that settles on the first success signal.
///
/// Every success signal that carries a cursor, the first included, is forwarded to
/// `navigator` after settlement. The navigator walks on by calling `continue_` or
/// `advance`; the bridge never moves the cursor itself.
pub fn promisify_cursor<R, N>(request: R, mut navigator: N) -> Settled<()>
where
    R: CursorRequest,
    N: FnMut(&R::Cursor) + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let slot: Slot<()> = Rc::new(RefCell::new(Some(sender)));
    let error_slot = slot.clone();

    request.on_each(
        Box::new(move |cursor| {
            settle(&slot, Ok(()));
            if let Some(cursor) = cursor {
                navigator(&cursor);
            }
        }),
        Box::new(move |error| {
            if !settle(&error_slot, Err(error.clone())) {
                debug!(%error, "cursor error after request already settled");
            }
        }),
    );

    Settled { receiver }
}
