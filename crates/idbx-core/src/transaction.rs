//! Per-call transaction acquisition

use tracing::trace;

use crate::bridge::Settled;
use crate::engine::{Database, StoreOf, Transaction, TransactionMode};

/// Open a transaction limited to `store_name` at `mode` and return the store inside it.
///
/// Engines create the transaction synchronously; the result is still handed back as a
/// settled future so every step of an action is awaited the same way. Commit is
/// implicit once no further requests are issued against the returned store.
pub fn acquire_store<D: Database>(
    db: &D,
    store_name: &str,
    mode: TransactionMode,
) -> Settled<StoreOf<D>> {
    trace!(store = %store_name, ?mode, "acquiring transaction");
    Settled::resolved(
        db.transaction(store_name, mode)
            .and_then(|tx| tx.object_store(store_name)),
    )
}
