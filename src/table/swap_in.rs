use std::sync::Arc;

use crossbeam_epoch as epoch;
use log::trace;

use crate::table::backend::SwapInStore;
use crate::table::record_store::RecordStore;
use crate::table::{AspaTable, SocketBinding};
use crate::types::aspa::{AspaRecord, SocketId};
use crate::types::errors::{AspaStoreError, UpdateError};
use crate::types::update::{UpdateBatch, UpdateKind, UpdateOp};

//------------ Swap-in update strategy ---------------------------------------
//
// A replacement record array is built off to the side by merging the
// normalized batch with the current store, then substituted in one atomic
// pointer swap. Readers either see the whole old store or the whole new
// one; the old store is reclaimed once all readers that could still hold
// it have drained.

/// Merges a normalized batch with `current` into a fresh store.
///
/// The current store is not touched; kept records are copied, announced
/// records move out of their operation slots, and each withdrawal parks a
/// copy of the removed record's provider sequence in its slot for the
/// notification pass. On failure the reported index is the offending
/// operation's original batch position.
pub(crate) fn merge(
    current: &RecordStore,
    ops: &mut [UpdateOp],
) -> Result<RecordStore, UpdateError> {
    let announcements = ops
        .iter()
        .filter(|op| !op.no_op && op.kind == UpdateKind::Announce)
        .count();
    let mut target =
        RecordStore::try_with_capacity(current.len() + announcements)?;

    let records = current.records();
    let mut ri = 0;
    for pos in 0..ops.len() {
        if ops[pos].no_op {
            continue;
        }
        let customer = ops[pos].customer;
        while ri < records.len() && records[ri].customer < customer {
            target.push(records[ri].clone());
            ri += 1;
        }
        let present =
            ri < records.len() && records[ri].customer == customer;
        match ops[pos].kind {
            UpdateKind::Announce if present => {
                return Err(UpdateError::new(
                    AspaStoreError::DuplicateRecord,
                    ops[pos].index,
                ));
            }
            UpdateKind::Announce => {
                let providers =
                    ops[pos].take_providers().unwrap_or_default();
                target.push(AspaRecord::new(customer, providers));
            }
            UpdateKind::Withdraw if present => {
                ops[pos].put_providers(records[ri].providers.clone());
                ri += 1;
            }
            UpdateKind::Withdraw => {
                return Err(UpdateError::new(
                    AspaStoreError::RecordNotFound,
                    ops[pos].index,
                ));
            }
        }
    }
    while ri < records.len() {
        target.push(records[ri].clone());
        ri += 1;
    }

    trace!(
        "merged {} ops into a store of {} records",
        ops.len(),
        target.len()
    );
    Ok(target)
}

//------------ AspaUpdate ----------------------------------------------------

/// A computed but possibly not yet published swap-in update.
///
/// Produced by [`AspaTable::prepare_update`]. For as long as the handle
/// lives, no other operation can mutate the target socket's store. Calling
/// [`apply`][Self::apply] publishes the replacement store and emits the
/// batch's notifications; dropping the handle finishes the update either
/// way, releasing whichever store lost and whatever the batch still owns.
pub struct AspaUpdate<'a> {
    table: &'a AspaTable<super::config::SwapInConfig>,
    binding: Arc<SocketBinding<SwapInStore>>,
    socket: SocketId,
    batch: UpdateBatch,
    new_store: Option<RecordStore>,
}

impl<'a> AspaUpdate<'a> {
    pub(crate) fn new(
        table: &'a AspaTable<super::config::SwapInConfig>,
        binding: Arc<SocketBinding<SwapInStore>>,
        socket: SocketId,
        batch: UpdateBatch,
        new_store: RecordStore,
    ) -> Self {
        Self {
            table,
            binding,
            socket,
            batch,
            new_store: Some(new_store),
        }
    }

    /// Whether the replacement store has been published yet.
    pub fn is_applied(&self) -> bool {
        self.new_store.is_none()
    }

    /// Publishes the replacement store.
    ///
    /// The store pointer flips in a single atomic swap; the superseded
    /// store is reclaimed after in-flight readers drain. Notifications go
    /// out after the swap, so a listener that queries the table right away
    /// observes the new state. Applying twice is a no-op.
    pub fn apply(&mut self) {
        let Some(new_store) = self.new_store.take() else {
            return;
        };
        let guard = &epoch::pin();
        self.table.pre_apply(self.batch.ops(), guard);
        self.binding.store.publish(new_store, guard);
        self.table.after_apply(
            self.socket,
            &self.binding,
            self.batch.ops(),
            guard,
        );
    }
}

impl Drop for AspaUpdate<'_> {
    fn drop(&mut self) {
        self.binding.release_lease();
    }
}
