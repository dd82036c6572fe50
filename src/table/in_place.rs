use std::sync::PoisonError;

use crossbeam_utils::sync::{ShardedLock, ShardedLockWriteGuard};
use log::trace;

use crate::table::record_store::RecordStore;
use crate::types::aspa::AspaRecord;
use crate::types::errors::AspaStoreError;
use crate::types::update::{UpdateKind, UpdateOp};

//------------ In-place update strategy --------------------------------------
//
// The operations of a normalized batch are spliced directly into the live
// record array, one by one, each splice under its own write lock so that
// readers interleave with a running batch. Each applied operation leaves
// enough state in its own slot to be reversed: an applied withdrawal parks
// the removed record's provider sequence in the slot, an applied
// announcement empties its slot into the store. When an operation fails,
// `undo` walks the already-applied prefix backwards and restores the store
// to the state it had before the batch started.

/// Where and why an in-place application stopped.
///
/// `failed_pos` is the position in the batch's post-normalization order.
/// `None` means the batch failed before the first splice, with the store
/// untouched.
#[derive(Debug)]
pub(crate) struct ApplyFailure {
    pub failed_pos: Option<usize>,
    pub error: AspaStoreError,
}

/// A panic while holding the write half can only have happened between
/// two well-formed splices, so the records themselves are sound and the
/// lock can be taken over.
fn write(
    store: &ShardedLock<RecordStore>,
) -> ShardedLockWriteGuard<'_, RecordStore> {
    store.write().unwrap_or_else(PoisonError::into_inner)
}

/// Splices a single operation into the store.
///
/// The operation must not be a no-op. On failure nothing was changed.
pub(crate) fn apply_one(
    store: &mut RecordStore,
    op: &mut UpdateOp,
) -> Result<(), AspaStoreError> {
    debug_assert!(!op.no_op);
    match op.kind {
        UpdateKind::Announce => {
            let idx = match store.position(op.customer) {
                Ok(_) => return Err(AspaStoreError::DuplicateRecord),
                Err(idx) => idx,
            };
            let providers = op.take_providers().unwrap_or_default();
            store.insert_at(idx, AspaRecord::new(op.customer, providers));
        }
        UpdateKind::Withdraw => {
            let idx = match store.position(op.customer) {
                Ok(idx) => idx,
                Err(_) => return Err(AspaStoreError::RecordNotFound),
            };
            let removed = store.remove_at(idx);
            op.put_providers(removed.providers);
        }
    }
    Ok(())
}

/// Reverses one applied operation, re-using the provider sequence parked
/// in the operation's slot on the forward pass.
pub(crate) fn undo_one(store: &mut RecordStore, op: &mut UpdateOp) {
    debug_assert!(!op.no_op);
    match op.kind {
        UpdateKind::Announce => {
            // The forward pass inserted this record; take it back out and
            // return its providers to the slot.
            if let Ok(idx) = store.position(op.customer) {
                let removed = store.remove_at(idx);
                op.put_providers(removed.providers);
            } else {
                debug_assert!(false, "applied announcement vanished");
            }
        }
        UpdateKind::Withdraw => {
            let providers = op.take_providers().unwrap_or_default();
            match store.position(op.customer) {
                Err(idx) => {
                    store.insert_at(
                        idx,
                        AspaRecord::new(op.customer, providers),
                    );
                }
                Ok(_) => {
                    debug_assert!(false, "withdrawn record reappeared");
                }
            }
        }
    }
    trace!("undid op {} ({})", op.index, op.kind);
}

/// Applies a normalized batch to the live store, one splice at a time.
///
/// On failure the failed operation itself is not applied and no later
/// operation is attempted; the store is left partially updated until the
/// caller runs [`undo`] over the same batch. Readers are only held out
/// during the individual splices, so they may observe intermediate states
/// of the batch.
pub(crate) fn apply(
    store: &ShardedLock<RecordStore>,
    ops: &mut [UpdateOp],
) -> Result<(), ApplyFailure> {
    let announcements = ops
        .iter()
        .filter(|op| !op.no_op && op.kind == UpdateKind::Announce)
        .count();
    if let Err(error) = write(store).try_reserve(announcements) {
        return Err(ApplyFailure {
            failed_pos: None,
            error,
        });
    }

    for pos in 0..ops.len() {
        if ops[pos].no_op {
            continue;
        }
        let res = apply_one(&mut write(store), &mut ops[pos]);
        if let Err(error) = res {
            return Err(ApplyFailure {
                failed_pos: Some(pos),
                error,
            });
        }
    }

    Ok(())
}

/// Reverses the applied prefix of a batch that failed at `failed_pos`.
///
/// Walks the operations in reverse order up to, but not including, the
/// failed one. Afterwards the store is equal to its pre-[`apply`] state.
pub(crate) fn undo(
    store: &ShardedLock<RecordStore>,
    ops: &mut [UpdateOp],
    failed_pos: usize,
) {
    for pos in (0..failed_pos).rev() {
        if ops[pos].no_op {
            continue;
        }
        undo_one(&mut write(store), &mut ops[pos]);
    }
}
