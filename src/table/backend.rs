use std::fmt;
use std::sync::PoisonError;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::sync::ShardedLock;
use log::trace;

use crate::table::record_store::RecordStore;
use crate::table::{in_place, swap_in};
use crate::types::errors::UpdateError;
use crate::types::update::UpdateOp;

//------------ StoreBackend --------------------------------------------------

/// How a socket binding stores its records and takes update batches.
///
/// The two implementations trade differently between readers and writers.
/// [`SwapInStore`] gives readers lock-free access and a single publication
/// point per batch; [`InPlaceStore`] splices the live array and lets
/// readers in between splices. Either way a failed batch leaves no visible
/// change behind.
pub trait StoreBackend:
    Default + fmt::Debug + Send + Sync + 'static
{
    /// Calls `f` with the current records.
    ///
    /// The reference handed to `f` cannot outlive the call; readers that
    /// need to keep data copy it out.
    fn with_store<R>(
        &self,
        guard: &Guard,
        f: impl FnOnce(&RecordStore) -> R,
    ) -> R;

    /// Applies a normalized batch with this backend's strategy.
    ///
    /// On failure the visible store is as if the batch never happened: the
    /// swap-in strategy never published, the in-place strategy has rolled
    /// its applied prefix back.
    fn apply_batch(
        &self,
        ops: &mut [UpdateOp],
    ) -> Result<(), UpdateError>;

    /// Replaces the whole store with `store`, calling `with_old` on the
    /// records that are being replaced before they are released.
    fn replace<R>(
        &self,
        store: RecordStore,
        guard: &Guard,
        with_old: impl FnOnce(&RecordStore) -> R,
    ) -> R;
}

//------------ SwapInStore ---------------------------------------------------

/// Record storage published through an atomic pointer.
///
/// Readers pin an epoch and dereference the current pointer without taking
/// any lock. A batch builds its replacement store off to the side (see
/// [`swap_in::merge`]) and swaps it in whole; the superseded store is
/// handed to the epoch collector and freed once the readers that could
/// still see it have moved on.
#[derive(Debug)]
pub struct SwapInStore {
    current: Atomic<RecordStore>,
}

impl SwapInStore {
    /// Swaps `store` in as the current store and schedules the superseded
    /// one for destruction after in-flight readers drain.
    pub(crate) fn publish(&self, store: RecordStore, guard: &Guard) {
        let old = self.current.swap(Owned::new(store), Ordering::AcqRel, guard);
        trace!("published replacement store");
        unsafe {
            // The old pointer came out of the swap, so nobody can load it
            // anymore; readers that already did are still pinned.
            guard.defer_destroy(old);
        }
    }
}

impl Default for SwapInStore {
    fn default() -> Self {
        Self {
            current: Atomic::new(RecordStore::new()),
        }
    }
}

impl StoreBackend for SwapInStore {
    fn with_store<R>(
        &self,
        guard: &Guard,
        f: impl FnOnce(&RecordStore) -> R,
    ) -> R {
        let shared = self.current.load(Ordering::Acquire, guard);
        // The pointer is never null and its target lives at least as long
        // as the guard.
        f(unsafe { shared.deref() })
    }

    fn apply_batch(
        &self,
        ops: &mut [UpdateOp],
    ) -> Result<(), UpdateError> {
        let guard = &epoch::pin();
        let new_store = self.with_store(guard, |current| {
            swap_in::merge(current, ops)
        })?;
        self.publish(new_store, guard);
        Ok(())
    }

    fn replace<R>(
        &self,
        store: RecordStore,
        guard: &Guard,
        with_old: impl FnOnce(&RecordStore) -> R,
    ) -> R {
        let old = self.current.swap(
            Owned::new(store),
            Ordering::AcqRel,
            guard,
        );
        let res = with_old(unsafe { old.deref() });
        unsafe {
            guard.defer_destroy(old);
        }
        res
    }
}

impl Drop for SwapInStore {
    fn drop(&mut self) {
        // Nobody holds the binding anymore, so the pointer can be taken
        // without pinning.
        unsafe {
            let guard = epoch::unprotected();
            let shared = self.current.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(shared.into_owned());
            }
        }
    }
}

//------------ InPlaceStore --------------------------------------------------

/// Record storage mutated in place under a read-mostly lock.
///
/// Writers take the write half only for the duration of one array splice,
/// so readers interleave with a running batch and may observe its
/// intermediate states. The batch's undo state lives in the operation
/// slots (see [`in_place`]).
#[derive(Debug, Default)]
pub struct InPlaceStore {
    current: ShardedLock<RecordStore>,
}

impl StoreBackend for InPlaceStore {
    fn with_store<R>(
        &self,
        _guard: &Guard,
        f: impl FnOnce(&RecordStore) -> R,
    ) -> R {
        let store =
            self.current.read().unwrap_or_else(PoisonError::into_inner);
        f(&store)
    }

    fn apply_batch(
        &self,
        ops: &mut [UpdateOp],
    ) -> Result<(), UpdateError> {
        match in_place::apply(&self.current, ops) {
            Ok(()) => Ok(()),
            Err(failure) => {
                if let Some(failed_pos) = failure.failed_pos {
                    trace!(
                        "op {} failed, undoing {} applied ops",
                        ops[failed_pos].index,
                        failed_pos
                    );
                    in_place::undo(&self.current, ops, failed_pos);
                    Err(UpdateError::new(
                        failure.error,
                        ops[failed_pos].index,
                    ))
                } else {
                    Err(failure.error.into())
                }
            }
        }
    }

    fn replace<R>(
        &self,
        store: RecordStore,
        _guard: &Guard,
        with_old: impl FnOnce(&RecordStore) -> R,
    ) -> R {
        let old = {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, store)
        };
        with_old(&old)
    }
}
