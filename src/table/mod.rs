pub mod backend;
pub mod config;
pub mod record_store;

pub(crate) mod in_place;
pub(crate) mod normalize;
pub(crate) mod swap_in;

pub use config::{Config, InPlaceConfig, SwapInConfig};
pub use record_store::RecordStore;
pub use swap_in::AspaUpdate;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::sync::{
    ShardedLock, ShardedLockReadGuard, ShardedLockWriteGuard,
};
use inetnum::asn::Asn;
use log::{debug, trace};
use roaring::RoaringBitmap;

use crate::table::backend::StoreBackend;
use crate::types::aspa::{AspaRecord, SocketId};
use crate::types::errors::{AspaStoreError, UpdateError};
use crate::types::hop::HopResult;
use crate::types::update::{
    ChangeKind, UpdateBatch, UpdateKind, UpdateObserver, UpdateOp,
};

//------------ Counters ------------------------------------------------------

#[derive(Debug, Default)]
pub struct Counters {
    // number of records currently live across all bindings
    records: AtomicUsize,
    // number of announcements applied over the table's lifetime
    announcements: AtomicUsize,
    // number of withdrawals applied over the table's lifetime
    withdrawals: AtomicUsize,
    // number of successfully applied update batches
    batches: AtomicUsize,
}

impl Counters {
    pub fn get_records_count(&self) -> usize {
        self.records.load(Ordering::Relaxed)
    }

    pub fn get_announcements_count(&self) -> usize {
        self.announcements.load(Ordering::Relaxed)
    }

    pub fn get_withdrawals_count(&self) -> usize {
        self.withdrawals.load(Ordering::Relaxed)
    }

    pub fn get_batches_count(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    pub(crate) fn batch_applied(
        &self,
        announcements: usize,
        withdrawals: usize,
    ) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.announcements.fetch_add(announcements, Ordering::Relaxed);
        self.withdrawals.fetch_add(withdrawals, Ordering::Relaxed);
        self.records.fetch_add(announcements, Ordering::Relaxed);
        self.records.fetch_sub(withdrawals, Ordering::Relaxed);
    }

    pub(crate) fn records_adopted(&self, count: usize) {
        self.records.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn records_dropped(&self, count: usize) {
        self.records.fetch_sub(count, Ordering::Relaxed);
    }
}

//------------ SocketBinding -------------------------------------------------

/// The pairing of one RTR cache session with its record store.
///
/// The `busy` flag is the binding's writer lease: whoever holds it is the
/// one mutation in flight on this binding. Writers per table are
/// serialized by the caller, so the lease does not wait; finding it taken
/// means the serialization contract was broken.
pub(crate) struct SocketBinding<B> {
    pub(crate) socket: SocketId,
    pub(crate) store: B,
    busy: AtomicBool,
}

impl<B: StoreBackend> SocketBinding<B> {
    fn new(socket: SocketId) -> Self {
        Self {
            socket,
            store: B::default(),
            busy: AtomicBool::new(false),
        }
    }

    pub(crate) fn try_lease(&self) -> Result<(), AspaStoreError> {
        self.busy
            .compare_exchange(
                false,
                true,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| AspaStoreError::ExternalError)
    }

    pub(crate) fn release_lease(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub(crate) fn lease(&self) -> Result<Lease<'_, B>, AspaStoreError> {
        self.try_lease()?;
        Ok(Lease(self))
    }
}

impl<B: fmt::Debug> fmt::Debug for SocketBinding<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SocketBinding")
            .field("socket", &self.socket)
            .field("store", &self.store)
            .finish()
    }
}

/// A held writer lease; released on drop.
pub(crate) struct Lease<'a, B: StoreBackend>(&'a SocketBinding<B>);

impl<B: StoreBackend> Drop for Lease<'_, B> {
    fn drop(&mut self) {
        self.0.release_lease();
    }
}

//------------ AspaTable -----------------------------------------------------

/// An ASPA validation table.
///
/// The table stores, per customer ASN, the provider ASNs authorized to
/// act as that customer's upstreams, as learned over one or more RTR cache
/// sessions. The records of each session live in their own store, so a
/// session that drops only takes its own contributions with it.
///
/// Many threads may verify hops concurrently through
/// [`check_hop`][Self::check_hop]; at most one thread at a time updates
/// any given table, a serialization the session layer provides. The
/// update strategy and notification policy are fixed at construction
/// through the [`Config`] parameter.
pub struct AspaTable<C: Config = SwapInConfig> {
    bindings: ShardedLock<Vec<Arc<SocketBinding<C::Backend>>>>,
    // All customer ASNs that might have a record in some binding. Kept as
    // a superset of the truth at every instant, so a miss here is a
    // definitive miss.
    customers: Atomic<RoaringBitmap>,
    observer: Option<Box<dyn UpdateObserver>>,
    counters: Counters,
    config: C,
}

impl<C: Config> AspaTable<C> {
    pub fn new() -> Self {
        Self::new_with_config(C::default())
    }

    pub fn new_with_config(config: C) -> Self {
        Self {
            bindings: ShardedLock::new(Vec::new()),
            customers: Atomic::new(RoaringBitmap::new()),
            observer: None,
            counters: Counters::default(),
            config,
        }
    }

    /// Creates a table that reports every record change to `observer`.
    pub fn new_with_observer(
        config: C,
        observer: Box<dyn UpdateObserver>,
    ) -> Self {
        let mut table = Self::new_with_config(config);
        table.observer = Some(observer);
        table
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The number of records currently live across all cache sessions.
    pub fn num_records(&self) -> usize {
        self.counters.get_records_count()
    }

    pub fn is_empty(&self) -> bool {
        self.num_records() == 0
    }

    //--- Hop verification

    /// Classifies one customer-to-provider hop of an `AS_PATH`.
    ///
    /// If no attached session attests anything for `customer`, the hop is
    /// [`HopResult::NoAttestation`]. Otherwise the attested provider sets
    /// act as a whitelist: the hop is [`HopResult::ProviderPlus`] if any
    /// of them contains `provider` and [`HopResult::NotProviderPlus`] if
    /// none does.
    pub fn check_hop(
        &self,
        customer: Asn,
        provider: Asn,
        guard: &Guard,
    ) -> HopResult {
        let customers = unsafe {
            // Never null; replaced bitmaps outlive the guard.
            self.customers.load(Ordering::Acquire, guard).deref()
        };
        if !customers.contains(customer.into_u32()) {
            return HopResult::NoAttestation;
        }

        let mut attested = false;
        for binding in self.read_bindings().iter() {
            let verdict = binding.store.with_store(guard, |store| {
                store
                    .lookup(customer)
                    .map(|record| record.providers.contains(provider))
            });
            match verdict {
                Some(true) => return HopResult::ProviderPlus,
                Some(false) => attested = true,
                None => {}
            }
        }

        if attested {
            HopResult::NotProviderPlus
        } else {
            HopResult::NoAttestation
        }
    }

    //--- Updating

    /// Applies one update batch for one cache session.
    ///
    /// The batch is normalized, then applied with the strategy the table
    /// was configured with. On success, listeners are notified per record
    /// in the batch's post-normalization order, after the new state is
    /// visible to readers. On failure nothing remains visible of the
    /// batch: the swap-in strategy never published its replacement store
    /// and the in-place strategy has rolled back. Either way the batch,
    /// and every provider sequence it still owns, is released on return.
    pub fn update(
        &self,
        socket: SocketId,
        mut batch: UpdateBatch,
    ) -> Result<(), UpdateError> {
        normalize::normalize(batch.ops_mut())?;

        let binding = self.bind_or_get(socket);
        let _lease = binding.lease()?;
        let guard = &epoch::pin();

        self.pre_apply(batch.ops(), guard);
        match binding.store.apply_batch(batch.ops_mut()) {
            Ok(()) => {
                debug!(
                    "{}: applied batch of {} ops",
                    socket,
                    batch.len()
                );
                self.after_apply(socket, &binding, batch.ops(), guard);
                Ok(())
            }
            Err(err) => {
                self.refresh_customer_index(guard);
                Err(err)
            }
        }
    }

    /// Removes the binding of a dropped cache session.
    ///
    /// Readers see the session's records disappear in one step. With
    /// `notify`, every removed record is reported to the listener.
    /// Returns whether the session had a binding at all.
    pub fn remove_socket(
        &self,
        socket: SocketId,
        notify: bool,
    ) -> Result<bool, AspaStoreError> {
        let binding = match self.find_binding(socket) {
            Some(binding) => binding,
            None => return Ok(false),
        };
        let _lease = binding.lease()?;
        {
            let mut bindings = self.write_bindings();
            bindings.retain(|b| !Arc::ptr_eq(b, &binding));
        }

        let guard = &epoch::pin();
        binding.store.replace(RecordStore::new(), guard, |old| {
            self.counters.records_dropped(old.len());
            debug!("{}: unbound, dropping {} records", socket, old.len());
            if notify {
                if let Some(observer) = &self.observer {
                    for record in old.iter() {
                        observer.record_changed(
                            socket,
                            record,
                            ChangeKind::Removed,
                        );
                    }
                }
            }
        });
        self.refresh_customer_index(guard);
        Ok(true)
    }

    /// Moves the store a session built up in `src` over to `dst`.
    ///
    /// The records `socket` contributed to `src` replace whatever the
    /// same session had contributed to `dst`; the `src` binding is left
    /// empty. Readers of either table see their table flip in a single
    /// step. With `notify_dst`, the replaced records are reported as
    /// removed and the transferred ones as added to `dst`'s listener;
    /// with `notify_src`, the transferred records are reported as removed
    /// to `src`'s listener.
    pub fn src_replace(
        dst: &Self,
        src: &Self,
        socket: SocketId,
        notify_dst: bool,
        notify_src: bool,
    ) -> Result<(), AspaStoreError> {
        if std::ptr::eq(dst, src) {
            return Ok(());
        }
        let src_binding = match src.find_binding(socket) {
            Some(binding) => binding,
            None => return Err(AspaStoreError::RecordNotFound),
        };
        let _src_lease = src_binding.lease()?;
        let dst_binding = dst.bind_or_get(socket);
        let _dst_lease = dst_binding.lease()?;

        let guard = &epoch::pin();
        let moved: Vec<AspaRecord> = src_binding
            .store
            .with_store(guard, |store| store.records().to_vec());
        debug!(
            "{}: transferring {} records between tables",
            socket,
            moved.len()
        );

        dst.extend_customer_index(
            moved.iter().map(|record| record.customer),
            guard,
        );
        let new_store: RecordStore = moved.iter().cloned().collect();
        dst_binding.store.replace(new_store, guard, |old| {
            dst.counters.records_dropped(old.len());
            if notify_dst {
                if let Some(observer) = &dst.observer {
                    for record in old.iter() {
                        observer.record_changed(
                            socket,
                            record,
                            ChangeKind::Removed,
                        );
                    }
                }
            }
        });
        dst.counters.records_adopted(moved.len());
        if notify_dst {
            if let Some(observer) = &dst.observer {
                for record in &moved {
                    observer.record_changed(
                        socket,
                        record,
                        ChangeKind::Added,
                    );
                }
            }
        }
        dst.refresh_customer_index(guard);

        src_binding.store.replace(RecordStore::new(), guard, |old| {
            src.counters.records_dropped(old.len());
            if notify_src {
                if let Some(observer) = &src.observer {
                    for record in old.iter() {
                        observer.record_changed(
                            socket,
                            record,
                            ChangeKind::Removed,
                        );
                    }
                }
            }
        });
        src.refresh_customer_index(guard);
        Ok(())
    }

    //--- Iteration

    /// Calls `f` for every record in the table, per binding in customer
    /// ASN order.
    pub fn for_each_record<F: FnMut(SocketId, &AspaRecord)>(
        &self,
        guard: &Guard,
        mut f: F,
    ) {
        for binding in self.read_bindings().iter() {
            binding.store.with_store(guard, |store| {
                for record in store.iter() {
                    f(binding.socket, record);
                }
            });
        }
    }

    /// Returns a copy of the records a session currently contributes.
    pub fn socket_records(
        &self,
        socket: SocketId,
        guard: &Guard,
    ) -> Option<Vec<AspaRecord>> {
        let binding = self.find_binding(socket)?;
        Some(
            binding
                .store
                .with_store(guard, |store| store.records().to_vec()),
        )
    }

    //--- Internals

    fn read_bindings(
        &self,
    ) -> ShardedLockReadGuard<'_, Vec<Arc<SocketBinding<C::Backend>>>>
    {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_bindings(
        &self,
    ) -> ShardedLockWriteGuard<'_, Vec<Arc<SocketBinding<C::Backend>>>>
    {
        self.bindings.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_binding(
        &self,
        socket: SocketId,
    ) -> Option<Arc<SocketBinding<C::Backend>>> {
        self.read_bindings()
            .iter()
            .find(|binding| binding.socket == socket)
            .cloned()
    }

    pub(crate) fn bind_or_get(
        &self,
        socket: SocketId,
    ) -> Arc<SocketBinding<C::Backend>> {
        if let Some(binding) = self.find_binding(socket) {
            return binding;
        }
        let mut bindings = self.write_bindings();
        if let Some(binding) =
            bindings.iter().find(|binding| binding.socket == socket)
        {
            return binding.clone();
        }
        trace!("{}: new binding", socket);
        let binding = Arc::new(SocketBinding::new(socket));
        bindings.push(binding.clone());
        binding
    }

    /// Grows the customer index by the batch's announcements before they
    /// are applied, so the index stays a superset throughout.
    pub(crate) fn pre_apply(&self, ops: &[UpdateOp], guard: &Guard) {
        self.extend_customer_index(
            ops.iter()
                .filter(|op| {
                    !op.no_op && op.kind == UpdateKind::Announce
                })
                .map(|op| op.customer),
            guard,
        );
    }

    /// Bookkeeping and notifications for a successfully applied batch.
    pub(crate) fn after_apply(
        &self,
        socket: SocketId,
        binding: &SocketBinding<C::Backend>,
        ops: &[UpdateOp],
        guard: &Guard,
    ) {
        let mut announcements = 0;
        let mut withdrawals = 0;
        for op in ops.iter().filter(|op| !op.no_op) {
            match op.kind {
                UpdateKind::Announce => announcements += 1,
                UpdateKind::Withdraw => withdrawals += 1,
            }
        }
        self.counters.batch_applied(announcements, withdrawals);
        if withdrawals > 0 {
            self.refresh_customer_index(guard);
        }
        self.notify_batch(socket, binding, ops, guard);
    }

    /// Reports a batch's record changes in post-normalization order.
    fn notify_batch(
        &self,
        socket: SocketId,
        binding: &SocketBinding<C::Backend>,
        ops: &[UpdateOp],
        guard: &Guard,
    ) {
        let Some(observer) = &self.observer else {
            return;
        };
        let notify_no_ops = self.config.notify_no_ops();

        for pos in 0..ops.len() {
            let op = &ops[pos];
            if op.no_op && !notify_no_ops {
                continue;
            }
            match (op.kind, op.no_op) {
                (UpdateKind::Announce, false) => {
                    binding.store.with_store(guard, |store| {
                        if let Some(record) = store.lookup(op.customer) {
                            observer.record_changed(
                                socket,
                                record,
                                ChangeKind::Added,
                            );
                        }
                    });
                }
                (UpdateKind::Withdraw, false) => {
                    let record = AspaRecord::new(
                        op.customer,
                        op.providers.clone().unwrap_or_default(),
                    );
                    observer.record_changed(
                        socket,
                        &record,
                        ChangeKind::Removed,
                    );
                }
                (UpdateKind::Announce, true) => {
                    let record = AspaRecord::new(
                        op.customer,
                        op.providers.clone().unwrap_or_default(),
                    );
                    observer.record_changed(
                        socket,
                        &record,
                        ChangeKind::Added,
                    );
                }
                (UpdateKind::Withdraw, true) => {
                    // The annihilated partner announcement sits right
                    // before this op and still owns the record.
                    let providers = pos
                        .checked_sub(1)
                        .and_then(|prev| ops[prev].providers.clone())
                        .unwrap_or_default();
                    let record =
                        AspaRecord::new(op.customer, providers);
                    observer.record_changed(
                        socket,
                        &record,
                        ChangeKind::Removed,
                    );
                }
            }
        }
    }

    fn extend_customer_index(
        &self,
        add: impl Iterator<Item = Asn>,
        guard: &Guard,
    ) {
        let current = unsafe {
            self.customers.load(Ordering::Acquire, guard).deref()
        };
        let mut next = current.clone();
        let mut changed = false;
        for asn in add {
            changed |= next.insert(asn.into_u32());
        }
        if changed {
            self.publish_customer_index(next, guard);
        }
    }

    /// Rebuilds the customer index to exactly the live set of customers.
    fn refresh_customer_index(&self, guard: &Guard) {
        let mut next = RoaringBitmap::new();
        for binding in self.read_bindings().iter() {
            binding.store.with_store(guard, |store| {
                for record in store.iter() {
                    next.insert(record.customer.into_u32());
                }
            });
        }
        self.publish_customer_index(next, guard);
    }

    fn publish_customer_index(
        &self,
        next: RoaringBitmap,
        guard: &Guard,
    ) {
        let old = self.customers.swap(
            Owned::new(next),
            Ordering::AcqRel,
            guard,
        );
        unsafe {
            guard.defer_destroy(old);
        }
    }
}

impl AspaTable<SwapInConfig> {
    /// Computes a swap-in update without publishing it.
    ///
    /// The replacement store is built and validated against the current
    /// one; the live binding is not touched. The returned handle holds an
    /// exclusive lease on the binding: until it is dropped, no other
    /// operation mutates this session's store. Call
    /// [`AspaUpdate::apply`] to publish; dropping the handle without
    /// applying discards the replacement store without any visible
    /// effect. On error the batch is released before this returns.
    pub fn prepare_update(
        &self,
        socket: SocketId,
        mut batch: UpdateBatch,
    ) -> Result<AspaUpdate<'_>, UpdateError> {
        normalize::normalize(batch.ops_mut())?;

        let binding = self.bind_or_get(socket);
        binding.try_lease()?;
        let guard = &epoch::pin();
        let computed = binding
            .store
            .with_store(guard, |current| {
                swap_in::merge(current, batch.ops_mut())
            });
        match computed {
            Ok(new_store) => Ok(AspaUpdate::new(
                self, binding, socket, batch, new_store,
            )),
            Err(err) => {
                binding.release_lease();
                Err(err)
            }
        }
    }
}

impl<C: Config> Default for AspaTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> fmt::Debug for AspaTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AspaTable")
            .field("bindings", &self.read_bindings().len())
            .field("records", &self.num_records())
            .field("config", &self.config)
            .finish()
    }
}

impl<C: Config> Drop for AspaTable<C> {
    fn drop(&mut self) {
        // Nobody can read the table anymore; take the bitmap out without
        // pinning.
        unsafe {
            let guard = epoch::unprotected();
            let shared = self.customers.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(shared.into_owned());
            }
        }
    }
}
