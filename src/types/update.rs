use std::fmt;

use inetnum::asn::Asn;
use serde_derive::{Deserialize, Serialize};

use crate::types::aspa::{AspaRecord, ProviderAsns, SocketId};

//------------ UpdateKind ----------------------------------------------------

/// The direction of one update operation, in RTR terms.
#[derive(
    Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum UpdateKind {
    /// Add a record for a customer ASN that has none yet.
    Announce,
    /// Remove the record for a customer ASN.
    Withdraw,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UpdateKind::Announce => write!(f, "announce"),
            UpdateKind::Withdraw => write!(f, "withdraw"),
        }
    }
}

//------------ UpdateOp ------------------------------------------------------

/// One operation of an update batch.
///
/// The `providers` slot is the conduit for provider-sequence ownership. An
/// announcement carries its sequence in the slot until the record is moved
/// into a store. A withdrawal enters with an empty slot; when it is applied
/// in-place the removed record's sequence is parked in the slot, so that a
/// later undo can put it back. Whatever is left in the slot when the batch
/// is dropped is released with it.
#[derive(Debug)]
pub struct UpdateOp {
    pub(crate) index: usize,
    pub(crate) kind: UpdateKind,
    pub(crate) customer: Asn,
    pub(crate) providers: Option<ProviderAsns>,
    pub(crate) no_op: bool,
}

impl UpdateOp {
    /// The position this operation had in the batch it was created in.
    ///
    /// Batches are reordered during normalization; the original position
    /// survives as the tie-breaker for the sort and as the reference in
    /// error reports.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> UpdateKind {
        self.kind
    }

    pub fn customer(&self) -> Asn {
        self.customer
    }

    /// Whether this operation was annotated as cancelled-out during
    /// normalization. No-op operations are not applied to the store.
    pub fn is_no_op(&self) -> bool {
        self.no_op
    }

    pub(crate) fn take_providers(&mut self) -> Option<ProviderAsns> {
        self.providers.take()
    }

    pub(crate) fn put_providers(&mut self, providers: ProviderAsns) {
        debug_assert!(self.providers.is_none());
        self.providers = Some(providers);
    }
}

impl fmt::Display for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.customer)?;
        if let Some(providers) = &self.providers {
            write!(f, " {}", providers)?;
        }
        Ok(())
    }
}

//------------ UpdateBatch ---------------------------------------------------

/// A batch of add/remove operations derived from one cache response.
///
/// The session layer builds a batch in arrival order and hands it to
/// [`AspaTable::update`][crate::AspaTable::update] in one piece. The batch
/// owns the provider sequences of its announcements until they are moved
/// into a store; dropping the batch releases whatever it still owns, on
/// both the success and the failure path.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    ops: Vec<UpdateOp>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation to the batch.
    ///
    /// An empty provider sequence on a withdrawal is the well-formed way of
    /// saying "no providers"; a non-empty sequence on a withdrawal is kept
    /// and rejected as `InvalidArgument` during normalization.
    pub fn push(
        &mut self,
        kind: UpdateKind,
        customer: Asn,
        providers: ProviderAsns,
    ) {
        let providers = match kind {
            UpdateKind::Announce => Some(providers),
            UpdateKind::Withdraw if providers.is_empty() => None,
            UpdateKind::Withdraw => Some(providers),
        };
        self.ops.push(UpdateOp {
            index: self.ops.len(),
            kind,
            customer,
            providers,
            no_op: false,
        });
    }

    /// Appends an announcement for `customer` with the given providers.
    pub fn announce(&mut self, customer: Asn, providers: ProviderAsns) {
        self.push(UpdateKind::Announce, customer, providers);
    }

    /// Appends a withdrawal for `customer`.
    pub fn withdraw(&mut self, customer: Asn) {
        self.push(UpdateKind::Withdraw, customer, ProviderAsns::empty());
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, UpdateOp> {
        self.ops.iter()
    }

    pub(crate) fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub(crate) fn ops_mut(&mut self) -> &mut [UpdateOp] {
        &mut self.ops
    }
}

//------------ ChangeKind / UpdateObserver -----------------------------------

/// What happened to a record, as reported to an [`UpdateObserver`].
#[derive(
    Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum ChangeKind {
    Added,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Removed => write!(f, "removed"),
        }
    }
}

/// A listener for per-record changes on an ASPA table.
///
/// Within one update batch, changes are reported in the batch's
/// post-normalization order, after the new state has been published. The
/// callback runs on the updating thread and must not call back into the
/// table.
pub trait UpdateObserver: Send + Sync {
    fn record_changed(
        &self,
        socket: SocketId,
        record: &AspaRecord,
        change: ChangeKind,
    );
}

impl<T: UpdateObserver> UpdateObserver for std::sync::Arc<T> {
    fn record_changed(
        &self,
        socket: SocketId,
        record: &AspaRecord,
        change: ChangeKind,
    ) {
        (**self).record_changed(socket, record, change)
    }
}
