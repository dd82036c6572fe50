//! An in-memory table of ASPA records learned over RTR sessions.
//!
//! An [`AspaTable`] stores, per customer ASN, the provider ASNs that are
//! authorized to act as that customer's upstreams, as learned from one or
//! more RPKI-to-Router cache sessions. Given a `(customer, provider)` pair
//! taken from a BGP `AS_PATH`, [`AspaTable::check_hop`] answers whether
//! the hop is attested as authorized, attested as unauthorized, or not
//! attested at all.
//!
//! Cache sessions feed the table batched diffs of announcements and
//! withdrawals, which are applied atomically with respect to concurrent
//! readers. Two update strategies are available, selected at construction
//! through the [`Config`] parameter: [`SwapInConfig`] builds a
//! replacement record array off to the side and swaps it in whole, while
//! [`InPlaceConfig`] splices the live array and can undo a partially
//! applied batch.
//!
//! The crate also provides [`LpmTree`], the longest-prefix-match tree the
//! surrounding RPKI machinery uses for route-origin lookups, and
//! [`PrefixLpm`], its two-family wrapper.

pub mod lpm;
pub mod table;
pub mod types;

pub use crossbeam_epoch as epoch;

pub use inetnum::addr::Prefix;
pub use inetnum::asn::Asn;

pub use lpm::{LpmMatch, LpmTree, PrefixLpm};
pub use table::{
    AspaTable, AspaUpdate, Config, Counters, InPlaceConfig, RecordStore,
    SwapInConfig,
};
pub use types::af::AddressFamily;
pub use types::aspa::{AspaRecord, ProviderAsns, SocketId};
pub use types::errors::{AspaStoreError, UpdateError};
pub use types::hop::HopResult;
pub use types::update::{
    ChangeKind, UpdateBatch, UpdateKind, UpdateObserver, UpdateOp,
};
