//------------ Config --------------------------------------------------------

//! Construction-time configuration for an ASPA table.
//!
//! The update strategy and the no-op notification policy are fixed when a
//! table is created; there is no process-wide mutable configuration.

use crate::table::backend::{InPlaceStore, StoreBackend, SwapInStore};

/// Selects a table's update strategy and notification policy.
pub trait Config: Clone + Default + std::fmt::Debug {
    /// The per-socket storage the strategy runs on.
    type Backend: StoreBackend;

    /// Whether cancelled-out operations still emit their paired
    /// added/removed notifications.
    fn notify_no_ops(&self) -> bool;
}

//------------ SwapInConfig --------------------------------------------------

/// Replace the record array wholesale and swap it in atomically.
///
/// Readers never block and see exactly one publication point per batch. A
/// failed batch is never published.
#[derive(Copy, Clone, Debug)]
pub struct SwapInConfig {
    pub notify_no_ops: bool,
}

impl Config for SwapInConfig {
    type Backend = SwapInStore;

    fn notify_no_ops(&self) -> bool {
        self.notify_no_ops
    }
}

impl Default for SwapInConfig {
    fn default() -> Self {
        Self {
            notify_no_ops: false,
        }
    }
}

//------------ InPlaceConfig -------------------------------------------------

/// Splice each operation into the live record array.
///
/// Writers block readers only for the duration of one splice; readers may
/// observe a batch's intermediate states. A failed batch is rolled back
/// before the update call returns.
#[derive(Copy, Clone, Debug)]
pub struct InPlaceConfig {
    pub notify_no_ops: bool,
}

impl Config for InPlaceConfig {
    type Backend = InPlaceStore;

    fn notify_no_ops(&self) -> bool {
        self.notify_no_ops
    }
}

impl Default for InPlaceConfig {
    fn default() -> Self {
        Self {
            notify_no_ops: false,
        }
    }
}
