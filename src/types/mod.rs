pub mod af;
pub mod aspa;
pub mod errors;
pub mod hop;
pub mod update;

pub use af::AddressFamily;
pub use aspa::{AspaRecord, ProviderAsns, SocketId};
pub use hop::HopResult;
pub use update::{
    ChangeKind, UpdateBatch, UpdateKind, UpdateObserver, UpdateOp,
};
