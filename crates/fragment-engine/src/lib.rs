//! Lifecycle engine for ephemeral voice rooms: the ownership ledger, the
//! controller that creates and reaps rooms, per-room watchers, and startup
//! recovery of rooms left behind by a previous run.

pub mod controller;
pub mod error;
pub mod ledger;
pub mod mock;
pub mod naming;
pub mod recovery;
mod watcher;

pub use controller::{ControllerConfig, ControllerHandle, LifecycleController, RoomSnapshot};
pub use error::ControllerError;
pub use ledger::{LedgerMirror, OwnershipLedger};
pub use mock::{MemoryProvider, ProviderOp};
pub use recovery::{recover_orphans, RecoveryReport};
