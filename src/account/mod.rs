//! Account lifecycle: the persisted record, lifecycle types and the
//! controller that ties storage, vault and server together.

pub mod controller;
pub mod store;
pub mod types;

pub use controller::{AccountController, ControllerSettings};
pub use store::{PersistedState, StateStore};
pub use types::{AllocationOutcome, CreatedAccount, LifecycleEvent, LifecycleState, LoginOutcome};
