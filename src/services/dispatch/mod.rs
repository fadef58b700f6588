mod memory;
mod queue;
mod runner;
mod store;
mod types;

pub use memory::{MemoryUnit, MemoryUnitQueue};
pub use queue::{DispatchClient, UnitQueue};
pub use runner::{retry_delay, Dispatcher, DispatcherOptions, DrainSummary, UnitHandler};
pub use store::PgUnitQueue;
pub use types::{
    ClaimedUnit, DispatchUnit, EnqueueOutcome, EnqueueRequest, LeaseRecovery, UnitFailure,
    UnitStatus,
};
