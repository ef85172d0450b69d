//! Orchestration: intake, the single-writer path, reconciliation and the
//! `Ledger` facade that ties them together.

pub mod intake;
pub mod ledger;
pub mod locks;
pub mod reconciler;
pub mod writer;

pub use intake::{IntakeQueue, IntakeService};
pub use ledger::{ImportSummary, Ledger};
pub use locks::{AggregateGuard, AggregateKey, AggregateLocks};
pub use reconciler::Reconciler;
pub use writer::{LedgerWriter, ScheduleBackoff};
