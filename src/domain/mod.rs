//! Domain types for the referral commission ledger.
//!
//! This module provides:
//! - Lossless money and rate handling via the Decimal wrapper
//! - Domain primitives: TimeMs, ParticipantId, Currency, ProductKind, Generation
//! - Purchase events, chain snapshots, commission entries and aggregates
//! - Journal types for reconciler runs and dead letters

pub mod aggregate;
pub mod chain;
pub mod dead_letter;
pub mod decimal;
pub mod entry;
pub mod event;
pub mod outcome;
pub mod participant;
pub mod primitives;
pub mod rate;
pub mod reconcile;

pub use aggregate::{AggregateDelta, AggregateOverflow, BeneficiaryAggregate, GenerationTotals};
pub use chain::{ChainLink, ChainSnapshot, ChainStop};
pub use dead_letter::{DeadLetter, DeadLetterKind};
pub use decimal::{Decimal, RoundingMode};
pub use entry::{CommissionEntry, DerivedEntry, EntryKey, EntryStatus};
pub use event::{PurchaseEvent, RawPurchase, RejectReason, MAX_PURCHASE_AMOUNT_UNITS};
pub use outcome::{ApplyOutcome, ConflictDetail, RollbackOutcome, SubmitResult};
pub use participant::{Participant, ParticipantFlag, ParticipantStatus};
pub use primitives::{Currency, Generation, ParticipantId, ProductKind, TimeMs};
pub use rate::{schedule_in_force, RateError, RateSchedule};
pub use reconcile::{Action, Finding, ReconcileScope, ReconcilerRun, RunStatus};
