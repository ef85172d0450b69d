pub mod api;
pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod notify;
pub mod orchestration;

pub use config::Config;
pub use datasource::{DataSourceError, MockDirectory, ParticipantDirectory, RateScheduleSource};
pub use db::{init_db, Repository};
pub use domain::{
    BeneficiaryAggregate, CommissionEntry, Currency, Decimal, Generation, Participant,
    ParticipantId, RawPurchase, ReconcileScope, SubmitResult, TimeMs,
};
pub use error::{AppError, ErrorKind, LedgerError};
pub use orchestration::Ledger;
