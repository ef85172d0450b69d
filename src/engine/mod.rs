//! Pure computation: handle validation, chain resolution, commission
//! derivation and aggregate rebuilds.
//!
//! Nothing here writes to the store. The resolver reads the participant
//! directory through its trait; the rest works on values only.

pub mod aggregator;
pub mod deriver;
pub mod handle;
pub mod resolver;

pub use aggregator::{rebuild, split_duplicates, DuplicateSplit};
pub use deriver::{CommissionDeriver, DeriveError};
pub use handle::{validate_handle, HandleError, MAX_HANDLE_LEN};
pub use resolver::{ChainResolver, ResolvedChain};
