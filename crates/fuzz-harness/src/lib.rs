//! Chain Embedding Fuzz Harness
//!
//! Property-based testing for the embedding engine: generators for
//! connected substrates, chained requests and ledger operation sequences,
//! the invariants they must satisfy, and a standalone runner with reports.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fuzz_harness::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn ledger_is_lifo(case in ledger_case()) {
//!         prop_assert!(check_ledger_lifo(&case).is_ok());
//!     }
//! }
//! ```

pub mod generators;
pub mod properties;
pub mod reports;
pub mod runner;

pub mod prelude {
    pub use crate::generators::*;
    pub use crate::properties::*;
    pub use crate::runner::{CaseOutcome, FuzzConfig, FuzzResult, FuzzRunner, SearchStats};
    pub use proptest::prelude::*;
}

// Re-export proptest for convenience
pub use proptest;
